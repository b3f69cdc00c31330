use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::clock::{ClockSource, TimeQuery};
use crate::detector::DetectorState;
use crate::store::{DocumentStore, Fetched, StoreError};
use crate::types::{Location, Observation, RemoteDocument, TimeReading, TIMESTAMP_FORMAT};

/// Reconciles local observations with the remote station document.
pub struct Reporter<S, Q> {
    store: S,
    clock: ClockSource<Q>,
    state: Arc<DetectorState>,
    station_id: String,
    location: Location,
    time_retries: u32,
}

impl<S: DocumentStore, Q: TimeQuery> Reporter<S, Q> {
    pub fn new(
        store: S,
        clock: ClockSource<Q>,
        state: Arc<DetectorState>,
        station_id: String,
        location: Location,
        time_retries: u32,
    ) -> Self {
        Self {
            store,
            clock,
            state,
            station_id,
            location,
            time_retries,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolves the current time, paired with the monotonic instant it belongs to.
    async fn now(&self) -> (TimeReading, Instant) {
        let reading = self.clock.resolve_time(self.time_retries).await;
        (reading, Instant::now())
    }

    /// Periodic status upload.
    pub async fn heartbeat(&self) -> Result<RemoteDocument, StoreError> {
        let (now, taken) = self.now().await;
        self.upload(&now, taken).await
    }

    /// Upload for a latched event.
    pub async fn report_event(&self) -> Result<RemoteDocument, StoreError> {
        let (now, taken) = self.now().await;
        let event_time = self.event_time(&now, taken);
        info!(event_time = ?event_time, degraded = now.is_degraded(), "Reporting detected event");
        self.upload(&now, taken).await
    }

    /// Fixes the event time on first use, dating it to the latched edge
    /// rather than to whenever the loop got round to uploading.
    fn event_time(&self, now: &TimeReading, taken: Instant) -> Option<&str> {
        let edge = self.state.first_edge_at()?;
        let at = wall_clock_at(now, taken, edge);
        Some(self.state.record_event_time(at.format(TIMESTAMP_FORMAT).to_string()))
    }

    async fn upload(
        &self,
        now: &TimeReading,
        taken: Instant,
    ) -> Result<RemoteDocument, StoreError> {
        let (version, previous) = match self.store.fetch().await {
            Ok(Fetched::Found { version, document }) => (Some(version), Some(document)),
            Ok(Fetched::Absent) => (None, None),
            Err(e) => {
                // Abandoning here would starve the heartbeat; try a create instead.
                warn!(error = %e, "Could not read station document, treating as absent");
                (None, None)
            }
        };

        // Sampled after the fetch so an edge latched meanwhile is dated correctly.
        let event_time = self.event_time(now, taken).map(str::to_string);
        let observation = Observation {
            station_id: self.station_id.clone(),
            location: self.location,
            report_time: now.formatted(),
            event_latched: self.state.is_latched(),
            event_time,
        };
        let document = RemoteDocument::merged(previous.as_ref(), &observation);

        self.store.write(&document, version.as_deref()).await?;
        info!(
            total = document.monitor_minutes_total,
            event = document.event_occurred,
            "Station document updated"
        );
        Ok(document)
    }
}

/// Maps a monotonic instant onto the wall clock using a reading taken at `taken`.
fn wall_clock_at(now: &TimeReading, taken: Instant, at: Instant) -> DateTime<Utc> {
    let delta = |d: Duration| {
        chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
    };
    if at <= taken {
        now.at - delta(taken - at)
    } else {
        now.at + delta(at - taken)
    }
}
