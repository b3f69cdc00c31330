use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The single record a station keeps in the remote store.
///
/// Field names on the wire are the ones the dashboard reads, so they are
/// renamed rather than changed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    #[serde(rename = "station", default)]
    pub station_id: String,
    #[serde(rename = "nuke gone off?", with = "yes_no", default)]
    pub event_occurred: bool,
    #[serde(rename = "last monitor upload date", default)]
    pub last_report_time: String,
    #[serde(rename = "nuke detected time", default)]
    pub event_time: Option<String>,
    #[serde(rename = "total minutes monitored", default)]
    pub monitor_minutes_total: u64,
    #[serde(flatten)]
    pub location: Location,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Location {
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub long: f64,
}

/// What the device knows locally at upload time.
#[derive(Debug, Clone)]
pub struct Observation {
    pub station_id: String,
    pub location: Location,
    pub report_time: String,
    pub event_latched: bool,
    pub event_time: Option<String>,
}

impl RemoteDocument {
    /// Folds local observations into the document last read from the store.
    ///
    /// The event flag only ever moves from "no" to "yes", the first recorded
    /// event time wins, and the counter continues from the stored value.
    pub fn merged(previous: Option<&RemoteDocument>, obs: &Observation) -> RemoteDocument {
        let previous_total = previous.map(|doc| doc.monitor_minutes_total).unwrap_or(0);
        let remote_event = previous.map(|doc| doc.event_occurred).unwrap_or(false);
        let event_occurred = remote_event || obs.event_latched;

        let event_time = if event_occurred {
            previous
                .and_then(|doc| doc.event_time.clone())
                .or_else(|| obs.event_time.clone())
                // A document flagged "yes" without a time predates this firmware.
                .or_else(|| remote_event.then(|| obs.report_time.clone()))
        } else {
            None
        };

        RemoteDocument {
            station_id: obs.station_id.clone(),
            event_occurred,
            last_report_time: obs.report_time.clone(),
            event_time,
            monitor_minutes_total: previous_total.saturating_add(1),
            location: obs.location,
        }
    }
}

mod yes_no {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "yes" } else { "no" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(text == "yes")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrigin {
    /// Answered by the time server.
    Network,
    /// Local device clock, used once every network attempt failed.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeReading {
    pub at: DateTime<Utc>,
    pub origin: TimeOrigin,
}

impl TimeReading {
    pub fn network(at: DateTime<Utc>) -> Self {
        Self {
            at,
            origin: TimeOrigin::Network,
        }
    }

    pub fn local_now() -> Self {
        Self {
            at: Utc::now(),
            origin: TimeOrigin::Local,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.origin == TimeOrigin::Local
    }

    pub fn formatted(&self) -> String {
        self.at.format(TIMESTAMP_FORMAT).to_string()
    }
}
