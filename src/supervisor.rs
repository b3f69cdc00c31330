//! Top-level control loop of the node.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected ──link lost──▶ Disconnected
//!        ▲                      │
//!        └──────timeout─────────┘   (after max_connect_retries: reset)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::clock::TimeQuery;
use crate::config::{Config, Timings};
use crate::detector::{self, DetectorState};
use crate::gpio::{DigitalIo, Level, Line};
use crate::net::Link;
use crate::reporter::Reporter;
use crate::selftest::{SelfTestController, SelfTestOutcome};
use crate::store::{DocumentStore, StoreError};
use crate::types::RemoteDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    LinkLost,
}

pub struct Supervisor<S, Q, L> {
    io: Arc<dyn DigitalIo>,
    detector: Arc<DetectorState>,
    reporter: Reporter<S, Q>,
    self_test: SelfTestController,
    link: L,
    timings: Timings,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    max_connect_retries: u32,
    link_state: LinkState,
    connect_retry_count: u32,
    last_upload: Option<Instant>,
}

impl<S, Q, L> Supervisor<S, Q, L>
where
    S: DocumentStore,
    Q: TimeQuery,
    L: Link,
{
    pub fn new(
        io: Arc<dyn DigitalIo>,
        detector: Arc<DetectorState>,
        reporter: Reporter<S, Q>,
        link: L,
        config: &Config,
        timings: Timings,
    ) -> Self {
        Self {
            io,
            detector,
            reporter,
            self_test: SelfTestController::new(&timings),
            link,
            timings,
            heartbeat_interval: config.heartbeat_interval(),
            connect_timeout: config.connect_timeout(),
            max_connect_retries: config.max_connect_retries,
            link_state: LinkState::Disconnected,
            connect_retry_count: 0,
            last_upload: None,
        }
    }

    #[cfg(test)]
    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    #[cfg(test)]
    pub fn reporter(&self) -> &Reporter<S, Q> {
        &self.reporter
    }

    fn set_link_state(&mut self, next: LinkState) {
        if next != self.link_state {
            debug!(from = ?self.link_state, to = ?next, "Link state");
            self.link_state = next;
        }
    }

    /// Runs until the connection retry budget is spent.
    ///
    /// Returning is the reset: the caller exits and the service manager
    /// restarts the node from a clean state.
    pub async fn run(&mut self) -> Result<()> {
        self.boot().context("initialising indicator lines")?;

        while self.connect_retry_count < self.max_connect_retries {
            let cycle = match self.connect().await {
                Ok(()) => {
                    self.connect_retry_count = 0;
                    self.serve().await
                }
                Err(e) => Err(e),
            };

            match cycle {
                Ok(()) => warn!("Uplink lost, reconnecting"),
                Err(e) => {
                    self.connect_retry_count += 1;
                    error!(
                        error = %format!("{e:#}"),
                        attempt = self.connect_retry_count,
                        max = self.max_connect_retries,
                        "Connection cycle failed"
                    );
                    time::sleep(self.timings.connect_retry_delay).await;
                }
            }
        }

        self.escalate();
        bail!(
            "maximum connection retries ({}) reached, resetting device",
            self.max_connect_retries
        )
    }

    /// Indicators off, stimulus idle high.
    pub fn boot(&self) -> Result<()> {
        for led in Line::INDICATORS {
            self.io.set_low(led)?;
        }
        self.io.set_high(Line::Stimulus)?;
        info!(detect = ?self.io.read(Line::EventDetect)?, "Detector line at boot");
        Ok(())
    }

    /// Retries the link until it comes up or the connect timeout passes,
    /// blinking every indicator while it waits.
    pub async fn connect(&mut self) -> Result<()> {
        self.set_link_state(LinkState::Connecting);
        let deadline = Instant::now() + self.connect_timeout;

        loop {
            match self.link.try_connect().await {
                Ok(()) => {
                    self.io.set_high(Line::WifiLed)?;
                    self.set_link_state(LinkState::Connected);
                    info!("Connected");
                    return Ok(());
                }
                Err(e) => debug!(error = %e, "Uplink not up yet"),
            }

            if Instant::now() >= deadline {
                self.set_link_state(LinkState::Disconnected);
                self.io.set_high(Line::ErrorLed)?;
                self.io.set_low(Line::SelfTestLed)?;
                self.io.set_low(Line::WifiLed)?;
                bail!("uplink not connected within {:?}", self.connect_timeout);
            }
            self.blink_all().await?;
        }
    }

    async fn blink_all(&self) -> Result<()> {
        for led in Line::INDICATORS {
            self.io.set_high(led)?;
        }
        time::sleep(self.timings.connect_blink).await;
        for led in Line::INDICATORS {
            self.io.set_low(led)?;
        }
        time::sleep(self.timings.connect_blink).await;
        Ok(())
    }

    /// Arms both interrupts and schedules an immediate heartbeat.
    pub fn start_session(&mut self) -> Result<()> {
        detector::arm(&*self.io, &self.detector).context("arming interrupts")?;
        self.last_upload = None;
        Ok(())
    }

    /// Inner loop while connected. Returns `Ok` when the link drops.
    async fn serve(&mut self) -> Result<()> {
        self.start_session()?;
        loop {
            match self.tick().await {
                Ok(Flow::Continue) => time::sleep(self.timings.loop_sleep).await,
                Ok(Flow::LinkLost) => {
                    // Interrupts stay armed: an event while reconnecting is latched
                    // and uploaded by the next session.
                    if let Err(e) = self.io.set_low(Line::WifiLed) {
                        warn!(error = %e, "Could not clear uplink indicator");
                    }
                    self.set_link_state(LinkState::Disconnected);
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Error in main loop");
                    time::sleep(self.timings.loop_error_delay).await;
                }
            }
        }
    }

    /// One pass of the connected loop: pending event, requested self-test, heartbeat.
    pub async fn tick(&mut self) -> Result<Flow> {
        if self.detector.take_pending_event() {
            let result = self.reporter.report_event().await;
            let rearmed = detector::arm(&*self.io, &self.detector);
            let flow = self.settle("event", result).await;
            rearmed.context("re-arming interrupts after event upload")?;
            if flow == Flow::LinkLost {
                return Ok(flow);
            }
        }

        if self.detector.self_test_requested() {
            let outcome = self.self_test.dispatch(&*self.io, &self.detector).await;
            let rearmed = self.io.on_rising_edge(
                Line::EventDetect,
                Some(detector::event_handler(Arc::clone(&self.detector))),
            );
            match outcome.context("self-test")? {
                SelfTestOutcome::Pass => info!("Self-test passed"),
                SelfTestOutcome::Fail => warn!("Self-test failed"),
            }
            rearmed.context("re-arming event interrupt after self-test")?;
        }

        if self.heartbeat_due() {
            let result = self.reporter.heartbeat().await;
            self.last_upload = Some(Instant::now());
            return Ok(self.settle("heartbeat", result).await);
        }

        Ok(Flow::Continue)
    }

    fn heartbeat_due(&self) -> bool {
        match self.last_upload {
            None => true,
            Some(at) => at.elapsed() >= self.heartbeat_interval,
        }
    }

    async fn settle(&self, kind: &str, result: Result<RemoteDocument, StoreError>) -> Flow {
        match result {
            Ok(document) => {
                info!(kind, total = document.monitor_minutes_total, "Upload complete");
                Flow::Continue
            }
            Err(e) => {
                error!(kind, error = %e, "Upload failed");
                self.indicate_fault().await;
                if e.is_link_down() {
                    Flow::LinkLost
                } else {
                    Flow::Continue
                }
            }
        }
    }

    /// Lights the error LED for the fault blink, then restores its previous
    /// level so an event indication is not lost.
    async fn indicate_fault(&self) {
        let previous = self.io.read(Line::ErrorLed).unwrap_or(Level::Low);
        if let Err(e) = self.io.set_high(Line::ErrorLed) {
            warn!(error = %e, "Could not raise fault indicator");
        }
        time::sleep(self.timings.fault_blink).await;
        if let Err(e) = self.io.write(Line::ErrorLed, previous) {
            warn!(error = %e, "Could not restore fault indicator");
        }
    }

    fn escalate(&self) {
        error!("Maximum retries reached, resetting device");
        if let Err(e) = self.io.set_high(Line::ErrorLed) {
            warn!(error = %e, "Could not raise error indicator");
        }
        for led in [Line::SelfTestLed, Line::WifiLed] {
            if let Err(e) = self.io.set_low(led) {
                warn!(error = %e, %led, "Could not clear indicator");
            }
        }
    }
}
