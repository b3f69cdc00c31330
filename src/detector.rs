//! Event latch shared between the interrupt handlers and the control loop.
//!
//! Handlers only flip flags here; anything slow (time queries, uploads)
//! happens in the supervisor's next iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::time::Instant;
use tracing::{error, warn};

use crate::gpio::{DigitalIo, EdgeHandler, IoError, Line};

#[derive(Debug, Default)]
pub struct DetectorState {
    event_latched: AtomicBool,
    upload_pending: AtomicBool,
    self_test_requested: AtomicBool,
    first_edge_at: OnceLock<Instant>,
    event_time: OnceLock<String>,
}

impl DetectorState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records a qualifying edge. The latch never clears for the life of the process.
    ///
    /// The edge instant is stored before the flag is raised, so a reader that
    /// sees the latch also sees when it happened.
    pub fn latch_event(&self, at: Instant) {
        let _ = self.first_edge_at.set(at);
        self.event_latched.store(true, Ordering::SeqCst);
        self.upload_pending.store(true, Ordering::SeqCst);
    }

    pub fn is_latched(&self) -> bool {
        self.event_latched.load(Ordering::SeqCst)
    }

    /// Consumes the pending-upload signal raised by [`DetectorState::latch_event`].
    pub fn take_pending_event(&self) -> bool {
        self.upload_pending.swap(false, Ordering::SeqCst)
    }

    pub fn first_edge_at(&self) -> Option<Instant> {
        self.first_edge_at.get().copied()
    }

    /// Fixes the reported event time. Only the first call has an effect.
    pub fn record_event_time(&self, formatted: String) -> &str {
        self.event_time.get_or_init(|| formatted)
    }

    pub fn event_time(&self) -> Option<&str> {
        self.event_time.get().map(String::as_str)
    }

    pub fn request_self_test(&self) {
        self.self_test_requested.store(true, Ordering::SeqCst);
    }

    pub fn self_test_requested(&self) -> bool {
        self.self_test_requested.load(Ordering::SeqCst)
    }

    pub fn clear_self_test_request(&self) {
        self.self_test_requested.store(false, Ordering::SeqCst);
    }
}

/// Handler for the self-test enable line: just raises the request flag.
pub fn self_test_handler(state: Arc<DetectorState>) -> EdgeHandler {
    Arc::new(move |_io: &dyn DigitalIo| {
        state.request_self_test();
    })
}

/// Handler for the detect line.
///
/// Masks both interrupt sources, latches the event and raises the error LED.
/// The supervisor re-arms the sources once the event upload has been attempted.
pub fn event_handler(state: Arc<DetectorState>) -> EdgeHandler {
    Arc::new(move |io: &dyn DigitalIo| {
        if let Err(e) = disarm(io) {
            warn!(error = %e, "Could not mask interrupts in event handler");
        }
        state.latch_event(Instant::now());
        if let Err(e) = io.set_high(Line::ErrorLed) {
            error!(error = %e, "Could not raise event indicator");
        }
    })
}

/// Registers both handlers.
pub fn arm(io: &dyn DigitalIo, state: &Arc<DetectorState>) -> Result<(), IoError> {
    io.on_rising_edge(Line::SelfTestEnable, Some(self_test_handler(Arc::clone(state))))?;
    io.on_rising_edge(Line::EventDetect, Some(event_handler(Arc::clone(state))))?;
    Ok(())
}

pub fn disarm(io: &dyn DigitalIo) -> Result<(), IoError> {
    io.on_rising_edge(Line::EventDetect, None)?;
    io.on_rising_edge(Line::SelfTestEnable, None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::Level;
    use crate::simulate::SimulatedBoard;

    #[test]
    fn latch_survives_any_number_of_takes() {
        let state = DetectorState::new();
        assert!(!state.is_latched());
        state.latch_event(Instant::now());
        assert!(state.take_pending_event());
        assert!(!state.take_pending_event());
        assert!(state.is_latched());
    }

    #[test]
    fn event_time_is_set_once() {
        let state = DetectorState::new();
        let first = state.record_event_time("2024-01-01 00:00:00".into());
        assert_eq!(first, "2024-01-01 00:00:00");
        let second = state.record_event_time("2024-01-01 00:05:00".into());
        assert_eq!(second, "2024-01-01 00:00:00");
        assert_eq!(state.event_time(), Some("2024-01-01 00:00:00"));
    }

    #[test]
    fn event_edge_masks_both_sources_and_raises_indicator() {
        let board = SimulatedBoard::new(true);
        let state = DetectorState::new();
        arm(&board, &state).unwrap();

        board.pulse(Line::EventDetect);

        assert!(state.is_latched());
        assert!(state.first_edge_at().is_some());
        assert!(!board.is_armed(Line::EventDetect));
        assert!(!board.is_armed(Line::SelfTestEnable));
        assert_eq!(board.level(Line::ErrorLed), Level::High);

        // Masked: an operator request during handling is not seen.
        board.pulse(Line::SelfTestEnable);
        assert!(!state.self_test_requested());
    }

    #[test]
    fn self_test_edge_only_sets_request() {
        let board = SimulatedBoard::new(true);
        let state = DetectorState::new();
        arm(&board, &state).unwrap();

        board.pulse(Line::SelfTestEnable);

        assert!(state.self_test_requested());
        assert!(!state.is_latched());
        assert!(board.is_armed(Line::SelfTestEnable));
        assert!(board.writes().is_empty());
    }

    #[test]
    fn second_edge_keeps_first_edge_time() {
        let state = DetectorState::new();
        let first = Instant::now();
        state.latch_event(first);
        state.latch_event(first + std::time::Duration::from_secs(30));
        assert_eq!(state.first_edge_at(), Some(first));
    }
}
