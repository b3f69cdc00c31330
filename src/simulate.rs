use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::gpio::{DigitalIo, EdgeHandler, IoError, Level, Line};

#[derive(Default)]
struct BoardState {
    levels: HashMap<Line, Level>,
    handlers: HashMap<Line, EdgeHandler>,
    running: HashSet<Line>,
    failing: HashSet<Line>,
    writes: Vec<(Line, Level)>,
}

/// Host stand-in for the sensor board.
///
/// The detector circuit is modelled just enough for the self-test: a
/// low-to-high pulse on the stimulus line raises the detect line when the
/// detector is healthy.
pub struct SimulatedBoard {
    state: Mutex<BoardState>,
    detector_healthy: AtomicBool,
}

impl SimulatedBoard {
    pub fn new(detector_healthy: bool) -> Self {
        Self {
            state: Mutex::new(BoardState::default()),
            detector_healthy: AtomicBool::new(detector_healthy),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        // A panicking handler must not take the whole board down with it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sets the level of an input line as the outside world would, firing the
    /// registered handler on a rising edge.
    pub fn drive(&self, line: Line, level: Level) {
        let handler = {
            let mut state = self.lock();
            let previous = state.levels.insert(line, level).unwrap_or_default();
            let rising = previous == Level::Low && level == Level::High;
            if !rising || state.running.contains(&line) {
                return;
            }
            match state.handlers.get(&line).cloned() {
                Some(handler) => {
                    state.running.insert(line);
                    handler
                }
                None => {
                    debug!(%line, "Rising edge with interrupt masked");
                    return;
                }
            }
        };

        handler(self as &dyn DigitalIo);
        self.lock().running.remove(&line);
    }

    /// Full low-high transition on an input.
    pub fn pulse(&self, line: Line) {
        self.drive(line, Level::Low);
        self.drive(line, Level::High);
    }
}

#[cfg(test)]
impl SimulatedBoard {
    /// Makes every access to `line` fail until [`SimulatedBoard::repair_line`].
    pub fn fail_line(&self, line: Line) {
        self.lock().failing.insert(line);
    }

    pub fn repair_line(&self, line: Line) {
        self.lock().failing.remove(&line);
    }

    pub fn level(&self, line: Line) -> Level {
        self.lock().levels.get(&line).copied().unwrap_or_default()
    }

    pub fn is_armed(&self, line: Line) -> bool {
        self.lock().handlers.contains_key(&line)
    }

    /// Every level written to an output, oldest first.
    pub fn writes(&self) -> Vec<(Line, Level)> {
        self.lock().writes.clone()
    }

    pub fn writes_to(&self, line: Line) -> Vec<Level> {
        self.lock()
            .writes
            .iter()
            .filter(|(l, _)| *l == line)
            .map(|(_, level)| *level)
            .collect()
    }
}

impl DigitalIo for SimulatedBoard {
    fn read(&self, line: Line) -> Result<Level, IoError> {
        let state = self.lock();
        if state.failing.contains(&line) {
            return Err(IoError::Unavailable(line));
        }
        Ok(state.levels.get(&line).copied().unwrap_or_default())
    }

    fn write(&self, line: Line, level: Level) -> Result<(), IoError> {
        if !line.is_output() {
            return Err(IoError::NotAnOutput(line));
        }
        let stimulated = {
            let mut state = self.lock();
            if state.failing.contains(&line) {
                return Err(IoError::Unavailable(line));
            }
            let previous = state.levels.insert(line, level).unwrap_or_default();
            state.writes.push((line, level));
            line == Line::Stimulus && previous == Level::Low && level == Level::High
        };

        if stimulated && self.detector_healthy.load(Ordering::SeqCst) {
            self.drive(Line::EventDetect, Level::High);
        }
        Ok(())
    }

    fn on_rising_edge(&self, line: Line, handler: Option<EdgeHandler>) -> Result<(), IoError> {
        if line.is_output() {
            return Err(IoError::NotAnInput(line));
        }
        let mut state = self.lock();
        if state.failing.contains(&line) {
            return Err(IoError::Unavailable(line));
        }
        match handler {
            Some(handler) => state.handlers.insert(line, handler),
            None => state.handlers.remove(&line),
        };
        Ok(())
    }
}

/// Spawns the scripted operator/self-test and event stimuli from `config`.
pub fn spawn_script(board: Arc<SimulatedBoard>, config: &SimulationConfig) {
    if let Some(every) = config.self_test_every_secs.filter(|secs| *secs > 0) {
        let board = Arc::clone(&board);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(every));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!("Simulated operator requests a self-test");
                board.pulse(Line::SelfTestEnable);
            }
        });
    }

    if let Some(after) = config.event_after_secs {
        // Up to 10% jitter so repeated runs do not line up with the heartbeat.
        let jitter_ms = rand::thread_rng().gen_range(0..=after.saturating_mul(100));
        let delay = Duration::from_secs(after) + Duration::from_millis(jitter_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!(after = ?delay, "Simulated detector fires");
            board.drive(Line::EventDetect, Level::Low);
            board.drive(Line::EventDetect, Level::High);
        });
    }
}
