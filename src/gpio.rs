//! Digital I/O capability used by the control loop.
//!
//! The node only ever touches six lines, so they are a closed enum rather than
//! pin numbers. Board drivers implement [`DigitalIo`]; [`crate::simulate`]
//! provides the host-side board.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    WifiLed,
    SelfTestLed,
    ErrorLed,
    /// Input raised by an operator or timer to request a self-test.
    SelfTestEnable,
    /// Output of the detector circuit.
    EventDetect,
    /// Drives the detector's built-in test input.
    Stimulus,
}

impl Line {
    #[cfg(test)]
    pub const ALL: [Line; 6] = [
        Line::WifiLed,
        Line::SelfTestLed,
        Line::ErrorLed,
        Line::SelfTestEnable,
        Line::EventDetect,
        Line::Stimulus,
    ];

    pub const INDICATORS: [Line; 3] = [Line::WifiLed, Line::ErrorLed, Line::SelfTestLed];

    /// GPIO number on the reference board.
    pub fn pin(self) -> u8 {
        match self {
            Line::WifiLed => 2,
            Line::SelfTestLed => 6,
            Line::ErrorLed => 11,
            Line::SelfTestEnable => 12,
            Line::EventDetect => 18,
            Line::Stimulus => 14,
        }
    }

    pub fn is_output(self) -> bool {
        !matches!(self, Line::SelfTestEnable | Line::EventDetect)
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(gpio{})", self, self.pin())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Level {
    #[default]
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IoError {
    #[error("{0} is an input and cannot be driven")]
    NotAnOutput(Line),
    #[error("{0} only supports edge interrupts on inputs")]
    NotAnInput(Line),
    #[error("{0} is not responding")]
    Unavailable(Line),
}

/// Rising-edge callback. It gets the I/O capability back so it can mask
/// interrupts and drive indicators without owning the board.
pub type EdgeHandler = Arc<dyn Fn(&dyn DigitalIo) + Send + Sync>;

pub trait DigitalIo: Send + Sync {
    fn read(&self, line: Line) -> Result<Level, IoError>;

    fn write(&self, line: Line, level: Level) -> Result<(), IoError>;

    /// Registers `handler` for rising edges on `line`; `None` masks the interrupt.
    fn on_rising_edge(&self, line: Line, handler: Option<EdgeHandler>) -> Result<(), IoError>;

    fn set_high(&self, line: Line) -> Result<(), IoError> {
        self.write(line, Level::High)
    }

    fn set_low(&self, line: Line) -> Result<(), IoError> {
        self.write(line, Level::Low)
    }

    fn is_high(&self, line: Line) -> Result<bool, IoError> {
        Ok(self.read(line)?.is_high())
    }
}
