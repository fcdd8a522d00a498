//! Driver boundary for the Wii remote
//!
//! The controller session never touches the hardware directly. It talks to a
//! [`ControllerDriver`] to pair with a remote and to the resulting
//! [`ControllerDevice`] for configuration and report delivery. Everything the
//! driver hands over is copied into owned [`Report`] values, so no buffer
//! owned by the driver outlives a single `read_reports` call.
//!
//! # Report model
//!
//! ```text
//! driver ──► Vec<Report> ──► ButtonEdgeTracker
//!            │
//!            ├─ Buttons { held: ButtonMask }   (the only kind the core consumes)
//!            ├─ Motion                        (anomalous in button mode)
//!            └─ Error / Unknown               (anomalous, forces reconnect)
//! ```
//!
//! Button bit values follow the Wii remote core button report, so a driver
//! speaking to the radio directly can pass its bitmask through untouched.

use chrono::{DateTime, Local};
use std::fmt;
use std::time::Duration;

/// The eleven buttons on the face of a Wii remote
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WiimoteButton {
    A,
    B,
    One,
    Two,
    Minus,
    Home,
    Left,
    Right,
    Down,
    Up,
    Plus,
}

impl WiimoteButton {
    pub const COUNT: usize = 11;

    pub const ALL: [WiimoteButton; WiimoteButton::COUNT] = [
        WiimoteButton::A,
        WiimoteButton::B,
        WiimoteButton::One,
        WiimoteButton::Two,
        WiimoteButton::Minus,
        WiimoteButton::Home,
        WiimoteButton::Left,
        WiimoteButton::Right,
        WiimoteButton::Down,
        WiimoteButton::Up,
        WiimoteButton::Plus,
    ];

    /// Bit of this button inside a core button report
    pub const fn mask(self) -> u16 {
        match self {
            WiimoteButton::Two => 0x0001,
            WiimoteButton::One => 0x0002,
            WiimoteButton::B => 0x0004,
            WiimoteButton::A => 0x0008,
            WiimoteButton::Minus => 0x0010,
            WiimoteButton::Home => 0x0080,
            WiimoteButton::Left => 0x0100,
            WiimoteButton::Right => 0x0200,
            WiimoteButton::Down => 0x0400,
            WiimoteButton::Up => 0x0800,
            WiimoteButton::Plus => 0x1000,
        }
    }

    /// Position of this button in [`WiimoteButton::ALL`]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for WiimoteButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WiimoteButton::A => "A",
            WiimoteButton::B => "B",
            WiimoteButton::One => "1",
            WiimoteButton::Two => "2",
            WiimoteButton::Minus => "Minus",
            WiimoteButton::Home => "Home",
            WiimoteButton::Left => "Left",
            WiimoteButton::Right => "Right",
            WiimoteButton::Down => "Down",
            WiimoteButton::Up => "Up",
            WiimoteButton::Plus => "Plus",
        };
        f.write_str(label)
    }
}

/// Set of currently held buttons as delivered by the driver
///
/// Bits that do not belong to any [`WiimoteButton`] are carried along untouched
/// and ignored by the edge tracker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ButtonMask(pub u16);

impl ButtonMask {
    pub const EMPTY: ButtonMask = ButtonMask(0);

    pub fn from_buttons(buttons: &[WiimoteButton]) -> Self {
        buttons
            .iter()
            .fold(Self::EMPTY, |mask, button| mask.with(*button))
    }

    pub fn is_held(self, button: WiimoteButton) -> bool {
        self.0 & button.mask() != 0
    }

    pub fn with(self, button: WiimoteButton) -> Self {
        ButtonMask(self.0 | button.mask())
    }

    pub fn without(self, button: WiimoteButton) -> Self {
        ButtonMask(self.0 & !button.mask())
    }
}

/// Which report kinds the device should deliver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReportMode(u8);

impl ReportMode {
    pub const BUTTONS: ReportMode = ReportMode(0x01);
    pub const MOTION: ReportMode = ReportMode(0x04);

    pub fn contains(self, other: ReportMode) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Player LEDs along the bottom edge of the remote
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndicatorPattern(u8);

impl IndicatorPattern {
    pub const OFF: IndicatorPattern = IndicatorPattern(0x00);
    pub const LED1: IndicatorPattern = IndicatorPattern(0x01);
    pub const LED2: IndicatorPattern = IndicatorPattern(0x02);
    pub const LED3: IndicatorPattern = IndicatorPattern(0x04);
    pub const LED4: IndicatorPattern = IndicatorPattern(0x08);

    /// Pattern shown while the bridge holds the controller
    pub const CONNECTED: IndicatorPattern = IndicatorPattern::LED2;

    /// Single LEDs from left to right
    pub const EACH: [IndicatorPattern; 4] = [
        IndicatorPattern::LED1,
        IndicatorPattern::LED2,
        IndicatorPattern::LED3,
        IndicatorPattern::LED4,
    ];

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_lit(self, led: IndicatorPattern) -> bool {
        self.0 & led.0 != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportKind {
    Buttons,
    Motion,
    Error,
    Unknown,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportKind::Buttons => "buttons",
            ReportKind::Motion => "motion",
            ReportKind::Error => "error",
            ReportKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One owned report copied out of the driver
#[derive(Clone, Debug, PartialEq)]
pub enum Report {
    Buttons {
        held: ButtonMask,
        timestamp: DateTime<Local>,
    },
    Motion {
        timestamp: DateTime<Local>,
    },
    Error {
        reason: String,
        timestamp: DateTime<Local>,
    },
    Unknown {
        code: u8,
        timestamp: DateTime<Local>,
    },
}

impl Report {
    pub fn buttons(held: ButtonMask) -> Self {
        Report::Buttons {
            held,
            timestamp: Local::now(),
        }
    }

    pub fn kind(&self) -> ReportKind {
        match self {
            Report::Buttons { .. } => ReportKind::Buttons,
            Report::Motion { .. } => ReportKind::Motion,
            Report::Error { .. } => ReportKind::Error,
            Report::Unknown { .. } => ReportKind::Unknown,
        }
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        match self {
            Report::Buttons { timestamp, .. }
            | Report::Motion { timestamp }
            | Report::Error { timestamp, .. }
            | Report::Unknown { timestamp, .. } => *timestamp,
        }
    }
}

/// Errors raised by a controller driver
///
/// Only [`DriverError::NoInterface`] is fatal. Every other variant is retried
/// by the session.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// No Bluetooth or input interface exists on this machine
    #[error("No controller interface available: {0}")]
    NoInterface(String),

    #[error("No controller found within {0:?}")]
    Timeout(Duration),

    #[error("Controller not found: {0}")]
    NotFound(String),

    #[error("Controller I/O failed: {0}")]
    Io(String),

    #[error("Controller disconnected")]
    Disconnected,
}

impl DriverError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::NoInterface(_))
    }
}

/// Pairs with a controller
pub trait ControllerDriver: Send + 'static {
    /// Attempts to open a controller, waiting at most `timeout`
    fn open(&mut self, timeout: Duration) -> Result<Box<dyn ControllerDevice>, DriverError>;
}

/// One open controller connection, exclusively owned by the session
pub trait ControllerDevice: Send {
    fn name(&self) -> String;

    /// Stable identity of the physical remote, e.g. its Bluetooth address
    ///
    /// Used to recognise a released remote that is still connected.
    fn identity(&self) -> String;

    fn set_report_mode(&mut self, mode: ReportMode) -> Result<(), DriverError>;

    /// Starts report delivery; `read_reports` yields nothing before this call
    fn enable_messages(&mut self) -> Result<(), DriverError>;

    fn set_indicator(&mut self, pattern: IndicatorPattern) -> Result<(), DriverError>;

    fn set_tactile(&mut self, on: bool) -> Result<(), DriverError>;

    /// Blocks for at most `timeout` and returns every report received meanwhile.
    /// An empty batch means nothing happened.
    fn read_reports(&mut self, timeout: Duration) -> Result<Vec<Report>, DriverError>;

    fn close(&mut self) -> Result<(), DriverError>;
}
