//! Translation of controller presses into remote control commands
//!
//! The table is fixed and total: every [`WiimoteButton`] has exactly one
//! command and there is no fallback.
//!
//! [`WiimoteButton`]: crate::controller::WiimoteButton

pub mod keymap;

pub use keymap::{command_for, Command};
