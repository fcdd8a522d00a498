//! Connection state shared by both session components.
//!
//! Each external resource (controller, remote link) owns exactly one
//! [`ConnectionState`] and publishes it through a `tokio::sync::watch` channel.
//! The owner is the only writer; the dispatcher only reads snapshots.

use std::fmt;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Configuring,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Configuring => "configuring",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}
