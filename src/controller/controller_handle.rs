//! Controller Handle - public API of the controller subsystem
//!
//! Spawns the controller session on its own OS thread and hands out the
//! channel ends the rest of the bridge needs: a sender for teardown signals,
//! a watch receiver for the connection state, and a one-shot exit report
//! that fires only when the session hits an unrecoverable error.
//!

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use super::driver::{ControllerDriver, DriverError};
use super::edge_tracker::PressEvent;
use super::session::{run_session_loop, ControllerSession, SessionSignal};
use crate::state::ConnectionState;

/// Configuration settings for the controller session
///
/// All intervals are plain milliseconds so they read naturally in the TOML
/// configuration file.
///
/// # Examples
///
/// ```rust
/// use mythmote::controller::ControllerSettings;
///
/// // Slower pairing loop for a remote that takes a while to wake up
/// let settings = ControllerSettings {
///     acquire_timeout_ms: 3000,
///     ..ControllerSettings::default()
/// };
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// How long a single pairing attempt may wait for a controller
    pub acquire_timeout_ms: u64,

    /// Pause between two pairing attempts
    ///
    /// Pairing needs a physical gesture on the remote, so this only keeps the
    /// log quiet; it never grows.
    pub acquire_retry_delay_ms: u64,

    /// Upper bound for one blocking report read while connected
    ///
    /// Teardown signals are checked between reads, so this is also the worst
    /// case latency of an idle disconnect.
    pub report_poll_interval_ms: u64,

    /// Length of the rumble pulse acknowledging a new connection
    pub tactile_pulse_ms: u64,

    /// Substring of the input device name identifying the remote
    pub device_name: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 1000,
            acquire_retry_delay_ms: 1000,
            report_poll_interval_ms: 100,
            tactile_pulse_ms: 200,
            device_name: "Nintendo Wii Remote".to_string(),
        }
    }
}

impl ControllerSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn acquire_retry_delay(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_delay_ms)
    }

    pub fn report_poll_interval(&self) -> Duration {
        Duration::from_millis(self.report_poll_interval_ms)
    }

    pub fn tactile_pulse(&self) -> Duration {
        Duration::from_millis(self.tactile_pulse_ms)
    }
}

/// Errors that stop the controller subsystem
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// The driver reported an unrecoverable condition, e.g. no Bluetooth adapter
    #[error("Fatal controller error: {0}")]
    Fatal(#[from] DriverError),

    /// A channel to the rest of the bridge was closed
    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),
}

/// Handle for the running controller session
///
/// # Threading Model
///
/// The session runs on a dedicated thread named `controller-session`. That
/// thread is the only caller of the driver and the only writer of the button
/// flags, so report handling needs no locking. Press events leave the thread
/// through a bounded tokio channel using `blocking_send`, which stalls the
/// report loop while the dispatcher is busy instead of buffering presses.
pub struct ControllerHandle {
    signal_sender: mpsc::UnboundedSender<SessionSignal>,
    state_receiver: watch::Receiver<ConnectionState>,
    exit_receiver: oneshot::Receiver<ControllerError>,
}

impl ControllerHandle {
    /// Spawns the controller session thread
    ///
    /// # Arguments
    ///
    /// * `driver` - Driver used for every pairing attempt
    /// * `settings` - Optional configuration; uses defaults if None
    /// * `press_sender` - Channel receiving every detected press, in order
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InitializationError`] if the thread cannot be
    /// created.
    pub fn spawn(
        driver: Box<dyn ControllerDriver>,
        settings: Option<ControllerSettings>,
        press_sender: mpsc::Sender<PressEvent>,
    ) -> Result<Self, ControllerError> {
        let settings = settings.unwrap_or_default();
        info!("Initializing controller session with settings: {:?}", settings);

        let (signal_sender, signal_receiver) = mpsc::unbounded_channel();
        let (state_sender, state_receiver) = watch::channel(ConnectionState::Disconnected);
        let (exit_sender, exit_receiver) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("controller-session".to_string())
            .spawn(move || {
                let session = ControllerSession::create(
                    driver,
                    settings,
                    press_sender,
                    signal_receiver,
                    state_sender,
                );
                let reason = run_session_loop(session);
                error!("Controller session stopped: {}", reason);
                if exit_sender.send(reason).is_err() {
                    debug!("Nobody is waiting for the controller session exit");
                }
            })
            .map_err(|e| ControllerError::InitializationError(e.to_string()))?;

        debug!("Controller session thread spawned: {:?}", thread.thread().name());
        info!("Controller session started");

        Ok(Self {
            signal_sender,
            state_receiver,
            exit_receiver,
        })
    }

    /// Sender used to ask the session to drop the controller
    pub fn signal_sender(&self) -> mpsc::UnboundedSender<SessionSignal> {
        self.signal_sender.clone()
    }

    /// Receiver for the controller connection state
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_receiver.clone()
    }

    /// Resolves once the session thread has stopped for good
    pub async fn wait_for_exit(&mut self) -> ControllerError {
        match (&mut self.exit_receiver).await {
            Ok(reason) => reason,
            Err(_) => ControllerError::ChannelError(
                "controller session ended without an exit report".to_string(),
            ),
        }
    }
}
