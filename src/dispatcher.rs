//! Session Dispatcher - top level event loop of the bridge
//!
//! Turns presses into commands for the remote link and keeps the idle timer.
//! Any press or playback notification restarts the idle window. When the
//! window runs out while a controller is connected, exactly one teardown
//! signal goes to the controller session and the timer stays disarmed until
//! the next activity.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::controller::{PressEvent, SessionSignal};
use crate::mapping::command_for;
use crate::remote::Outbound;
use crate::state::ConnectionState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Silence after which the controller is disconnected
    pub idle_timeout_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 60_000,
        }
    }
}

impl DispatcherSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Single deadline restarted by activity
#[derive(Clone, Debug)]
pub struct IdleTimer {
    window: Duration,
    deadline: Option<Instant>,
}

impl IdleTimer {
    /// Creates an armed timer
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: Some(Instant::now() + window),
        }
    }

    pub fn reset(&mut self) {
        self.deadline = Some(Instant::now() + self.window);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

pub struct SessionDispatcher {
    press_receiver: mpsc::Receiver<PressEvent>,
    status_receiver: mpsc::Receiver<String>,
    command_sender: mpsc::Sender<Outbound>,
    signal_sender: mpsc::UnboundedSender<SessionSignal>,
    controller_state: watch::Receiver<ConnectionState>,
    idle: IdleTimer,
}

impl SessionDispatcher {
    pub fn new(
        settings: DispatcherSettings,
        press_receiver: mpsc::Receiver<PressEvent>,
        status_receiver: mpsc::Receiver<String>,
        command_sender: mpsc::Sender<Outbound>,
        signal_sender: mpsc::UnboundedSender<SessionSignal>,
        controller_state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            press_receiver,
            status_receiver,
            command_sender,
            signal_sender,
            controller_state,
            idle: IdleTimer::new(settings.idle_timeout()),
        }
    }

    /// Runs until both the press and the status channel are closed
    pub async fn run(mut self) {
        info!("Session dispatcher started");
        let mut presses_open = true;
        let mut status_open = true;
        let mut state_open = true;

        while presses_open || status_open {
            let deadline = self.idle.deadline();

            tokio::select! {
                press = self.press_receiver.recv(), if presses_open => match press {
                    Some(press) => self.handle_press(press).await,
                    None => {
                        info!("Press channel closed");
                        presses_open = false;
                    }
                },
                status = self.status_receiver.recv(), if status_open => match status {
                    Some(line) => {
                        debug!("Remote activity: {}", line.trim());
                        self.idle.reset();
                    }
                    None => {
                        info!("Status channel closed");
                        status_open = false;
                    }
                },
                changed = self.controller_state.changed(), if state_open => {
                    if changed.is_err() {
                        debug!("Controller state channel closed");
                        state_open = false;
                        continue;
                    }
                    let state = *self.controller_state.borrow_and_update();
                    if state.is_connected() {
                        debug!("Controller connected, restarting idle window");
                        self.idle.reset();
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.handle_idle_expiry();
                }
            }
        }

        info!("Session dispatcher stopped");
    }

    async fn handle_press(&mut self, press: PressEvent) {
        let command = command_for(press.button);
        debug!("Button {} -> '{}'", press.button, command);
        if self.command_sender.send(Outbound::now(command)).await.is_err() {
            warn!("Remote link is gone, dropping command '{}'", command);
        }
        self.idle.reset();
    }

    fn handle_idle_expiry(&mut self) {
        self.idle.disarm();

        if !self.controller_state.borrow().is_connected() {
            debug!("Idle window elapsed without a connected controller");
            return;
        }

        info!("No activity for {:?}, disconnecting controller", self.idle.window);
        if self.signal_sender.send(SessionSignal::Teardown).is_err() {
            warn!("Controller session is gone, teardown not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::WiimoteButton;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::task::JoinHandle;
    use tokio::time::advance;

    struct Harness {
        presses: mpsc::Sender<PressEvent>,
        status: mpsc::Sender<String>,
        commands: mpsc::Receiver<Outbound>,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
        controller_state: watch::Sender<ConnectionState>,
        task: JoinHandle<()>,
    }

    fn start(initial: ConnectionState) -> Harness {
        let (presses, press_receiver) = mpsc::channel(1);
        let (status, status_receiver) = mpsc::channel(8);
        let (command_sender, commands) = mpsc::channel(8);
        let (signal_sender, signals) = mpsc::unbounded_channel();
        let (controller_state, state_receiver) = watch::channel(initial);

        let dispatcher = SessionDispatcher::new(
            DispatcherSettings::default(),
            press_receiver,
            status_receiver,
            command_sender,
            signal_sender,
            state_receiver,
        );
        let task = tokio::spawn(dispatcher.run());

        Harness {
            presses,
            status,
            commands,
            signals,
            controller_state,
            task,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn press(h: &Harness, button: WiimoteButton) {
        h.presses.send(PressEvent { button }).await.unwrap();
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_is_forwarded_as_command() {
        let mut h = start(ConnectionState::Connected);

        press(&h, WiimoteButton::A).await;

        assert_eq!(h.commands.try_recv().unwrap().command.as_str(), "key enter");
        assert_eq!(h.commands.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_button_reaches_the_link_in_order() {
        let mut h = start(ConnectionState::Connected);

        for button in WiimoteButton::ALL {
            press(&h, button).await;
        }

        for button in WiimoteButton::ALL {
            assert_eq!(h.commands.try_recv().unwrap().command, command_for(button));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_sends_exactly_one_teardown() {
        let mut h = start(ConnectionState::Connected);
        settle().await;

        advance(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(h.signals.try_recv(), Err(TryRecvError::Empty));

        advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(h.signals.try_recv(), Ok(SessionSignal::Teardown));

        advance(Duration::from_secs(300)).await;
        settle().await;
        assert_eq!(h.signals.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_before_deadline_restarts_window() {
        let mut h = start(ConnectionState::Connected);
        settle().await;

        advance(Duration::from_secs(59)).await;
        press(&h, WiimoteButton::Down).await;

        advance(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(h.signals.try_recv(), Err(TryRecvError::Empty));

        advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(h.signals.try_recv(), Ok(SessionSignal::Teardown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_notification_only_restarts_window() {
        let mut h = start(ConnectionState::Connected);
        settle().await;

        advance(Duration::from_secs(30)).await;
        h.status
            .send("# Playback Recorded foo".to_string())
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.commands.try_recv(), Err(TryRecvError::Empty));

        advance(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(h.signals.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(h.commands.try_recv(), Err(TryRecvError::Empty));

        advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(h.signals.try_recv(), Ok(SessionSignal::Teardown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_teardown_without_connected_controller() {
        let mut h = start(ConnectionState::Connecting);
        settle().await;

        advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(h.signals.try_recv(), Err(TryRecvError::Empty));

        // A fresh connection gets a full window
        h.controller_state.send_replace(ConnectionState::Connected);
        settle().await;
        advance(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(h.signals.try_recv(), Err(TryRecvError::Empty));

        advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(h.signals.try_recv(), Ok(SessionSignal::Teardown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_inputs_close() {
        let h = start(ConnectionState::Disconnected);
        let Harness {
            presses,
            status,
            task,
            ..
        } = h;

        drop(presses);
        drop(status);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
