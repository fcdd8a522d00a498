//! Controller session lifecycle with statum state machine
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──► Connecting ──► Configuring ──► Connected
//!      ▲               │  ▲            │              │
//!      │               └──┘            │              │
//!      │          (retry forever)      │              │
//!      ├───────────────────────────────┘              │
//!      │        (any configuration step failed)       │
//!      └──────────────────────────────────────────────┘
//!        (teardown signal, anomalous report, device error)
//! ```
//!
//! The loop only ends on a fatal driver error (no interface at all) or when
//! the rest of the bridge has gone away. The open device lives in the machine
//! only while in `Configuring` or `Connected`.
//!
//! A remote that was just released is not taken back while it is still
//! present. Pairing resumes once it has gone away or another remote shows up.

use statum::{machine, state};
use std::fmt;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::controller_handle::{ControllerError, ControllerSettings};
use super::driver::{
    ControllerDevice, ControllerDriver, DriverError, IndicatorPattern, ReportKind, ReportMode,
};
use super::edge_tracker::{ButtonEdgeTracker, PressEvent, ReportOutcome};
use crate::state::ConnectionState;

/// How often the pairing prompt is repeated at info level
const PROMPT_EVERY_ATTEMPTS: u64 = 30;

/// Requests sent to the session from the outside
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionSignal {
    /// Drop the controller and start pairing again
    Teardown,
}

/// Why a connected session was torn down
#[derive(Debug)]
pub enum TeardownReason {
    Requested,
    AnomalousReport(ReportKind),
    DeviceError(DriverError),
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownReason::Requested => write!(f, "disconnect requested"),
            TeardownReason::AnomalousReport(kind) => write!(f, "unexpected {} report", kind),
            TeardownReason::DeviceError(e) => write!(f, "{}", e),
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Configuring,
    Connected,
}

#[machine]
pub struct ControllerSession<S: SessionPhase> {
    driver: Box<dyn ControllerDriver>,

    // Present only in Configuring and Connected
    device: Option<Box<dyn ControllerDevice>>,

    // A device whose close failed; closing is retried before each pairing attempt
    stale_device: Option<Box<dyn ControllerDevice>>,

    // Identity of the last closed device, refused until it disappears
    released: Option<String>,

    tracker: ButtonEdgeTracker,
    settings: ControllerSettings,
    press_sender: mpsc::Sender<PressEvent>,
    signal_receiver: mpsc::UnboundedReceiver<SessionSignal>,
    state_sender: watch::Sender<ConnectionState>,
}

/// Result of the configuration sequence
pub enum ConfigureOutcome {
    Ready(ControllerSession<Connected>),
    Failed(ControllerSession<Disconnected>),
}

impl<S: SessionPhase> ControllerSession<S> {
    fn publish(&self, state: ConnectionState) {
        debug!("Controller state -> {}", state);
        // send_replace never fails, even without receivers
        self.state_sender.send_replace(state);
    }

    /// Closes the open device, keeping it aside if the close fails
    fn close_device(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };
        if let Err(e) = device.set_indicator(IndicatorPattern::OFF) {
            debug!("Could not clear indicator on {}: {}", device.name(), e);
        }
        self.released = Some(device.identity());
        match device.close() {
            Ok(()) => info!("Closed controller {}", device.name()),
            Err(e) => {
                warn!(
                    "Closing controller {} failed, will retry later: {}",
                    device.name(),
                    e
                );
                self.stale_device = Some(device);
            }
        }
    }

    fn retry_stale_close(&mut self) {
        let Some(device) = self.stale_device.as_mut() else {
            return;
        };
        match device.close() {
            Ok(()) => {
                info!("Closed stale controller {}", device.name());
                self.stale_device = None;
            }
            Err(e) => debug!("Stale controller {} still not closed: {}", device.name(), e),
        }
    }
}

impl ControllerSession<Disconnected> {
    pub fn create(
        driver: Box<dyn ControllerDriver>,
        settings: ControllerSettings,
        press_sender: mpsc::Sender<PressEvent>,
        signal_receiver: mpsc::UnboundedReceiver<SessionSignal>,
        state_sender: watch::Sender<ConnectionState>,
    ) -> Self {
        debug!("Creating controller session with settings: {:?}", settings);
        Self::new(
            driver,
            None, // device
            None, // stale_device
            None, // released
            ButtonEdgeTracker::new(),
            settings,
            press_sender,
            signal_receiver,
            state_sender,
        )
    }

    pub fn begin_acquire(self) -> ControllerSession<Connecting> {
        self.publish(ConnectionState::Connecting);
        self.transition()
    }
}

impl ControllerSession<Connecting> {
    /// Tries to pair until a controller shows up
    ///
    /// Transient failures are logged and retried after a fixed delay, forever.
    /// Only a fatal driver error is returned.
    pub fn acquire(mut self) -> Result<ControllerSession<Configuring>, ControllerError> {
        let timeout = self.settings.acquire_timeout();
        let retry_delay = self.settings.acquire_retry_delay();
        let mut attempt: u64 = 0;
        let mut waiting_for_release = false;

        loop {
            attempt += 1;
            self.retry_stale_close();

            if attempt == 1 || attempt % PROMPT_EVERY_ATTEMPTS == 0 {
                info!("Press 1+2 on the Wii remote now (attempt {})", attempt);
            } else {
                debug!("Pairing attempt {}", attempt);
            }

            match self.driver.open(timeout) {
                Ok(mut device)
                    if self.released.as_deref() == Some(device.identity().as_str()) =>
                {
                    if !waiting_for_release {
                        info!(
                            "Controller {} is still connected, waiting for it to go away",
                            device.name()
                        );
                        waiting_for_release = true;
                    }
                    if let Err(e) = device.close() {
                        debug!("Closing released controller {} failed: {}", device.name(), e);
                    }
                    std::thread::sleep(retry_delay);
                }
                Ok(device) => {
                    info!("Found controller {} after {} attempt(s)", device.name(), attempt);
                    self.released = None;
                    self.device = Some(device);
                    self.publish(ConnectionState::Configuring);
                    return Ok(self.transition());
                }
                Err(e) if e.is_fatal() => {
                    error!("Cannot pair with a controller: {}", e);
                    self.publish(ConnectionState::Error);
                    return Err(ControllerError::Fatal(e));
                }
                Err(e) => {
                    debug!("Pairing attempt {} failed: {}", attempt, e);
                    if self.released.take().is_some() {
                        debug!("Released controller has gone away");
                    }
                    std::thread::sleep(retry_delay);
                }
            }
        }
    }
}

impl ControllerSession<Configuring> {
    /// Runs the whole configuration sequence, all or nothing
    pub fn configure(mut self) -> ConfigureOutcome {
        match self.apply_configuration() {
            Ok(()) => {
                self.tracker.reset();
                self.discard_stale_signals();
                self.publish(ConnectionState::Connected);
                info!("Controller connected and configured");
                ConfigureOutcome::Ready(self.transition())
            }
            Err(e) => {
                warn!("Controller configuration failed, starting over: {}", e);
                self.close_device();
                self.publish(ConnectionState::Disconnected);
                ConfigureOutcome::Failed(self.transition())
            }
        }
    }

    fn apply_configuration(&mut self) -> Result<(), DriverError> {
        let pulse = self.settings.tactile_pulse();
        let device = self.device.as_mut().ok_or(DriverError::Disconnected)?;

        device.set_report_mode(ReportMode::BUTTONS)?;
        device.enable_messages()?;
        device.set_indicator(IndicatorPattern::CONNECTED)?;

        device.set_tactile(true)?;
        std::thread::sleep(pulse);
        device.set_tactile(false)?;

        Ok(())
    }

    // Signals sent while no controller was connected refer to an old connection
    fn discard_stale_signals(&mut self) {
        let mut discarded = 0;
        while self.signal_receiver.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("Discarded {} stale session signal(s)", discarded);
        }
    }
}

impl ControllerSession<Connected> {
    /// Pumps reports until something ends the connection, then tears down
    pub fn serve(mut self) -> Result<ControllerSession<Disconnected>, ControllerError> {
        let reason = match self.pump_reports() {
            Ok(reason) => reason,
            Err(e) => {
                self.close_device();
                self.publish(ConnectionState::Error);
                return Err(e);
            }
        };

        info!("Tearing down controller session: {}", reason);
        self.close_device();
        self.publish(ConnectionState::Disconnected);
        Ok(self.transition())
    }

    fn pump_reports(&mut self) -> Result<TeardownReason, ControllerError> {
        let poll_interval = self.settings.report_poll_interval();

        loop {
            match self.signal_receiver.try_recv() {
                Ok(SessionSignal::Teardown) => return Ok(TeardownReason::Requested),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    return Err(ControllerError::ChannelError(
                        "session signal channel closed".to_string(),
                    ))
                }
            }

            let Some(device) = self.device.as_mut() else {
                return Ok(TeardownReason::DeviceError(DriverError::Disconnected));
            };

            let reports = match device.read_reports(poll_interval) {
                Ok(reports) => reports,
                Err(e) if e.is_fatal() => return Err(ControllerError::Fatal(e)),
                Err(e) => return Ok(TeardownReason::DeviceError(e)),
            };

            for report in reports {
                match self.tracker.process(&report) {
                    ReportOutcome::Presses(presses) => {
                        for press in presses {
                            info!(
                                "Button pressed: {} at {}",
                                press.button,
                                report.timestamp().format("%H:%M:%S.%3f")
                            );
                            self.press_sender.blocking_send(press).map_err(|_| {
                                ControllerError::ChannelError(
                                    "press event channel closed".to_string(),
                                )
                            })?;
                        }
                    }
                    ReportOutcome::Anomaly(kind) => {
                        return Ok(TeardownReason::AnomalousReport(kind))
                    }
                }
            }
        }
    }
}

/// Runs the circular session lifecycle until it can no longer continue
///
/// Returns the error that ended the loop.
pub fn run_session_loop(mut session: ControllerSession<Disconnected>) -> ControllerError {
    info!("Entering controller session loop");
    loop {
        let configuring = match session.begin_acquire().acquire() {
            Ok(configuring) => configuring,
            Err(e) => return e,
        };

        session = match configuring.configure() {
            ConfigureOutcome::Ready(connected) => match connected.serve() {
                Ok(disconnected) => disconnected,
                Err(e) => return e,
            },
            ConfigureOutcome::Failed(disconnected) => disconnected,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::driver::{ButtonMask, Report, WiimoteButton};
    use chrono::Local;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq)]
    enum Call {
        Open,
        ReportMode(ReportMode),
        EnableMessages,
        Indicator(IndicatorPattern),
        Tactile(bool),
        Close,
    }

    type CallLog = Arc<Mutex<Vec<Call>>>;

    struct ScriptedDevice {
        identity: String,
        batches: VecDeque<Result<Vec<Report>, DriverError>>,
        fail_indicator: bool,
        log: CallLog,
    }

    impl ControllerDevice for ScriptedDevice {
        fn name(&self) -> String {
            "scripted remote".to_string()
        }

        fn identity(&self) -> String {
            self.identity.clone()
        }

        fn set_report_mode(&mut self, mode: ReportMode) -> Result<(), DriverError> {
            self.log.lock().unwrap().push(Call::ReportMode(mode));
            Ok(())
        }

        fn enable_messages(&mut self) -> Result<(), DriverError> {
            self.log.lock().unwrap().push(Call::EnableMessages);
            Ok(())
        }

        fn set_indicator(&mut self, pattern: IndicatorPattern) -> Result<(), DriverError> {
            self.log.lock().unwrap().push(Call::Indicator(pattern));
            if self.fail_indicator && pattern != IndicatorPattern::OFF {
                return Err(DriverError::Io("led write failed".into()));
            }
            Ok(())
        }

        fn set_tactile(&mut self, on: bool) -> Result<(), DriverError> {
            self.log.lock().unwrap().push(Call::Tactile(on));
            Ok(())
        }

        fn read_reports(&mut self, timeout: Duration) -> Result<Vec<Report>, DriverError> {
            match self.batches.pop_front() {
                Some(batch) => batch,
                None => {
                    std::thread::sleep(timeout.min(Duration::from_millis(1)));
                    Ok(Vec::new())
                }
            }
        }

        fn close(&mut self) -> Result<(), DriverError> {
            self.log.lock().unwrap().push(Call::Close);
            Ok(())
        }
    }

    /// Hands out scripted devices; once the script runs out every open is fatal
    struct ScriptedDriver {
        opens: VecDeque<Result<ScriptedDevice, DriverError>>,
        log: CallLog,
    }

    impl ControllerDriver for ScriptedDriver {
        fn open(&mut self, _timeout: Duration) -> Result<Box<dyn ControllerDevice>, DriverError> {
            self.log.lock().unwrap().push(Call::Open);
            match self.opens.pop_front() {
                Some(Ok(device)) => Ok(Box::new(device)),
                Some(Err(e)) => Err(e),
                None => Err(DriverError::NoInterface("script exhausted".into())),
            }
        }
    }

    static NEXT_REMOTE: AtomicUsize = AtomicUsize::new(0);

    /// A device for a remote not seen before
    fn device(log: &CallLog, batches: Vec<Result<Vec<Report>, DriverError>>) -> ScriptedDevice {
        let identity = format!("remote-{}", NEXT_REMOTE.fetch_add(1, Ordering::Relaxed));
        device_as(log, &identity, batches)
    }

    fn device_as(
        log: &CallLog,
        identity: &str,
        batches: Vec<Result<Vec<Report>, DriverError>>,
    ) -> ScriptedDevice {
        ScriptedDevice {
            identity: identity.to_string(),
            batches: batches.into(),
            fail_indicator: false,
            log: log.clone(),
        }
    }

    fn fast_settings() -> ControllerSettings {
        ControllerSettings {
            acquire_timeout_ms: 1,
            acquire_retry_delay_ms: 0,
            report_poll_interval_ms: 1,
            tactile_pulse_ms: 0,
            ..ControllerSettings::default()
        }
    }

    struct Harness {
        session: ControllerSession<Disconnected>,
        presses: mpsc::Receiver<PressEvent>,
        signals: mpsc::UnboundedSender<SessionSignal>,
        state: watch::Receiver<ConnectionState>,
    }

    fn harness(opens: Vec<Result<ScriptedDevice, DriverError>>, log: &CallLog) -> Harness {
        let (press_sender, presses) = mpsc::channel(64);
        let (signals, signal_receiver) = mpsc::unbounded_channel();
        let (state_sender, state) = watch::channel(ConnectionState::Disconnected);
        let driver = ScriptedDriver {
            opens: opens.into(),
            log: log.clone(),
        };
        let session = ControllerSession::create(
            Box::new(driver),
            fast_settings(),
            press_sender,
            signal_receiver,
            state_sender,
        );
        Harness {
            session,
            presses,
            signals,
            state,
        }
    }

    fn count(log: &CallLog, call: &Call) -> usize {
        log.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    fn unknown_report() -> Report {
        Report::Unknown {
            code: 0x42,
            timestamp: Local::now(),
        }
    }

    #[test]
    fn test_acquire_retries_transient_errors() {
        let log = CallLog::default();
        let h = harness(
            vec![
                Err(DriverError::Timeout(Duration::from_millis(1))),
                Err(DriverError::NotFound("no such device".into())),
                Ok(device(&log, vec![])),
            ],
            &log,
        );

        let configuring = h.session.begin_acquire().acquire();

        assert!(configuring.is_ok());
        assert_eq!(count(&log, &Call::Open), 3);
        assert_eq!(*h.state.borrow(), ConnectionState::Configuring);
    }

    #[test]
    fn test_acquire_stops_on_fatal_error() {
        let log = CallLog::default();
        let h = harness(
            vec![Err(DriverError::NoInterface("No Bluetooth interface found".into()))],
            &log,
        );

        let result = h.session.begin_acquire().acquire();

        assert!(matches!(
            result,
            Err(ControllerError::Fatal(DriverError::NoInterface(_)))
        ));
        assert_eq!(*h.state.borrow(), ConnectionState::Error);
    }

    #[test]
    fn test_configure_runs_full_sequence() {
        let log = CallLog::default();
        let h = harness(vec![Ok(device(&log, vec![]))], &log);

        let configuring = h.session.begin_acquire().acquire().unwrap();
        let outcome = configuring.configure();

        assert!(matches!(outcome, ConfigureOutcome::Ready(_)));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Call::Open,
                Call::ReportMode(ReportMode::BUTTONS),
                Call::EnableMessages,
                Call::Indicator(IndicatorPattern::CONNECTED),
                Call::Tactile(true),
                Call::Tactile(false),
            ]
        );
        assert_eq!(*h.state.borrow(), ConnectionState::Connected);
    }

    #[test]
    fn test_failed_configuration_closes_and_starts_over() {
        let log = CallLog::default();
        let mut failing = device(&log, vec![]);
        failing.fail_indicator = true;
        let h = harness(vec![Ok(failing)], &log);

        let configuring = h.session.begin_acquire().acquire().unwrap();
        let outcome = configuring.configure();

        assert!(matches!(outcome, ConfigureOutcome::Failed(_)));
        assert_eq!(count(&log, &Call::Close), 1);
        assert_eq!(count(&log, &Call::Tactile(true)), 0);
        assert_eq!(*h.state.borrow(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_presses_are_forwarded_in_order() {
        let log = CallLog::default();
        let a = ButtonMask::from_buttons(&[WiimoteButton::A]);
        let a_up = ButtonMask::from_buttons(&[WiimoteButton::A, WiimoteButton::Up]);
        let batches = vec![
            Ok(vec![Report::buttons(a), Report::buttons(a_up)]),
            Ok(vec![Report::buttons(ButtonMask::EMPTY), Report::buttons(a)]),
            Ok(vec![unknown_report()]),
        ];
        let mut h = harness(vec![Ok(device(&log, batches))], &log);

        let reason = run_session_loop(h.session);

        assert!(matches!(reason, ControllerError::Fatal(_)));
        let mut received = Vec::new();
        while let Ok(press) = h.presses.try_recv() {
            received.push(press.button);
        }
        assert_eq!(
            received,
            vec![WiimoteButton::A, WiimoteButton::Up, WiimoteButton::A]
        );
    }

    #[test]
    fn test_each_anomalous_report_tears_down_once() {
        let log = CallLog::default();
        let opens = (0..12)
            .map(|_| Ok(device(&log, vec![Ok(vec![unknown_report()])])))
            .collect();
        let h = harness(opens, &log);

        let reason = run_session_loop(h.session);

        assert!(matches!(reason, ControllerError::Fatal(_)));
        assert_eq!(count(&log, &Call::Close), 12);
        // twelve reconnects plus the final fatal attempt
        assert_eq!(count(&log, &Call::Open), 13);
    }

    #[test]
    fn test_device_error_reconnects() {
        let log = CallLog::default();
        let h = harness(
            vec![
                Ok(device(&log, vec![Err(DriverError::Io("hidp socket closed".into()))])),
                Ok(device(&log, vec![Ok(vec![unknown_report()])])),
            ],
            &log,
        );

        run_session_loop(h.session);

        assert_eq!(count(&log, &Call::Close), 2);
        assert_eq!(count(&log, &Call::Open), 3);
    }

    #[test]
    fn test_teardown_signal_disconnects_and_reacquires() {
        let log = CallLog::default();
        let batches = vec![Ok(vec![Report::buttons(ButtonMask::from_buttons(&[
            WiimoteButton::Home,
        ]))])];
        let mut h = harness(vec![Ok(device(&log, batches))], &log);
        let signals = h.signals.clone();

        let session_thread = std::thread::spawn(move || run_session_loop(h.session));

        let press = h.presses.blocking_recv().unwrap();
        assert_eq!(press.button, WiimoteButton::Home);
        signals.send(SessionSignal::Teardown).unwrap();

        let reason = session_thread.join().unwrap();
        assert!(matches!(reason, ControllerError::Fatal(_)));
        assert_eq!(count(&log, &Call::Close), 1);
        assert_eq!(count(&log, &Call::Indicator(IndicatorPattern::OFF)), 1);
        assert_eq!(count(&log, &Call::Open), 2);
    }

    #[test]
    fn test_stale_signals_do_not_drop_a_fresh_connection() {
        let log = CallLog::default();
        let batches = vec![
            Ok(vec![Report::buttons(ButtonMask::from_buttons(&[
                WiimoteButton::Plus,
            ]))]),
            Ok(vec![unknown_report()]),
        ];
        let mut h = harness(vec![Ok(device(&log, batches))], &log);
        h.signals.send(SessionSignal::Teardown).unwrap();
        h.signals.send(SessionSignal::Teardown).unwrap();

        let configuring = h.session.begin_acquire().acquire().unwrap();
        let connected = match configuring.configure() {
            ConfigureOutcome::Ready(connected) => connected,
            ConfigureOutcome::Failed(_) => panic!("configuration failed"),
        };
        let _ = connected.serve().unwrap();

        // the press was still read, so the stale signals did not end the session
        assert_eq!(h.presses.try_recv().unwrap().button, WiimoteButton::Plus);
        assert_eq!(count(&log, &Call::Close), 1);
    }

    #[test]
    fn test_released_remote_is_not_reconfigured_while_present() {
        let log = CallLog::default();
        let h = harness(
            vec![
                Ok(device_as(&log, "00:1F:32:AA:BB:CC", vec![Ok(vec![unknown_report()])])),
                Ok(device_as(&log, "00:1F:32:AA:BB:CC", vec![])),
                Ok(device_as(&log, "00:1F:32:AA:BB:CC", vec![])),
            ],
            &log,
        );

        let reason = run_session_loop(h.session);

        assert!(matches!(reason, ControllerError::Fatal(_)));
        assert_eq!(count(&log, &Call::EnableMessages), 1);
        assert_eq!(count(&log, &Call::Indicator(IndicatorPattern::CONNECTED)), 1);
        // the teardown plus one close for every refused open
        assert_eq!(count(&log, &Call::Close), 3);
        assert_eq!(count(&log, &Call::Open), 4);
    }

    #[test]
    fn test_released_remote_is_taken_back_after_it_went_away() {
        let log = CallLog::default();
        let h = harness(
            vec![
                Ok(device_as(&log, "00:1F:32:AA:BB:CC", vec![Ok(vec![unknown_report()])])),
                Err(DriverError::Timeout(Duration::from_millis(1))),
                Ok(device_as(&log, "00:1F:32:AA:BB:CC", vec![Ok(vec![unknown_report()])])),
            ],
            &log,
        );

        run_session_loop(h.session);

        assert_eq!(count(&log, &Call::EnableMessages), 2);
        assert_eq!(count(&log, &Call::Close), 2);
    }

    #[test]
    fn test_another_remote_is_taken_while_released_one_remains() {
        let log = CallLog::default();
        let h = harness(
            vec![
                Ok(device_as(&log, "00:1F:32:AA:BB:CC", vec![Ok(vec![unknown_report()])])),
                Ok(device_as(&log, "00:1F:32:AA:BB:CC", vec![])),
                Ok(device_as(&log, "00:1F:32:DD:EE:FF", vec![Ok(vec![unknown_report()])])),
            ],
            &log,
        );

        run_session_loop(h.session);

        assert_eq!(count(&log, &Call::EnableMessages), 2);
        assert_eq!(count(&log, &Call::Close), 3);
        assert_eq!(count(&log, &Call::Open), 4);
    }
}
