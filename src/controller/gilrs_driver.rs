//! gilrs backed driver for a Wii remote exposed by the kernel
//!
//! On Linux the `hid-wiimote` kernel driver turns a paired remote into a
//! regular input device. This backend finds that device through gilrs, keeps
//! the held-button mask up to date from press/release events and hands it to
//! the session as button reports, the same shape the remote itself sends.
//!
//! Rumble goes through gilrs force feedback. The player LEDs are not part of
//! the input layer; they are written through the device's sysfs node. Closing
//! asks BlueZ to disconnect the remote, since the input device would otherwise
//! stay registered and be found again on the next pairing attempt.

use chrono::{DateTime, Local};
use gilrs::ff::{BaseEffect, BaseEffectType, Effect, EffectBuilder, Replay, Ticks};
use gilrs::{Button, Event, EventType, GamepadId, Gilrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::bluez;
use super::driver::{
    ButtonMask, ControllerDevice, ControllerDriver, DriverError, IndicatorPattern, Report,
    ReportMode, WiimoteButton,
};
use super::sysfs::{WiimoteNode, SYSFS_ROOT};

/// Longest a single rumble may run if nobody switches it off
const RUMBLE_SAFETY_LIMIT_MS: u32 = 1000;

pub struct GilrsDriver {
    device_name: String,
    sysfs_root: PathBuf,
}

impl GilrsDriver {
    /// `device_name` is matched as a substring of the input device name
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            sysfs_root: PathBuf::from(SYSFS_ROOT),
        }
    }

    fn find_gamepad(&self, gilrs: &Gilrs) -> Option<(GamepadId, String)> {
        gilrs
            .gamepads()
            .find(|(_, gamepad)| gamepad.name().contains(&self.device_name))
            .map(|(id, gamepad)| (id, gamepad.name().to_string()))
    }
}

impl ControllerDriver for GilrsDriver {
    fn open(&mut self, timeout: Duration) -> Result<Box<dyn ControllerDevice>, DriverError> {
        // A fresh context rescans input devices, picking up a remote that was
        // paired after the previous attempt.
        let mut gilrs = match Gilrs::new() {
            Ok(g) => g,
            Err(gilrs::Error::NotImplemented(_)) => {
                return Err(DriverError::NoInterface(
                    "input backend not supported on this platform".to_string(),
                ))
            }
            Err(e) => return Err(DriverError::NoInterface(e.to_string())),
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some((id, name)) = self.find_gamepad(&gilrs) {
                info!("Selected controller: {} ({})", name, id);
                let node = WiimoteNode::find(&self.sysfs_root, &name);
                if node.is_none() {
                    warn!("No sysfs node for {}, LEDs and release unavailable", name);
                }
                return Ok(Box::new(GilrsDevice::new(
                    gilrs,
                    id,
                    name,
                    node,
                    self.sysfs_root.clone(),
                )));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Other input devices are present, just not ours
                if gilrs.gamepads().next().is_some() {
                    return Err(DriverError::NotFound(self.device_name.clone()));
                }
                return Err(DriverError::Timeout(timeout));
            }

            // Connect events arrive through the event queue
            if let Some(Event { id, event, .. }) = gilrs.next_event_blocking(Some(remaining)) {
                debug!("Input event while pairing: {:?} from {}", event, id);
            }
        }
    }
}

struct GilrsDevice {
    gilrs: Gilrs,
    id: GamepadId,
    name: String,
    node: Option<WiimoteNode>,
    address: Option<String>,
    sysfs_root: PathBuf,
    mode: ReportMode,
    messages_enabled: bool,
    held: ButtonMask,
    rumble: Option<Effect>,
}

impl GilrsDevice {
    fn new(
        gilrs: Gilrs,
        id: GamepadId,
        name: String,
        node: Option<WiimoteNode>,
        sysfs_root: PathBuf,
    ) -> Self {
        let address = node.as_ref().and_then(WiimoteNode::address);
        Self {
            gilrs,
            id,
            name,
            node,
            address,
            sysfs_root,
            mode: ReportMode::BUTTONS,
            messages_enabled: false,
            held: ButtonMask::EMPTY,
            rumble: None,
        }
    }

    fn rumble_effect(&mut self) -> Result<Option<&Effect>, DriverError> {
        if self.rumble.is_none() {
            let supported = self
                .gilrs
                .connected_gamepad(self.id)
                .map(|gamepad| gamepad.is_ff_supported())
                .unwrap_or(false);
            if !supported {
                return Ok(None);
            }

            let effect = EffectBuilder::new()
                .add_effect(BaseEffect {
                    kind: BaseEffectType::Strong { magnitude: u16::MAX },
                    scheduling: Replay {
                        play_for: Ticks::from_ms(RUMBLE_SAFETY_LIMIT_MS),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .gamepads(&[self.id])
                .finish(&mut self.gilrs)
                .map_err(|e| DriverError::Io(format!("rumble setup failed: {}", e)))?;
            self.rumble = Some(effect);
        }
        Ok(self.rumble.as_ref())
    }

    fn translate(&mut self, event: EventType, time: DateTime<Local>) -> Option<Report> {
        match event {
            EventType::ButtonPressed(button, _) => {
                let button = map_button(button)?;
                self.held = self.held.with(button);
                self.button_report(time)
            }
            EventType::ButtonReleased(button, _) => {
                let button = map_button(button)?;
                self.held = self.held.without(button);
                self.button_report(time)
            }
            EventType::AxisChanged(..) if self.mode.contains(ReportMode::MOTION) => {
                Some(Report::Motion { timestamp: time })
            }
            EventType::Disconnected => Some(Report::Error {
                reason: "controller disconnected".to_string(),
                timestamp: time,
            }),
            _ => None,
        }
    }

    fn button_report(&self, timestamp: DateTime<Local>) -> Option<Report> {
        self.mode.contains(ReportMode::BUTTONS).then_some(Report::Buttons {
            held: self.held,
            timestamp,
        })
    }
}

impl ControllerDevice for GilrsDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn identity(&self) -> String {
        self.address.clone().unwrap_or_else(|| self.name.clone())
    }

    fn set_report_mode(&mut self, mode: ReportMode) -> Result<(), DriverError> {
        debug!("Report mode for {}: {:?}", self.name, mode);
        self.mode = mode;
        Ok(())
    }

    fn enable_messages(&mut self) -> Result<(), DriverError> {
        // Drop whatever queued up while pairing
        while self.gilrs.next_event().is_some() {}
        self.held = ButtonMask::EMPTY;
        self.messages_enabled = true;
        Ok(())
    }

    fn set_indicator(&mut self, pattern: IndicatorPattern) -> Result<(), DriverError> {
        let Some(node) = self.node.as_ref() else {
            return Err(DriverError::Io(format!("no LED node for {}", self.name)));
        };
        debug!("Indicator {:#06b} on {}", pattern.bits(), self.name);
        node.set_indicator(pattern)
    }

    fn set_tactile(&mut self, on: bool) -> Result<(), DriverError> {
        let name = self.name.clone();
        let Some(effect) = self.rumble_effect()? else {
            debug!("{} has no force feedback, skipping rumble", name);
            return Ok(());
        };
        let result = if on { effect.play() } else { effect.stop() };
        result.map_err(|e| DriverError::Io(format!("rumble failed: {}", e)))
    }

    fn read_reports(&mut self, timeout: Duration) -> Result<Vec<Report>, DriverError> {
        let mut reports = Vec::new();
        let mut next = self.gilrs.next_event_blocking(Some(timeout));

        while let Some(Event { id, event, time, .. }) = next {
            if id == self.id && self.messages_enabled {
                if let Some(report) = self.translate(event, DateTime::<Local>::from(time)) {
                    reports.push(report);
                }
            }
            next = self.gilrs.next_event();
        }

        Ok(reports)
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if let Some(effect) = self.rumble.take() {
            if let Err(e) = effect.stop() {
                warn!("Could not stop rumble on {}: {}", self.name, e);
            }
        }
        self.messages_enabled = false;

        match self.address.as_deref() {
            Some(address) => bluez::disconnect(&self.sysfs_root, address),
            None => {
                debug!("{} has no Bluetooth address, leaving the link up", self.name);
                Ok(())
            }
        }
    }
}

// Layout the hid-wiimote input device presents through gilrs
fn map_button(button: Button) -> Option<WiimoteButton> {
    match button {
        Button::South => Some(WiimoteButton::A),
        Button::East => Some(WiimoteButton::B),
        Button::West => Some(WiimoteButton::One),
        Button::North => Some(WiimoteButton::Two),
        Button::Select => Some(WiimoteButton::Minus),
        Button::Start => Some(WiimoteButton::Plus),
        Button::Mode => Some(WiimoteButton::Home),
        Button::DPadLeft => Some(WiimoteButton::Left),
        Button::DPadRight => Some(WiimoteButton::Right),
        Button::DPadDown => Some(WiimoteButton::Down),
        Button::DPadUp => Some(WiimoteButton::Up),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_wiimote_button_has_a_gamepad_button() {
        let gamepad_buttons = [
            Button::South,
            Button::East,
            Button::West,
            Button::North,
            Button::Select,
            Button::Start,
            Button::Mode,
            Button::DPadLeft,
            Button::DPadRight,
            Button::DPadDown,
            Button::DPadUp,
        ];
        let mapped: Vec<WiimoteButton> = gamepad_buttons
            .iter()
            .filter_map(|button| map_button(*button))
            .collect();

        for button in WiimoteButton::ALL {
            assert_eq!(mapped.iter().filter(|b| **b == button).count(), 1);
        }
    }

    #[test]
    fn test_triggers_are_not_mapped() {
        assert_eq!(map_button(Button::LeftTrigger), None);
        assert_eq!(map_button(Button::RightThumb), None);
    }
}
