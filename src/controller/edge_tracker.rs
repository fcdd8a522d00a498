//! Press-edge detection for button reports
//!
//! The driver reports the full set of held buttons on every report. The
//! tracker keeps one "held" flag per button and turns released→held
//! transitions into [`PressEvent`]s. It is only ever touched from the
//! controller session thread, which processes reports strictly one after
//! another.

use tracing::{debug, warn};

use super::driver::{ButtonMask, Report, ReportKind, WiimoteButton};

/// One button press, emitted on the released→held edge only
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PressEvent {
    pub button: WiimoteButton,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Presses detected in this report, in button table order
    Presses(Vec<PressEvent>),
    /// Report was not a button report; the session must reconnect
    Anomaly(ReportKind),
}

#[derive(Clone, Debug, Default)]
pub struct ButtonEdgeTracker {
    held: [bool; WiimoteButton::COUNT],
}

impl ButtonEdgeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, report: &Report) -> ReportOutcome {
        let held_now = match report {
            Report::Buttons { held, .. } => *held,
            other => {
                warn!("Unexpected {} report from controller", other.kind());
                return ReportOutcome::Anomaly(other.kind());
            }
        };

        let mut presses = Vec::new();
        for button in WiimoteButton::ALL {
            let flag = &mut self.held[button.index()];
            if held_now.is_held(button) {
                if !*flag {
                    *flag = true;
                    presses.push(PressEvent { button });
                }
            } else {
                *flag = false;
            }
        }

        if !presses.is_empty() {
            debug!("Detected {} press edge(s) in {:?}", presses.len(), held_now);
        }
        ReportOutcome::Presses(presses)
    }

    /// Forgets every held flag, used when a new connection starts
    pub fn reset(&mut self) {
        self.held = [false; WiimoteButton::COUNT];
    }

    pub fn held(&self) -> ButtonMask {
        WiimoteButton::ALL
            .iter()
            .filter(|button| self.held[button.index()])
            .fold(ButtonMask::EMPTY, |mask, button| mask.with(*button))
    }
}
