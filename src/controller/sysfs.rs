//! sysfs view of a remote bound to the `hid-wiimote` kernel driver
//!
//! ```text
//! /sys/class/input/inputN/name         "Nintendo Wii Remote"
//! /sys/class/input/inputN/device  ──►  HID device, e.g. 0005:057E:0306.0001
//!                          ├─ uevent   HID_UNIQ=00:1f:32:aa:bb:cc
//!                          └─ leds/0005:057E:0306.0001:blue:p0 .. p3/brightness
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::driver::{DriverError, IndicatorPattern};

pub const SYSFS_ROOT: &str = "/sys";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WiimoteNode {
    hid_dir: PathBuf,
}

impl WiimoteNode {
    /// Finds the input device whose name is exactly `name`
    ///
    /// The remote also registers "... Accelerometer" and "... IR" inputs, so
    /// a substring match would be ambiguous here.
    pub fn find(sysfs_root: &Path, name: &str) -> Option<Self> {
        let input_class = sysfs_root.join("class/input");
        let entries = match fs::read_dir(&input_class) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {}: {}", input_class.display(), e);
                return None;
            }
        };

        let mut inputs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("input"))
            })
            .collect();
        inputs.sort();

        inputs
            .into_iter()
            .find(|dir| {
                fs::read_to_string(dir.join("name"))
                    .map(|n| n.trim() == name)
                    .unwrap_or(false)
            })
            .map(|dir| Self {
                hid_dir: dir.join("device"),
            })
    }

    /// Bluetooth address of the remote, upper case
    pub fn address(&self) -> Option<String> {
        let uevent = fs::read_to_string(self.hid_dir.join("uevent")).ok()?;
        uevent
            .lines()
            .find_map(|line| line.strip_prefix("HID_UNIQ="))
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(|address| address.to_ascii_uppercase())
    }

    pub fn set_indicator(&self, pattern: IndicatorPattern) -> Result<(), DriverError> {
        for (led, path) in IndicatorPattern::EACH.iter().zip(self.led_paths()?) {
            let value = if pattern.is_lit(*led) { "1" } else { "0" };
            fs::write(&path, value)
                .map_err(|e| DriverError::Io(format!("writing {}: {}", path.display(), e)))?;
        }
        Ok(())
    }

    fn led_paths(&self) -> Result<[PathBuf; 4], DriverError> {
        let leds_dir = self.hid_dir.join("leds");
        let names: Vec<String> = fs::read_dir(&leds_dir)
            .map_err(|e| DriverError::Io(format!("listing {}: {}", leds_dir.display(), e)))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();

        let find = |index: usize| {
            let suffix = format!(":blue:p{}", index);
            names
                .iter()
                .find(|name| name.ends_with(&suffix))
                .map(|name| leds_dir.join(name).join("brightness"))
                .ok_or_else(|| {
                    DriverError::Io(format!(
                        "player LED {} missing under {}",
                        index + 1,
                        leds_dir.display()
                    ))
                })
        };

        Ok([find(0)?, find(1)?, find(2)?, find(3)?])
    }
}
