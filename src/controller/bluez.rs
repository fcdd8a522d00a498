//! Releasing a remote through BlueZ
//!
//! Closing the input device leaves the Bluetooth link up: the remote stays on
//! and its input device stays registered. Asking BlueZ to disconnect it
//! switches the remote off, so the next connection needs a new 1+2 press.

use std::fs;
use std::path::Path;
use tracing::{debug, info};
use zbus::blocking::Connection;

use super::driver::DriverError;

const BLUEZ_SERVICE: &str = "org.bluez";
const DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// D-Bus object path BlueZ uses for `address` on `adapter`
pub fn device_path(adapter: &str, address: &str) -> String {
    format!(
        "/org/bluez/{}/dev_{}",
        adapter,
        address.to_ascii_uppercase().replace(':', "_")
    )
}

/// Adapter names such as `hci0`; connection entries like `hci0:256` are skipped
pub fn adapters(sysfs_root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(sysfs_root.join("class/bluetooth")) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("hci") && !name.contains(':'))
        .collect();
    names.sort();
    names
}

pub fn disconnect(sysfs_root: &Path, address: &str) -> Result<(), DriverError> {
    let adapters = adapters(sysfs_root);
    if adapters.is_empty() {
        return Err(DriverError::Io(format!(
            "no Bluetooth adapter to disconnect {} from",
            address
        )));
    }

    let connection = Connection::system()
        .map_err(|e| DriverError::Io(format!("system bus unavailable: {}", e)))?;

    let mut last_error = String::new();
    for adapter in &adapters {
        let path = device_path(adapter, address);
        match connection.call_method(
            Some(BLUEZ_SERVICE),
            path.as_str(),
            Some(DEVICE_INTERFACE),
            "Disconnect",
            &(),
        ) {
            Ok(_) => {
                info!("Disconnected {} via {}", address, adapter);
                return Ok(());
            }
            Err(e) => {
                debug!("Disconnect of {} failed: {}", path, e);
                last_error = e.to_string();
            }
        }
    }

    Err(DriverError::Io(format!(
        "BlueZ could not disconnect {}: {}",
        address, last_error
    )))
}
