//! USB serial port discovery via sysfs.
//!
//! Walks `/sys/bus/usb/devices/*`, matches `idVendor`/`idProduct` against the
//! configured pair and collects the `ttyUSB*` nodes exposed by the matching
//! device's interfaces. The result is sorted so the configured index stays
//! stable across scans.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use log::debug;

use crate::config::UsbDeviceId;

const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

pub fn discover_usb_interfaces(device_id: &UsbDeviceId) -> Result<Vec<String>> {
    discover_in(Path::new(SYSFS_USB_DEVICES), device_id)
}

fn read_id(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
}

fn discover_in(root: &Path, device_id: &UsbDeviceId) -> Result<Vec<String>> {
    let vendor = format!("{:04x}", device_id.vendor_id);
    let product = format!("{:04x}", device_id.product_id);

    let entries = fs::read_dir(root)
        .map_err(|e| anyhow!("failed to list USB devices under {}: {}", root.display(), e))?;

    let mut interfaces: Vec<String> = Vec::new();
    let mut device_found = false;
    for entry in entries.flatten() {
        let device_dir = entry.path();
        let (Some(vid), Some(pid)) = (read_id(&device_dir, "idVendor"), read_id(&device_dir, "idProduct")) else {
            continue;
        };
        debug!("Checking USB device '{}', '{}'", vid, pid);
        if vid != vendor || pid != product {
            continue;
        }
        device_found = true;
        // Each interface of the device may expose one or more ttyUSB nodes.
        let Ok(children) = fs::read_dir(&device_dir) else {
            continue;
        };
        for child in children.flatten() {
            let Ok(grandchildren) = fs::read_dir(child.path()) else {
                continue;
            };
            for node in grandchildren.flatten() {
                let name = node.file_name();
                let name = name.to_string_lossy();
                if name.starts_with("ttyUSB") {
                    interfaces.push(format!("/dev/{}", name));
                }
            }
        }
    }
    if !device_found {
        return Err(anyhow!("found no USB device with ID {}", device_id));
    }
    // stable interface order: the configured serialPort value indexes into this list
    interfaces.sort();
    for (i, iface) in interfaces.iter().enumerate() {
        debug!("Discovered interface #{} : {}", i, iface);
    }
    Ok(interfaces)
}
