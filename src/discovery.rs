//! Locating the meter's serial port.
//!
//! The FS5000 enumerates as a CH340 USB serial bridge.

use crate::error::{Error, Result};
use tokio_serial::{SerialPortInfo, SerialPortType};
use tracing::{debug, info};

pub const VID: u16 = 0x1A86;
pub const PID: u16 = 0x7523;

pub fn is_fs5000(vid: u16, pid: u16) -> bool {
    (vid, pid) == (VID, PID)
}

/// A serial port as seen by the operating system.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PortEntry {
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub product: Option<String>,
    /// USB identifiers match the meter's.
    pub is_fs5000: bool,
}

impl From<SerialPortInfo> for PortEntry {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => PortEntry {
                is_fs5000: is_fs5000(usb.vid, usb.pid),
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product,
            },
            _ => PortEntry {
                name: info.port_name,
                vid: None,
                pid: None,
                product: None,
                is_fs5000: false,
            },
        }
    }
}

pub fn list_ports() -> Result<Vec<PortEntry>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| Error::Transport(format!("failed to enumerate serial ports: {e}")))?;
    Ok(ports.into_iter().map(PortEntry::from).collect())
}

/// Path of the first port whose USB identifiers match the meter.
pub fn find_port() -> Result<String> {
    info!("Searching for FS5000...");
    let ports = list_ports()?;
    debug!(count = ports.len(), "Serial ports enumerated");
    ports
        .into_iter()
        .find(|p| p.is_fs5000)
        .map(|p| {
            info!(port = %p.name, "Found FS5000");
            p.name
        })
        .ok_or(Error::DeviceNotFound { vid: VID, pid: PID })
}
