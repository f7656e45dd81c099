//! Port enumeration backed by the `serialport` crate.

use std::collections::HashSet;

use log::trace;

use super::{DetectedPort, PortEnumerator};
use crate::error::{Error, Result};

/// Native port enumerator using `serialport::available_ports`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports(&self) -> Result<Vec<DetectedPort>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        let detected = ports
            .into_iter()
            .map(|p| match p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X})",
                        p.port_name, info.vid, info.pid
                    );
                    DetectedPort {
                        name: p.port_name,
                        vid: Some(info.vid),
                        pid: Some(info.pid),
                        manufacturer: info.manufacturer,
                        product: info.product,
                        serial: info.serial_number,
                    }
                },
                _ => DetectedPort::plain(p.port_name),
            })
            .collect();

        Ok(drop_tty_duplicates(detected))
    }
}

/// Drop macOS `/dev/tty.*` entries whose `/dev/cu.*` twin is also listed.
///
/// macOS lists every USB serial device twice; only the call-out side is kept
/// so one attached toy is one match.
pub(crate) fn drop_tty_duplicates(ports: Vec<DetectedPort>) -> Vec<DetectedPort> {
    let callouts: HashSet<String> = ports
        .iter()
        .filter_map(|p| p.name.strip_prefix("/dev/cu."))
        .map(str::to_string)
        .collect();

    ports
        .into_iter()
        .filter(|p| {
            p.name
                .strip_prefix("/dev/tty.")
                .is_none_or(|suffix| !callouts.contains(suffix))
        })
        .collect()
}
