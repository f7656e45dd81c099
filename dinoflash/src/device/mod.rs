//! Port scanner: finds the ESP32 toy among the attached serial ports.
//!
//! Scanning only enumerates port metadata; it never opens a port. The result
//! is one of three states, and callers must refuse to touch hardware unless
//! it is [`ScanStatus::Found`]: with two matching boards attached, writing to
//! the wrong one would burn or flash the wrong device.

mod native;
mod watcher;

pub use native::NativePortEnumerator;
pub use watcher::{DEFAULT_POLL_INTERVAL, PortWatcher};

use log::{debug, trace};

use crate::error::{Error, Result};

/// Espressif USB vendor ID.
pub const ESP32_VID: u16 = 0x303A;

/// ESP32-S3 built-in USB-Serial/JTAG product ID.
pub const ESP32_PID: u16 = 0x1001;

/// USB vendor/product pair identifying the target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbId {
    /// The ESP32-S3 USB-Serial/JTAG interface.
    pub const ESP32_S3: Self = Self {
        vid: ESP32_VID,
        pid: ESP32_PID,
    };
}

impl Default for UsbId {
    fn default() -> Self {
        Self::ESP32_S3
    }
}

/// A serial port as reported by the OS, valid for one physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPort {
    /// Port path (e.g. "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A port without USB metadata.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// A USB port with the given IDs.
    pub fn usb(name: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            vid: Some(vid),
            pid: Some(pid),
            ..Self::plain(name)
        }
    }

    /// Check whether this port carries the given USB identity.
    pub fn matches(&self, id: UsbId) -> bool {
        self.vid == Some(id.vid) && self.pid == Some(id.pid)
    }
}

/// Source of the live port list.
pub trait PortEnumerator: Send + Sync {
    /// List currently available ports.
    fn list_ports(&self) -> Result<Vec<DetectedPort>>;

    /// Check whether a port with this name is still enumerated.
    ///
    /// Enumeration failures count as "still present" so that a transient OS
    /// error does not tear down a healthy monitor.
    fn is_present(&self, name: &str) -> bool {
        self.list_ports()
            .map_or(true, |ports| ports.iter().any(|p| p.name == name))
    }
}

/// Outcome class of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// Exactly one matching device.
    Found,
    /// No matching device.
    NotFound,
    /// More than one matching device.
    Ambiguous,
}

/// Result of a single [`scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Outcome class.
    pub status: ScanStatus,
    /// Port path, set only when `status` is [`ScanStatus::Found`].
    pub port: Option<String>,
    /// Number of matching ports seen.
    pub matches: usize,
}

impl ScanResult {
    /// Convert into the selected port path, or the matching error.
    pub fn into_port(self) -> Result<String> {
        match (self.status, self.port) {
            (ScanStatus::Found, Some(port)) => Ok(port),
            (ScanStatus::Ambiguous, _) => Err(Error::AmbiguousDevice(self.matches)),
            _ => Err(Error::DeviceNotFound),
        }
    }

    /// Operator-facing one-line description.
    pub fn describe(&self) -> String {
        match (self.status, &self.port) {
            (ScanStatus::Found, Some(port)) => format!("ESP32 connected on {port}"),
            (ScanStatus::Ambiguous, _) => format!(
                "{} ESP32 devices attached; disconnect all but one",
                self.matches
            ),
            _ => "No ESP32 device connected".to_string(),
        }
    }
}

/// Classify the attached ports against `id`.
///
/// Enumeration errors are reported as [`ScanStatus::NotFound`]; the caller
/// simply polls again.
pub fn scan(enumerator: &dyn PortEnumerator, id: UsbId) -> ScanResult {
    let ports = match enumerator.list_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    };

    let mut matching: Vec<String> = ports
        .into_iter()
        .filter(|p| p.matches(id))
        .map(|p| p.name)
        .collect();
    matching.sort_unstable();
    matching.dedup();

    trace!("Scan for {:04X}:{:04X}: {matching:?}", id.vid, id.pid);

    match matching.len() {
        0 => ScanResult {
            status: ScanStatus::NotFound,
            port: None,
            matches: 0,
        },
        1 => ScanResult {
            status: ScanStatus::Found,
            port: matching.pop(),
            matches: 1,
        },
        n => ScanResult {
            status: ScanStatus::Ambiguous,
            port: None,
            matches: n,
        },
    }
}

/// Format a list of ports for display, marking the target device.
pub fn format_port_list(ports: &[DetectedPort], id: UsbId) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port.matches(id) {
            " [ESP32-S3]".to_string()
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", port.name, device_info, product_info));
    }

    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Enumerator backed by a mutable list.
    #[derive(Default)]
    pub(crate) struct FakePorts {
        pub(crate) ports: Mutex<Vec<DetectedPort>>,
    }

    impl FakePorts {
        pub(crate) fn with(ports: Vec<DetectedPort>) -> Self {
            Self {
                ports: Mutex::new(ports),
            }
        }

        pub(crate) fn set(&self, ports: Vec<DetectedPort>) {
            *self.ports.lock().unwrap() = ports;
        }
    }

    impl PortEnumerator for FakePorts {
        fn list_ports(&self) -> Result<Vec<DetectedPort>> {
            Ok(self.ports.lock().unwrap().clone())
        }
    }

    struct BrokenPorts;

    impl PortEnumerator for BrokenPorts {
        fn list_ports(&self) -> Result<Vec<DetectedPort>> {
            Err(Error::Protocol("enumeration unavailable".into()))
        }
    }

    fn esp(name: &str) -> DetectedPort {
        DetectedPort::usb(name, ESP32_VID, ESP32_PID)
    }

    #[test]
    fn test_scan_not_found_ignores_other_devices() {
        let ports = FakePorts::with(vec![
            DetectedPort::plain("/dev/ttyS0"),
            DetectedPort::usb("/dev/ttyUSB0", 0x1A86, 0x7523),
        ]);
        let result = scan(&ports, UsbId::ESP32_S3);
        assert_eq!(result.status, ScanStatus::NotFound);
        assert_eq!(result.port, None);
        assert!(matches!(result.into_port(), Err(Error::DeviceNotFound)));
    }

    #[test]
    fn test_scan_found_single_device() {
        let ports = FakePorts::with(vec![DetectedPort::plain("/dev/ttyS0"), esp("/dev/ttyACM0")]);
        let result = scan(&ports, UsbId::ESP32_S3);
        assert_eq!(result.status, ScanStatus::Found);
        assert_eq!(result.into_port().unwrap(), "/dev/ttyACM0");
    }

    #[test]
    fn test_scan_two_devices_is_ambiguous() {
        let ports = FakePorts::with(vec![esp("/dev/ttyACM0"), esp("/dev/ttyACM1")]);
        let result = scan(&ports, UsbId::ESP32_S3);
        assert_eq!(result.status, ScanStatus::Ambiguous);
        assert_eq!(result.port, None);
        assert_eq!(result.matches, 2);
        assert!(matches!(result.into_port(), Err(Error::AmbiguousDevice(2))));
    }

    #[test]
    fn test_scan_matches_are_sorted_and_unique() {
        let ports = FakePorts::with(vec![
            esp("/dev/ttyACM1"),
            esp("/dev/ttyACM0"),
            esp("/dev/ttyACM1"),
        ]);
        let result = scan(&ports, UsbId::ESP32_S3);
        assert_eq!(result.status, ScanStatus::Ambiguous);
        assert_eq!(result.matches, 2);

        ports.set(vec![esp("/dev/ttyACM0"), esp("/dev/ttyACM0")]);
        let single = scan(&ports, UsbId::ESP32_S3);
        assert_eq!(single.status, ScanStatus::Found);
        assert_eq!(single.into_port().unwrap(), "/dev/ttyACM0");
    }

    #[test]
    fn test_scan_is_idempotent_without_hardware_change() {
        let ports = FakePorts::with(vec![esp("/dev/ttyACM0"), esp("/dev/ttyACM1")]);
        let first = scan(&ports, UsbId::ESP32_S3);
        for _ in 0..5 {
            assert_eq!(scan(&ports, UsbId::ESP32_S3), first);
        }

        ports.set(vec![esp("/dev/ttyACM1")]);
        let after = scan(&ports, UsbId::ESP32_S3);
        assert_eq!(after.status, ScanStatus::Found);
        assert_eq!(after.port.as_deref(), Some("/dev/ttyACM1"));
    }

    #[test]
    fn test_scan_enumeration_error_is_not_found() {
        assert_eq!(scan(&BrokenPorts, UsbId::ESP32_S3).status, ScanStatus::NotFound);
    }

    #[test]
    fn test_is_present_defaults() {
        let ports = FakePorts::with(vec![esp("/dev/ttyACM0")]);
        assert!(ports.is_present("/dev/ttyACM0"));
        assert!(!ports.is_present("/dev/ttyACM1"));
        assert!(BrokenPorts.is_present("/dev/ttyACM0"));
    }

    #[test]
    fn test_describe() {
        let ports = FakePorts::with(vec![esp("COM7")]);
        assert!(scan(&ports, UsbId::ESP32_S3).describe().contains("COM7"));
        ports.set(vec![esp("COM7"), esp("COM8"), esp("COM9")]);
        assert!(scan(&ports, UsbId::ESP32_S3).describe().starts_with("3 ESP32"));
    }

    #[test]
    fn test_format_port_list() {
        let ports = vec![
            DetectedPort {
                product: Some("USB JTAG/serial debug unit".to_string()),
                ..esp("/dev/ttyACM0")
            },
            DetectedPort::usb("/dev/ttyUSB1", 0x10C4, 0xEA60),
            DetectedPort::plain("/dev/ttyS0"),
        ];

        let formatted = format_port_list(&ports, UsbId::ESP32_S3);
        assert_eq!(formatted.len(), 3);
        assert!(formatted[0].contains("[ESP32-S3]"));
        assert!(formatted[0].contains("USB JTAG"));
        assert!(formatted[1].contains("VID:10C4 PID:EA60"));
        assert_eq!(formatted[2], "/dev/ttyS0");
    }
}
