//! Serial console monitor that captures the device's BLE identity.
//!
//! After a flash the firmware boots and logs its Bluetooth MAC, the name it
//! advertises under, and finally a "discoverable and ready" line. Those three
//! markers are the only contract with the firmware and are parsed by
//! [`parse_boot_event`].

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};
use regex::Regex;

use crate::device::PortEnumerator;
use crate::error::{Error, Result};
use crate::event::EventSink;

/// Console baud rate of the toy firmware.
pub const MONITOR_BAUD: u32 = 115200;

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const IDLE_SLEEP: Duration = Duration::from_millis(50);
const MAX_OPEN_PORT_ATTEMPTS: usize = 5;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

#[allow(clippy::unwrap_used)] // Static pattern
static MAC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Bluetooth MAC: ([0-9A-Fa-f:]{17}|[0-9A-Fa-f-]{17})").unwrap()
});

#[allow(clippy::unwrap_used)] // Static pattern
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Setting device name to: (.+)").unwrap());

const READY_MARKER: &str = "discoverable and ready";

/// A boot log marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootEvent {
    /// Bluetooth MAC, upper-case and colon-separated.
    Mac(String),
    /// Advertised device name.
    DeviceName(String),
    /// The BLE stack is advertising.
    Ready,
}

/// Recognise a boot marker in one console line.
pub fn parse_boot_event(line: &str) -> Option<BootEvent> {
    if let Some(caps) = MAC_PATTERN.captures(line) {
        return Some(BootEvent::Mac(caps[1].to_uppercase().replace('-', ":")));
    }
    if let Some(caps) = NAME_PATTERN.captures(line) {
        let name = caps[1].trim();
        if !name.is_empty() {
            return Some(BootEvent::DeviceName(name.to_string()));
        }
    }
    if line.contains(READY_MARKER) {
        return Some(BootEvent::Ready);
    }
    None
}

/// The identity needed to find the device over BLE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleIdentity {
    /// Bluetooth MAC.
    pub mac: String,
    /// Advertised name.
    pub name: String,
}

/// Accumulates boot markers until a full identity is seen.
#[derive(Debug, Default, Clone)]
pub struct CaptureState {
    mac: Option<String>,
    name: Option<String>,
}

impl CaptureState {
    /// Feed one marker; returns the identity on `Ready` once MAC and name are known.
    ///
    /// Emitting clears the state so a reboot does not replay the old identity.
    pub fn feed(&mut self, event: BootEvent) -> Option<BleIdentity> {
        match event {
            BootEvent::Mac(mac) => self.mac = Some(mac),
            BootEvent::DeviceName(name) => self.name = Some(name),
            BootEvent::Ready => {
                if self.mac.is_some() && self.name.is_some() {
                    let mac = self.mac.take()?;
                    let name = self.name.take()?;
                    return Some(BleIdentity { mac, name });
                }
            },
        }
        None
    }
}

/// Drain buffered bytes into displayable UTF-8 text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - Incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if valid_up_to > 0 {
                    if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                        output.push_str(valid);
                    }
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('�');
                        let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        if valid_up_to > 0 {
                            buffer.drain(..valid_up_to);
                        }
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Drop control characters (ANSI colour codes from ESP-IDF logs included),
/// keeping tabs and turning carriage returns into line breaks.
pub fn clean_monitor_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\n' | '\t' => out.push(ch),
            '\r' => out.push('\n'),
            '\x1b' => {
                // Skip a CSI sequence such as "\x1b[0;32m".
                if chars.peek() == Some(&'[') {
                    chars.next();
                    for c in chars.by_ref() {
                        if c.is_ascii_alphabetic() {
                            break;
                        }
                    }
                }
            },
            _ if ch.is_control() => {},
            _ => out.push(ch),
        }
    }
    out
}

/// Reassembles complete lines from raw serial chunks.
#[derive(Debug, Default)]
pub struct LineSplitter {
    bytes: Vec<u8>,
    text: String,
}

impl LineSplitter {
    /// Append received bytes and return every completed, non-blank line.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(data);
        let decoded = drain_utf8_lossy(&mut self.bytes);
        self.text.push_str(&clean_monitor_text(&decoded));

        let mut lines = Vec::new();
        while let Some(end) = self.text.find('\n') {
            let line: String = self.text.drain(..=end).collect();
            let line = line.trim_end();
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

/// Why a monitor loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// The stop flag was set.
    Stopped,
    /// The port disappeared or failed.
    Disconnected,
}

/// Reads a device console and reports captured identities.
pub struct SerialMonitor {
    port: String,
    ports: Arc<dyn PortEnumerator>,
    events: EventSink,
    idle_sleep: Duration,
}

impl SerialMonitor {
    /// Create a monitor for `port`.
    pub fn new(port: impl Into<String>, ports: Arc<dyn PortEnumerator>, events: EventSink) -> Self {
        Self {
            port: port.into(),
            ports,
            events,
            idle_sleep: IDLE_SLEEP,
        }
    }

    /// Open the port, retrying while USB re-enumerates after a reset.
    pub fn open(&self, baud: u32) -> Result<Box<dyn serialport::SerialPort>> {
        let mut last_error = None;

        for attempt in 1..=MAX_OPEN_PORT_ATTEMPTS {
            match serialport::new(&self.port, baud)
                .timeout(READ_TIMEOUT)
                .open()
            {
                Ok(port) => {
                    if attempt > 1 {
                        debug!("Port opened on attempt {attempt}");
                    }
                    return Ok(port);
                },
                Err(e) => {
                    warn!(
                        "Failed to open port {} (attempt {attempt}/{MAX_OPEN_PORT_ATTEMPTS}): {e}",
                        self.port
                    );
                    last_error = Some(e);

                    if attempt < MAX_OPEN_PORT_ATTEMPTS {
                        thread::sleep(OPEN_RETRY_DELAY);
                    }
                },
            }
        }

        Err(last_error.map_or(Error::DeviceNotFound, Error::Serial))
    }

    /// Read until stopped or disconnected, calling `on_capture` for each identity.
    pub fn run<R: Read>(
        &self,
        mut reader: R,
        stop: &AtomicBool,
        on_capture: &mut dyn FnMut(BleIdentity),
    ) -> MonitorExit {
        let mut splitter = LineSplitter::default();
        let mut capture = CaptureState::default();
        let mut buf = [0u8; 1024];

        loop {
            if stop.load(Ordering::Relaxed) {
                debug!("Monitor on {} stopped", self.port);
                return MonitorExit::Stopped;
            }

            match reader.read(&mut buf) {
                Ok(n) if n > 0 => {
                    for line in splitter.push(&buf[..n]) {
                        trace!("serial: {line}");
                        let event = parse_boot_event(&line);
                        self.events.line(line);

                        if let Some(identity) = event.and_then(|e| capture.feed(e)) {
                            self.events.line(format!(
                                "Captured BLE identity: {} ({})",
                                identity.mac, identity.name
                            ));
                            on_capture(identity);
                        }
                    }
                    continue;
                },
                Ok(_) => {},
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
                Err(e) => {
                    self.events
                        .line(format!("Serial read on {} failed: {e}", self.port));
                    return MonitorExit::Disconnected;
                },
            }

            if !self.ports.is_present(&self.port) {
                self.events
                    .line(format!("Device on {} disconnected", self.port));
                return MonitorExit::Disconnected;
            }
            thread::sleep(self.idle_sleep);
        }
    }
}

/// A running monitor: capture channel plus cooperative stop.
pub struct MonitorHandle {
    captures: Receiver<BleIdentity>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Assemble a handle from its parts.
    pub fn new(
        captures: Receiver<BleIdentity>,
        stop: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            captures,
            stop,
            thread,
        }
    }

    /// Block up to `timeout` for the next captured identity.
    pub fn wait_for_capture(&self, timeout: Duration) -> Option<BleIdentity> {
        self.captures.recv_timeout(timeout).ok()
    }

    /// Whether the monitor thread has ended.
    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Stop the monitor and wait for its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Starts a console monitor on a freshly flashed device.
pub trait BootWatcher: Send + Sync {
    /// Begin monitoring `port`; the port must not be held by anyone else.
    fn watch(&self, port: &str, events: EventSink) -> Result<MonitorHandle>;
}

/// [`BootWatcher`] reading a real serial port on a background thread.
pub struct SerialBootWatcher {
    ports: Arc<dyn PortEnumerator>,
    baud: u32,
}

impl SerialBootWatcher {
    /// Create a watcher using `ports` for disconnect detection.
    pub fn new(ports: Arc<dyn PortEnumerator>) -> Self {
        Self {
            ports,
            baud: MONITOR_BAUD,
        }
    }
}

impl BootWatcher for SerialBootWatcher {
    fn watch(&self, port: &str, events: EventSink) -> Result<MonitorHandle> {
        let monitor = SerialMonitor::new(port, Arc::clone(&self.ports), events.clone());
        let serial = monitor.open(self.baud)?;
        events.line(format!("Monitoring {port} at {} baud", self.baud));

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let (tx, rx) = mpsc::channel();

        let thread = thread::spawn(move || {
            let exit = monitor.run(serial, &flag, &mut |identity| {
                let _ = tx.send(identity);
            });
            debug!("Monitor ended: {exit:?}");
        });

        Ok(MonitorHandle::new(rx, stop, Some(thread)))
    }
}
