//! Device lifecycle controller.
//!
//! Binds the phases together for one physical device at a time:
//!
//! ```text
//! Idle -> AwaitingToyId -> AwaitingConnection -> EfusePhase -> FlashPhase
//!      -> BleCaptureWait -> QcPhase -> {Approved, NeedsAttention} -> Reporting -> Idle
//! ```
//!
//! eFuse, flash and capture failures are terminal for the device. A QC
//! failure parks the device in `NeedsAttention` where [`DeviceController::retry_qc`]
//! may be called any number of times. A failed inventory report parks the
//! station in `ReportBlocked`; no new device is accepted until the report is
//! retried successfully or explicitly overridden.
//!
//! The controller is driven through `&mut self`. To run a device off the UI
//! thread, move the controller into a worker with [`DeviceController::spawn_worker`]
//! and get it back from the join handle.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};

use crate::device::{PortEnumerator, ScanResult, ScanStatus, UsbId, scan};
use crate::efuse::{EfuseController, SETTLE_DELAY};
use crate::error::{Error, Result};
use crate::event::{Event, EventSink, Tone};
use crate::firmware::{BuildCatalog, FLASH_BAUD, FirmwareDirs, FirmwareFlasher, Mode};
use crate::inventory::{InventoryReport, InventoryReporter};
use crate::monitor::{BootWatcher, MonitorHandle};
use crate::qc::{QcOutcome, QcRunner};
use crate::session::{DeviceSession, FlashResult, ToyId};
use crate::tool::{EspToolchain, ToolRunner};
use crate::version::{DEFAULT_HARDWARE_VERSION, HardwareVersion};

/// Default bound on waiting for the boot log identity.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default pause between capture and the first BLE scan.
pub const BLE_SETTLE: Duration = Duration::from_secs(5);

/// Controller state, published as [`Event::State`] on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowState {
    /// Nothing in progress.
    Idle,
    /// Waiting for the operator to enter a toy ID.
    AwaitingToyId,
    /// Toy ID accepted, waiting for exactly one device.
    AwaitingConnection,
    /// Burning or reading the hardware version.
    EfusePhase,
    /// Downloading and flashing firmware.
    FlashPhase,
    /// Waiting for the boot log to reveal the BLE identity.
    BleCaptureWait,
    /// Running the BLE QC session.
    QcPhase,
    /// QC passed.
    Approved,
    /// QC did not pass; retry is possible.
    NeedsAttention,
    /// Sending the inventory report.
    Reporting,
    /// Terminal failure for the current device.
    Failed(String),
    /// The inventory report failed; the station is blocked.
    ReportBlocked,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::AwaitingToyId => f.write_str("awaiting toy ID"),
            Self::AwaitingConnection => f.write_str("awaiting connection"),
            Self::EfusePhase => f.write_str("eFuse"),
            Self::FlashPhase => f.write_str("flashing"),
            Self::BleCaptureWait => f.write_str("waiting for BLE identity"),
            Self::QcPhase => f.write_str("QC"),
            Self::Approved => f.write_str("approved"),
            Self::NeedsAttention => f.write_str("needs attention"),
            Self::Reporting => f.write_str("reporting"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::ReportBlocked => f.write_str("report blocked"),
        }
    }
}

/// External collaborators of the station.
#[derive(Clone)]
pub struct Station {
    /// Serial port enumeration.
    pub ports: Arc<dyn PortEnumerator>,
    /// esptool / espefuse execution.
    pub tools: Arc<dyn ToolRunner>,
    /// Firmware build source.
    pub catalog: Arc<dyn BuildCatalog>,
    /// Serial boot log monitor.
    pub watcher: Arc<dyn BootWatcher>,
    /// BLE QC session.
    pub qc: Arc<dyn QcRunner>,
    /// Inventory destination.
    pub reporter: Arc<dyn InventoryReporter>,
}

/// Station behaviour.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Testing burns and verifies; production reads only.
    pub mode: Mode,
    /// Version burned in testing mode, trusted when `skip_efuse_read` is set.
    pub target_version: HardwareVersion,
    /// Tool invocation settings.
    pub toolchain: EspToolchain,
    /// Artifact cache directories.
    pub dirs: FirmwareDirs,
    /// Device USB identity.
    pub usb_id: UsbId,
    /// Flash baud rate.
    pub flash_baud: u32,
    /// Pause between burn and read-back.
    pub settle_delay: Duration,
    /// Bound on the boot log identity capture.
    pub capture_timeout: Duration,
    /// Pause after capture before QC.
    pub ble_settle: Duration,
    /// Production only: skip the eFuse read and use `target_version`.
    pub skip_efuse_read: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Testing,
            target_version: DEFAULT_HARDWARE_VERSION,
            toolchain: EspToolchain::default(),
            dirs: FirmwareDirs::default(),
            usb_id: UsbId::default(),
            flash_baud: FLASH_BAUD,
            settle_delay: SETTLE_DELAY,
            capture_timeout: CAPTURE_TIMEOUT,
            ble_settle: BLE_SETTLE,
            skip_efuse_read: false,
        }
    }
}

/// Result of a controller operation, with an operator-facing message.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutcome {
    /// QC passed and the device is done.
    Completed {
        /// Toy ID.
        toy_id: ToyId,
        /// Captured MAC.
        mac: String,
        /// Whether the inventory accepted the report (false when overridden).
        reported: bool,
    },
    /// QC did not pass; `retry_qc` is available.
    NeedsAttention(String),
    /// Terminal failure for this device.
    Failed(String),
    /// The report failed; `retry_report` or `override_report` is required.
    ReportBlocked(String),
    /// The operation could not start (no device, wrong state).
    NotReady(String),
}

impl DeviceOutcome {
    /// Operator-facing message.
    pub fn message(&self) -> String {
        match self {
            Self::Completed {
                toy_id,
                mac,
                reported: true,
            } => format!("{toy_id} ({mac}) approved and registered in inventory"),
            Self::Completed {
                toy_id,
                mac,
                reported: false,
            } => format!("{toy_id} ({mac}) approved; inventory report overridden"),
            Self::NeedsAttention(m)
            | Self::Failed(m)
            | Self::ReportBlocked(m)
            | Self::NotReady(m) => m.clone(),
        }
    }
}

impl fmt::Display for DeviceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Drives one device at a time through the provisioning pipeline.
pub struct DeviceController {
    station: Station,
    settings: ControllerSettings,
    events: EventSink,
    state: WorkflowState,
    session: Option<DeviceSession>,
    monitor: Option<MonitorHandle>,
}

impl DeviceController {
    /// Create a controller; lines sent through `events` are also kept as
    /// the session transcript for the inventory report.
    pub fn new(station: Station, settings: ControllerSettings, events: EventSink) -> Self {
        let controller = Self {
            station,
            settings,
            events: events.with_transcript(),
            state: WorkflowState::Idle,
            session: None,
            monitor: None,
        };
        controller.publish();
        controller
    }

    /// Current state.
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Current device session, if any.
    pub fn session(&self) -> Option<&DeviceSession> {
        self.session.as_ref()
    }

    /// Active settings.
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Event sink used by the controller and its phases.
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    fn publish(&self) {
        self.events.send(Event::State(self.state.clone()));
    }

    fn enter(&mut self, state: WorkflowState) {
        if self.state != state {
            info!("State: {} -> {state}", self.state);
            self.state = state;
            self.publish();
        }
    }

    fn is_blocked(&self) -> bool {
        self.state == WorkflowState::ReportBlocked
    }

    fn blocked_outcome(&self) -> DeviceOutcome {
        DeviceOutcome::ReportBlocked(
            "The last inventory report has not been sent. Retry the transmission or override it before starting another device".to_string(),
        )
    }

    /// Prepare for the next device. Refused while a report is blocked.
    pub fn start_new_device(&mut self) -> Result<()> {
        if self.is_blocked() {
            return Err(Error::ReportBlocked);
        }
        self.stop_monitor();
        self.session = None;
        self.enter(WorkflowState::AwaitingToyId);
        Ok(())
    }

    /// Validate operator input and open a session for it.
    ///
    /// Any previous session is abandoned. Refused while a report is blocked.
    pub fn accept_toy_id(&mut self, input: &str) -> Result<ToyId> {
        if self.is_blocked() {
            return Err(Error::ReportBlocked);
        }
        let toy_id = ToyId::parse(input)?;

        self.stop_monitor();
        self.events.clear_transcript();
        self.session = Some(DeviceSession::new(toy_id.clone()));
        self.events.line(format!("Toy ID accepted: {toy_id}"));
        self.enter(WorkflowState::AwaitingConnection);
        Ok(toy_id)
    }

    /// Scan once for the device.
    pub fn locate(&self) -> ScanResult {
        scan(self.station.ports.as_ref(), self.settings.usb_id)
    }

    /// Scan and, if exactly one device is attached, process it.
    ///
    /// Nothing touches hardware unless the scan is [`ScanStatus::Found`].
    pub fn begin_device(&mut self) -> DeviceOutcome {
        if self.is_blocked() {
            return self.blocked_outcome();
        }
        let result = self.locate();
        match (result.status, result.port.clone()) {
            (ScanStatus::Found, Some(port)) => self.process_device(&port),
            _ => DeviceOutcome::NotReady(result.describe()),
        }
    }

    /// Run eFuse, flash, capture, QC and reporting on `port`.
    ///
    /// A panic in any phase is caught here; the device is marked failed and
    /// the controller stays usable.
    pub fn process_device(&mut self, port: &str) -> DeviceOutcome {
        if self.is_blocked() {
            return self.blocked_outcome();
        }
        if self.session.is_none() {
            return DeviceOutcome::NotReady(
                "No toy ID entered. Scan or type the toy ID before connecting a device".to_string(),
            );
        }

        match panic::catch_unwind(AssertUnwindSafe(|| self.run_pipeline(port))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                error!("Device processing panicked: {detail}");
                self.stop_monitor();
                self.fail(format!(
                    "Internal error while processing {port}: {detail}. Disconnect the device and start it again"
                ))
            },
        }
    }

    /// Run QC again after `NeedsAttention`.
    pub fn retry_qc(&mut self) -> DeviceOutcome {
        if self.state != WorkflowState::NeedsAttention {
            return DeviceOutcome::NotReady(format!("QC retry is not available while {}", self.state));
        }
        self.events.line("Retrying QC");
        match panic::catch_unwind(AssertUnwindSafe(|| self.qc_and_report())) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                error!("QC retry panicked: {detail}");
                self.fail(format!("Internal error during QC retry: {detail}"))
            },
        }
    }

    /// Send the blocked report again.
    pub fn retry_report(&mut self) -> DeviceOutcome {
        if !self.is_blocked() {
            return DeviceOutcome::NotReady("No inventory report is pending".to_string());
        }
        self.events.line("Retrying inventory report");
        self.report()
    }

    /// Release a blocked station without sending the report.
    pub fn override_report(&mut self) -> DeviceOutcome {
        if !self.is_blocked() {
            return DeviceOutcome::NotReady("No inventory report is pending".to_string());
        }
        let Some((toy_id, mac)) = self.identity() else {
            self.finish();
            return DeviceOutcome::NotReady("No device session to override".to_string());
        };
        warn!("Inventory report for {toy_id} ({mac}) overridden by operator");
        self.events.line(format!(
            "WARNING: inventory report for {toy_id} overridden; the toy is not registered"
        ));
        self.finish();
        DeviceOutcome::Completed {
            toy_id,
            mac,
            reported: false,
        }
    }

    /// Move the controller to a worker thread, run `job`, and hand it back.
    pub fn spawn_worker<F>(mut self, job: F) -> JoinHandle<(Self, DeviceOutcome)>
    where
        F: FnOnce(&mut Self) -> DeviceOutcome + Send + 'static,
    {
        thread::spawn(move || {
            let outcome = job(&mut self);
            (self, outcome)
        })
    }

    fn run_pipeline(&mut self, port: &str) -> DeviceOutcome {
        self.events.line(format!(
            "Processing device on {port} in {} mode",
            self.settings.mode
        ));

        self.enter(WorkflowState::EfusePhase);
        let version = match self.efuse_phase(port) {
            Ok(version) => version,
            Err(message) => {
                // The session cannot continue without a trusted version.
                self.session = None;
                return self.fail(message);
            },
        };
        if let Some(session) = self.session.as_mut() {
            session.hardware_version = Some(version);
        }

        self.enter(WorkflowState::FlashPhase);
        let flasher = FirmwareFlasher::new(
            Arc::clone(&self.station.catalog),
            Arc::clone(&self.station.tools),
            self.settings.toolchain.clone(),
            self.settings.dirs.clone(),
            self.events.clone(),
        )
        .with_baud(self.settings.flash_baud);

        let flashed = flasher.flash(port, self.settings.mode, version);
        if let Some(session) = self.session.as_mut() {
            session.flash_result = if flashed {
                FlashResult::Flashed
            } else {
                FlashResult::Failed
            };
        }
        if !flashed {
            return self.fail(format!(
                "Flashing {} firmware for hardware version {version} failed. Check the log, then reconnect the device and start it again",
                self.settings.mode
            ));
        }

        self.enter(WorkflowState::BleCaptureWait);
        if let Err(message) = self.capture_phase(port) {
            return self.fail(message);
        }

        self.qc_and_report()
    }

    fn efuse_phase(&self, port: &str) -> std::result::Result<HardwareVersion, String> {
        let efuse = EfuseController::new(
            Arc::clone(&self.station.tools),
            self.settings.toolchain.clone(),
            self.events.clone(),
        );
        let target = self.settings.target_version;

        match self.settings.mode {
            Mode::Production => {
                if self.settings.skip_efuse_read {
                    self.events.line(format!(
                        "eFuse read skipped; using configured hardware version {target}"
                    ));
                    return Ok(target);
                }
                efuse.read(port).ok_or_else(|| {
                    "No hardware version found in eFuse. Production mode never burns eFuses: run testing mode on this device first".to_string()
                })
            },
            Mode::Testing => {
                let verification = efuse.burn_and_verify(port, target, self.settings.settle_delay);
                verification.version().ok_or_else(|| verification.describe())
            },
        }
    }

    fn capture_phase(&mut self, port: &str) -> std::result::Result<(), String> {
        let handle = self
            .station
            .watcher
            .watch(port, self.events.clone())
            .map_err(|e| {
                format!("Could not open {port} to read the boot log ({e}). Reconnect the device and start it again")
            })?;

        let timeout = self.settings.capture_timeout;
        let Some(identity) = handle.wait_for_capture(timeout) else {
            handle.stop();
            return Err(format!(
                "The device did not report its Bluetooth identity within {}s. Reconnect the device and start it again",
                timeout.as_secs()
            ));
        };

        self.events.line(format!(
            "Device {} advertising as {}",
            identity.mac, identity.name
        ));
        if let Some(session) = self.session.as_mut() {
            session.physical_id = Some(identity.mac);
            session.device_name = Some(identity.name);
        }
        // Keep the console streaming into the transcript during QC.
        self.monitor = Some(handle);

        thread::sleep(self.settings.ble_settle);
        Ok(())
    }

    fn qc_and_report(&mut self) -> DeviceOutcome {
        let Some(mac) = self.session.as_ref().and_then(|s| s.physical_id.clone()) else {
            return self.fail("No Bluetooth MAC captured for this device".to_string());
        };

        self.enter(WorkflowState::QcPhase);
        let outcome = self.station.qc.run_qc(&mac, &self.events);
        self.events.line(outcome.to_string());

        if let (QcOutcome::Completed(result), Some(session)) = (&outcome, self.session.as_mut()) {
            session.qc_results.push(result.clone());
        }

        let approved = self.session.as_ref().is_some_and(DeviceSession::approved);
        if !outcome.passed() || !approved {
            self.events.signal(Tone::Error);
            self.enter(WorkflowState::NeedsAttention);
            return DeviceOutcome::NeedsAttention(format!(
                "QC did not pass: {outcome}. Check the toy, then retry QC"
            ));
        }

        self.events.signal(Tone::Success);
        self.enter(WorkflowState::Approved);
        self.report()
    }

    fn report(&mut self) -> DeviceOutcome {
        self.enter(WorkflowState::Reporting);
        let Some((toy_id, mac)) = self.identity() else {
            return self.fail("No device session to report".to_string());
        };
        let qc_results = self
            .session
            .as_ref()
            .map(|s| s.qc_results.clone())
            .unwrap_or_default();

        let report = InventoryReport::new(
            toy_id.as_str(),
            &mac,
            &self.events.transcript(),
            qc_results,
        );

        match self.station.reporter.send(&report) {
            Ok(()) => {
                self.events
                    .line(format!("Inventory updated for {toy_id}"));
                if let Some(session) = self.session.as_mut() {
                    session.api_sent = true;
                }
                self.finish();
                DeviceOutcome::Completed {
                    toy_id,
                    mac,
                    reported: true,
                }
            },
            Err(e) => {
                error!("Inventory report for {toy_id} failed: {e}");
                self.events
                    .line(format!("Inventory report failed: {e}"));
                self.events.signal(Tone::Error);
                self.enter(WorkflowState::ReportBlocked);
                DeviceOutcome::ReportBlocked(format!(
                    "Inventory report for {toy_id} failed ({e}). Retry the transmission or override it; no new device can start until then"
                ))
            },
        }
    }

    fn identity(&self) -> Option<(ToyId, String)> {
        let session = self.session.as_ref()?;
        Some((
            session.toy_id.clone(),
            session.physical_id.clone().unwrap_or_default(),
        ))
    }

    fn finish(&mut self) {
        self.stop_monitor();
        self.enter(WorkflowState::Idle);
    }

    fn fail(&mut self, message: String) -> DeviceOutcome {
        error!("{message}");
        self.events.line(message.clone());
        self.events.signal(Tone::Error);
        self.stop_monitor();
        self.enter(WorkflowState::Failed(message.clone()));
        DeviceOutcome::Failed(message)
    }

    fn stop_monitor(&mut self) {
        if let Some(handle) = self.monitor.take() {
            handle.stop();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
