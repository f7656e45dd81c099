//! Bluetooth LE quality-control session.
//!
//! The QC firmware exposes one GATT service with a write-only control
//! characteristic and a notify-only event characteristic. The station writes
//! a `qa_mic_lr_test` command, the toy plays a tone and answers with the RMS
//! level it measured on each microphone channel.
//!
//! [`QcSession`] drives the exchange over the [`BleCentral`] / [`BleLink`]
//! seam so the protocol can be tested without a radio. Every wait is bounded
//! by `tokio::time::timeout`.

mod ble;

pub use ble::{BleCentral, BleLink, BtleplugCentral, BtleplugLink, BtleplugQcRunner, QcRunner};

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::{Instant, timeout, timeout_at};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::EventSink;

/// QC GATT service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xa07498ca_ad5b_474e_940d_16f1fbe7e8cd);

/// Control characteristic (write).
pub const CONTROL_UUID: Uuid = Uuid::from_u128(0xb30ac6b4_1b2d_4c2f_9c10_4b2a7b80f1a1);

/// Event characteristic (notify).
pub const EVENTS_UUID: Uuid = Uuid::from_u128(0xf29f4a3e_9a53_4d93_9b33_0a1cc4f0c8a2);

/// Minimum RMS level each microphone channel must exceed.
pub const DEFAULT_THRESHOLD: f64 = 4500.0;

/// Name recorded for the microphone test.
pub const MIC_TEST_NAME: &str = "Test Mic L/R Balance";

/// Per-channel or overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QcStatus {
    /// Above threshold.
    Pass,
    /// At or below threshold.
    Fail,
}

impl QcStatus {
    fn from_bool(pass: bool) -> Self {
        if pass { Self::Pass } else { Self::Fail }
    }

    /// Whether this is [`QcStatus::Pass`].
    pub fn is_pass(self) -> bool {
        self == Self::Pass
    }
}

impl fmt::Display for QcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        })
    }
}

/// One evaluated QC measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QcTestResult {
    /// Test name.
    pub name: String,
    /// Overall verdict.
    pub status: QcStatus,
    /// Left channel verdict.
    pub left_status: QcStatus,
    /// Right channel verdict.
    pub right_status: QcStatus,
    /// Left channel RMS.
    pub rms_left: f64,
    /// Right channel RMS.
    pub rms_right: f64,
    /// Threshold applied.
    pub threshold: f64,
    /// Unix time the result arrived, in seconds.
    pub raw_timestamp: f64,
}

impl QcTestResult {
    /// Whether the test passed.
    pub fn passed(&self) -> bool {
        self.status.is_pass()
    }

    /// L/R balance ratio; informational only.
    pub fn balance(&self) -> f64 {
        balance_ratio(self.rms_left, self.rms_right)
    }
}

/// Evaluate a microphone measurement against `threshold`.
///
/// Each channel passes strictly above the threshold; the test passes when
/// both do.
pub fn evaluate(rms_left: f64, rms_right: f64, threshold: f64) -> QcTestResult {
    let left = rms_left > threshold;
    let right = rms_right > threshold;
    QcTestResult {
        name: MIC_TEST_NAME.to_string(),
        status: QcStatus::from_bool(left && right),
        left_status: QcStatus::from_bool(left),
        right_status: QcStatus::from_bool(right),
        rms_left,
        rms_right,
        threshold,
        raw_timestamp: unix_now().as_secs_f64(),
    }
}

/// `left / max(right, 0.001)`.
pub fn balance_ratio(rms_left: f64, rms_right: f64) -> f64 {
    rms_left / rms_right.max(0.001)
}

/// Whether a balance ratio counts as balanced.
pub fn is_balanced(ratio: f64) -> bool {
    (0.9..=1.1).contains(&ratio)
}

fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Encode the microphone test command.
pub fn mic_test_command(unix_secs: u64) -> Vec<u8> {
    json!({
        "id": format!("qa_mic_lr_test_{unix_secs}"),
        "type": "qa_mic_lr_test",
        "payload": {
            "wait_ms": 2000,
            "tone_ms": 2000,
            "volume_percent": 95,
            "freq_hz": 1000,
        },
    })
    .to_string()
    .into_bytes()
}

/// A decoded event notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Microphone test levels.
    MicResult {
        /// Left RMS.
        rms_left: f64,
        /// Right RMS.
        rms_right: f64,
    },
    /// Instruction for the operator.
    Instruction {
        /// Instruction text.
        text: String,
        /// Whether the toy waits for the operator.
        wait_for_user: bool,
    },
    /// JSON of an unhandled type.
    Other(String),
    /// Not JSON.
    Text(String),
}

/// Decode one notification payload.
pub fn parse_notification(data: &[u8]) -> Notification {
    let text = String::from_utf8_lossy(data).into_owned();
    let Ok(value) = serde_json::from_str::<Value>(&text) else {
        return Notification::Text(text);
    };

    if value.get("kind").and_then(Value::as_str) == Some("mic_lr_test") {
        if let Some(tone) = value.pointer("/payload/tone") {
            let level = |key: &str| tone.get(key).and_then(Value::as_f64).unwrap_or(0.0);
            return Notification::MicResult {
                rms_left: level("rms_L"),
                rms_right: level("rms_R"),
            };
        }
    }

    if value.get("type").and_then(Value::as_str) == Some("qa_instruction") {
        return Notification::Instruction {
            text: value
                .get("instruction")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            wait_for_user: value
                .get("wait_for_user")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };
    }

    Notification::Other(
        value
            .get("type")
            .or_else(|| value.get("kind"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
    )
}

/// Progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QcState {
    /// Not connected.
    Disconnected,
    /// Looking for the toy.
    Scanning,
    /// Link established.
    Connected,
    /// Command sent, waiting for levels.
    TestRunning,
    /// Test passed.
    Pass,
    /// Test failed.
    Fail,
}

/// Session timing and threshold.
#[derive(Debug, Clone)]
pub struct QcConfig {
    /// Pass threshold.
    pub threshold: f64,
    /// Length of one scan.
    pub scan_window: Duration,
    /// Number of scans before giving up.
    pub scan_attempts: u32,
    /// Pause between scans.
    pub scan_backoff: Duration,
    /// Bound on connection and service discovery.
    pub connect_timeout: Duration,
    /// Pause after connecting.
    pub settle: Duration,
    /// Pause before the single command retry.
    pub write_retry_delay: Duration,
    /// Bound on waiting for the result.
    pub result_timeout: Duration,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            scan_window: Duration::from_secs(7),
            scan_attempts: 3,
            scan_backoff: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(20),
            settle: Duration::from_secs(1),
            write_retry_delay: Duration::from_secs(1),
            result_timeout: Duration::from_secs(15),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum QcOutcome {
    /// Levels received and evaluated (pass or fail).
    Completed(QcTestResult),
    /// The MAC never showed up in a scan.
    DeviceNotFound {
        /// Scans performed.
        attempts: u32,
    },
    /// Connecting or discovering services failed.
    ConnectFailed(String),
    /// Subscribing or writing the command failed.
    CommandFailed(String),
    /// No result arrived in time.
    TimedOut,
}

impl QcOutcome {
    /// The evaluated result, if any.
    pub fn result(&self) -> Option<&QcTestResult> {
        match self {
            Self::Completed(result) => Some(result),
            _ => None,
        }
    }

    /// Whether the test completed and passed.
    pub fn passed(&self) -> bool {
        self.result().is_some_and(QcTestResult::passed)
    }
}

impl fmt::Display for QcOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(r) => write!(
                f,
                "QC {}: L={:.1} ({}), R={:.1} ({}), threshold {}",
                r.status, r.rms_left, r.left_status, r.rms_right, r.right_status, r.threshold
            ),
            Self::DeviceNotFound { attempts } => {
                write!(f, "toy not found over Bluetooth after {attempts} scans")
            },
            Self::ConnectFailed(e) => write!(f, "Bluetooth connection failed: {e}"),
            Self::CommandFailed(e) => write!(f, "QC command failed: {e}"),
            Self::TimedOut => f.write_str("no QC result received in time"),
        }
    }
}

/// One QC exchange with one toy.
pub struct QcSession<C: BleCentral> {
    central: C,
    config: QcConfig,
    events: EventSink,
    state: QcState,
}

impl<C: BleCentral> QcSession<C> {
    /// Create a session over `central`.
    pub fn new(central: C, config: QcConfig, events: EventSink) -> Self {
        Self {
            central,
            config,
            events,
            state: QcState::Disconnected,
        }
    }

    /// Current state.
    pub fn state(&self) -> QcState {
        self.state
    }

    fn enter(&mut self, state: QcState) {
        debug!("QC state {:?} -> {state:?}", self.state);
        self.state = state;
    }

    /// Scan for `mac`, connect, run the microphone test and disconnect.
    pub async fn run(&mut self, mac: &str) -> QcOutcome {
        self.enter(QcState::Scanning);
        let Some(address) = self.find(mac).await else {
            self.enter(QcState::Disconnected);
            return QcOutcome::DeviceNotFound {
                attempts: self.config.scan_attempts,
            };
        };

        self.events
            .line(format!("Connecting to {address} over Bluetooth"));
        let mut link = match timeout(self.config.connect_timeout, self.central.connect(&address)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                debug!("Connect to {address} failed ({e}); no link to disconnect");
                self.enter(QcState::Disconnected);
                return QcOutcome::ConnectFailed(e.to_string());
            },
            Err(_) => {
                debug!(
                    "Connect to {address} timed out after {:?}; no link to disconnect",
                    self.config.connect_timeout
                );
                self.enter(QcState::Disconnected);
                return QcOutcome::ConnectFailed("connection timed out".to_string());
            },
        };
        self.enter(QcState::Connected);
        self.events.line("Bluetooth connected");
        tokio::time::sleep(self.config.settle).await;

        let outcome = self.exchange(&mut link).await;

        if let Err(e) = link.disconnect().await {
            warn!("Bluetooth disconnect failed: {e}");
        }
        self.enter(match &outcome {
            QcOutcome::Completed(r) if r.passed() => QcState::Pass,
            QcOutcome::Completed(_) => QcState::Fail,
            _ => QcState::Disconnected,
        });
        outcome
    }

    async fn find(&mut self, mac: &str) -> Option<String> {
        let attempts = self.config.scan_attempts;
        let bound = self.config.scan_window + self.config.connect_timeout;

        for attempt in 1..=attempts {
            self.events.line(format!(
                "Scanning for {mac} (attempt {attempt}/{attempts})"
            ));
            match timeout(bound, self.central.scan(self.config.scan_window)).await {
                Ok(Ok(addresses)) => {
                    debug!("Scan saw {} devices", addresses.len());
                    if let Some(found) = addresses.into_iter().find(|a| a.eq_ignore_ascii_case(mac)) {
                        self.events.line(format!("Found {found}"));
                        return Some(found);
                    }
                },
                Ok(Err(e)) => self.events.line(format!("Bluetooth scan failed: {e}")),
                Err(_) => self.events.line("Bluetooth scan timed out"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.scan_backoff).await;
            }
        }

        self.events
            .line(format!("{mac} not found after {attempts} scans"));
        None
    }

    async fn exchange(&mut self, link: &mut C::Link) -> QcOutcome {
        if let Err(e) = link.subscribe_events().await {
            return QcOutcome::CommandFailed(format!("subscribe: {e}"));
        }

        let command = mic_test_command(unix_now().as_secs());
        if let Err(first) = link.write_command(&command).await {
            self.events
                .line(format!("Command write failed ({first}), retrying"));
            tokio::time::sleep(self.config.write_retry_delay).await;
            if let Err(e) = link.write_command(&command).await {
                return QcOutcome::CommandFailed(e.to_string());
            }
        }
        self.enter(QcState::TestRunning);
        self.events.line("Microphone test started");

        let deadline = Instant::now() + self.config.result_timeout;
        loop {
            let data = match timeout_at(deadline, link.next_notification()).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    return QcOutcome::CommandFailed("notification stream closed".to_string());
                },
                Err(_) => {
                    self.events.line("Timed out waiting for QC result");
                    return QcOutcome::TimedOut;
                },
            };

            match parse_notification(&data) {
                Notification::MicResult {
                    rms_left,
                    rms_right,
                } => {
                    let result = evaluate(rms_left, rms_right, self.config.threshold);
                    self.report(&result);
                    return QcOutcome::Completed(result);
                },
                Notification::Instruction {
                    text,
                    wait_for_user,
                } => {
                    if wait_for_user {
                        self.events.line(format!("Operator action required: {text}"));
                    } else {
                        self.events.line(format!("Instruction: {text}"));
                    }
                },
                Notification::Other(kind) => {
                    self.events.line(format!("Unhandled message type: {kind}"));
                },
                Notification::Text(text) => {
                    self.events.line(format!("[BLE RX] {}", text.trim()));
                },
            }
        }
    }

    fn report(&self, result: &QcTestResult) {
        self.events.line(format!(
            "Left channel: {:.1} RMS ({})",
            result.rms_left, result.left_status
        ));
        self.events.line(format!(
            "Right channel: {:.1} RMS ({})",
            result.rms_right, result.right_status
        ));
        let ratio = result.balance();
        self.events.line(format!(
            "Balance L/R {ratio:.2} ({})",
            if is_balanced(ratio) { "balanced" } else { "unbalanced" }
        ));
        info!("QC {} for threshold {}", result.status, result.threshold);
    }
}

/// Reject MACs that cannot match a BLE address.
pub fn validate_mac(mac: &str) -> Result<String> {
    let normalized = mac.trim().to_uppercase().replace('-', ":");
    let valid = normalized.len() == 17
        && normalized.split(':').count() == 6
        && normalized
            .split(':')
            .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(normalized)
    } else {
        Err(Error::Protocol(format!("'{mac}' is not a Bluetooth MAC")))
    }
}
