//! Error types for dinoflash.

use std::io;
use thiserror::Error;

/// Result type for dinoflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for dinoflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations, subprocess spawn).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// HTTP error talking to the build server or inventory API.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed JSON payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bluetooth LE stack error.
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// An external tool exited unsuccessfully.
    #[error("{tool} exited with {status}")]
    Tool {
        /// Tool name (e.g. "espefuse").
        tool: String,
        /// Exit status description.
        status: String,
    },

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Hardware version string could not be parsed.
    #[error("Invalid hardware version '{0}': expected X.Y.Z with each part 0-255")]
    InvalidVersion(String),

    /// Toy ID failed validation.
    #[error("Invalid toy ID: {0}")]
    InvalidToyId(String),

    /// No matching ESP32 device is attached.
    #[error("No ESP32 device found")]
    DeviceNotFound,

    /// More than one matching ESP32 device is attached.
    #[error("{0} ESP32 devices attached; connect exactly one")]
    AmbiguousDevice(usize),

    /// The last inventory report failed and has not been retried or overridden.
    #[error("Inventory report pending: retry transmission or override before the next device")]
    ReportBlocked,

    /// Unexpected data from the device or a remote service.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
