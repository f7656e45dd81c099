//! Per-device session data.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::qc::QcTestResult;
use crate::version::HardwareVersion;

const TOY_URL_MARKER: &str = "bondu.com/toy/";
const TOY_URL_PREFIXES: [&str; 3] = ["https://bondu.com/toy/", "http://bondu.com/toy/", "bondu.com/toy/"];

#[allow(clippy::unwrap_used)] // Static pattern
static TOY_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Validated toy identifier.
///
/// Accepts either a bare ID or a `bondu.com/toy/<slug>` URL, which maps to
/// `toy_<slug>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToyId(String);

impl ToyId {
    /// Parse operator input.
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(Error::InvalidToyId("toy ID cannot be empty".to_string()));
        }

        let id = from_url(raw).unwrap_or_else(|| raw.to_string());

        if !TOY_ID_PATTERN.is_match(&id) {
            return Err(Error::InvalidToyId(format!(
                "'{id}' may only contain letters, numbers, hyphens and underscores"
            )));
        }
        if !(3..=50).contains(&id.len()) {
            return Err(Error::InvalidToyId(format!(
                "'{id}' must be between 3 and 50 characters long"
            )));
        }
        Ok(Self(id))
    }

    /// The identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn from_url(raw: &str) -> Option<String> {
    if !TOY_URL_PREFIXES.iter().any(|p| raw.starts_with(p)) {
        return None;
    }
    let (_, rest) = raw.split_once(TOY_URL_MARKER)?;
    let slug = rest
        .split('/')
        .next()?
        .split(['?', '#'])
        .next()?;
    if slug.is_empty() {
        None
    } else {
        Some(format!("toy_{slug}"))
    }
}

impl FromStr for ToyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ToyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of the flash phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashResult {
    /// Not attempted yet.
    Pending,
    /// All four images written.
    Flashed,
    /// Download or write failed.
    Failed,
}

/// Everything learned about the device currently on the station.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSession {
    /// Operator-entered ID.
    pub toy_id: ToyId,
    /// Bluetooth MAC captured from the boot log.
    pub physical_id: Option<String>,
    /// Advertised name captured from the boot log.
    pub device_name: Option<String>,
    /// Version burned or read from eFuse.
    pub hardware_version: Option<HardwareVersion>,
    /// Flash phase result.
    pub flash_result: FlashResult,
    /// Append-only QC history.
    pub qc_results: Vec<QcTestResult>,
    /// Whether the inventory report went out (or was overridden).
    pub api_sent: bool,
}

impl DeviceSession {
    /// Start a session for `toy_id`.
    pub fn new(toy_id: ToyId) -> Self {
        Self {
            toy_id,
            physical_id: None,
            device_name: None,
            hardware_version: None,
            flash_result: FlashResult::Pending,
            qc_results: Vec::new(),
            api_sent: false,
        }
    }

    /// Whether the most recent QC attempt passed.
    ///
    /// Earlier failed attempts stay in `qc_results` as evidence but do not
    /// block approval after a successful retry.
    pub fn approved(&self) -> bool {
        self.qc_results.last().is_some_and(QcTestResult::passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qc::evaluate;

    #[test]
    fn test_toy_id_from_url() {
        assert_eq!(ToyId::parse("https://bondu.com/toy/2drvff").unwrap().as_str(), "toy_2drvff");
        assert_eq!(ToyId::parse("  bondu.com/toy/abc123/extra?x=1").unwrap().as_str(), "toy_abc123");
        assert_eq!(ToyId::parse("http://bondu.com/toy/q1w2#frag").unwrap().as_str(), "toy_q1w2");
    }

    #[test]
    fn test_toy_id_plain() {
        assert_eq!(ToyId::parse("DINO-001").unwrap().to_string(), "DINO-001");
        assert_eq!("toy_4paqpj".parse::<ToyId>().unwrap().as_str(), "toy_4paqpj");
    }

    #[test]
    fn test_toy_id_rejects_invalid() {
        assert!(ToyId::parse("").is_err());
        assert!(ToyId::parse("ab").is_err());
        assert!(ToyId::parse(&"x".repeat(51)).is_err());
        assert!(ToyId::parse("has space").is_err());
        assert!(ToyId::parse("https://bondu.com/toy/").is_err());
        assert!(ToyId::parse(&"x".repeat(50)).is_ok());
    }

    #[test]
    fn test_approval_follows_latest_attempt() {
        let mut session = DeviceSession::new(ToyId::parse("toy_abc").unwrap());
        assert!(!session.approved());

        session.qc_results.push(evaluate(1000.0, 5000.0, 4500.0));
        assert!(!session.approved());

        session.qc_results.push(evaluate(5000.0, 5000.0, 4500.0));
        assert!(session.approved());
        assert_eq!(session.qc_results.len(), 2);
    }
}
