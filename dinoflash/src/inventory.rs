//! Inventory reporting for approved toys.

use std::time::Duration;

use log::{debug, info};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::qc::QcTestResult;

/// Partner inventory endpoint.
pub const DEFAULT_INVENTORY_URL: &str = "https://api.bondu.com/api/partner/toys/inventory/update";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Test evidence attached to a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestData {
    /// Sanitised session log.
    pub logs: String,
    /// Every QC result of the session.
    pub qc_results: Vec<QcTestResult>,
}

/// Body of the inventory update request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventoryReport {
    /// Toy identifier.
    pub toy_id: String,
    /// MAC without separators, lower case.
    pub mac_address: String,
    /// Always empty.
    pub sku: String,
    /// Evidence.
    pub test_data: TestData,
}

impl InventoryReport {
    /// Build a report from session data.
    pub fn new(toy_id: &str, mac: &str, logs: &[String], qc_results: Vec<QcTestResult>) -> Self {
        Self {
            toy_id: toy_id.to_string(),
            mac_address: compact_mac(mac),
            sku: String::new(),
            test_data: TestData {
                logs: sanitize_log_text(&logs.join("\n")),
                qc_results,
            },
        }
    }
}

/// `"A4:CF:12:0B:3E:9D"` -> `"a4cf120b3e9d"`.
pub fn compact_mac(mac: &str) -> String {
    mac.chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect::<String>()
        .to_lowercase()
}

/// Make log text safe for the inventory API.
///
/// Backslashes become `/`, carriage returns are dropped, tabs become four
/// spaces, control characters other than `\n` are removed and non-ASCII
/// characters are replaced with `?`.
pub fn sanitize_log_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push('/'),
            '\r' => {},
            '\t' => out.push_str("    "),
            '\n' => out.push('\n'),
            c if c.is_control() => {},
            c if !c.is_ascii() => out.push('?'),
            c => out.push(c),
        }
    }
    out
}

/// Destination for inventory reports.
pub trait InventoryReporter: Send + Sync {
    /// Send one report; `Ok` only when the server accepted it.
    fn send(&self, report: &InventoryReport) -> Result<()>;
}

/// Reporter posting JSON over HTTPS.
pub struct HttpInventoryReporter {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpInventoryReporter {
    /// Create a reporter for `url`.
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("dinoflash/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl InventoryReporter for HttpInventoryReporter {
    fn send(&self, report: &InventoryReport) -> Result<()> {
        debug!("POST {} for {}", self.url, report.toy_id);
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "*/*")
            .json(report)
            .send()?;

        let status = response.status();
        if matches!(status.as_u16(), 200 | 201) {
            info!("Inventory accepted {} ({status})", report.toy_id);
            return Ok(());
        }

        let body = response.text().unwrap_or_default();
        Err(Error::Protocol(format!(
            "inventory API answered {status}: {}",
            body.trim()
        )))
    }
}

/// Reporter that accepts everything without sending; used when reporting is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledReporter;

impl InventoryReporter for DisabledReporter {
    fn send(&self, report: &InventoryReport) -> Result<()> {
        info!("Inventory reporting disabled; not sending {}", report.toy_id);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::qc::evaluate;
    use std::sync::Mutex;

    /// Fails the first `failures` sends, then records reports.
    #[derive(Default)]
    pub(crate) struct FakeReporter {
        pub(crate) failures: Mutex<u32>,
        pub(crate) sent: Mutex<Vec<InventoryReport>>,
    }

    impl FakeReporter {
        pub(crate) fn failing(failures: u32) -> Self {
            Self {
                failures: Mutex::new(failures),
                sent: Mutex::default(),
            }
        }

        pub(crate) fn sent(&self) -> Vec<InventoryReport> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl InventoryReporter for FakeReporter {
        fn send(&self, report: &InventoryReport) -> Result<()> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Protocol("inventory API answered 503".into()));
            }
            self.sent.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    #[test]
    fn test_sanitize_log_text() {
        assert_eq!(
            sanitize_log_text("C:\\fw\\app.bin\r\n\tok ✅\x1b[0m"),
            "C:/fw/app.bin\n    ok ?[0m"
        );
        assert_eq!(sanitize_log_text("plain\nlines"), "plain\nlines");
    }

    #[test]
    fn test_report_body_shape() {
        let report = InventoryReport::new(
            "toy_4paqpj",
            "8C:BF:EA:84:B8:C8",
            &["line one".to_string(), "line\ttwo".to_string()],
            vec![evaluate(5000.0, 4800.0, 4500.0)],
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["toy_id"], "toy_4paqpj");
        assert_eq!(value["mac_address"], "8cbfea84b8c8");
        assert_eq!(value["sku"], "");
        assert_eq!(value["test_data"]["logs"], "line one\nline    two");
        assert_eq!(value["test_data"]["qc_results"][0]["status"], "pass");
        assert_eq!(value["test_data"]["qc_results"][0]["left_status"], "pass");
        assert_eq!(value["test_data"]["qc_results"][0]["rms_left"], 5000.0);
    }

    #[test]
    fn test_compact_mac() {
        assert_eq!(compact_mac("A4-CF-12-0B-3E-9D"), "a4cf120b3e9d");
    }
}
