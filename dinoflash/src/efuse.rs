//! eFuse provisioning of the hardware version.
//!
//! The version lives in the first three bytes of eFuse `BLOCK3`
//! (`BLOCK_USR_DATA`). Burning is one-time and irreversible; reading is
//! unlimited. Both go through `espefuse`, so failures surface as `false` /
//! `None` with the tool output forwarded to the event sink.

use std::io::Write as _;
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use regex::Regex;

use crate::error::Error;
use crate::event::EventSink;
use crate::tool::{EspToolchain, ToolRunner};
use crate::version::HardwareVersion;

/// eFuse block holding the provisioning record.
pub const EFUSE_BLOCK: &str = "BLOCK3";

/// Timeout for the reset-to-download `chip_id` call.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for `espefuse summary`.
pub const SUMMARY_TIMEOUT: Duration = Duration::from_secs(15);

/// Wait between a burn and its read-back.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

#[allow(clippy::unwrap_used)] // Static pattern
static BLOCK3_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)BLOCK_USR_DATA \(BLOCK3\).*?=\s*([0-9a-f]{2})\s*([0-9a-f]{2})\s*([0-9a-f]{2})",
    )
    .unwrap()
});

/// Extract the hardware version from `espefuse summary` output.
///
/// Returns `None` when the block is missing, unparsable, or all zero.
pub fn parse_summary(text: &str) -> Option<HardwareVersion> {
    let caps = BLOCK3_PATTERN.captures(text)?;
    let mut bytes = [0u8; 3];
    for (i, slot) in bytes.iter_mut().enumerate() {
        *slot = u8::from_str_radix(caps.get(i + 1)?.as_str(), 16).ok()?;
    }
    HardwareVersion::from_bytes(bytes)
}

/// Burns and reads the hardware version through `espefuse`.
pub struct EfuseController {
    runner: Arc<dyn ToolRunner>,
    tools: EspToolchain,
    events: EventSink,
}

impl EfuseController {
    /// Create a controller.
    pub fn new(runner: Arc<dyn ToolRunner>, tools: EspToolchain, events: EventSink) -> Self {
        Self {
            runner,
            tools,
            events,
        }
    }

    /// Best-effort reset into the ROM download mode.
    ///
    /// Returns whether the reset reported success; callers proceed either way.
    pub fn reset_to_download(&self, port: &str) -> bool {
        let invocation = self
            .tools
            .esptool(port)
            .args(["--before=default_reset", "--after=hard_reset", "chip_id"])
            .with_timeout(RESET_TIMEOUT);

        match self.runner.run_checked(&invocation) {
            Ok(_) => {
                debug!("Reset on {port} succeeded");
                true
            },
            Err(e) => {
                warn!("Reset on {port} failed ({e}), continuing");
                self.events
                    .line(format!("Device reset failed ({e}), trying to burn anyway"));
                false
            },
        }
    }

    /// Burn `version` into `BLOCK3`.
    ///
    /// Returns `false` if the tool reports an error, for example because the
    /// block is already written.
    pub fn burn(&self, port: &str, version: HardwareVersion) -> bool {
        self.reset_to_download(port);

        let record = match write_record(version) {
            Ok(file) => file,
            Err(e) => {
                self.events
                    .line(format!("Could not stage eFuse record: {e}"));
                return false;
            },
        };

        let invocation = self
            .tools
            .espefuse(port)
            .arg("--do-not-confirm")
            .args(["burn_block_data", EFUSE_BLOCK])
            .arg(record.path().to_string_lossy());

        self.events
            .line(format!("Burning hardware version {version} into eFuse {EFUSE_BLOCK}"));

        let events = self.events.clone();
        match self
            .runner
            .stream_checked(&invocation, &mut |line| events.line(line))
        {
            Ok(_) => {
                self.events
                    .line(format!("eFuse burn of {version} completed"));
                true
            },
            Err(e @ (Error::Tool { .. } | Error::Timeout(_))) => {
                self.events.line(format!(
                    "eFuse burn failed ({e}); the block may already be written"
                ));
                false
            },
            Err(e) => {
                self.events
                    .line(format!("Could not run espefuse: {e}"));
                false
            },
        }
    }

    /// Read the burned hardware version, `None` if absent or unreadable.
    pub fn read(&self, port: &str) -> Option<HardwareVersion> {
        let invocation = self
            .tools
            .espefuse(port)
            .arg("summary")
            .with_timeout(SUMMARY_TIMEOUT);

        let output = match self.runner.run_checked(&invocation) {
            Ok(output) => output,
            Err(e @ (Error::Tool { .. } | Error::Timeout(_))) => {
                self.events.line(format!("eFuse read failed ({e})"));
                return None;
            },
            Err(e) => {
                self.events
                    .line(format!("Could not run espefuse: {e}"));
                return None;
            },
        };

        let version = parse_summary(&output.text());
        match version {
            Some(v) => self
                .events
                .line(format!("eFuse hardware version: {v}")),
            None => self
                .events
                .line("No hardware version found in eFuse"),
        }
        version
    }

    /// Burn `target`, wait `settle`, and read it back.
    ///
    /// The read-back decides the result. A burn refused because the block
    /// already holds a version recovers that version, even when it differs
    /// from `target`.
    pub fn burn_and_verify(&self, port: &str, target: HardwareVersion, settle: Duration) -> Verification {
        let burned = self.burn(port, target);
        if burned {
            thread::sleep(settle);
        } else {
            self.events
                .line("Burn failed; checking whether the eFuse already holds a version");
        }

        match (burned, self.read(port)) {
            (_, Some(found)) if found == target => {
                self.events
                    .line(format!("Hardware version {found} verified"));
                Verification::Verified(found)
            },
            (false, Some(found)) => {
                self.events.line(format!(
                    "eFuse already holds hardware version {found}; continuing with it instead of {target}"
                ));
                Verification::Recovered(found)
            },
            (true, Some(found)) => Verification::Mismatch {
                expected: target,
                found,
            },
            (true, None) => Verification::Missing(target),
            (false, None) => Verification::BurnFailed(target),
        }
    }
}

/// Result of [`EfuseController::burn_and_verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The block holds the target version.
    Verified(HardwareVersion),
    /// The burn failed and the block already holds this other version.
    Recovered(HardwareVersion),
    /// The burn reported success but the block holds a different version.
    Mismatch {
        /// Version that was to be burned.
        expected: HardwareVersion,
        /// Version read back.
        found: HardwareVersion,
    },
    /// The burn of the given version reported success but the block reads back as 0.0.0.
    Missing(HardwareVersion),
    /// The burn of the given version failed and no version is present.
    BurnFailed(HardwareVersion),
}

impl Verification {
    /// The verified version, if any.
    pub fn version(self) -> Option<HardwareVersion> {
        match self {
            Self::Verified(v) | Self::Recovered(v) => Some(v),
            _ => None,
        }
    }

    /// Operator-facing explanation of a failed verification.
    pub fn describe(self) -> String {
        match self {
            Self::Verified(v) => format!("Hardware version {v} verified"),
            Self::Recovered(v) => format!("Existing hardware version {v} recovered"),
            Self::Mismatch { expected, found } => format!(
                "eFuse verification failed: expected {expected}, read {found}. The fuse cannot be rewritten; set this device aside"
            ),
            Self::Missing(target) => format!(
                "eFuse verification failed: burned {target} but read back none (0.0.0). Do not retry the burn; set this device aside"
            ),
            Self::BurnFailed(target) => format!(
                "eFuse burn of {target} failed and no version is present. Check the connection and start the device again"
            ),
        }
    }
}

fn write_record(version: HardwareVersion) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("efuse_block3_")
        .suffix(".bin")
        .tempfile()?;
    file.write_all(&version.to_record())?;
    file.flush()?;
    Ok(file)
}
