//! Firmware catalog model, download and flashing.
//!
//! Builds come from a remote catalog split into two channels: `builds` for
//! production and `testing-builds` for the QC firmware. Each build carries
//! four binaries that are flashed at fixed offsets.

mod catalog;
mod flasher;

pub use catalog::{BuildCatalog, DEFAULT_CATALOG_URL, HttpCatalog};
pub use flasher::{FLASH_BAUD, FirmwareDirs, FirmwareFlasher, FlashLine, FlashProgressParser};

use std::fmt;

use serde::Deserialize;

use crate::version::HardwareVersion;

/// Station operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Burn the eFuse and flash QC firmware.
    Testing,
    /// Never burn; recover the version and flash release firmware.
    Production,
}

impl Mode {
    /// Catalog channel path segment.
    pub fn channel(self) -> &'static str {
        match self {
            Self::Testing => "testing-builds",
            Self::Production => "builds",
        }
    }

    /// Default local cache directory name.
    pub fn default_dir(self) -> &'static str {
        match self {
            Self::Testing => "testing_firmware",
            Self::Production => "production_firmware",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Testing => "testing",
            Self::Production => "production",
        })
    }
}

/// One of the four binaries in a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Second-stage bootloader.
    Bootloader,
    /// Application image.
    App,
    /// Partition table.
    PartitionTable,
    /// Initial OTA data partition.
    OtaInitial,
}

impl ArtifactKind {
    /// All artifacts, in `write_flash` argument order.
    pub const ALL: [Self; 4] = [
        Self::Bootloader,
        Self::App,
        Self::PartitionTable,
        Self::OtaInitial,
    ];

    /// `type` segment of the download URL.
    pub fn api_type(self) -> &'static str {
        match self {
            Self::Bootloader => "bootloader",
            Self::App => "app",
            Self::PartitionTable => "partition_table",
            Self::OtaInitial => "ota_initial",
        }
    }

    /// Local file name inside the mode directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Bootloader => "bootloader.bin",
            Self::App => "magical-toys.bin",
            Self::PartitionTable => "partition-table.bin",
            Self::OtaInitial => "ota_data_initial.bin",
        }
    }

    /// Flash offset.
    pub fn offset(self) -> u32 {
        match self {
            Self::Bootloader => 0x0,
            Self::App => 0x260000,
            Self::PartitionTable => 0x10000,
            Self::OtaInitial => 0x15000,
        }
    }
}

/// Build identifier as returned by the catalog (number or string).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BuildId {
    /// Numeric ID.
    Number(u64),
    /// String ID.
    Text(String),
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FirmwareBuild {
    /// Build identifier.
    pub id: BuildId,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// ISO-8601 creation timestamp.
    #[serde(default)]
    pub created_at: String,
    /// Hardware versions this build runs on, as `X.Y.Z` strings.
    #[serde(default)]
    pub supported_versions: Vec<String>,
}

impl FirmwareBuild {
    /// Whether `version` is listed as supported. Malformed entries are ignored.
    pub fn supports(&self, version: HardwareVersion) -> bool {
        self.supported_versions
            .iter()
            .filter_map(|s| s.parse::<HardwareVersion>().ok())
            .any(|v| v == version)
    }

    /// Name for display, falling back to the ID.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("build {}", self.id))
    }
}

/// Pick the newest build that supports `version`.
pub fn select_latest(builds: &[FirmwareBuild], version: HardwareVersion) -> Option<&FirmwareBuild> {
    builds
        .iter()
        .filter(|b| b.supports(version))
        .max_by(|a, b| a.created_at.cmp(&b.created_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(id: u64, created_at: &str, versions: &[&str]) -> FirmwareBuild {
        FirmwareBuild {
            id: BuildId::Number(id),
            name: Some(format!("fw-{id}")),
            created_at: created_at.to_string(),
            supported_versions: versions.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_select_latest_compatible() {
        let builds = vec![
            build(1, "2024-05-01T10:00:00Z", &["1.9.1"]),
            build(2, "2024-07-01T10:00:00Z", &["1.9.1", "2.0.0"]),
            build(3, "2024-09-01T10:00:00Z", &["2.0.0"]),
        ];
        let v = HardwareVersion::new(1, 9, 1);
        assert_eq!(select_latest(&builds, v).map(|b| &b.id), Some(&BuildId::Number(2)));
    }

    #[test]
    fn test_select_latest_none_compatible() {
        let builds = vec![build(1, "2024-05-01", &["2.0.0", "garbage"])];
        assert!(select_latest(&builds, HardwareVersion::new(1, 9, 1)).is_none());
        assert!(select_latest(&[], HardwareVersion::new(1, 9, 1)).is_none());
    }

    #[test]
    fn test_catalog_json_shapes() {
        let json = r#"[
            {"id": 17, "name": "QC 2.3", "created_at": "2024-08-01T00:00:00Z", "supported_versions": ["1.9.1"]},
            {"id": "abc", "name": null, "created_at": "2024-08-02T00:00:00Z", "supported_versions": []}
        ]"#;
        let builds: Vec<FirmwareBuild> = serde_json::from_str(json).unwrap();
        assert_eq!(builds[0].id, BuildId::Number(17));
        assert_eq!(builds[0].label(), "QC 2.3");
        assert_eq!(builds[1].id.to_string(), "abc");
        assert_eq!(builds[1].label(), "build abc");
    }

    #[test]
    fn test_mode_channels() {
        assert_eq!(Mode::Testing.channel(), "testing-builds");
        assert_eq!(Mode::Production.channel(), "builds");
        assert_eq!(Mode::Production.default_dir(), "production_firmware");
        assert_eq!(Mode::Testing.to_string(), "testing");
    }

    #[test]
    fn test_artifact_layout() {
        let offsets: Vec<u32> = ArtifactKind::ALL.iter().map(|k| k.offset()).collect();
        assert_eq!(offsets, vec![0x0, 0x260000, 0x10000, 0x15000]);
        assert_eq!(ArtifactKind::App.file_name(), "magical-toys.bin");
        assert_eq!(ArtifactKind::OtaInitial.api_type(), "ota_initial");
    }
}
