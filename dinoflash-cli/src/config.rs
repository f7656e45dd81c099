//! Configuration file support for dinoflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (DINOFLASH_*)
//! 3. Local config file (./dinoflash.toml)
//! 4. Global config file (~/.config/dinoflash/config.toml)
//!
//! `--config PATH` replaces both files.

use directories::ProjectDirs;
use dinoflash::firmware::{DEFAULT_CATALOG_URL, FirmwareDirs};
use dinoflash::inventory::DEFAULT_INVENTORY_URL;
use dinoflash::qc::DEFAULT_THRESHOLD;
use dinoflash::tool::EspToolchain;
use dinoflash::{HardwareVersion, UsbId};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "dinoflash.toml";

/// Session log written by `run` unless configured otherwise.
pub const DEFAULT_SESSION_LOG: &str = "session.log";

/// Target device identification and provisioning defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    /// USB Vendor ID of the target.
    pub vid: Option<u16>,
    /// USB Product ID of the target.
    pub pid: Option<u16>,
    /// Hardware version to burn or assume, `X.Y.Z`.
    pub hardware_version: Option<String>,
}

/// Build server settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogConfig {
    /// Base URL of the build server.
    pub base_url: Option<String>,
}

/// Inventory API settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryConfig {
    /// Inventory update endpoint.
    pub url: Option<String>,
    /// Set to `false` to run without reporting.
    pub enabled: Option<bool>,
}

/// External tool settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolsConfig {
    /// Python interpreter with esptool installed.
    pub python: Option<String>,
}

/// Firmware cache directories.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathsConfig {
    /// Production build cache.
    pub production_firmware: Option<PathBuf>,
    /// Testing build cache.
    pub testing_firmware: Option<PathBuf>,
}

/// QC settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QcSection {
    /// Minimum RMS per microphone channel.
    pub threshold: Option<f64>,
}

/// Station settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StationConfig {
    /// Session log, truncated when `run` starts.
    pub log_file: Option<PathBuf>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Target device.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Build server.
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Inventory API.
    #[serde(default)]
    pub inventory: InventoryConfig,
    /// External tools.
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Firmware directories.
    #[serde(default)]
    pub paths: PathsConfig,
    /// QC.
    #[serde(default)]
    pub qc: QcSection,
    /// Station.
    #[serde(default)]
    pub station: StationConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "dinoflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.device.vid, other.device.vid);
        take(&mut self.device.pid, other.device.pid);
        take(&mut self.device.hardware_version, other.device.hardware_version);
        take(&mut self.catalog.base_url, other.catalog.base_url);
        take(&mut self.inventory.url, other.inventory.url);
        take(&mut self.inventory.enabled, other.inventory.enabled);
        take(&mut self.tools.python, other.tools.python);
        take(&mut self.paths.production_firmware, other.paths.production_firmware);
        take(&mut self.paths.testing_firmware, other.paths.testing_firmware);
        take(&mut self.qc.threshold, other.qc.threshold);
        take(&mut self.station.log_file, other.station.log_file);
    }

    /// USB identity of the target device.
    pub fn usb_id(&self) -> UsbId {
        let default = UsbId::default();
        UsbId {
            vid: self.device.vid.unwrap_or(default.vid),
            pid: self.device.pid.unwrap_or(default.pid),
        }
    }

    /// Configured hardware version, if any.
    pub fn hardware_version(&self) -> dinoflash::Result<Option<HardwareVersion>> {
        self.device
            .hardware_version
            .as_deref()
            .map(str::parse)
            .transpose()
    }

    /// Build server base URL.
    pub fn catalog_url(&self) -> &str {
        self.catalog
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_CATALOG_URL)
    }

    /// Inventory endpoint.
    pub fn inventory_url(&self) -> &str {
        self.inventory
            .url
            .as_deref()
            .unwrap_or(DEFAULT_INVENTORY_URL)
    }

    /// Whether reports are sent.
    pub fn inventory_enabled(&self) -> bool {
        self.inventory.enabled.unwrap_or(true)
    }

    /// esptool/espefuse invocation settings.
    pub fn toolchain(&self) -> EspToolchain {
        match &self.tools.python {
            Some(python) => EspToolchain::new(python.clone()),
            None => EspToolchain::default(),
        }
    }

    /// Firmware cache directories.
    pub fn firmware_dirs(&self) -> FirmwareDirs {
        let default = FirmwareDirs::default();
        FirmwareDirs {
            production: self
                .paths
                .production_firmware
                .clone()
                .unwrap_or(default.production),
            testing: self
                .paths
                .testing_firmware
                .clone()
                .unwrap_or(default.testing),
        }
    }

    /// QC threshold.
    pub fn qc_threshold(&self) -> f64 {
        self.qc.threshold.unwrap_or(DEFAULT_THRESHOLD)
    }

    /// Session log path.
    pub fn session_log(&self) -> PathBuf {
        self.station
            .log_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_LOG))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.device.vid.is_none());
        assert!(config.device.hardware_version.is_none());
        assert!(config.inventory.enabled.is_none());
        assert_eq!(config.usb_id(), UsbId::ESP32_S3);
        assert_eq!(config.catalog_url(), DEFAULT_CATALOG_URL);
        assert_eq!(config.inventory_url(), DEFAULT_INVENTORY_URL);
        assert!(config.inventory_enabled());
        assert!((config.qc_threshold() - DEFAULT_THRESHOLD).abs() < f64::EPSILON);
        assert_eq!(config.firmware_dirs(), FirmwareDirs::default());
        assert_eq!(config.hardware_version().unwrap(), None);
        assert_eq!(config.session_log(), PathBuf::from(DEFAULT_SESSION_LOG));
    }

    // ---- Merge ----

    #[test]
    fn test_config_merge_overrides_set_values() {
        let mut base = Config::default();
        base.device.hardware_version = Some("1.9.1".into());
        base.tools.python = Some("python3".into());

        let mut local = Config::default();
        local.device.hardware_version = Some("2.0.0".into());
        local.inventory.enabled = Some(false);

        base.merge(local);
        assert_eq!(base.device.hardware_version.as_deref(), Some("2.0.0"));
        assert_eq!(base.tools.python.as_deref(), Some("python3"));
        assert!(!base.inventory_enabled());
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.device.vid = Some(0x1234);
        base.qc.threshold = Some(3000.0);

        base.merge(Config::default());
        assert_eq!(base.device.vid, Some(0x1234));
        assert_eq!(base.qc.threshold, Some(3000.0));
    }

    // ---- TOML ----

    #[test]
    fn test_config_from_toml() {
        let config: Config = toml::from_str(
            r#"
[device]
vid = 12346
pid = 4097
hardware_version = "1.9.1"

[catalog]
base_url = "http://builds.local:3000"

[inventory]
url = "http://inventory.local/update"
enabled = false

[tools]
python = "/opt/esp/python"

[paths]
production_firmware = "/srv/fw/prod"
testing_firmware = "/srv/fw/test"

[qc]
threshold = 4000.0

[station]
log_file = "/var/log/dinoflash/bench1.log"
"#,
        )
        .unwrap();

        assert_eq!(config.usb_id(), UsbId { vid: 12346, pid: 4097 });
        assert_eq!(
            config.hardware_version().unwrap(),
            Some(HardwareVersion::new(1, 9, 1))
        );
        assert_eq!(config.catalog_url(), "http://builds.local:3000");
        assert_eq!(config.inventory_url(), "http://inventory.local/update");
        assert!(!config.inventory_enabled());
        assert_eq!(config.toolchain().python, "/opt/esp/python");
        assert_eq!(config.firmware_dirs().production, PathBuf::from("/srv/fw/prod"));
        assert_eq!(config.firmware_dirs().testing, PathBuf::from("/srv/fw/test"));
        assert!((config.qc_threshold() - 4000.0).abs() < f64::EPSILON);
        assert_eq!(
            config.session_log(),
            PathBuf::from("/var/log/dinoflash/bench1.log")
        );
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_from_partial_toml() {
        let config: Config = toml::from_str("[device]\nvid = 1\n").unwrap();
        assert_eq!(config.usb_id().vid, 1);
        assert_eq!(config.usb_id().pid, UsbId::ESP32_S3.pid);
    }

    #[test]
    fn test_invalid_hardware_version_is_reported() {
        let config: Config = toml::from_str("[device]\nhardware_version = \"1.9\"\n").unwrap();
        assert!(config.hardware_version().is_err());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let mut config = Config::default();
        config.device.hardware_version = Some("1.9.1".into());
        config.paths.testing_firmware = Some(PathBuf::from("fw/testing"));

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    // ---- load_from_path with tempfile ----

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("station.toml");
        fs::write(
            &path,
            r#"
[device]
hardware_version = "2.1.0"
[tools]
python = "python3.11"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.device.hardware_version.as_deref(), Some("2.1.0"));
        assert_eq!(config.tools.python.as_deref(), Some("python3.11"));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[device\nvid = ").unwrap();

        assert_eq!(Config::load_from_path(&path), Config::default());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert_eq!(config, Config::default());
    }

    // ---- global_config_path ----

    #[test]
    fn test_global_config_path_is_some() {
        let path = Config::global_config_path();
        if let Some(p) = path {
            assert!(p.to_str().unwrap().contains("dinoflash"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
