//! Command implementations.
//!
//! Each subcommand is implemented in its own module; shared wiring from
//! configuration to library types lives here.

pub(crate) mod efuse;
pub(crate) mod flash;
pub(crate) mod monitor;
pub(crate) mod ports;
pub(crate) mod qc;
pub(crate) mod run;

use anyhow::{Context, Result};
use dinoflash::device::NativePortEnumerator;
use dinoflash::firmware::HttpCatalog;
use dinoflash::inventory::{DisabledReporter, HttpInventoryReporter, InventoryReporter};
use dinoflash::monitor::SerialBootWatcher;
use dinoflash::qc::{BtleplugQcRunner, QcConfig};
use dinoflash::tool::SystemToolRunner;
use dinoflash::version::DEFAULT_HARDWARE_VERSION;
use dinoflash::{HardwareVersion, Station};
use log::warn;
use std::sync::Arc;

use crate::CliError;
use crate::config::Config;

/// Hardware version from the command line, else the config, else the default.
pub(crate) fn resolve_version(
    cli_version: Option<HardwareVersion>,
    config: &Config,
) -> Result<HardwareVersion> {
    if let Some(version) = cli_version {
        return Ok(version);
    }
    match config.hardware_version() {
        Ok(version) => Ok(version.unwrap_or(DEFAULT_HARDWARE_VERSION)),
        Err(e) => Err(CliError::Config(format!("[device] hardware_version: {e}")).into()),
    }
}

/// QC settings from the config, with an optional threshold override.
pub(crate) fn qc_config(config: &Config, threshold: Option<f64>) -> QcConfig {
    QcConfig {
        threshold: threshold.unwrap_or_else(|| config.qc_threshold()),
        ..QcConfig::default()
    }
}

/// Real hardware and network collaborators.
pub(crate) fn build_station(config: &Config) -> Result<Station> {
    let ports = Arc::new(NativePortEnumerator);

    let catalog = HttpCatalog::new(config.catalog_url())
        .with_context(|| format!("Failed to set up build server client for {}", config.catalog_url()))?;

    let reporter: Arc<dyn InventoryReporter> = if config.inventory_enabled() {
        Arc::new(
            HttpInventoryReporter::new(config.inventory_url())
                .context("Failed to set up inventory client")?,
        )
    } else {
        warn!("Inventory reporting is disabled in the configuration");
        Arc::new(DisabledReporter)
    };

    Ok(Station {
        ports: ports.clone(),
        tools: Arc::new(SystemToolRunner),
        catalog: Arc::new(catalog),
        watcher: Arc::new(SerialBootWatcher::new(ports)),
        qc: Arc::new(BtleplugQcRunner::new(qc_config(config, None))),
        reporter,
    })
}
