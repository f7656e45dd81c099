//! Firmware download and flash command.

use anyhow::{Context, Result, bail};
use console::style;
use dinoflash::firmware::{FirmwareFlasher, HttpCatalog};
use dinoflash::tool::SystemToolRunner;
use dinoflash::{EventSink, HardwareVersion, Mode};
use std::sync::Arc;
use std::thread;

use super::resolve_version;
use crate::config::Config;
use crate::ui::EventConsole;
use crate::{Cli, ensure_not_interrupted, get_port};

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    mode: Mode,
    hw_version: Option<HardwareVersion>,
) -> Result<()> {
    let version = resolve_version(hw_version, config)?;
    let port = get_port(cli, config)?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!(
            "{} Flashing {mode} firmware for hardware version {version} on {}",
            style("📦").cyan(),
            style(&port).cyan()
        );
    }

    let catalog = HttpCatalog::new(config.catalog_url())
        .with_context(|| format!("Failed to set up build server client for {}", config.catalog_url()))?;

    let (events, rx) = EventSink::channel();
    let flasher = FirmwareFlasher::new(
        Arc::new(catalog),
        Arc::new(SystemToolRunner),
        config.toolchain(),
        config.firmware_dirs(),
        events,
    );
    let worker = thread::spawn(move || flasher.flash(&port, mode, version));
    let flashed = EventConsole::new(cli.quiet).wait_for(&rx, worker)?;

    if !flashed {
        bail!("Flashing {mode} firmware for hardware version {version} failed");
    }
    if !cli.quiet {
        eprintln!("{} Flash complete", style("✓").green());
    }
    Ok(())
}
