//! eFuse read and burn commands.

use anyhow::{Result, bail};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use dinoflash::efuse::{EFUSE_BLOCK, EfuseController, SETTLE_DELAY, Verification};
use dinoflash::tool::SystemToolRunner;
use dinoflash::{EventSink, HardwareVersion};
use std::sync::Arc;
use std::thread;

use super::resolve_version;
use super::run::map_prompt_error;
use crate::config::Config;
use crate::ui::EventConsole;
use crate::{Cli, CliError, ensure_not_interrupted, get_port};

fn controller(config: &Config, events: EventSink) -> EfuseController {
    EfuseController::new(Arc::new(SystemToolRunner), config.toolchain(), events)
}

/// Print the burned hardware version, or "none".
pub(crate) fn cmd_efuse_read(cli: &Cli, config: &Config) -> Result<()> {
    let port = get_port(cli, config)?;
    if !cli.quiet {
        eprintln!("{} Reading eFuse {EFUSE_BLOCK} on {port}", style("🔎").cyan());
    }

    let (events, rx) = EventSink::channel();
    let efuse = controller(config, events);
    let worker = thread::spawn(move || efuse.read(&port));
    let version = EventConsole::new(cli.quiet).wait_for(&rx, worker)?;

    match version {
        Some(version) => println!("{version}"),
        None => println!("none"),
    }
    Ok(())
}

/// Burn the hardware version and verify the read-back.
pub(crate) fn cmd_efuse_burn(
    cli: &Cli,
    config: &Config,
    hw_version: Option<HardwareVersion>,
    yes: bool,
) -> Result<()> {
    let version = resolve_version(hw_version, config)?;

    if !yes {
        if cli.non_interactive {
            return Err(CliError::Usage(
                "Burning an eFuse is irreversible; pass --yes to confirm in non-interactive mode"
                    .to_string(),
            )
            .into());
        }
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Burn hardware version {version} into eFuse {EFUSE_BLOCK}? This cannot be undone"
            ))
            .default(false)
            .interact_opt()
            .map_err(map_prompt_error)?
            .unwrap_or(false);
        if !confirmed {
            return Err(CliError::Cancelled("eFuse burn cancelled".to_string()).into());
        }
    }
    ensure_not_interrupted()?;

    let port = get_port(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Burning hardware version {} on {port}",
            style("🔥").red(),
            style(version).bold()
        );
    }

    let (events, rx) = EventSink::channel();
    let efuse = controller(config, events);
    let worker = thread::spawn(move || efuse.burn_and_verify(&port, version, SETTLE_DELAY));
    let verification = EventConsole::new(cli.quiet).wait_for(&rx, worker)?;

    match verification {
        Verification::Verified(found) => {
            if !cli.quiet {
                eprintln!(
                    "{} Hardware version {} verified",
                    style("✓").green(),
                    style(found).bold()
                );
            }
            Ok(())
        },
        Verification::Recovered(found) => {
            eprintln!(
                "{} eFuse already holds hardware version {}, not {version}",
                style("⚠").yellow(),
                style(found).bold()
            );
            Ok(())
        },
        _ => bail!(verification.describe()),
    }
}
