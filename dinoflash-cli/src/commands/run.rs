//! The station loop: one toy after another through the full pipeline.

use anyhow::{Result, anyhow, bail};
use console::style;
use dialoguer::{Confirm, Error as DialoguerError, Input, Select, theme::ColorfulTheme};
use dinoflash::device::DEFAULT_POLL_INTERVAL;
use dinoflash::{
    ControllerSettings, DeviceController, DeviceOutcome, Event, EventSink, HardwareVersion, Mode,
    ScanResult, ScanStatus,
};
use log::{debug, info};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Instant;

use super::{build_station, resolve_version};
use crate::config::Config;
use crate::ui::{EventConsole, TICK, detection_line};
use crate::{Cli, CliError, ensure_not_interrupted};

/// Options of the `run` subcommand.
#[derive(Debug, Clone)]
pub(crate) struct RunOptions {
    pub(crate) mode: Mode,
    pub(crate) toy_id: Option<String>,
    pub(crate) hw_version: Option<HardwareVersion>,
    pub(crate) skip_efuse_read: bool,
    pub(crate) log_file: Option<PathBuf>,
}

/// Map a prompt failure to a CLI error class.
pub(crate) fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Prompt cancelled".to_string()).into()
            } else {
                CliError::Usage(format!("Prompt failed: {io_err}")).into()
            }
        },
    }
}

/// Operator choice after a QC failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttentionChoice {
    RetryQc,
    Abort,
}

/// Operator choice while a report is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockedChoice {
    Retry,
    Override,
}

/// Controller settings for this run.
fn settings_for(config: &Config, options: &RunOptions) -> Result<ControllerSettings> {
    if options.skip_efuse_read && options.mode != Mode::Production {
        return Err(CliError::Usage(
            "--skip-efuse-read only applies to production mode".to_string(),
        )
        .into());
    }

    Ok(ControllerSettings {
        mode: options.mode,
        target_version: resolve_version(options.hw_version, config)?,
        toolchain: config.toolchain(),
        dirs: config.firmware_dirs(),
        usb_id: config.usb_id(),
        skip_efuse_read: options.skip_efuse_read,
        ..ControllerSettings::default()
    })
}

/// Run the station until the operator stops.
pub(crate) fn cmd_run(cli: &Cli, config: &Config, options: &RunOptions) -> Result<()> {
    let settings = settings_for(config, options)?;
    let station = build_station(config)?;

    if !cli.quiet {
        eprintln!(
            "{} Station ready: {} mode, hardware version {}",
            style("🦖").green(),
            style(settings.mode).bold(),
            style(settings.target_version).bold()
        );
    }

    let log_path = options
        .log_file
        .clone()
        .unwrap_or_else(|| config.session_log());
    let (events, rx) = EventSink::channel();
    let mut console = EventConsole::new(cli.quiet).with_session_log(&log_path)?;
    console.record(&format!(
        "Station started: {} mode, hardware version {}",
        settings.mode, settings.target_version
    ));
    let mut controller = DeviceController::new(station, settings, events);
    let mut preset = options.toy_id.clone();
    let mut completed = 0u32;

    loop {
        ensure_not_interrupted()?;
        controller.start_new_device()?;
        console.drain(&rx);

        enter_toy_id(cli, &mut controller, &mut console, &rx, preset.take())?;
        let port = wait_for_device(cli, &controller, &mut console, &rx)?;

        let (returned, outcome) =
            run_job(&mut console, &rx, controller, move |c| c.process_device(&port))?;
        let (returned, outcome) = resolve_outcome(cli, returned, &mut console, &rx, outcome)?;
        controller = returned;

        console.record(&outcome.to_string());
        let done = show_outcome(&outcome);
        if done {
            completed += 1;
        }

        if cli.non_interactive {
            if !done {
                bail!("{outcome}");
            }
            break;
        }
        if !confirm_next_device()? {
            break;
        }
    }

    if !cli.quiet {
        eprintln!(
            "{} {completed} device(s) completed this session",
            style("→").green().bold()
        );
    }
    info!("Station stopped after {completed} device(s)");
    Ok(())
}

/// Move the controller onto a worker for `job`, rendering events meanwhile.
fn run_job<F>(
    console: &mut EventConsole,
    rx: &Receiver<Event>,
    controller: DeviceController,
    job: F,
) -> Result<(DeviceController, DeviceOutcome)>
where
    F: FnOnce(&mut DeviceController) -> DeviceOutcome + Send + 'static,
{
    let worker = controller.spawn_worker(job);
    console
        .wait_for(rx, worker)
        .map_err(|e| anyhow!("{e}; the station must be restarted"))
}

fn enter_toy_id(
    cli: &Cli,
    controller: &mut DeviceController,
    console: &mut EventConsole,
    rx: &Receiver<Event>,
    preset: Option<String>,
) -> Result<()> {
    if let Some(input) = preset {
        controller
            .accept_toy_id(&input)
            .map_err(|e| CliError::Usage(e.to_string()))?;
        console.drain(rx);
        return Ok(());
    }
    if cli.non_interactive {
        return Err(CliError::Usage(
            "--toy-id is required in non-interactive mode".to_string(),
        )
        .into());
    }

    loop {
        let input = Input::<String>::with_theme(&ColorfulTheme::default())
            .with_prompt("Scan or type the toy ID")
            .interact_text()
            .map_err(map_prompt_error)?;
        ensure_not_interrupted()?;

        match controller.accept_toy_id(&input) {
            Ok(toy_id) => {
                debug!("Session opened for {toy_id}");
                console.drain(rx);
                return Ok(());
            },
            Err(e) => eprintln!("{} {e}", style("✗").red()),
        }
    }
}

/// Poll until exactly one device is attached.
///
/// A changed result is printed once; an ambiguous result is repeated on
/// every poll until resolved.
fn wait_for_device(
    cli: &Cli,
    controller: &DeviceController,
    console: &mut EventConsole,
    rx: &Receiver<Event>,
) -> Result<String> {
    if let Some(port) = &cli.port {
        return Ok(port.clone());
    }

    let mut last: Option<ScanResult> = None;
    loop {
        ensure_not_interrupted()?;
        let result = controller.locate();
        let changed = last.as_ref() != Some(&result);

        if changed || result.status == ScanStatus::Ambiguous {
            console.record(&result.describe());
            eprintln!("{}", detection_line(&result));
        }
        if let (ScanStatus::Found, Some(port)) = (result.status, &result.port) {
            return Ok(port.clone());
        }
        last = Some(result);

        let deadline = Instant::now() + DEFAULT_POLL_INTERVAL;
        while Instant::now() < deadline {
            console.drain(rx);
            ensure_not_interrupted()?;
            thread::sleep(TICK);
        }
    }
}

/// Handle `NeedsAttention` and `ReportBlocked` until a final outcome.
fn resolve_outcome(
    cli: &Cli,
    mut controller: DeviceController,
    console: &mut EventConsole,
    rx: &Receiver<Event>,
    mut outcome: DeviceOutcome,
) -> Result<(DeviceController, DeviceOutcome)> {
    loop {
        match &outcome {
            DeviceOutcome::NeedsAttention(message) => {
                eprintln!("{} {message}", style("⚠").yellow());
                if cli.non_interactive || prompt_attention()? == AttentionChoice::Abort {
                    return Ok((controller, outcome));
                }
                (controller, outcome) = run_job(console, rx, controller, DeviceController::retry_qc)?;
            },
            DeviceOutcome::ReportBlocked(message) => {
                eprintln!("{} {message}", style("⛔").red());
                if cli.non_interactive {
                    bail!("{message}");
                }
                match prompt_blocked()? {
                    BlockedChoice::Retry => {
                        (controller, outcome) =
                            run_job(console, rx, controller, DeviceController::retry_report)?;
                    },
                    BlockedChoice::Override => {
                        outcome = controller.override_report();
                        console.drain(rx);
                    },
                }
            },
            _ => return Ok((controller, outcome)),
        }
    }
}

fn prompt_attention() -> Result<AttentionChoice> {
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("QC did not pass")
        .items(&["Retry QC", "Abort this device"])
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    Ok(match selection {
        Some(0) => AttentionChoice::RetryQc,
        _ => AttentionChoice::Abort,
    })
}

fn prompt_blocked() -> Result<BlockedChoice> {
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Inventory report failed; the station is blocked")
        .items(&[
            "Retry transmission",
            "Override (the toy will NOT be registered)",
        ])
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(0) => Ok(BlockedChoice::Retry),
        Some(_) => {
            let confirmed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt("Release the station without registering this toy?")
                .default(false)
                .interact_opt()
                .map_err(map_prompt_error)?
                .unwrap_or(false);
            Ok(if confirmed {
                BlockedChoice::Override
            } else {
                BlockedChoice::Retry
            })
        },
        None => Err(CliError::Cancelled(
            "Station stopped with an unsent inventory report".to_string(),
        )
        .into()),
    }
}

fn confirm_next_device() -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Provision the next device?")
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false))
}

/// Print the final outcome; returns whether the device is done.
fn show_outcome(outcome: &DeviceOutcome) -> bool {
    match outcome {
        DeviceOutcome::Completed { reported: true, .. } => {
            eprintln!("{} {}", style("✓").green().bold(), style(outcome).green());
            true
        },
        DeviceOutcome::Completed { reported: false, .. } => {
            eprintln!("{} {}", style("⚠").yellow().bold(), style(outcome).yellow());
            true
        },
        DeviceOutcome::NeedsAttention(_) => {
            eprintln!("{} Device set aside after failed QC", style("✗").red().bold());
            false
        },
        DeviceOutcome::Failed(message) | DeviceOutcome::ReportBlocked(message) => {
            eprintln!("{} {message}", style("✗").red().bold());
            false
        },
        DeviceOutcome::NotReady(message) => {
            eprintln!("{} {message}", style("…").yellow());
            false
        },
    }
}
