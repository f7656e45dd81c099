//! Standalone BLE QC command.

use anyhow::Result;
use console::style;
use dinoflash::EventSink;
use dinoflash::qc::{BtleplugQcRunner, QcOutcome, QcRunner, validate_mac};
use std::thread;

use super::qc_config;
use crate::config::Config;
use crate::ui::EventConsole;
use crate::{Cli, CliError};

/// Run one QC session against `mac`.
pub(crate) fn cmd_qc(cli: &Cli, config: &Config, mac: &str, threshold: Option<f64>) -> Result<()> {
    let mac = validate_mac(mac).map_err(|e| CliError::Usage(e.to_string()))?;
    let runner = BtleplugQcRunner::new(qc_config(config, threshold));

    if !cli.quiet {
        eprintln!("{} Running QC on {}", style("🎤").cyan(), style(&mac).cyan());
    }

    let (events, rx) = EventSink::channel();
    let worker = thread::spawn(move || runner.run_qc(&mac, &events));
    let outcome = EventConsole::new(cli.quiet).wait_for(&rx, worker)?;

    if let Some(result) = outcome.result() {
        println!(
            "{}",
            serde_json::to_string_pretty(result).unwrap_or_default()
        );
    }

    match outcome {
        QcOutcome::Completed(ref result) if result.passed() => {
            eprintln!("{} {outcome}", style("✓").green());
            Ok(())
        },
        QcOutcome::DeviceNotFound { .. } => Err(CliError::DeviceNotFound(outcome.to_string()).into()),
        _ => anyhow::bail!("{outcome}"),
    }
}
