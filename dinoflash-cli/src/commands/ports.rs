//! Port listing and device scanning.

use anyhow::Result;
use console::style;
use dinoflash::device::{DEFAULT_POLL_INTERVAL, NativePortEnumerator, PortWatcher, format_port_list, scan};
use dinoflash::{EventSink, PortEnumerator, ScanStatus};
use std::sync::Arc;
use std::thread;

use crate::config::Config;
use crate::ui::{EventConsole, TICK, detection_line};
use crate::{Cli, CliError, clear_interrupted_flag, was_interrupted};

/// List all serial ports, marking the target device.
pub(crate) fn cmd_list_ports(config: &Config, json: bool) -> Result<()> {
    let id = config.usb_id();
    let detected = NativePortEnumerator.list_ports()?;

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "esp32": p.matches(id),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for (port, line) in detected.iter().zip(format_port_list(&detected, id)) {
        let bullet = if port.matches(id) {
            style("•").green()
        } else {
            style("•").dim()
        };
        eprintln!("  {bullet} {line}");
    }

    let result = scan(&NativePortEnumerator, id);
    if let (ScanStatus::Found, Some(port)) = (result.status, &result.port) {
        eprintln!(
            "\n{} Target device: {}",
            style("→").green().bold(),
            style(port).cyan().bold()
        );
    }
    Ok(())
}

/// Scan once, or keep reporting changes with `watch`.
pub(crate) fn cmd_scan(cli: &Cli, config: &Config, watch: bool) -> Result<()> {
    let id = config.usb_id();

    if !watch {
        let result = scan(&NativePortEnumerator, id);
        eprintln!("{}", detection_line(&result));
        return match (result.status, result.port) {
            (ScanStatus::Found, Some(port)) => {
                println!("{port}");
                Ok(())
            },
            _ => Err(CliError::DeviceNotFound("Expected exactly one ESP32 device".to_string()).into()),
        };
    }

    if !cli.quiet {
        eprintln!(
            "{} Watching for ESP32 devices (Ctrl-C to stop)",
            style("🔍").cyan()
        );
    }

    let (events, rx) = EventSink::channel();
    let watcher = PortWatcher::spawn(Arc::new(NativePortEnumerator), id, DEFAULT_POLL_INTERVAL, events);
    let mut console = EventConsole::new(cli.quiet);

    while !was_interrupted() {
        console.drain(&rx);
        thread::sleep(TICK);
    }

    watcher.stop();
    console.drain(&rx);
    clear_interrupted_flag();
    Ok(())
}
