//! Serial monitor command.

use anyhow::{Result, bail};
use console::style;
use dinoflash::EventSink;
use dinoflash::device::NativePortEnumerator;
use dinoflash::monitor::{MONITOR_BAUD, MonitorExit, SerialMonitor};
use std::sync::Arc;
use std::thread;

use crate::config::Config;
use crate::ui::EventConsole;
use crate::{Cli, clear_interrupted_flag, get_port, interrupt_flag};

/// Stream the device console; captured identities go to stdout as `MAC NAME`.
pub(crate) fn cmd_monitor(cli: &Cli, config: &Config) -> Result<()> {
    let port = get_port(cli, config)?;

    let (events, rx) = EventSink::channel();
    let monitor = SerialMonitor::new(port.clone(), Arc::new(NativePortEnumerator), events);
    let serial = monitor.open(MONITOR_BAUD)?;

    if !cli.quiet {
        eprintln!(
            "{} Monitoring {} at {MONITOR_BAUD} baud (Ctrl-C to exit)",
            style("📡").cyan(),
            style(&port).cyan()
        );
    }

    let worker = thread::spawn(move || {
        monitor.run(serial, interrupt_flag(), &mut |identity| {
            println!("{} {}", identity.mac, identity.name);
        })
    });

    // Console lines are the point of this command, even with --quiet.
    let exit = EventConsole::new(false).wait_for(&rx, worker)?;

    match exit {
        MonitorExit::Stopped => {
            clear_interrupted_flag();
            Ok(())
        },
        MonitorExit::Disconnected => bail!("Device on {port} disconnected"),
    }
}
