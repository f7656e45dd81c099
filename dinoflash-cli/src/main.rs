//! dinoflash CLI - operator station for provisioning ESP32-S3 toys.
//!
//! ## Features
//!
//! - ESP32-S3 detection with ambiguity handling
//! - Hardware version eFuse read and burn
//! - Firmware download and flashing
//! - Serial boot log monitor with BLE identity capture
//! - Microphone QC over Bluetooth LE
//! - Full station loop with inventory reporting
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use dinoflash::device::{NativePortEnumerator, scan};
use dinoflash::{HardwareVersion, Mode};
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed since the flag was last cleared.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// The shared stop flag, for loops that poll it directly.
fn interrupt_flag() -> &'static AtomicBool {
    &INTERRUPTED
}

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".to_string()).into())
    } else {
        Ok(())
    }
}

mod commands;
mod config;
mod ui;

use commands::efuse::{cmd_efuse_burn, cmd_efuse_read};
use commands::flash::cmd_flash;
use commands::monitor::cmd_monitor;
use commands::ports::{cmd_list_ports, cmd_scan};
use commands::qc::cmd_qc;
use commands::run::{RunOptions, cmd_run};
use config::Config;

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Invalid invocation (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Invalid configuration (exit code 3).
    #[error("{0}")]
    Config(String),
    /// No usable device attached (exit code 4).
    #[error("{0}")]
    DeviceNotFound(String),
    /// Cancelled by the operator (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::DeviceNotFound(_) => 4,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_error) = err.downcast_ref::<CliError>() {
        return cli_error.exit_code();
    }
    match err.downcast_ref::<dinoflash::Error>() {
        Some(dinoflash::Error::DeviceNotFound | dinoflash::Error::AmbiguousDevice(_)) => 4,
        _ => 1,
    }
}

/// dinoflash - factory provisioning station for ESP32-S3 toys.
///
/// Environment variables:
///   DINOFLASH_PORT              - Serial port (skips auto-detection)
///   DINOFLASH_MODE              - Station mode (testing, production)
///   DINOFLASH_HW_VERSION        - Hardware version X.Y.Z
///   DINOFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "dinoflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:
  dinoflash scan --watch
  dinoflash efuse burn --hw-version 1.9.1
  dinoflash run --mode testing
  dinoflash run --mode production --toy-id https://bondu.com/toy/2drvff")]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "DINOFLASH_PORT")]
    port: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "DINOFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Station mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    /// Burn the hardware version and flash QC firmware.
    Testing,
    /// Read the hardware version and flash release firmware.
    Production,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Testing => Mode::Testing,
            ModeArg::Production => Mode::Production,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check for exactly one connected ESP32-S3.
    Scan {
        /// Keep scanning and report every change until Ctrl-C.
        #[arg(short, long)]
        watch: bool,
    },

    /// Read or burn the hardware version eFuse.
    Efuse {
        #[command(subcommand)]
        action: EfuseAction,
    },

    /// Download and flash firmware (no eFuse, no QC).
    Flash {
        /// Firmware channel.
        #[arg(short, long, env = "DINOFLASH_MODE")]
        mode: ModeArg,

        /// Hardware version the build must support.
        #[arg(long, env = "DINOFLASH_HW_VERSION", value_name = "X.Y.Z")]
        hw_version: Option<HardwareVersion>,
    },

    /// Stream the serial console and report the BLE identity.
    Monitor,

    /// Run the microphone QC session over BLE.
    Qc {
        /// Bluetooth MAC of the toy (AA:BB:CC:DD:EE:FF).
        #[arg(long)]
        mac: String,

        /// Minimum RMS per channel.
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Run the full station loop: toy ID, eFuse, flash, QC, inventory.
    Run {
        /// Station mode.
        #[arg(short, long, env = "DINOFLASH_MODE")]
        mode: ModeArg,

        /// Toy ID or bondu.com/toy URL for the first device.
        #[arg(long, value_name = "ID")]
        toy_id: Option<String>,

        /// Hardware version to burn (testing) or assume (production with --skip-efuse-read).
        #[arg(long, env = "DINOFLASH_HW_VERSION", value_name = "X.Y.Z")]
        hw_version: Option<HardwareVersion>,

        /// Production only: trust the configured version instead of reading eFuse.
        #[arg(long)]
        skip_efuse_read: bool,

        /// Session log, truncated at start (defaults to `[station] log_file`, then session.log).
        #[arg(long, env = "DINOFLASH_LOG_FILE", value_name = "PATH")]
        log_file: Option<PathBuf>,
    },
}

/// eFuse operations.
#[derive(Subcommand)]
enum EfuseAction {
    /// Print the burned hardware version.
    Read,

    /// Burn the hardware version (one-time, irreversible).
    Burn {
        /// Version to burn (defaults to the configured one).
        #[arg(long, env = "DINOFLASH_HW_VERSION", value_name = "X.Y.Z")]
        hw_version: Option<HardwareVersion>,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "dinoflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    if let Err(err) = run(&cli, &config) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}

fn run(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Commands::ListPorts { json } => cmd_list_ports(config, *json)?,
        Commands::Scan { watch } => cmd_scan(cli, config, *watch)?,
        Commands::Efuse { action } => match action {
            EfuseAction::Read => cmd_efuse_read(cli, config)?,
            EfuseAction::Burn { hw_version, yes } => {
                cmd_efuse_burn(cli, config, *hw_version, *yes)?;
            },
        },
        Commands::Flash { mode, hw_version } => {
            cmd_flash(cli, config, (*mode).into(), *hw_version)?;
        },
        Commands::Monitor => cmd_monitor(cli, config)?,
        Commands::Qc { mac, threshold } => cmd_qc(cli, config, mac, *threshold)?,
        Commands::Run {
            mode,
            toy_id,
            hw_version,
            skip_efuse_read,
            log_file,
        } => {
            let options = RunOptions {
                mode: (*mode).into(),
                toy_id: toy_id.clone(),
                hw_version: *hw_version,
                skip_efuse_read: *skip_efuse_read,
                log_file: log_file.clone(),
            };
            cmd_run(cli, config, &options)?;
        },
    }

    Ok(())
}

/// Get the serial port from the CLI or by scanning for exactly one device.
fn get_port(cli: &Cli, config: &Config) -> Result<String> {
    if let Some(port) = &cli.port {
        return Ok(port.clone());
    }

    let result = scan(&NativePortEnumerator, config.usb_id());
    let description = result.describe();
    match result.into_port() {
        Ok(port) => {
            debug!("Auto-selected {port}");
            Ok(port)
        },
        Err(e) => {
            debug!("Port auto-detection failed: {e}");
            Err(CliError::DeviceNotFound(format!(
                "{description}. Use --port to choose one explicitly"
            ))
            .into())
        },
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    // ---- clap validation ----

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from([
            "dinoflash",
            "--port",
            "/dev/ttyACM0",
            "run",
            "--mode",
            "production",
            "--toy-id",
            "toy_abc",
            "--skip-efuse-read",
            "--log-file",
            "bench1.log",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        if let Commands::Run {
            mode,
            toy_id,
            hw_version,
            skip_efuse_read,
            log_file,
        } = cli.command
        {
            assert_eq!(mode, ModeArg::Production);
            assert_eq!(toy_id.as_deref(), Some("toy_abc"));
            assert!(hw_version.is_none());
            assert!(skip_efuse_read);
            assert_eq!(log_file, Some(PathBuf::from("bench1.log")));
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_cli_parse_flash_with_version() {
        let cli = Cli::try_parse_from([
            "dinoflash",
            "flash",
            "-m",
            "testing",
            "--hw-version",
            "1.9.1",
        ])
        .unwrap();
        if let Commands::Flash { mode, hw_version } = cli.command {
            assert_eq!(Mode::from(mode), Mode::Testing);
            assert_eq!(hw_version, Some(HardwareVersion::new(1, 9, 1)));
        } else {
            panic!("Expected Flash command");
        }
    }

    #[test]
    fn test_cli_rejects_malformed_version() {
        let result = Cli::try_parse_from([
            "dinoflash",
            "flash",
            "--mode",
            "testing",
            "--hw-version",
            "1.9",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["dinoflash", "run", "--mode", "staging"]).is_err());
    }

    #[test]
    fn test_cli_parse_efuse_burn() {
        let cli =
            Cli::try_parse_from(["dinoflash", "efuse", "burn", "--hw-version", "2.0.0", "-y"])
                .unwrap();
        match cli.command {
            Commands::Efuse {
                action: EfuseAction::Burn { hw_version, yes },
            } => {
                assert_eq!(hw_version, Some(HardwareVersion::new(2, 0, 0)));
                assert!(yes);
            },
            _ => panic!("Expected efuse burn"),
        }
    }

    #[test]
    fn test_cli_parse_efuse_read() {
        let cli = Cli::try_parse_from(["dinoflash", "efuse", "read"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Efuse {
                action: EfuseAction::Read
            }
        ));
    }

    #[test]
    fn test_cli_parse_qc() {
        let cli = Cli::try_parse_from([
            "dinoflash",
            "qc",
            "--mac",
            "8C:BF:EA:84:B8:C8",
            "--threshold",
            "4000",
        ])
        .unwrap();
        if let Commands::Qc { mac, threshold } = cli.command {
            assert_eq!(mac, "8C:BF:EA:84:B8:C8");
            assert_eq!(threshold, Some(4000.0));
        } else {
            panic!("Expected Qc command");
        }
    }

    #[test]
    fn test_cli_qc_requires_mac() {
        assert!(Cli::try_parse_from(["dinoflash", "qc"]).is_err());
    }

    #[test]
    fn test_cli_parse_list_ports_json() {
        let cli = Cli::try_parse_from(["dinoflash", "list-ports", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    #[test]
    fn test_cli_parse_scan_watch() {
        let cli = Cli::try_parse_from(["dinoflash", "scan", "--watch"]).unwrap();
        assert!(matches!(cli.command, Commands::Scan { watch: true }));
    }

    // ---- Global options ----

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["dinoflash", "monitor"]).unwrap();
        assert_eq!(cli.verbose, 0);
        assert!(!cli.quiet);
        assert!(cli.config_path.is_none());
    }

    #[test]
    fn test_cli_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "dinoflash",
            "scan",
            "-vv",
            "-q",
            "--non-interactive",
            "--config",
            "station.toml",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
        assert!(cli.non_interactive);
        assert_eq!(cli.config_path, Some(PathBuf::from("station.toml")));
    }

    // ---- Exit codes ----

    #[test]
    fn test_exit_codes() {
        let usage: anyhow::Error = CliError::Usage("bad".into()).into();
        let config: anyhow::Error = CliError::Config("bad".into()).into();
        let missing: anyhow::Error = CliError::DeviceNotFound("none".into()).into();
        let cancelled: anyhow::Error = CliError::Cancelled("stop".into()).into();
        assert_eq!(exit_code_for(&usage), 2);
        assert_eq!(exit_code_for(&config), 3);
        assert_eq!(exit_code_for(&missing), 4);
        assert_eq!(exit_code_for(&cancelled), 130);
    }

    #[test]
    fn test_exit_codes_for_library_errors() {
        let ambiguous: anyhow::Error = dinoflash::Error::AmbiguousDevice(2).into();
        let not_found = anyhow::Error::from(dinoflash::Error::DeviceNotFound).context("scanning");
        let other: anyhow::Error = dinoflash::Error::Protocol("x".into()).into();
        assert_eq!(exit_code_for(&ambiguous), 4);
        assert_eq!(exit_code_for(&not_found), 4);
        assert_eq!(exit_code_for(&other), 1);
        assert_eq!(exit_code_for(&anyhow::anyhow!("plain")), 1);
    }

    #[test]
    fn test_interrupt_flag() {
        clear_interrupted_flag();
        assert!(ensure_not_interrupted().is_ok());
        interrupt_flag().store(true, Ordering::SeqCst);
        assert!(was_interrupted());
        let err = ensure_not_interrupted().unwrap_err();
        assert_eq!(exit_code_for(&err), 130);
        clear_interrupted_flag();
    }
}
