//! Download-and-flash of a build via `esptool write_flash`.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use log::{debug, warn};
use regex::Regex;

use super::{ArtifactKind, BuildCatalog, Mode, select_latest};
use crate::error::Error;
use crate::event::{Event, EventSink, Tone};
use crate::tool::{EspToolchain, ToolRunner};
use crate::version::HardwareVersion;

/// Baud rate used for flashing.
pub const FLASH_BAUD: u32 = 460800;

#[allow(clippy::unwrap_used)] // Static pattern
static WRITE_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Writing at 0x([0-9a-fA-F]+)").unwrap());

#[allow(clippy::unwrap_used)] // Static pattern
static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").unwrap());

/// How a line of `write_flash` output should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashLine {
    /// App-region write progress, in percent.
    Progress(u8),
    /// Write progress outside the app region; not worth a log line.
    Quiet,
    /// Anything else; forward as a log line.
    Log,
}

/// Classifies `esptool` output lines.
///
/// Only the app region drives the progress bar: it is the largest image and
/// written last, so smaller regions would make the bar jump back and forth.
#[derive(Debug, Clone, Copy)]
pub struct FlashProgressParser {
    app_offset: u32,
}

impl Default for FlashProgressParser {
    fn default() -> Self {
        Self {
            app_offset: ArtifactKind::App.offset(),
        }
    }
}

impl FlashProgressParser {
    /// Classify one output line.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn classify(&self, line: &str) -> FlashLine {
        let Some(addr) = WRITE_ADDR
            .captures(line)
            .and_then(|c| u32::from_str_radix(&c[1], 16).ok())
        else {
            return FlashLine::Log;
        };

        if addr < self.app_offset {
            return FlashLine::Quiet;
        }

        match PERCENT
            .captures(line)
            .and_then(|c| c[1].parse::<f32>().ok())
        {
            Some(pct) => FlashLine::Progress(pct.clamp(0.0, 100.0) as u8),
            None => FlashLine::Quiet,
        }
    }
}

/// Per-mode artifact cache directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareDirs {
    /// Production build cache.
    pub production: PathBuf,
    /// Testing build cache.
    pub testing: PathBuf,
}

impl Default for FirmwareDirs {
    fn default() -> Self {
        Self {
            production: PathBuf::from(Mode::Production.default_dir()),
            testing: PathBuf::from(Mode::Testing.default_dir()),
        }
    }
}

impl FirmwareDirs {
    /// Directory for `mode`.
    pub fn for_mode(&self, mode: Mode) -> &Path {
        match mode {
            Mode::Production => &self.production,
            Mode::Testing => &self.testing,
        }
    }
}

/// Downloads builds and flashes them.
pub struct FirmwareFlasher {
    catalog: Arc<dyn BuildCatalog>,
    runner: Arc<dyn ToolRunner>,
    tools: EspToolchain,
    dirs: FirmwareDirs,
    baud: u32,
    events: EventSink,
}

impl FirmwareFlasher {
    /// Create a flasher.
    pub fn new(
        catalog: Arc<dyn BuildCatalog>,
        runner: Arc<dyn ToolRunner>,
        tools: EspToolchain,
        dirs: FirmwareDirs,
        events: EventSink,
    ) -> Self {
        Self {
            catalog,
            runner,
            tools,
            dirs,
            baud: FLASH_BAUD,
            events,
        }
    }

    /// Override the flashing baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Fetch the newest build for `version` into the mode directory.
    pub fn download(&self, mode: Mode, version: HardwareVersion) -> bool {
        let builds = match self.catalog.list_builds(mode) {
            Ok(builds) => builds,
            Err(e) => {
                self.events
                    .line(format!("Could not fetch {mode} build catalog: {e}"));
                return false;
            },
        };

        let Some(build) = select_latest(&builds, version) else {
            self.events.line(format!(
                "No {mode} firmware supports hardware version {version} ({} builds checked)",
                builds.len()
            ));
            return false;
        };

        self.events.line(format!(
            "Selected {} (created {}) for hardware version {version}",
            build.label(),
            build.created_at
        ));

        let dir = self.dirs.for_mode(mode);
        if let Err(e) = fs::create_dir_all(dir) {
            self.events
                .line(format!("Could not create {}: {e}", dir.display()));
            return false;
        }

        for kind in ArtifactKind::ALL {
            let target = dir.join(kind.file_name());
            let result = tempfile::NamedTempFile::new_in(dir)
                .map_err(crate::Error::from)
                .and_then(|mut staged| {
                    let bytes =
                        self.catalog
                            .download_artifact(mode, &build.id, kind, staged.as_file_mut())?;
                    staged.flush()?;
                    staged
                        .persist(&target)
                        .map_err(|e| crate::Error::Io(e.error))?;
                    Ok(bytes)
                });

            match result {
                Ok(bytes) => {
                    debug!("Saved {} ({bytes} bytes)", target.display());
                    self.events
                        .line(format!("Downloaded {} ({bytes} bytes)", kind.file_name()));
                },
                Err(e) => {
                    self.events
                        .line(format!("Download of {} failed: {e}", kind.file_name()));
                    return false;
                },
            }
        }

        true
    }

    /// Clear the cache, download, and flash all four artifacts to `port`.
    ///
    /// Success is decided by the tool's exit code alone.
    pub fn flash(&self, port: &str, mode: Mode, version: HardwareVersion) -> bool {
        let dir = self.dirs.for_mode(mode);
        clear_artifacts(dir);

        if !self.download(mode, version) {
            return false;
        }

        let mut invocation = self
            .tools
            .esptool(port)
            .arg("-b")
            .arg(self.baud.to_string())
            .args([
                "--before=default_reset",
                "--after=hard_reset",
                "write_flash",
                "--flash_mode",
                "dio",
                "--flash_freq",
                "80m",
                "--flash_size",
                "16MB",
            ]);
        for kind in ArtifactKind::ALL {
            invocation = invocation
                .arg(format!("{:#x}", kind.offset()))
                .arg(dir.join(kind.file_name()).to_string_lossy());
        }

        self.events
            .line(format!("Flashing {mode} firmware to {port} at {} baud", self.baud));
        self.events.signal(Tone::Start);
        self.events.send(Event::ShowProgress);

        let parser = FlashProgressParser::default();
        let events = self.events.clone();
        let result = self.runner.stream_checked(&invocation, &mut |line| {
            match parser.classify(line) {
                FlashLine::Progress(pct) => events.progress(pct),
                FlashLine::Quiet => {},
                FlashLine::Log => events.line(line),
            }
        });

        self.events.send(Event::HideProgress);

        match result {
            Ok(_) => {
                self.events.line("Firmware flashed successfully");
                self.events.signal(Tone::Success);
                true
            },
            Err(e @ (Error::Tool { .. } | Error::Timeout(_))) => {
                self.events.line(format!("Flashing failed ({e})"));
                self.events.signal(Tone::Error);
                false
            },
            Err(e) => {
                self.events
                    .line(format!("Could not run esptool: {e}"));
                self.events.signal(Tone::Error);
                false
            },
        }
    }
}

/// Remove cached files from a mode directory, leaving subdirectories alone.
fn clear_artifacts(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Could not remove {}: {e}", path.display());
            }
        }
    }
}
