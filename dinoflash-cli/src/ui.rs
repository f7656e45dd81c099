//! Terminal rendering of the library event channel.

use anyhow::{Result, anyhow};
use console::style;
use dinoflash::event::ProgressGauge;
use dinoflash::{Event, ScanResult, ScanStatus, Tone};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, trace, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::{use_fancy_output, was_interrupted};

/// Interval at which the console drains the event channel.
pub(crate) const TICK: Duration = Duration::from_millis(100);

/// Renders events on stderr, and appends them to a session log when one is open.
pub(crate) struct EventConsole {
    quiet: bool,
    bar: Option<ProgressBar>,
    gauge: ProgressGauge,
    interrupt_noted: bool,
    log: Option<BufWriter<File>>,
}

impl EventConsole {
    pub(crate) fn new(quiet: bool) -> Self {
        Self {
            quiet,
            bar: None,
            gauge: ProgressGauge::default(),
            interrupt_noted: false,
            log: None,
        }
    }

    /// Truncate `path` and record every rendered line in it, even when quiet.
    pub(crate) fn with_session_log(mut self, path: &Path) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| anyhow!("Cannot create session log {}: {e}", path.display()))?;
        debug!("Session log: {}", path.display());
        self.log = Some(BufWriter::new(file));
        Ok(self)
    }

    /// Render everything currently queued.
    pub(crate) fn drain(&mut self, rx: &Receiver<Event>) {
        for event in rx.try_iter() {
            self.handle(event);
        }
    }

    /// Keep rendering until `worker` finishes, then return its result.
    ///
    /// Ctrl-C does not abort the worker; the current step always completes.
    pub(crate) fn wait_for<T>(&mut self, rx: &Receiver<Event>, worker: JoinHandle<T>) -> Result<T> {
        while !worker.is_finished() {
            self.drain(rx);
            if was_interrupted() && !self.interrupt_noted {
                self.interrupt_noted = true;
                self.println(&format!(
                    "{} Stopping after the current step completes",
                    style("⏸").yellow()
                ));
            }
            thread::sleep(TICK);
        }
        self.drain(rx);
        worker
            .join()
            .map_err(|_| anyhow!("Worker thread panicked"))
    }

    pub(crate) fn handle(&mut self, event: Event) {
        match event {
            Event::Line(text) => {
                self.record(&text);
                if !self.quiet {
                    self.println(&format!("  {text}"));
                }
            },
            Event::ShowProgress => self.show_progress(),
            Event::Progress(percent) => {
                if let (Some(shown), Some(bar)) = (self.gauge.update(percent), &self.bar) {
                    bar.set_position(u64::from(shown));
                }
            },
            Event::HideProgress => {
                if let Some(bar) = self.bar.take() {
                    bar.finish_and_clear();
                }
            },
            Event::State(state) => {
                self.record(&format!("[{state}]"));
                if !self.quiet {
                    self.println(&format!("{} {}", style("▶").cyan(), style(state).bold()));
                }
            },
            Event::Detection(result) => {
                self.record(&result.describe());
                self.println(&detection_line(&result));
            },
            Event::Signal(tone) => {
                trace!("Signal {tone:?} {:?}", tone.pitch());
                if tone == Tone::Error && use_fancy_output() {
                    eprint!("\x07");
                }
            },
        }
    }

    fn show_progress(&mut self) {
        self.gauge.reset();
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }

        let bar = if self.quiet || !use_fancy_output() {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::with_draw_target(Some(100), ProgressDrawTarget::stderr());
            #[allow(clippy::unwrap_used)] // Static template string
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            bar
        };
        self.bar = Some(bar);
    }

    /// Append one line to the session log.
    ///
    /// A write failure closes the log; the station keeps running.
    pub(crate) fn record(&mut self, text: &str) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(log, "{text}").and_then(|()| log.flush()) {
            warn!("Session log write failed, logging disabled: {e}");
            self.log = None;
        }
    }

    fn println(&self, text: &str) {
        match &self.bar {
            Some(bar) if !bar.is_hidden() => bar.println(text),
            _ => eprintln!("{text}"),
        }
    }
}

impl Drop for EventConsole {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

/// One styled line describing a scan result.
pub(crate) fn detection_line(result: &ScanResult) -> String {
    let text = result.describe();
    match result.status {
        ScanStatus::Found => format!("{} {}", style("✓").green(), style(text).green()),
        ScanStatus::Ambiguous => format!("{} {}", style("⚠").yellow(), style(text).yellow()),
        ScanStatus::NotFound => format!("{} {}", style("…").dim(), style(text).dim()),
    }
}
