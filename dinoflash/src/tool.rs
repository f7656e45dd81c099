//! External tool invocation (`esptool`, `espefuse`).
//!
//! The tools are a fixed external ABI: exit code 0 means success, and the
//! merged stdout/stderr text is scanned line by line by the caller. Timeouts
//! apply only where an [`Invocation`] asks for one; a flash write is never
//! given a timeout and never killed.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{Error, Result};

const READ_CHUNK: usize = 1024;
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Default chip argument passed to the Espressif tools.
pub const DEFAULT_CHIP: &str = "esp32s3";

/// A single subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Short name used in logs and errors.
    pub tool: String,
    /// Executable to run.
    pub program: String,
    /// Argument vector.
    pub args: Vec<String>,
    /// Kill the process after this long.
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Create an invocation without arguments.
    pub fn new(tool: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set a kill timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` if killed by a signal or timeout.
    pub code: Option<i32>,
    /// Merged stdout/stderr lines in arrival order.
    pub lines: Vec<String>,
    /// The process was killed after its timeout.
    pub timed_out: bool,
}

impl ToolOutput {
    /// Exit code 0 and no timeout.
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// All output joined with newlines.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Short status for log messages.
    pub fn status(&self) -> String {
        match (self.timed_out, self.code) {
            (true, _) => "timeout".to_string(),
            (false, Some(code)) => format!("exit code {code}"),
            (false, None) => "termination by signal".to_string(),
        }
    }

    /// Turn a timeout or an unsuccessful exit of `invocation` into an error.
    pub fn check(self, invocation: &Invocation) -> Result<Self> {
        if self.timed_out {
            let limit = invocation
                .timeout
                .map(|t| format!(" after {}s", t.as_secs()))
                .unwrap_or_default();
            return Err(Error::Timeout(format!("{}{limit}", invocation.tool)));
        }
        if self.code != Some(0) {
            return Err(Error::Tool {
                tool: invocation.tool.clone(),
                status: self.status(),
            });
        }
        Ok(self)
    }
}

/// Runs external tools.
pub trait ToolRunner: Send + Sync {
    /// Run to completion, calling `on_line` for each output line as it arrives.
    ///
    /// Errors are reserved for failing to start the process at all.
    fn stream(&self, invocation: &Invocation, on_line: &mut dyn FnMut(&str)) -> Result<ToolOutput>;

    /// Run to completion, collecting output.
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
        self.stream(invocation, &mut |_| {})
    }

    /// [`stream`](Self::stream), with failure exits as [`Error::Tool`] and
    /// timeouts as [`Error::Timeout`].
    fn stream_checked(
        &self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<ToolOutput> {
        self.stream(invocation, on_line)?.check(invocation)
    }

    /// [`run`](Self::run), checked like [`stream_checked`](Self::stream_checked).
    fn run_checked(&self, invocation: &Invocation) -> Result<ToolOutput> {
        self.run(invocation)?.check(invocation)
    }
}

/// [`ToolRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    fn stream(&self, invocation: &Invocation, on_line: &mut dyn FnMut(&str)) -> Result<ToolOutput> {
        debug!("Running {}", invocation.command_line());

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            // Terminal Ctrl-C reaches the station only; a running burn or flash completes.
            command.process_group(0);
        }
        let mut child = command.spawn()?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx.clone()));
        }
        drop(tx);

        let deadline = invocation.timeout.map(|t| Instant::now() + t);
        let mut output = ToolOutput::default();

        loop {
            match rx.recv_timeout(WAIT_SLICE) {
                Ok(line) => {
                    on_line(&line);
                    output.lines.push(line);
                },
                Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(
                    "{} did not finish within {:?}, killing it",
                    invocation.tool,
                    invocation.timeout.unwrap_or_default()
                );
                let _ = child.kill();
                output.timed_out = true;
                break;
            }
        }

        let status = child.wait()?;
        for reader in readers {
            let _ = reader.join();
        }
        for line in rx.try_iter() {
            on_line(&line);
            output.lines.push(line);
        }

        output.code = if output.timed_out { None } else { status.code() };
        debug!("{} finished: {}", invocation.tool, output.status());
        Ok(output)
    }
}

/// Forward a pipe as lines, splitting on `\n` and on bare `\r` progress updates.
fn spawn_line_reader<R: Read + Send + 'static>(
    mut pipe: R,
    tx: Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut pending = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = match pipe.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };

            for &byte in &chunk[..n] {
                if byte == b'\n' || byte == b'\r' {
                    if !pending.is_empty() {
                        let line = String::from_utf8_lossy(&pending).into_owned();
                        pending.clear();
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                } else {
                    pending.push(byte);
                }
            }
        }

        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
        }
    })
}

/// Builds `esptool`/`espefuse` invocations for one chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EspToolchain {
    /// Python interpreter used to run the tool modules.
    pub python: String,
    /// `--chip` argument.
    pub chip: String,
}

impl Default for EspToolchain {
    fn default() -> Self {
        Self {
            python: "python".to_string(),
            chip: DEFAULT_CHIP.to_string(),
        }
    }
}

impl EspToolchain {
    /// Toolchain using the given Python interpreter.
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            ..Self::default()
        }
    }

    /// `python -m esptool --chip <chip> -p <port> ...`
    pub fn esptool(&self, port: &str) -> Invocation {
        Invocation::new("esptool", &self.python)
            .args(["-m", "esptool", "--chip", self.chip.as_str(), "-p", port])
    }

    /// `python -m espefuse --chip <chip> -p <port> ...`
    pub fn espefuse(&self, port: &str) -> Invocation {
        Invocation::new("espefuse", &self.python)
            .args(["-m", "espefuse", "--chip", self.chip.as_str(), "-p", port])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted runner: pops one canned response per call and records argv.
    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        pub(crate) responses: Mutex<VecDeque<ToolOutput>>,
        pub(crate) calls: Mutex<Vec<Invocation>>,
    }

    impl ScriptedRunner {
        pub(crate) fn push(&self, code: i32, text: &str) {
            self.responses.lock().unwrap().push_back(ToolOutput {
                code: Some(code),
                lines: text.lines().map(str::to_string).collect(),
                timed_out: false,
            });
        }

        pub(crate) fn push_timeout(&self) {
            self.responses.lock().unwrap().push_back(ToolOutput {
                timed_out: true,
                ..ToolOutput::default()
            });
        }

        pub(crate) fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn called_with(&self, needle: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.args.iter().any(|a| a == needle))
                .count()
        }
    }

    impl ToolRunner for ScriptedRunner {
        fn stream(
            &self,
            invocation: &Invocation,
            on_line: &mut dyn FnMut(&str),
        ) -> Result<ToolOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            let output = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ToolOutput {
                    code: Some(0),
                    ..ToolOutput::default()
                });
            for line in &output.lines {
                on_line(line);
            }
            Ok(output)
        }
    }

    #[test]
    fn test_invocation_builder() {
        let inv = EspToolchain::new("python3")
            .espefuse("/dev/ttyACM0")
            .arg("summary")
            .with_timeout(Duration::from_secs(15));
        assert_eq!(inv.tool, "espefuse");
        assert_eq!(
            inv.command_line(),
            "python3 -m espefuse --chip esp32s3 -p /dev/ttyACM0 summary"
        );
        assert_eq!(inv.timeout, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_tool_output_status() {
        let ok = ToolOutput {
            code: Some(0),
            ..ToolOutput::default()
        };
        assert!(ok.success());

        let failed = ToolOutput {
            code: Some(2),
            ..ToolOutput::default()
        };
        assert!(!failed.success());
        assert_eq!(failed.status(), "exit code 2");

        let timed_out = ToolOutput {
            timed_out: true,
            ..ToolOutput::default()
        };
        assert!(!timed_out.success());
        assert_eq!(timed_out.status(), "timeout");
    }

    #[test]
    fn test_check_maps_failures_to_errors() {
        let inv = EspToolchain::default()
            .espefuse("/dev/ttyACM0")
            .arg("summary")
            .with_timeout(Duration::from_secs(15));

        let ok = ToolOutput {
            code: Some(0),
            lines: vec!["done".into()],
            ..ToolOutput::default()
        };
        assert_eq!(ok.clone().check(&inv).unwrap(), ok);

        let failed = ToolOutput {
            code: Some(2),
            ..ToolOutput::default()
        };
        let err = failed.check(&inv).unwrap_err();
        assert!(matches!(err, Error::Tool { ref tool, ref status } if tool == "espefuse" && status == "exit code 2"));
        assert_eq!(err.to_string(), "espefuse exited with exit code 2");

        let killed = ToolOutput {
            timed_out: true,
            ..ToolOutput::default()
        };
        let err = killed.check(&inv).unwrap_err();
        assert!(matches!(err, Error::Timeout(ref what) if what == "espefuse after 15s"));
    }

    #[test]
    fn test_scripted_runner_checked_timeout() {
        let runner = ScriptedRunner::default();
        runner.push_timeout();
        let inv = Invocation::new("esptool", "python");
        assert!(matches!(runner.run_checked(&inv), Err(Error::Timeout(ref what)) if what == "esptool"));
    }

    #[test]
    fn test_line_reader_splits_on_cr_and_lf() {
        let (tx, rx) = mpsc::channel();
        let data: &[u8] = b"first\r\nWriting at 0x0 (10 %)\rWriting at 0x1 (20 %)\nlast";
        spawn_line_reader(data, tx).join().unwrap();
        let lines: Vec<String> = rx.try_iter().collect();
        assert_eq!(
            lines,
            vec!["first", "Writing at 0x0 (10 %)", "Writing at 0x1 (20 %)", "last"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_reports_exit_code_and_output() {
        let inv = Invocation::new("sh", "sh").args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let mut seen = Vec::new();
        let output = SystemToolRunner
            .stream(&inv, &mut |line| seen.push(line.to_string()))
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert!(!output.success());
        assert!(seen.contains(&"out".to_string()));
        assert!(seen.contains(&"err".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_kills_on_timeout() {
        let inv = Invocation::new("sleep", "sleep")
            .arg("5")
            .with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let output = SystemToolRunner.run(&inv).unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_system_runner_missing_program_is_error() {
        let inv = Invocation::new("missing", "definitely-not-a-real-tool-7f3a");
        assert!(SystemToolRunner.run(&inv).is_err());
    }
}
