//! Telemetry subprocess control.
//!
//! The collector never touches `std::process` directly. It asks a
//! [`TelemetryLauncher`] for a [`TelemetryProcess`] and drives it through
//! this narrow interface: take stdout once, poll for early exit, send the
//! graceful signal, wait with a bound, force-kill, reap. The real
//! implementation lives in [`spawner`]; tests substitute scripted processes.

pub mod spawner;

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use crate::config::CollectorConfig;

pub use spawner::{ChildProcess, SystemLauncher};

/// Samplers requested from powermetrics. CPU and GPU samplers report the
/// processor, GPU, and neural engine channels; `thermal` reports DRAM.
pub const SAMPLERS: &str = "cpu_power,gpu_power,thermal";

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments, not including the program.
    pub args: Vec<OsString>,
}

impl LaunchSpec {
    /// Create a spec for an arbitrary command.
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The powermetrics sampling command described by `config`.
    ///
    /// With the default configuration this is
    /// `sudo powermetrics -i 100 -f plist --samplers cpu_power,gpu_power,thermal`.
    #[must_use]
    pub fn powermetrics(config: &CollectorConfig) -> Self {
        let tool_args: [OsString; 6] = [
            "-i".into(),
            config.sample_interval_ms.to_string().into(),
            "-f".into(),
            "plist".into(),
            "--samplers".into(),
            SAMPLERS.into(),
        ];
        Self::wrapped(config, tool_args)
    }

    /// The non-interactive availability check described by `config`:
    /// `sudo -n powermetrics --help`.
    #[must_use]
    pub fn availability_check(config: &CollectorConfig) -> Self {
        match config.wrapper() {
            Some(wrapper) => Self::new(
                wrapper,
                [
                    OsString::from("-n"),
                    config.binary.clone().into_os_string(),
                    OsString::from("--help"),
                ],
            ),
            None => Self::new(config.binary.clone(), ["--help"]),
        }
    }

    fn wrapped<I>(config: &CollectorConfig, tool_args: I) -> Self
    where
        I: IntoIterator<Item = OsString>,
    {
        match config.wrapper() {
            Some(wrapper) => {
                let mut args = vec![config.binary.clone().into_os_string()];
                args.extend(tool_args);
                Self::new(wrapper, args)
            },
            None => Self::new(config.binary.clone(), tool_args),
        }
    }
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How a subprocess ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when the process was killed by one.
    pub signal: Option<i32>,
}

impl ProcessExit {
    /// Exit with the given code.
    #[must_use]
    pub const fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Termination by the given signal.
    #[must_use]
    pub const fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Byte stream carrying telemetry records.
pub type TelemetryStream = Box<dyn Read + Send>;

/// A running telemetry subprocess.
pub trait TelemetryProcess: Send {
    /// OS process ID, when there is one.
    fn id(&self) -> Option<u32>;

    /// Hand over the stdout stream. Returns `None` on every call after the
    /// first.
    fn take_stdout(&mut self) -> Option<TelemetryStream>;

    /// Non-blocking exit check.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the status cannot be queried.
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>>;

    /// Ask the process to exit (SIGTERM).
    ///
    /// # Errors
    ///
    /// Returns the OS error if the signal cannot be delivered.
    fn terminate(&mut self) -> io::Result<()>;

    /// Wait up to `timeout` for the process to exit. `Ok(None)` means it is
    /// still running.
    ///
    /// # Errors
    ///
    /// Returns the OS error if waiting fails.
    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ProcessExit>>;

    /// Force the process to exit (SIGKILL).
    ///
    /// # Errors
    ///
    /// Returns the OS error if the signal cannot be delivered.
    fn kill(&mut self) -> io::Result<()>;

    /// Block until the process exits.
    ///
    /// # Errors
    ///
    /// Returns the OS error if waiting fails.
    fn wait(&mut self) -> io::Result<ProcessExit>;

    /// Captured diagnostic output (stderr tail). Meaningful once the process
    /// has exited.
    fn diagnostics(&mut self) -> String;
}

/// Creates telemetry subprocesses.
pub trait TelemetryLauncher: Send + Sync {
    /// Spawn the command described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the process cannot be spawned.
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn TelemetryProcess>>;
}
