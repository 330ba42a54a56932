//! Process spawning utilities.
//!
//! Spawns the telemetry command with stdout piped for the consumer thread
//! and stderr drained by a helper thread into a bounded buffer, so a chatty
//! tool can never block on a full stderr pipe and an early failure can still
//! be reported with its diagnostic text.
//!
//! On unix the child is placed in its own process group and signals are sent
//! to the whole group. With `sudo powermetrics`, the direct child is `sudo`;
//! signalling the group reaches the tool itself even if `sudo` does not relay
//! the signal.

use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use super::{LaunchSpec, ProcessExit, TelemetryLauncher, TelemetryProcess, TelemetryStream};

/// Maximum number of stderr bytes kept for diagnostics.
const MAX_DIAGNOSTIC_BYTES: usize = 8 * 1024;

/// Maximum time `diagnostics()` waits for the stderr drain to reach EOF.
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Launcher that spawns real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl TelemetryLauncher for SystemLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn TelemetryProcess>> {
        Ok(Box::new(ChildProcess::spawn(spec)?))
    }
}

/// A spawned telemetry process.
pub struct ChildProcess {
    child: Child,
    pid: u32,
    stdout: Option<ChildStdout>,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
    stderr_drain: Option<JoinHandle<()>>,
    exit: Option<ProcessExit>,
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.pid)
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}

impl ChildProcess {
    /// Spawn the command described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the process or its stderr drain thread cannot
    /// be started. In the latter case the process is killed and reaped first.
    pub fn spawn(spec: &LaunchSpec) -> io::Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr_tail = Arc::new(Mutex::new(Vec::new()));

        let stderr_drain = match child.stderr.take() {
            Some(stderr) => match spawn_stderr_drain(stderr, Arc::clone(&stderr_tail)) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e);
                },
            },
            None => None,
        };

        debug!(pid, command = %spec, "spawned telemetry process");

        Ok(Self {
            child,
            pid,
            stdout,
            stderr_tail,
            stderr_drain,
            exit: None,
        })
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> io::Result<()> {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let pid = i32::try_from(self.pid)
            .map_err(|_| io::Error::other(format!("pid {} out of range", self.pid)))?;
        killpg(Pid::from_raw(pid), signal).map_err(io::Error::from)
    }

    fn record(&mut self, exit: ProcessExit) -> ProcessExit {
        self.exit = Some(exit);
        exit
    }
}

impl TelemetryProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn take_stdout(&mut self) -> Option<TelemetryStream> {
        self.stdout
            .take()
            .map(|stdout| Box::new(stdout) as TelemetryStream)
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        Ok(self.child.try_wait()?.map(|status| self.record(status.into())))
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGTERM)
        }

        #[cfg(not(unix))]
        {
            self.child.kill()
        }
    }

    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ProcessExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        Ok(self
            .child
            .wait_timeout(timeout)?
            .map(|status| self.record(status.into())))
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            if let Err(e) = self.signal_group(nix::sys::signal::Signal::SIGKILL) {
                warn!(pid = self.pid, error = %e, "process group kill failed, killing child directly");
                return self.child.kill();
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            self.child.kill()
        }
    }

    fn wait(&mut self) -> io::Result<ProcessExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait()?;
        Ok(self.record(status.into()))
    }

    fn diagnostics(&mut self) -> String {
        if let Some(handle) = self.stderr_drain.take() {
            let deadline = Instant::now() + DRAIN_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                self.stderr_drain = Some(handle);
            }
        }

        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&tail).trim().to_string()
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if matches!(self.try_wait(), Ok(None)) {
            warn!(pid = self.pid, "telemetry process dropped while running, killing");
            let _ = self.kill();
            let _ = self.wait();
        }
    }
}

/// Keep the first [`MAX_DIAGNOSTIC_BYTES`] of stderr and discard the rest
/// until EOF.
fn spawn_stderr_drain<R>(mut stderr: R, tail: Arc<Mutex<Vec<u8>>>) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name("powerscope-stderr".to_string())
        .spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match stderr.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                        let room = MAX_DIAGNOSTIC_BYTES.saturating_sub(tail.len());
                        tail.extend_from_slice(&chunk[..n.min(room)]);
                    },
                }
            }
        })
}
