//! Scripted telemetry backend shared by the integration tests.
//!
//! `ScriptedLauncher` hands out processes whose stdout is fed by the test
//! through [`ScriptedLauncher::send`]. Every terminate/kill call is counted
//! so tests can assert on the shutdown sequence.

#![allow(dead_code)]

use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use powerscope_core::config::CollectorConfig;
use powerscope_core::probe::AvailabilityProbe;
use powerscope_core::process::{
    LaunchSpec, ProcessExit, TelemetryLauncher, TelemetryProcess, TelemetryStream,
};

/// Collector settings that keep tests fast.
pub fn fast_config() -> CollectorConfig {
    CollectorConfig {
        grace_period: Duration::from_millis(100),
        startup_check: Duration::from_millis(10),
        max_record_bytes: 4096,
        ..CollectorConfig::default()
    }
}

/// One NUL-terminated powermetrics record.
pub fn record(cpu: f64, gpu: f64, ane: f64, dram: f64) -> Vec<u8> {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>processor</key>
    <dict>
        <key>clusters</key>
        <array>
            <dict>
                <key>name</key>
                <string>P-Cluster</string>
                <key>cpu_power</key>
                <real>{cpu}</real>
            </dict>
        </array>
        <key>gpu</key>
        <dict>
            <key>gpu_power</key>
            <real>{gpu}</real>
        </dict>
        <key>ane</key>
        <dict>
            <key>power</key>
            <real>{ane}</real>
        </dict>
    </dict>
    <key>thermal</key>
    <dict>
        <key>channels</key>
        <array>
            <dict>
                <key>power</key>
                <real>{dram}</real>
            </dict>
        </array>
    </dict>
</dict>
</plist>
"#
    )
    .into_bytes()
    .into_iter()
    .chain(std::iter::once(0))
    .collect()
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Probe with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub bool);

impl AvailabilityProbe for FixedProbe {
    fn is_available(&self) -> bool {
        self.0
    }
}

/// How scripted processes behave.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Exit with this code and stderr before the startup check.
    pub exit_immediately: Option<(i32, String)>,
    /// Ignore SIGTERM, forcing escalation.
    pub ignore_terminate: bool,
}

/// Signal and launch counters.
#[derive(Debug, Default)]
pub struct ProcessLog {
    pub launches: AtomicUsize,
    pub terminates: AtomicUsize,
    pub kills: AtomicUsize,
}

impl ProcessLog {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

type FeedSlot = Arc<Mutex<Option<Sender<Vec<u8>>>>>;

fn close(feed: &FeedSlot) {
    feed.lock().unwrap_or_else(PoisonError::into_inner).take();
}

/// Launcher producing scripted processes.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    behavior: Behavior,
    log: Arc<ProcessLog>,
    feed: FeedSlot,
    last_spec: Mutex<Option<LaunchSpec>>,
}

impl ScriptedLauncher {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            ..Self::default()
        })
    }

    pub fn log(&self) -> &ProcessLog {
        &self.log
    }

    pub fn last_spec(&self) -> Option<LaunchSpec> {
        self.last_spec.lock().unwrap().clone()
    }

    /// Write bytes to the current process's stdout. Returns `false` when no
    /// process is running.
    pub fn send(&self, bytes: &[u8]) -> bool {
        self.feed
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.send(bytes.to_vec()).is_ok())
    }
}

impl TelemetryLauncher for ScriptedLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn TelemetryProcess>> {
        self.log.launches.fetch_add(1, Ordering::SeqCst);
        *self.last_spec.lock().unwrap() = Some(spec.clone());

        let (tx, rx) = mpsc::channel();
        let exited = self
            .behavior
            .exit_immediately
            .as_ref()
            .map(|(code, _)| ProcessExit::code(*code));
        if exited.is_none() {
            *self.feed.lock().unwrap() = Some(tx);
        }

        Ok(Box::new(ScriptedProcess {
            behavior: self.behavior.clone(),
            log: Arc::clone(&self.log),
            feed: Arc::clone(&self.feed),
            stdout: Some(ChannelReader::new(rx)),
            exited,
        }))
    }
}

struct ScriptedProcess {
    behavior: Behavior,
    log: Arc<ProcessLog>,
    feed: FeedSlot,
    stdout: Option<ChannelReader>,
    exited: Option<ProcessExit>,
}

impl TelemetryProcess for ScriptedProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn take_stdout(&mut self) -> Option<TelemetryStream> {
        self.stdout
            .take()
            .map(|reader| Box::new(reader) as TelemetryStream)
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self.exited)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.log.terminates.fetch_add(1, Ordering::SeqCst);
        if !self.behavior.ignore_terminate && self.exited.is_none() {
            self.exited = Some(ProcessExit::signaled(15));
            close(&self.feed);
        }
        Ok(())
    }

    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ProcessExit>> {
        if self.exited.is_none() {
            thread::sleep(timeout);
        }
        Ok(self.exited)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.log.kills.fetch_add(1, Ordering::SeqCst);
        if self.exited.is_none() {
            self.exited = Some(ProcessExit::signaled(9));
            close(&self.feed);
        }
        Ok(())
    }

    fn wait(&mut self) -> io::Result<ProcessExit> {
        Ok(*self.exited.get_or_insert(ProcessExit::code(0)))
    }

    fn diagnostics(&mut self) -> String {
        self.behavior
            .exit_immediately
            .as_ref()
            .map(|(_, stderr)| stderr.clone())
            .unwrap_or_default()
    }
}

/// Blocking reader over a channel of byte chunks. EOF once every sender is
/// gone and the buffered chunks are consumed.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            chunk: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                },
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
