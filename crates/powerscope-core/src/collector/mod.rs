//! Collector lifecycle.
//!
//! [`PowerCollector`] is a two-state machine:
//!
//! ```text
//!            start()                       stop()
//! Stopped ───────────────▶ Running ───────────────▶ Stopped
//!    │  probe, spawn,         │  SIGTERM once, wait grace,
//!    │  startup check,        │  SIGKILL + unconditional wait,
//!    │  reset store,          │  bounded consumer join
//!    │  start consumer        │
//! ```
//!
//! A failed `start()` leaves the collector Stopped with no subprocess and no
//! consumer thread behind. `stop()` always reaps the subprocess: escalation
//! to SIGKILL is not optional.

mod session;

use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CollectorConfig, ReportConfig};
use crate::decode::{DecodeCounters, DecodeStats, Frame, RecordFramer, StreamDecoder};
use crate::phase::{Phase, PhaseError, PhaseTracker};
use crate::probe::{AvailabilityProbe, PrivilegedProbe, REMEDIATION};
use crate::process::{
    LaunchSpec, SystemLauncher, TelemetryLauncher, TelemetryProcess, TelemetryStream,
};
use crate::report::{ReportError, RunReport};
use crate::sample::{IdleBaseline, PeakPower, PowerSample};
use crate::store::SampleStore;
use crate::summary::RunSummary;

pub use session::CollectorSession;

/// Name of the thread that reads the telemetry stream.
pub const CONSUMER_THREAD_NAME: &str = "powerscope-consumer";

/// How long `stop()` waits for the consumer to drain the stream after the
/// subprocess has been reaped.
const CONSUMER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Collector errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CollectorError {
    /// The telemetry source cannot be started non-interactively.
    #[error("power telemetry is unavailable: {remediation}")]
    Unavailable {
        /// What the operator should do about it.
        remediation: String,
    },

    /// `start()` while Running.
    #[error("collector is already running")]
    AlreadyRunning,

    /// `stop()` or a baseline measurement while Stopped.
    #[error("collector is not running")]
    NotRunning,

    /// The subprocess exited before the startup check.
    #[error("telemetry process exited immediately ({}): {diagnostics}", describe_exit(.code))]
    ImmediateExit {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Captured stderr.
        diagnostics: String,
    },

    /// Unknown phase name.
    #[error(transparent)]
    InvalidPhase(#[from] PhaseError),

    /// The subprocess could not be spawned.
    #[error("failed to launch '{command}': {source}")]
    Launch {
        /// Command line that failed.
        command: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The subprocess has no stdout to read.
    #[error("telemetry process stdout is not available")]
    StdoutUnavailable,

    /// The consumer thread could not be started.
    #[error("failed to start consumer thread: {0}")]
    ConsumerThread(#[source] std::io::Error),

    /// A run report could not be written.
    #[error(transparent)]
    Report(#[from] ReportError),
}

#[allow(clippy::ref_option)]
fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_string(), |code| format!("exit code {code}"))
}

/// How the subprocess ended during `stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Did not exit in time and was killed.
    Forced,
}

impl ShutdownOutcome {
    /// Whether SIGKILL was needed.
    #[must_use]
    pub const fn is_forced(self) -> bool {
        matches!(self, Self::Forced)
    }
}

struct ActiveRun {
    process: Box<dyn TelemetryProcess>,
    consumer: JoinHandle<()>,
    halt: Arc<AtomicBool>,
    started_at: Instant,
}

#[derive(Default)]
struct Lifecycle {
    run: Option<ActiveRun>,
    last_started: Option<DateTime<Utc>>,
    /// Bumped by every successful `start()`.
    generation: u64,
}

/// Collects power samples from a telemetry subprocess.
///
/// All methods take `&self`; the collector can be shared between the thread
/// driving the workload and threads that only query it.
pub struct PowerCollector {
    config: CollectorConfig,
    launcher: Arc<dyn TelemetryLauncher>,
    probe: Arc<dyn AvailabilityProbe>,
    store: Arc<SampleStore>,
    phase: Arc<PhaseTracker>,
    counters: Arc<DecodeCounters>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for PowerCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerCollector")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("phase", &self.phase())
            .field("samples", &self.sample_count())
            .finish_non_exhaustive()
    }
}

impl PowerCollector {
    /// Collector that probes and launches the real `powermetrics`.
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        let probe = Arc::new(PrivilegedProbe::from_config(&config));
        Self::with_backend(config, Arc::new(SystemLauncher), probe)
    }

    /// Collector with a custom launcher and probe.
    #[must_use]
    pub fn with_backend(
        config: CollectorConfig,
        launcher: Arc<dyn TelemetryLauncher>,
        probe: Arc<dyn AvailabilityProbe>,
    ) -> Self {
        Self {
            config,
            launcher,
            probe,
            store: Arc::new(SampleStore::new()),
            phase: Arc::new(PhaseTracker::new()),
            counters: Arc::new(DecodeCounters::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// The configuration this collector was built with.
    #[must_use]
    pub const fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start collecting.
    ///
    /// Clears the previous run's samples, peaks, and decode counters. The
    /// current phase is kept.
    ///
    /// # Errors
    ///
    /// - [`CollectorError::AlreadyRunning`] when already Running.
    /// - [`CollectorError::Unavailable`] when the probe fails.
    /// - [`CollectorError::Launch`] when the subprocess cannot be spawned.
    /// - [`CollectorError::ImmediateExit`] when it exits during the startup
    ///   check.
    /// - [`CollectorError::StdoutUnavailable`] or
    ///   [`CollectorError::ConsumerThread`] when the stream cannot be wired
    ///   up.
    ///
    /// On error the collector stays Stopped.
    pub fn start(&self) -> Result<(), CollectorError> {
        let mut lifecycle = self.lock();
        if lifecycle.run.is_some() {
            return Err(CollectorError::AlreadyRunning);
        }

        if !self.probe.is_available() {
            warn!("power telemetry unavailable");
            return Err(CollectorError::Unavailable {
                remediation: REMEDIATION.to_string(),
            });
        }

        let spec = LaunchSpec::powermetrics(&self.config);
        debug!(command = %spec, "launching telemetry process");
        let mut process = self
            .launcher
            .launch(&spec)
            .map_err(|source| CollectorError::Launch {
                command: spec.to_string(),
                source,
            })?;

        if !self.config.startup_check.is_zero() {
            thread::sleep(self.config.startup_check);
        }
        match process.try_wait() {
            Ok(None) => {},
            Ok(Some(exit)) => {
                let diagnostics = process.diagnostics();
                warn!(%exit, %diagnostics, "telemetry process exited immediately");
                return Err(CollectorError::ImmediateExit {
                    code: exit.code,
                    diagnostics,
                });
            },
            Err(source) => {
                discard(process);
                return Err(CollectorError::Launch {
                    command: spec.to_string(),
                    source,
                });
            },
        }

        let Some(stream) = process.take_stdout() else {
            discard(process);
            return Err(CollectorError::StdoutUnavailable);
        };

        let started_at = Instant::now();
        let started_wall = Utc::now();
        self.store.reset();
        self.counters.reset();

        let halt = Arc::new(AtomicBool::new(false));
        let consumer = Consumer {
            decoder: StreamDecoder::new(Arc::clone(&self.phase), started_at),
            store: Arc::clone(&self.store),
            counters: Arc::clone(&self.counters),
            halt: Arc::clone(&halt),
            max_record_bytes: self.config.max_record_bytes,
        };
        let consumer = match thread::Builder::new()
            .name(CONSUMER_THREAD_NAME.to_string())
            .spawn(move || consumer.run(stream))
        {
            Ok(handle) => handle,
            Err(e) => {
                discard(process);
                return Err(CollectorError::ConsumerThread(e));
            },
        };

        info!(
            pid = process.id(),
            interval_ms = self.config.sample_interval_ms,
            "power collector started"
        );
        lifecycle.run = Some(ActiveRun {
            process,
            consumer,
            halt,
            started_at,
        });
        lifecycle.last_started = Some(started_wall);
        lifecycle.generation += 1;
        Ok(())
    }

    /// Stop collecting.
    ///
    /// Sends SIGTERM exactly once and waits up to the grace period. If the
    /// subprocess is still alive it is killed and waited for without a
    /// bound. The consumer thread is then given a bounded time to drain the
    /// remaining output.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::NotRunning`] when already Stopped.
    pub fn stop(&self) -> Result<ShutdownOutcome, CollectorError> {
        // Held across shutdown: start() must not reset the store while the
        // old consumer is still draining.
        let mut lifecycle = self.lock();
        let run = lifecycle.run.take().ok_or(CollectorError::NotRunning)?;
        Ok(self.shut_down(run))
    }

    fn shut_down(&self, mut run: ActiveRun) -> ShutdownOutcome {
        let outcome = terminate(run.process.as_mut(), self.config.grace_period);
        join_consumer(run.consumer, &run.halt, CONSUMER_JOIN_TIMEOUT);
        drop(run.process);

        info!(
            ?outcome,
            samples = self.store.len(),
            elapsed_ms = run.started_at.elapsed().as_millis(),
            "power collector stopped"
        );
        outcome
    }

    /// Start a scoped run that stops when the guard is dropped.
    ///
    /// # Errors
    ///
    /// Any error from [`PowerCollector::start`].
    pub fn session(&self) -> Result<CollectorSession<'_>, CollectorError> {
        self.start()?;
        Ok(CollectorSession::new(self))
    }

    /// Whether a run is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock().run.is_some()
    }

    /// Copy of every sample of the current (or last) run.
    #[must_use]
    pub fn samples(&self) -> Vec<PowerSample> {
        self.store.samples()
    }

    /// Most recent sample.
    #[must_use]
    pub fn current(&self) -> Option<PowerSample> {
        self.store.current()
    }

    /// Per-channel maxima of the current (or last) run.
    #[must_use]
    pub fn peak_power(&self) -> PeakPower {
        self.store.peaks()
    }

    /// Number of samples recorded.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.store.len()
    }

    /// Record counters of the current (or last) run.
    #[must_use]
    pub fn decode_stats(&self) -> DecodeStats {
        self.counters.snapshot()
    }

    /// Phase new samples are tagged with.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// Tag subsequent samples with `phase`.
    pub fn set_phase(&self, phase: Phase) {
        debug!(%phase, "phase boundary");
        self.phase.set(phase);
    }

    /// Tag subsequent samples with the phase called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::InvalidPhase`] for an unknown name. The
    /// current phase is unchanged.
    pub fn set_phase_named(&self, name: &str) -> Result<Phase, CollectorError> {
        let phase = self.phase.set_named(name)?;
        debug!(%phase, "phase boundary");
        Ok(phase)
    }

    /// Average the samples that arrive during the next `duration`.
    ///
    /// Blocks the calling thread; the consumer keeps recording. Only samples
    /// appended during the window count. An empty window yields an all-zero
    /// baseline.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::NotRunning`] when Stopped, or when another
    /// run was started while the window was open.
    pub fn measure_idle_baseline(&self, duration: Duration) -> Result<IdleBaseline, CollectorError> {
        let (generation, start) = {
            let lifecycle = self.lock();
            if lifecycle.run.is_none() {
                return Err(CollectorError::NotRunning);
            }
            (lifecycle.generation, self.store.len())
        };
        debug!(duration_ms = duration.as_millis(), start, "measuring idle baseline");
        thread::sleep(duration);

        // Locked so no start() can reset the store between the check and the read.
        let lifecycle = self.lock();
        if lifecycle.generation != generation {
            warn!("collector restarted during idle baseline window");
            return Err(CollectorError::NotRunning);
        }
        let window = self.store.samples_since(start);
        drop(lifecycle);

        let baseline = IdleBaseline::from_samples(&window);
        info!(
            baseline_mw = baseline.baseline_power_mw,
            samples = baseline.baseline_sample_count,
            "idle baseline measured"
        );
        Ok(baseline)
    }

    /// Energy and per-phase aggregates over the recorded samples.
    #[must_use]
    pub fn summary(&self) -> RunSummary {
        RunSummary::from_samples(&self.store.samples())
    }

    /// Report over the current (or last) run.
    #[must_use]
    pub fn report(&self, idle_baseline: Option<IdleBaseline>) -> RunReport {
        let started_at = self.lock().last_started;
        RunReport::new(
            started_at,
            self.config.sample_interval_ms,
            self.store.snapshot(),
            idle_baseline,
            self.counters.snapshot(),
        )
    }

    /// Build a report and write it into `config.output_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Report`] if the report cannot be written.
    pub fn save_report(
        &self,
        idle_baseline: Option<IdleBaseline>,
        config: &ReportConfig,
    ) -> Result<(RunReport, PathBuf), CollectorError> {
        let report = self.report(idle_baseline);
        let path = report.save_in(&config.output_dir, config.pretty)?;
        Ok((report, path))
    }
}

impl Drop for PowerCollector {
    fn drop(&mut self) {
        let run = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .run
            .take();
        if let Some(run) = run {
            warn!("power collector dropped while running, stopping");
            self.shut_down(run);
        }
    }
}

/// Graceful-then-forced termination. SIGTERM is sent once; SIGKILL only if
/// the grace period runs out.
fn terminate(process: &mut dyn TelemetryProcess, grace: Duration) -> ShutdownOutcome {
    if let Err(e) = process.terminate() {
        warn!(error = %e, "failed to signal telemetry process");
    }

    match process.wait_timeout(grace) {
        Ok(Some(exit)) => {
            debug!(%exit, "telemetry process exited");
            return ShutdownOutcome::Graceful;
        },
        Ok(None) => {
            warn!(
                grace_ms = grace.as_millis(),
                "telemetry process ignored SIGTERM, killing"
            );
        },
        Err(e) => {
            warn!(error = %e, "waiting for telemetry process failed, killing");
        },
    }

    if let Err(e) = process.kill() {
        warn!(error = %e, "failed to kill telemetry process");
    }
    match process.wait() {
        Ok(exit) => debug!(%exit, "telemetry process killed"),
        Err(e) => warn!(error = %e, "failed to reap telemetry process"),
    }
    ShutdownOutcome::Forced
}

/// Kill and reap a process that never became a run.
fn discard(mut process: Box<dyn TelemetryProcess>) {
    if let Err(e) = process.kill() {
        debug!(error = %e, "failed to kill discarded telemetry process");
    }
    match process.wait() {
        Ok(exit) => debug!(%exit, "discarded telemetry process reaped"),
        Err(e) => warn!(error = %e, "failed to reap discarded telemetry process"),
    }
}

/// Wait for the consumer to finish. A descendant that inherited stdout can
/// keep the stream open after the subprocess is gone; in that case the
/// consumer is told to halt and left behind.
fn join_consumer(handle: JoinHandle<()>, halt: &AtomicBool, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(JOIN_POLL_INTERVAL);
    }
    halt.store(true, Ordering::Release);

    if handle.is_finished() {
        if handle.join().is_err() {
            warn!("consumer thread panicked");
        }
    } else {
        warn!(
            timeout_ms = timeout.as_millis(),
            "consumer thread still blocked on the telemetry stream, detaching"
        );
    }
}

/// State moved onto the consumer thread.
struct Consumer {
    decoder: StreamDecoder,
    store: Arc<SampleStore>,
    counters: Arc<DecodeCounters>,
    halt: Arc<AtomicBool>,
    max_record_bytes: usize,
}

impl Consumer {
    fn run(self, stream: TelemetryStream) {
        let mut framer = RecordFramer::new(BufReader::new(stream), self.max_record_bytes);
        loop {
            let frame = match framer.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "telemetry stream read failed");
                    break;
                },
            };
            if self.halt.load(Ordering::Acquire) {
                break;
            }

            match frame {
                Frame::Record(record) => match self.decoder.decode(&record) {
                    Some(sample) => {
                        // Checked under the store lock: `halt` is always set
                        // before the next start() resets the store.
                        let stored = self.store.push_if(sample, || {
                            if self.halt.load(Ordering::Acquire) {
                                return false;
                            }
                            self.counters.record_decoded();
                            true
                        });
                        if !stored {
                            break;
                        }
                    },
                    None => self.counters.record_discarded(),
                },
                Frame::Oversized { size } => {
                    warn!(
                        size,
                        limit = self.max_record_bytes,
                        "discarding oversized telemetry record"
                    );
                    self.counters.record_oversized();
                },
            }
        }
        debug!(stats = ?self.counters.snapshot(), "telemetry stream ended");
    }
}
