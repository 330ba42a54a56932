//! powerscope core library.
//!
//! Collects power telemetry from the platform `powermetrics` tool while a
//! workload runs. The collector owns the subprocess lifecycle, decodes the
//! NUL-separated property-list stream on a background thread, tags every
//! sample with the caller's current execution phase, and keeps running
//! per-channel peaks next to the sample timeline.
//!
//! # Architecture
//!
//! ```text
//! PowerCollector::start()
//!     │
//!     ├── AvailabilityProbe::is_available()      (sudo -n powermetrics --help)
//!     ├── TelemetryLauncher::launch()            (sudo powermetrics -i .. -f plist ..)
//!     └── consumer thread
//!             │
//!             ├── RecordFramer   ── one frame per NUL-delimited record
//!             ├── StreamDecoder  ── PowerSample tagged with PhaseTracker::get()
//!             └── SampleStore    ── append + peak update under one lock
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use powerscope_core::config::CollectorConfig;
//! use powerscope_core::{Phase, PowerCollector};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let collector = PowerCollector::new(CollectorConfig::default());
//! let session = collector.session()?;
//! session.set_phase(Phase::Prefill);
//! std::thread::sleep(Duration::from_secs(1));
//! session.set_phase(Phase::Decode);
//! std::thread::sleep(Duration::from_secs(1));
//! session.finish()?;
//!
//! println!("peak total: {} mW", collector.peak_power().peak_total_mw);
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod config;
pub mod decode;
pub mod phase;
pub mod probe;
pub mod process;
pub mod report;
pub mod sample;
pub mod store;
pub mod summary;

pub use collector::{CollectorError, CollectorSession, PowerCollector, ShutdownOutcome};
pub use decode::DecodeStats;
pub use phase::{Phase, PhaseError, PhaseTracker};
pub use report::RunReport;
pub use sample::{ChannelPower, IdleBaseline, PeakPower, PowerSample};
pub use store::SampleStore;
pub use summary::{PhaseSummary, RunSummary};
