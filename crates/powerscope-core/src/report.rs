//! Run reports.
//!
//! A [`RunReport`] is everything one collector run produced, in the JSON
//! shape the persistence layer stores under `run_id`. Reports are written
//! atomically: the JSON goes to a temp file in the target directory, is
//! synced, then renamed over `<run_id>.json`.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::decode::DecodeStats;
use crate::sample::{IdleBaseline, PeakPower, PowerSample};
use crate::store::StoreSnapshot;
use crate::summary::RunSummary;

/// Schema identifier written into every report.
pub const REPORT_SCHEMA: &str = "powerscope.run_report.v1";

/// Report errors.
#[derive(Debug, Error)]
pub enum ReportError {
    /// JSON encoding or decoding failed.
    #[error("failed to encode run report: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error while writing a report.
    #[error("failed to write run report {}: {source}", path.display())]
    Io {
        /// Path being written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl ReportError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Everything recorded during one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Always [`REPORT_SCHEMA`].
    pub schema: String,
    /// Unique run identifier.
    pub run_id: Uuid,
    /// When the collector started, if it ever did.
    pub started_at: Option<DateTime<Utc>>,
    /// When this report was built.
    pub generated_at: DateTime<Utc>,
    /// Sampling interval requested from the telemetry source.
    pub sample_interval_ms: u64,
    /// Per-channel maxima over `samples`.
    pub peak_power: PeakPower,
    /// Idle baseline measured before the workload, if any.
    pub idle_baseline: Option<IdleBaseline>,
    /// Aggregates over `samples`.
    pub summary: RunSummary,
    /// Record counters.
    pub decode_stats: DecodeStats,
    /// The full timeline.
    pub samples: Vec<PowerSample>,
}

impl RunReport {
    /// Build a report with a fresh run ID.
    #[must_use]
    pub fn new(
        started_at: Option<DateTime<Utc>>,
        sample_interval_ms: u64,
        snapshot: StoreSnapshot,
        idle_baseline: Option<IdleBaseline>,
        decode_stats: DecodeStats,
    ) -> Self {
        Self {
            schema: REPORT_SCHEMA.to_string(),
            run_id: Uuid::new_v4(),
            started_at,
            generated_at: Utc::now(),
            sample_interval_ms,
            peak_power: snapshot.peaks,
            idle_baseline,
            summary: RunSummary::from_samples(&snapshot.samples),
            decode_stats,
            samples: snapshot.samples,
        }
    }

    /// File name used by [`RunReport::save_in`].
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.json", self.run_id)
    }

    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Json`] if encoding fails.
    pub fn to_json(&self, pretty: bool) -> Result<Vec<u8>, ReportError> {
        let bytes = if pretty {
            serde_json::to_vec_pretty(self)?
        } else {
            serde_json::to_vec(self)?
        };
        Ok(bytes)
    }

    /// Decode a report previously written by [`RunReport::to_json`].
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Json`] for invalid input.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ReportError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Atomically write the report to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError`] if encoding, writing, syncing, or renaming
    /// fails. `path` is never left partially written.
    pub fn write_to(&self, path: &Path, pretty: bool) -> Result<(), ReportError> {
        let payload = self.to_json(pretty)?;
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| ReportError::io(path, e))?;
        temp.write_all(&payload)
            .map_err(|e| ReportError::io(path, e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| ReportError::io(path, e))?;
        temp.persist(path)
            .map_err(|e| ReportError::io(path, e.error))?;

        info!(
            run_id = %self.run_id,
            path = %path.display(),
            samples = self.samples.len(),
            "wrote run report"
        );
        Ok(())
    }

    /// Write `<run_id>.json` into `dir`, creating the directory if needed.
    /// Returns the written path.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError`] if the directory cannot be created or the
    /// write fails.
    pub fn save_in(&self, dir: &Path, pretty: bool) -> Result<PathBuf, ReportError> {
        std::fs::create_dir_all(dir).map_err(|e| ReportError::io(dir, e))?;
        let path = dir.join(self.file_name());
        self.write_to(&path, pretty)?;
        Ok(path)
    }
}
