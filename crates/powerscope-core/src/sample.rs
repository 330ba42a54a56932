//! Power sample records and the aggregates derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// Per-channel power in milliwatts, with absent channels already resolved
/// to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelPower {
    /// Sum of all CPU clusters.
    pub cpu_mw: f64,
    /// GPU.
    pub gpu_mw: f64,
    /// Apple Neural Engine.
    pub ane_mw: f64,
    /// DRAM / thermal channels.
    pub dram_mw: f64,
}

impl ChannelPower {
    /// Sum of the four channels.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.cpu_mw + self.gpu_mw + self.ane_mw + self.dram_mw
    }
}

/// One decoded telemetry tick.
///
/// `total_power_mw` is always the sum of the four channel fields. There is
/// no way to build a sample with a different total: the constructor computes
/// it and deserialization recomputes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SampleRecord")]
pub struct PowerSample {
    timestamp: DateTime<Utc>,
    relative_time_ms: f64,
    cpu_power_mw: f64,
    gpu_power_mw: f64,
    ane_power_mw: f64,
    dram_power_mw: f64,
    total_power_mw: f64,
    phase: Phase,
}

impl PowerSample {
    /// Build a sample from resolved channel readings.
    #[must_use]
    pub fn new(
        timestamp: DateTime<Utc>,
        relative_time_ms: f64,
        channels: ChannelPower,
        phase: Phase,
    ) -> Self {
        Self {
            timestamp,
            relative_time_ms,
            cpu_power_mw: channels.cpu_mw,
            gpu_power_mw: channels.gpu_mw,
            ane_power_mw: channels.ane_mw,
            dram_power_mw: channels.dram_mw,
            total_power_mw: channels.total(),
            phase,
        }
    }

    /// Wall-clock time the sample was decoded.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Milliseconds since the collector started.
    #[must_use]
    pub const fn relative_time_ms(&self) -> f64 {
        self.relative_time_ms
    }

    /// CPU power in milliwatts.
    #[must_use]
    pub const fn cpu_power_mw(&self) -> f64 {
        self.cpu_power_mw
    }

    /// GPU power in milliwatts.
    #[must_use]
    pub const fn gpu_power_mw(&self) -> f64 {
        self.gpu_power_mw
    }

    /// Neural engine power in milliwatts.
    #[must_use]
    pub const fn ane_power_mw(&self) -> f64 {
        self.ane_power_mw
    }

    /// DRAM power in milliwatts.
    #[must_use]
    pub const fn dram_power_mw(&self) -> f64 {
        self.dram_power_mw
    }

    /// Sum of the four channels in milliwatts.
    #[must_use]
    pub const fn total_power_mw(&self) -> f64 {
        self.total_power_mw
    }

    /// Sum of the four channels in watts.
    #[must_use]
    pub fn total_power_w(&self) -> f64 {
        self.total_power_mw / 1000.0
    }

    /// Phase that was current when the sample was decoded.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// The four channels of this sample.
    #[must_use]
    pub const fn channels(&self) -> ChannelPower {
        ChannelPower {
            cpu_mw: self.cpu_power_mw,
            gpu_mw: self.gpu_power_mw,
            ane_mw: self.ane_power_mw,
            dram_mw: self.dram_power_mw,
        }
    }
}

/// Serialized shape of a sample. Any stored total is ignored on the way in.
#[derive(Deserialize)]
struct SampleRecord {
    timestamp: DateTime<Utc>,
    relative_time_ms: f64,
    #[serde(default)]
    cpu_power_mw: f64,
    #[serde(default)]
    gpu_power_mw: f64,
    #[serde(default)]
    ane_power_mw: f64,
    #[serde(default)]
    dram_power_mw: f64,
    #[serde(default)]
    phase: Phase,
}

impl From<SampleRecord> for PowerSample {
    fn from(record: SampleRecord) -> Self {
        Self::new(
            record.timestamp,
            record.relative_time_ms,
            ChannelPower {
                cpu_mw: record.cpu_power_mw,
                gpu_mw: record.gpu_power_mw,
                ane_mw: record.ane_power_mw,
                dram_mw: record.dram_power_mw,
            },
            record.phase,
        )
    }
}

/// Running per-channel maxima since the last collector start.
///
/// Each channel is tracked on its own, so the reported set need not come
/// from a single sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakPower {
    /// Highest `total_power_mw` seen.
    pub peak_total_mw: f64,
    /// Highest `cpu_power_mw` seen.
    pub peak_cpu_mw: f64,
    /// Highest `gpu_power_mw` seen.
    pub peak_gpu_mw: f64,
    /// Highest `ane_power_mw` seen.
    pub peak_ane_mw: f64,
    /// Highest `dram_power_mw` seen.
    pub peak_dram_mw: f64,
}

impl PeakPower {
    /// Fold one sample into the maxima.
    pub fn observe(&mut self, sample: &PowerSample) {
        self.peak_total_mw = self.peak_total_mw.max(sample.total_power_mw);
        self.peak_cpu_mw = self.peak_cpu_mw.max(sample.cpu_power_mw);
        self.peak_gpu_mw = self.peak_gpu_mw.max(sample.gpu_power_mw);
        self.peak_ane_mw = self.peak_ane_mw.max(sample.ane_power_mw);
        self.peak_dram_mw = self.peak_dram_mw.max(sample.dram_power_mw);
    }
}

/// Mean power over an idle measurement window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IdleBaseline {
    /// Mean total power.
    pub baseline_power_mw: f64,
    /// Mean CPU power.
    pub baseline_cpu_power_mw: f64,
    /// Mean GPU power.
    pub baseline_gpu_power_mw: f64,
    /// Mean neural engine power.
    pub baseline_ane_power_mw: f64,
    /// Mean DRAM power.
    pub baseline_dram_power_mw: f64,
    /// Number of samples in the window.
    pub baseline_sample_count: usize,
}

impl IdleBaseline {
    /// Average a window of samples. An empty window yields an all-zero
    /// baseline with a count of zero.
    #[must_use]
    pub fn from_samples(window: &[PowerSample]) -> Self {
        if window.is_empty() {
            return Self::default();
        }

        let mut sum = ChannelPower::default();
        let mut total = 0.0;
        for sample in window {
            sum.cpu_mw += sample.cpu_power_mw;
            sum.gpu_mw += sample.gpu_power_mw;
            sum.ane_mw += sample.ane_power_mw;
            sum.dram_mw += sample.dram_power_mw;
            total += sample.total_power_mw;
        }

        #[allow(clippy::cast_precision_loss)] // sample counts stay far below 2^52
        let n = window.len() as f64;
        Self {
            baseline_power_mw: total / n,
            baseline_cpu_power_mw: sum.cpu_mw / n,
            baseline_gpu_power_mw: sum.gpu_mw / n,
            baseline_ane_power_mw: sum.ane_mw / n,
            baseline_dram_power_mw: sum.dram_mw / n,
            baseline_sample_count: window.len(),
        }
    }
}
