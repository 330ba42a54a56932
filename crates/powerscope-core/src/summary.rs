//! Per-run and per-phase aggregates.
//!
//! Energy is integrated with the trapezoidal rule over `relative_time_ms`.
//! Power is in milliwatts and time in milliseconds, so one interval
//! contributes `mean_mw * dt_ms / 1000` millijoules. Each interval between
//! consecutive samples is credited to the phase of the later sample: that
//! sample was decoded after the phase boundary was declared.

use serde::{Deserialize, Serialize};

use crate::phase::Phase;
use crate::sample::PowerSample;

/// Aggregates for one phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    /// The phase.
    pub phase: Phase,
    /// Samples tagged with this phase.
    pub sample_count: usize,
    /// Mean `total_power_mw` over those samples.
    pub mean_power_mw: f64,
    /// Highest `total_power_mw` among those samples.
    pub peak_power_mw: f64,
    /// Time credited to this phase.
    pub duration_ms: f64,
    /// Energy credited to this phase, in millijoules.
    pub energy_mj: f64,
}

impl PhaseSummary {
    const fn empty(phase: Phase) -> Self {
        Self {
            phase,
            sample_count: 0,
            mean_power_mw: 0.0,
            peak_power_mw: 0.0,
            duration_ms: 0.0,
            energy_mj: 0.0,
        }
    }
}

/// Aggregates for a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Number of samples.
    pub sample_count: usize,
    /// Time between the first and last sample.
    pub duration_ms: f64,
    /// Mean `total_power_mw`.
    pub mean_power_mw: f64,
    /// Highest `total_power_mw`.
    pub peak_power_mw: f64,
    /// Total energy, in millijoules.
    pub energy_mj: f64,
    /// Phases that have at least one sample, in workload order.
    pub phases: Vec<PhaseSummary>,
}

impl RunSummary {
    /// Summarize samples in decode order.
    #[must_use]
    pub fn from_samples(samples: &[PowerSample]) -> Self {
        let Some(first) = samples.first() else {
            return Self::default();
        };

        let mut phases = Phase::ALL.map(PhaseSummary::empty);
        let mut power_sums = [0.0f64; Phase::ALL.len()];
        let mut total_sum = 0.0;
        let mut peak = f64::NEG_INFINITY;
        let mut energy_mj = 0.0;

        for (i, sample) in samples.iter().enumerate() {
            let power = sample.total_power_mw();
            let slot = phase_index(sample.phase());

            total_sum += power;
            peak = peak.max(power);

            let phase = &mut phases[slot];
            phase.sample_count += 1;
            phase.peak_power_mw = phase.peak_power_mw.max(power);
            power_sums[slot] += power;

            if i > 0 {
                let prev = &samples[i - 1];
                let dt_ms = (sample.relative_time_ms() - prev.relative_time_ms()).max(0.0);
                let interval_mj = (prev.total_power_mw() + power) / 2.0 * dt_ms / 1000.0;
                energy_mj += interval_mj;
                phase.duration_ms += dt_ms;
                phase.energy_mj += interval_mj;
            }
        }

        for (phase, sum) in phases.iter_mut().zip(power_sums) {
            if phase.sample_count > 0 {
                phase.mean_power_mw = sum / count_f64(phase.sample_count);
            }
        }

        let last = &samples[samples.len() - 1];
        Self {
            sample_count: samples.len(),
            duration_ms: (last.relative_time_ms() - first.relative_time_ms()).max(0.0),
            mean_power_mw: total_sum / count_f64(samples.len()),
            peak_power_mw: peak,
            energy_mj,
            phases: phases.into_iter().filter(|p| p.sample_count > 0).collect(),
        }
    }

    /// Summary for one phase, if it appeared in the run.
    #[must_use]
    pub fn phase(&self, phase: Phase) -> Option<&PhaseSummary> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

fn phase_index(phase: Phase) -> usize {
    Phase::ALL.iter().position(|p| *p == phase).unwrap_or(0)
}

#[allow(clippy::cast_precision_loss)] // sample counts stay far below 2^52
const fn count_f64(n: usize) -> f64 {
    n as f64
}
