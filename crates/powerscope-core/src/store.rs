//! Append-only sample timeline with running peaks.
//!
//! One mutex guards both the samples and the peaks. The consumer thread is
//! the only writer; every reader locks, copies, and releases, so no live
//! reference into the store ever escapes. Because the peak update happens in
//! the same critical section as the append, a reader never observes peaks
//! that lag behind (or run ahead of) the visible sample count.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::sample::{PeakPower, PowerSample};

#[derive(Debug, Default)]
struct StoreInner {
    samples: Vec<PowerSample>,
    peaks: PeakPower,
}

/// Samples and peaks captured under a single lock acquisition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    /// Every sample appended since the last reset, in append order.
    pub samples: Vec<PowerSample>,
    /// Peaks over exactly `samples`.
    pub peaks: PeakPower,
}

/// Thread-safe store for the current run.
#[derive(Debug, Default)]
pub struct SampleStore {
    inner: Mutex<StoreInner>,
}

impl SampleStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the vector half-written,
    // so recovering the guard is sound.
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a sample and fold it into the peaks.
    pub fn push(&self, sample: PowerSample) {
        let mut inner = self.lock();
        inner.peaks.observe(&sample);
        inner.samples.push(sample);
    }

    /// Append `sample` only if `admit` returns `true`, evaluated while the
    /// lock is held. Returns whether the sample was stored.
    ///
    /// A writer whose right to append can be revoked concurrently with
    /// [`SampleStore::reset`] uses this so the check and the append are one
    /// step.
    pub fn push_if(&self, sample: PowerSample, admit: impl FnOnce() -> bool) -> bool {
        let mut inner = self.lock();
        if !admit() {
            return false;
        }
        inner.peaks.observe(&sample);
        inner.samples.push(sample);
        true
    }

    /// Drop every sample and zero the peaks.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.samples.clear();
        inner.peaks = PeakPower::default();
    }

    /// Owned copy of every sample.
    #[must_use]
    pub fn samples(&self) -> Vec<PowerSample> {
        self.lock().samples.clone()
    }

    /// Owned copy of the samples at index `start` and later.
    #[must_use]
    pub fn samples_since(&self, start: usize) -> Vec<PowerSample> {
        let inner = self.lock();
        inner.samples.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// The most recently appended sample.
    #[must_use]
    pub fn current(&self) -> Option<PowerSample> {
        self.lock().samples.last().cloned()
    }

    /// Current peaks.
    #[must_use]
    pub fn peaks(&self) -> PeakPower {
        self.lock().peaks
    }

    /// Number of samples stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    /// Whether the store holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().samples.is_empty()
    }

    /// Samples and peaks read together.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.lock();
        StoreSnapshot {
            samples: inner.samples.clone(),
            peaks: inner.peaks,
        }
    }
}
