//! Execution phase tagging.
//!
//! The instrumentation layer declares phase boundaries while a workload runs;
//! the consumer thread reads the current phase once per decoded record. The
//! phase is stored as a single atomic byte so neither side ever blocks the
//! other.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Execution stage a sample is attributed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No workload is running.
    #[default]
    Idle,
    /// Setup before the model runs (tokenization, input staging).
    PreInference,
    /// Prompt processing.
    Prefill,
    /// Token generation.
    Decode,
    /// Teardown after the model runs (detokenization, output handling).
    PostInference,
}

impl Phase {
    /// Every phase, in workload order.
    pub const ALL: [Self; 5] = [
        Self::Idle,
        Self::PreInference,
        Self::Prefill,
        Self::Decode,
        Self::PostInference,
    ];

    /// Returns the wire name of this phase.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PreInference => "pre_inference",
            Self::Prefill => "prefill",
            Self::Decode => "decode",
            Self::PostInference => "post_inference",
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::PreInference => 1,
            Self::Prefill => 2,
            Self::Decode => 3,
            Self::PostInference => 4,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::PreInference,
            2 => Self::Prefill,
            3 => Self::Decode,
            4 => Self::PostInference,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| PhaseError::Invalid {
                name: s.to_string(),
            })
    }
}

/// Phase validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhaseError {
    /// The name is not one of the known phases.
    #[error(
        "invalid phase '{name}': expected one of idle, pre_inference, prefill, decode, post_inference"
    )]
    Invalid {
        /// The rejected name.
        name: String,
    },
}

/// Holds the phase that newly decoded samples are tagged with.
///
/// Writes never touch samples that were already decoded.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    current: AtomicU8,
}

impl PhaseTracker {
    /// Create a tracker starting at [`Phase::Idle`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: AtomicU8::new(0),
        }
    }

    /// Returns the current phase.
    #[must_use]
    pub fn get(&self) -> Phase {
        Phase::from_u8(self.current.load(Ordering::Acquire))
    }

    /// Replace the current phase.
    pub fn set(&self, phase: Phase) {
        self.current.store(phase.to_u8(), Ordering::Release);
    }

    /// Parse `name` and make it the current phase.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::Invalid`] for an unknown name; the current phase
    /// is left unchanged.
    pub fn set_named(&self, name: &str) -> Result<Phase, PhaseError> {
        let phase = name.parse::<Phase>()?;
        self.set(phase);
        Ok(phase)
    }
}
