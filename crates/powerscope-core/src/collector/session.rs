//! Scoped collector runs.

use std::ops::Deref;

use tracing::{debug, warn};

use super::{CollectorError, PowerCollector, ShutdownOutcome};

/// A running collector that is stopped when the guard goes out of scope,
/// including during unwinding.
///
/// Dropping the guard swallows stop errors (they are logged). Call
/// [`CollectorSession::finish`] to stop explicitly and observe the outcome.
#[must_use = "dropping the session stops the collector immediately"]
#[derive(Debug)]
pub struct CollectorSession<'a> {
    collector: &'a PowerCollector,
    finished: bool,
}

impl<'a> CollectorSession<'a> {
    pub(super) const fn new(collector: &'a PowerCollector) -> Self {
        Self {
            collector,
            finished: false,
        }
    }

    /// Stop the collector now.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::NotRunning`] if the collector was already
    /// stopped through another handle.
    pub fn finish(mut self) -> Result<ShutdownOutcome, CollectorError> {
        self.finished = true;
        self.collector.stop()
    }
}

impl Deref for CollectorSession<'_> {
    type Target = PowerCollector;

    fn deref(&self) -> &Self::Target {
        self.collector
    }
}

impl Drop for CollectorSession<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.collector.stop() {
            Ok(outcome) => debug!(?outcome, "session ended"),
            Err(CollectorError::NotRunning) => {},
            Err(e) => warn!(error = %e, "failed to stop collector at end of session"),
        }
    }
}
