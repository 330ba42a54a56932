//! Availability probe for the telemetry binary.
//!
//! `powermetrics` needs root. The collector expects a sudoers entry that
//! allows it without a password, and checks for one by running
//! `sudo -n powermetrics --help`: `-n` makes sudo fail instead of prompting.
//!
//! The probe is bounded in time and never raises. A missing binary, a
//! non-zero exit, a spawn failure, or a timeout all read as "unavailable".

use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;
use wait_timeout::ChildExt;

use crate::config::CollectorConfig;
use crate::process::LaunchSpec;

/// Shown when the probe fails.
pub const REMEDIATION: &str = "powermetrics requires passwordless sudo access. Add a sudoers \
                               entry such as `<user> ALL=(root) NOPASSWD: /usr/bin/powermetrics` \
                               (via `sudo visudo -f /etc/sudoers.d/powermetrics`) and retry";

/// Answers whether the telemetry binary can be started non-interactively.
pub trait AvailabilityProbe: Send + Sync {
    /// `true` when the telemetry source can be started.
    fn is_available(&self) -> bool;
}

/// Probe that runs the non-interactive check command.
#[derive(Debug, Clone)]
pub struct PrivilegedProbe {
    spec: LaunchSpec,
    timeout: Duration,
}

impl PrivilegedProbe {
    /// Probe an arbitrary command with the given time bound.
    #[must_use]
    pub const fn new(spec: LaunchSpec, timeout: Duration) -> Self {
        Self { spec, timeout }
    }

    /// Probe described by the collector configuration.
    #[must_use]
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self::new(LaunchSpec::availability_check(config), config.probe_timeout)
    }

    /// The command this probe runs.
    #[must_use]
    pub const fn spec(&self) -> &LaunchSpec {
        &self.spec
    }
}

impl AvailabilityProbe for PrivilegedProbe {
    fn is_available(&self) -> bool {
        let mut child = match Command::new(&self.spec.program)
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                debug!(command = %self.spec, error = %e, "availability probe could not spawn");
                return false;
            },
        };

        match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => {
                debug!(command = %self.spec, %status, "availability probe finished");
                status.success()
            },
            Ok(None) => {
                debug!(
                    command = %self.spec,
                    timeout_ms = self.timeout.as_millis(),
                    "availability probe timed out"
                );
                let _ = child.kill();
                let _ = child.wait();
                false
            },
            Err(e) => {
                debug!(command = %self.spec, error = %e, "availability probe wait failed");
                let _ = child.kill();
                let _ = child.wait();
                false
            },
        }
    }
}
