//! `powerscope check`: probe for non-interactive powermetrics access.

use anyhow::Result;
use powerscope_core::config::PowerscopeConfig;
use powerscope_core::probe::{AvailabilityProbe, PrivilegedProbe, REMEDIATION};

/// Run the availability probe and print the verdict. Returns whether the
/// telemetry source is available.
pub fn run(config: &PowerscopeConfig) -> Result<bool> {
    let probe = PrivilegedProbe::from_config(&config.collector);
    let available = probe.is_available();

    if available {
        println!("powermetrics is available ({})", probe.spec());
    } else {
        println!("powermetrics is NOT available ({})", probe.spec());
        println!();
        println!("{REMEDIATION}");
    }
    Ok(available)
}
