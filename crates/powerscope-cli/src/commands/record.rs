//! `powerscope record`: collect for a fixed duration and write a report.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use powerscope_core::config::PowerscopeConfig;
use powerscope_core::{Phase, PowerCollector, RunReport};

/// Arguments for `powerscope record`.
#[derive(Args, Debug)]
pub struct RecordArgs {
    /// How long to record (e.g. "30s", "2m")
    #[arg(short, long, value_parser = humantime::parse_duration)]
    pub duration: Duration,

    /// Measure an idle baseline for this long before recording
    #[arg(long, value_parser = humantime::parse_duration)]
    pub baseline: Option<Duration>,

    /// Phase to tag the recorded samples with
    #[arg(long, default_value = "idle")]
    pub phase: Phase,

    /// Write the report to this file instead of the configured directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Record one run.
pub fn run(config: &PowerscopeConfig, args: &RecordArgs) -> Result<()> {
    let collector = PowerCollector::new(config.collector.clone());
    let session = collector
        .session()
        .context("failed to start power collection")?;

    let baseline = match args.baseline {
        Some(duration) => {
            eprintln!("measuring idle baseline for {}", humantime::format_duration(duration));
            Some(
                session
                    .measure_idle_baseline(duration)
                    .context("failed to measure idle baseline")?,
            )
        },
        None => None,
    };

    session.set_phase(args.phase);
    eprintln!(
        "recording '{}' for {}",
        args.phase,
        humantime::format_duration(args.duration)
    );
    thread::sleep(args.duration);

    let outcome = session
        .finish()
        .context("failed to stop power collection")?;
    collector.set_phase(Phase::Idle);
    if outcome.is_forced() {
        eprintln!("note: powermetrics did not exit on SIGTERM and was killed");
    }

    let (report, path) = match &args.output {
        Some(path) => {
            let report = collector.report(baseline);
            report
                .write_to(path, config.report.pretty)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            (report, path.clone())
        },
        None => collector
            .save_report(baseline, &config.report)
            .context("failed to save report")?,
    };

    print_summary(&report);
    println!("report: {}", path.display());
    Ok(())
}

fn print_summary(report: &RunReport) {
    let summary = &report.summary;
    let stats = &report.decode_stats;

    println!("run {}", report.run_id);
    println!(
        "  samples: {} ({} discarded, {} oversized)",
        summary.sample_count, stats.discarded, stats.oversized
    );
    println!("  duration: {:.1} s", summary.duration_ms / 1000.0);
    println!("  mean power: {:.1} mW", summary.mean_power_mw);
    println!("  energy: {:.1} mJ", summary.energy_mj);
    println!(
        "  peaks: total {:.1} / cpu {:.1} / gpu {:.1} / ane {:.1} / dram {:.1} mW",
        report.peak_power.peak_total_mw,
        report.peak_power.peak_cpu_mw,
        report.peak_power.peak_gpu_mw,
        report.peak_power.peak_ane_mw,
        report.peak_power.peak_dram_mw,
    );
    if let Some(baseline) = &report.idle_baseline {
        println!(
            "  idle baseline: {:.1} mW over {} samples",
            baseline.baseline_power_mw, baseline.baseline_sample_count
        );
    }
    for phase in &summary.phases {
        println!(
            "  {:<15} {:>6} samples  mean {:>9.1} mW  peak {:>9.1} mW  {:>10.1} mJ",
            phase.phase.as_str(),
            phase.sample_count,
            phase.mean_power_mw,
            phase.peak_power_mw,
            phase.energy_mj
        );
    }
}
