//! `powerscope decode`: decode a saved capture offline.
//!
//! A capture is the raw stdout of `powermetrics -f plist`. Records carry no
//! usable clock here, so each record is placed `interval` after the
//! previous one.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use powerscope_core::config::PowerscopeConfig;
use powerscope_core::decode::{ChannelReadings, DecodeStats, Frame, RecordFramer};
use powerscope_core::{Phase, PowerSample, RunSummary};
use tracing::warn;

/// Arguments for `powerscope decode`.
#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Capture file (`powermetrics -f plist` output)
    pub capture: PathBuf,

    /// Sampling interval the capture was taken with, in milliseconds
    /// (defaults to `collector.sample_interval_ms`)
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Print a JSON summary instead of one line per record
    #[arg(long)]
    pub json: bool,
}

/// Samples and counters decoded from a capture.
#[derive(Debug, Default)]
pub struct Decoded {
    pub samples: Vec<PowerSample>,
    pub stats: DecodeStats,
}

/// Decode every record in `path`.
pub fn decode_capture(path: &Path, interval_ms: u64, max_record_bytes: usize) -> Result<Decoded> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut decoded = Decoded::default();

    for frame in RecordFramer::new(BufReader::new(file), max_record_bytes) {
        let frame = frame.with_context(|| format!("failed to read {}", path.display()))?;
        let record = match frame {
            Frame::Record(record) => record,
            Frame::Oversized { size } => {
                warn!(size, "skipping oversized record");
                decoded.stats.oversized += 1;
                continue;
            },
        };

        match ChannelReadings::parse(&record) {
            Ok(readings) => {
                #[allow(clippy::cast_precision_loss)] // record counts stay far below 2^52
                let relative_time_ms = decoded.samples.len() as f64 * interval_ms as f64;
                decoded.samples.push(PowerSample::new(
                    Utc::now(),
                    relative_time_ms,
                    readings.resolve(),
                    Phase::Idle,
                ));
                decoded.stats.decoded += 1;
            },
            Err(e) => {
                warn!(error = %e, "skipping record");
                decoded.stats.discarded += 1;
            },
        }
    }
    Ok(decoded)
}

/// Decode a capture and print it.
pub fn run(config: &PowerscopeConfig, args: &DecodeArgs) -> Result<()> {
    let interval_ms = args
        .interval_ms
        .unwrap_or(config.collector.sample_interval_ms);
    let decoded = decode_capture(&args.capture, interval_ms, config.collector.max_record_bytes)?;
    let summary = RunSummary::from_samples(&decoded.samples);

    if args.json {
        let output = serde_json::json!({
            "capture": args.capture,
            "decode_stats": decoded.stats,
            "summary": summary,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "{:>6} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "#", "t (ms)", "cpu", "gpu", "ane", "dram", "total"
    );
    for (i, sample) in decoded.samples.iter().enumerate() {
        println!(
            "{:>6} {:>10.0} {:>10.1} {:>10.1} {:>10.1} {:>10.1} {:>10.1}",
            i,
            sample.relative_time_ms(),
            sample.cpu_power_mw(),
            sample.gpu_power_mw(),
            sample.ane_power_mw(),
            sample.dram_power_mw(),
            sample.total_power_mw()
        );
    }
    println!(
        "{} records decoded, {} discarded, {} oversized; {:.1} mJ over {:.1} s",
        decoded.stats.decoded,
        decoded.stats.discarded,
        decoded.stats.oversized,
        summary.energy_mj,
        summary.duration_ms / 1000.0
    );
    Ok(())
}
