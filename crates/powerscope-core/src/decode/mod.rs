//! Telemetry record decoding.
//!
//! `powermetrics -f plist` writes one XML property list per sampling tick,
//! separated by NUL bytes. [`framing`] splits the byte stream into records;
//! [`StreamDecoder`] turns one record into a [`PowerSample`].
//!
//! # Record layout
//!
//! ```text
//! processor
//! +-- clusters[]           cpu_power    summed into cpu (fallback: processor.cpu_power)
//! +-- gpu                  gpu_power    gpu   (fallback: processor.gpu_power)
//! +-- ane                  power        ane   (fallback: processor.ane_power)
//! +-- combined_power                    ignored
//! thermal
//! +-- channels[]           power        summed into dram
//! ```
//!
//! Decoding is two explicit steps. The record is first parsed into
//! [`ChannelReadings`], where every channel is an `Option` and absence is
//! preserved. Absent channels are resolved to zero only when the sample is
//! built, and the total is always recomputed from the four channels.
//!
//! A record that does not have this shape yields a [`DecodeError`]. The
//! consumer thread calls [`StreamDecoder::decode`], which logs the error and
//! returns `None`: one bad record never ends a run.

pub mod framing;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::phase::PhaseTracker;
use crate::sample::{ChannelPower, PowerSample};

pub use framing::{Frame, RecordFramer};

/// Record decoding errors. Never surfaced by the collector.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The bytes are not a property list of the expected shape.
    #[error("malformed telemetry record: {0}")]
    Malformed(#[from] plist::Error),

    /// A required top-level container is missing.
    #[error("telemetry record has no '{container}' container")]
    MissingContainer {
        /// Name of the missing container.
        container: &'static str,
    },

    /// A channel value is NaN or infinite.
    #[error("telemetry record reports a non-finite {channel} power")]
    NonFinite {
        /// Channel name.
        channel: &'static str,
    },
}

/// Channel values as reported, with absence kept explicit.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelReadings {
    /// Sum over CPU clusters, `None` when no cluster reported power.
    pub cpu_mw: Option<f64>,
    /// GPU power.
    pub gpu_mw: Option<f64>,
    /// Neural engine power.
    pub ane_mw: Option<f64>,
    /// Sum over thermal channels, `None` when no channel reported power.
    pub dram_mw: Option<f64>,
}

impl ChannelReadings {
    /// Parse one record.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the record is not a property list, lacks
    /// the `processor` container, has containers of the wrong type, or
    /// reports a non-finite value.
    pub fn parse(record: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawRecord = plist::from_bytes(record)?;
        let processor = raw.processor.ok_or(DecodeError::MissingContainer {
            container: "processor",
        })?;

        let readings = Self {
            cpu_mw: sum_present(processor.clusters.iter().map(|c| c.cpu_power))
                .or(processor.cpu_power),
            gpu_mw: processor
                .gpu
                .and_then(|gpu| gpu.gpu_power)
                .or(processor.gpu_power),
            ane_mw: processor
                .ane
                .and_then(|ane| ane.power)
                .or(processor.ane_power),
            dram_mw: raw
                .thermal
                .and_then(|thermal| sum_present(thermal.channels.iter().map(|c| c.power))),
        };
        readings.check_finite()?;
        Ok(readings)
    }

    fn check_finite(&self) -> Result<(), DecodeError> {
        let channels = [
            ("cpu", self.cpu_mw),
            ("gpu", self.gpu_mw),
            ("ane", self.ane_mw),
            ("dram", self.dram_mw),
        ];
        for (channel, value) in channels {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(DecodeError::NonFinite { channel });
            }
        }
        Ok(())
    }

    /// Resolve absent channels to zero.
    #[must_use]
    pub fn resolve(self) -> ChannelPower {
        ChannelPower {
            cpu_mw: self.cpu_mw.unwrap_or(0.0),
            gpu_mw: self.gpu_mw.unwrap_or(0.0),
            ane_mw: self.ane_mw.unwrap_or(0.0),
            dram_mw: self.dram_mw.unwrap_or(0.0),
        }
    }
}

fn sum_present<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    values
        .into_iter()
        .flatten()
        .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    processor: Option<RawProcessor>,
    thermal: Option<RawThermal>,
}

#[derive(Debug, Deserialize)]
struct RawProcessor {
    #[serde(default)]
    clusters: Vec<RawCluster>,
    gpu: Option<RawGpu>,
    ane: Option<RawAne>,
    cpu_power: Option<f64>,
    gpu_power: Option<f64>,
    ane_power: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawCluster {
    cpu_power: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawGpu {
    gpu_power: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawAne {
    power: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawThermal {
    #[serde(default)]
    channels: Vec<RawChannel>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    power: Option<f64>,
}

/// Turns records into samples for one run.
#[derive(Debug, Clone)]
pub struct StreamDecoder {
    phase: Arc<PhaseTracker>,
    started_at: Instant,
}

impl StreamDecoder {
    /// Decoder for a run that started at `started_at`. Samples are tagged
    /// with whatever `phase` holds when each record is decoded.
    #[must_use]
    pub const fn new(phase: Arc<PhaseTracker>, started_at: Instant) -> Self {
        Self { phase, started_at }
    }

    /// Decode one record.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the record has the wrong shape.
    pub fn try_decode(&self, record: &[u8]) -> Result<PowerSample, DecodeError> {
        let channels = ChannelReadings::parse(record)?.resolve();
        let relative_time_ms = self.started_at.elapsed().as_secs_f64() * 1000.0;
        Ok(PowerSample::new(
            Utc::now(),
            relative_time_ms,
            channels,
            self.phase.get(),
        ))
    }

    /// Decode one record, logging and discarding it on error.
    #[must_use]
    pub fn decode(&self, record: &[u8]) -> Option<PowerSample> {
        match self.try_decode(record) {
            Ok(sample) => Some(sample),
            Err(e) => {
                warn!(error = %e, record_bytes = record.len(), "discarding telemetry record");
                None
            },
        }
    }
}

/// Record counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeStats {
    /// Records turned into samples.
    pub decoded: u64,
    /// Records that failed to decode.
    pub discarded: u64,
    /// Records skipped for exceeding the size limit.
    pub oversized: u64,
}

impl DecodeStats {
    /// Every record seen, decoded or not.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.decoded + self.discarded + self.oversized
    }
}

/// Shared, lock-free [`DecodeStats`] updated by the consumer thread.
#[derive(Debug, Default)]
pub struct DecodeCounters {
    decoded: AtomicU64,
    discarded: AtomicU64,
    oversized: AtomicU64,
}

impl DecodeCounters {
    /// Zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            decoded: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            oversized: AtomicU64::new(0),
        }
    }

    /// Count one decoded record.
    pub fn record_decoded(&self) {
        self.decoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one discarded record.
    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one oversized record.
    pub fn record_oversized(&self) {
        self.oversized.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.decoded.store(0, Ordering::Relaxed);
        self.discarded.store(0, Ordering::Relaxed);
        self.oversized.store(0, Ordering::Relaxed);
    }

    /// Current values.
    #[must_use]
    pub fn snapshot(&self) -> DecodeStats {
        DecodeStats {
            decoded: self.decoded.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;

    const SAMPLE_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>processor</key>
    <dict>
        <key>clusters</key>
        <array>
            <dict>
                <key>name</key>
                <string>E-Cluster</string>
                <key>cpu_power</key>
                <real>1250.5</real>
            </dict>
            <dict>
                <key>name</key>
                <string>P-Cluster</string>
                <key>cpu_power</key>
                <real>3450.2</real>
            </dict>
        </array>
        <key>gpu</key>
        <dict>
            <key>gpu_power</key>
            <real>5678.9</real>
        </dict>
        <key>ane</key>
        <dict>
            <key>power</key>
            <real>234.7</real>
        </dict>
        <key>combined_power</key>
        <real>99999.0</real>
    </dict>
    <key>thermal</key>
    <dict>
        <key>channels</key>
        <array>
            <dict>
                <key>name</key>
                <string>DRAM0</string>
                <key>power</key>
                <real>890.3</real>
            </dict>
            <dict>
                <key>name</key>
                <string>DRAM1</string>
                <key>power</key>
                <real>910.5</real>
            </dict>
        </array>
    </dict>
</dict>
</plist>
"#;

    const MINIMAL_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>processor</key>
    <dict>
        <key>clusters</key>
        <array>
            <dict>
                <key>cpu_power</key>
                <real>1000.0</real>
            </dict>
        </array>
    </dict>
</dict>
</plist>
"#;

    const FLAT_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>processor</key>
    <dict>
        <key>gpu_power</key>
        <integer>420</integer>
        <key>ane_power</key>
        <integer>17</integer>
    </dict>
</dict>
</plist>
"#;

    const SCALAR_CPU_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>processor</key>
    <dict>
        <key>clusters</key>
        <array>
            <dict>
                <key>name</key>
                <string>E-Cluster</string>
                <key>freq_hz</key>
                <real>972000000.0</real>
            </dict>
            <dict>
                <key>name</key>
                <string>P-Cluster</string>
                <key>freq_hz</key>
                <real>3204000000.0</real>
            </dict>
        </array>
        <key>cpu_power</key>
        <integer>1234</integer>
        <key>gpu_power</key>
        <integer>50</integer>
        <key>ane_power</key>
        <integer>0</integer>
        <key>combined_power</key>
        <integer>1284</integer>
    </dict>
</dict>
</plist>
"#;

    const NO_PROCESSOR_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>invalid</key>
    <string>structure</string>
</dict>
</plist>
"#;

    const WRONG_TYPE_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>processor</key>
    <string>not a dict</string>
</dict>
</plist>
"#;

    const BROKEN_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>broken
</plist>
"#;

    fn decoder() -> (StreamDecoder, Arc<PhaseTracker>) {
        let phase = Arc::new(PhaseTracker::new());
        (StreamDecoder::new(Arc::clone(&phase), Instant::now()), phase)
    }

    #[test]
    fn test_decode_complete_record() {
        let (decoder, _) = decoder();
        let sample = decoder.try_decode(SAMPLE_PLIST.as_bytes()).unwrap();

        assert!((sample.cpu_power_mw() - 4700.7).abs() < 0.05);
        assert!((sample.gpu_power_mw() - 5678.9).abs() < 0.05);
        assert!((sample.ane_power_mw() - 234.7).abs() < 0.05);
        assert!((sample.dram_power_mw() - 1800.8).abs() < 0.05);

        let expected = 4700.7 + 5678.9 + 234.7 + 1800.8;
        assert!((sample.total_power_mw() - expected).abs() < 0.05);
        assert_eq!(sample.phase(), Phase::Idle);
        assert!(sample.relative_time_ms() >= 0.0);
    }

    #[test]
    fn test_reported_total_is_ignored() {
        let (decoder, _) = decoder();
        let sample = decoder.try_decode(SAMPLE_PLIST.as_bytes()).unwrap();
        assert!(sample.total_power_mw() < 99999.0);
        assert_eq!(
            sample.total_power_mw(),
            sample.cpu_power_mw() + sample.gpu_power_mw() + sample.ane_power_mw() + sample.dram_power_mw()
        );
    }

    #[test]
    fn test_decode_minimal_record_zero_fills() {
        let (decoder, _) = decoder();
        let sample = decoder.try_decode(MINIMAL_PLIST.as_bytes()).unwrap();

        assert!((sample.cpu_power_mw() - 1000.0).abs() < f64::EPSILON);
        assert!(sample.gpu_power_mw().abs() < f64::EPSILON);
        assert!(sample.ane_power_mw().abs() < f64::EPSILON);
        assert!(sample.dram_power_mw().abs() < f64::EPSILON);
        assert!((sample.total_power_mw() - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_readings_keep_absence_explicit() {
        let readings = ChannelReadings::parse(MINIMAL_PLIST.as_bytes()).unwrap();
        assert_eq!(readings.cpu_mw, Some(1000.0));
        assert_eq!(readings.gpu_mw, None);
        assert_eq!(readings.ane_mw, None);
        assert_eq!(readings.dram_mw, None);
    }

    #[test]
    fn test_flat_layout_and_integers() {
        let readings = ChannelReadings::parse(FLAT_PLIST.as_bytes()).unwrap();
        assert_eq!(readings.cpu_mw, None);
        assert_eq!(readings.gpu_mw, Some(420.0));
        assert_eq!(readings.ane_mw, Some(17.0));

        let power = readings.resolve();
        assert!((power.total() - 437.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_scalar_cpu_power_when_clusters_lack_it() {
        let readings = ChannelReadings::parse(SCALAR_CPU_PLIST.as_bytes()).unwrap();
        assert_eq!(readings.cpu_mw, Some(1234.0));
        assert_eq!(readings.gpu_mw, Some(50.0));
        assert_eq!(readings.ane_mw, Some(0.0));
        assert_eq!(readings.dram_mw, None);
        assert!((readings.resolve().total() - 1284.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cluster_sum_wins_over_scalar_cpu_power() {
        let record = SCALAR_CPU_PLIST.replace(
            "<key>freq_hz</key>\n                <real>972000000.0</real>",
            "<key>cpu_power</key>\n                <real>300.0</real>",
        );
        let readings = ChannelReadings::parse(record.as_bytes()).unwrap();
        assert_eq!(readings.cpu_mw, Some(300.0));
    }

    #[test]
    fn test_missing_processor_is_rejected() {
        let (decoder, _) = decoder();
        let err = decoder.try_decode(NO_PROCESSOR_PLIST.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MissingContainer {
                container: "processor"
            }
        ));
        assert!(decoder.decode(NO_PROCESSOR_PLIST.as_bytes()).is_none());
    }

    #[test]
    fn test_wrong_container_type_is_rejected() {
        let (decoder, _) = decoder();
        assert!(matches!(
            decoder.try_decode(WRONG_TYPE_PLIST.as_bytes()),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_garbage_never_panics() {
        let (decoder, _) = decoder();
        for record in [
            BROKEN_PLIST.as_bytes(),
            b"".as_slice(),
            b"not a plist at all".as_slice(),
            [0xff_u8, 0xfe, 0x00, 0x01].as_slice(),
        ] {
            assert!(decoder.decode(record).is_none());
        }
    }

    #[test]
    fn test_samples_take_phase_at_decode_time() {
        let (decoder, phase) = decoder();
        let before = decoder.decode(SAMPLE_PLIST.as_bytes()).unwrap();

        phase.set_named("prefill").unwrap();
        let after = decoder.decode(SAMPLE_PLIST.as_bytes()).unwrap();

        assert_eq!(before.phase(), Phase::Idle);
        assert_eq!(after.phase(), Phase::Prefill);
    }

    #[test]
    fn test_counters() {
        let counters = DecodeCounters::new();
        counters.record_decoded();
        counters.record_decoded();
        counters.record_discarded();
        counters.record_oversized();

        let stats = counters.snapshot();
        assert_eq!(
            stats,
            DecodeStats {
                decoded: 2,
                discarded: 1,
                oversized: 1
            }
        );
        assert_eq!(stats.total(), 4);

        counters.reset();
        assert_eq!(counters.snapshot(), DecodeStats::default());
    }

    #[test]
    fn test_sum_present() {
        assert_eq!(sum_present([None, None]), None);
        assert_eq!(sum_present(Vec::new()), None);
        assert_eq!(sum_present([Some(1.5), None, Some(2.5)]), Some(4.0));
    }

    #[test]
    fn test_non_finite_rejected() {
        let readings = ChannelReadings {
            gpu_mw: Some(f64::NAN),
            ..ChannelReadings::default()
        };
        assert!(matches!(
            readings.check_finite(),
            Err(DecodeError::NonFinite { channel: "gpu" })
        ));
    }
}
