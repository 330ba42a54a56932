//! Samples, peaks, phases, and baselines flowing through a running collector.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{Behavior, FixedProbe, ScriptedLauncher, fast_config, record, wait_until};
use powerscope_core::config::ReportConfig;
use powerscope_core::{CollectorError, Phase, PowerCollector};

const WAIT: Duration = Duration::from_secs(5);

fn running() -> (Arc<ScriptedLauncher>, PowerCollector) {
    let launcher = ScriptedLauncher::new(Behavior::default());
    let collector = PowerCollector::with_backend(
        fast_config(),
        Arc::clone(&launcher) as _,
        Arc::new(FixedProbe(true)),
    );
    collector.start().unwrap();
    (launcher, collector)
}

#[test]
fn test_samples_arrive_in_order_with_totals() {
    let (launcher, collector) = running();

    launcher.send(&record(1000.0, 500.0, 100.0, 400.0));
    launcher.send(&record(2000.0, 0.0, 0.0, 0.0));
    assert!(wait_until(WAIT, || collector.sample_count() == 2));

    let samples = collector.samples();
    assert!((samples[0].total_power_mw() - 2000.0).abs() < 1e-9);
    assert!((samples[1].total_power_mw() - 2000.0).abs() < 1e-9);
    assert!(samples[0].relative_time_ms() <= samples[1].relative_time_ms());
    assert_eq!(collector.current().unwrap(), samples[1]);

    collector.stop().unwrap();
}

#[test]
fn test_peaks_are_tracked_per_channel() {
    let (launcher, collector) = running();

    launcher.send(&record(3000.0, 100.0, 0.0, 0.0));
    launcher.send(&record(100.0, 2500.0, 0.0, 0.0));
    assert!(wait_until(WAIT, || collector.sample_count() == 2));

    let peaks = collector.peak_power();
    assert!((peaks.peak_cpu_mw - 3000.0).abs() < 1e-9);
    assert!((peaks.peak_gpu_mw - 2500.0).abs() < 1e-9);
    // No single sample reached cpu + gpu = 5500.
    assert!((peaks.peak_total_mw - 3100.0).abs() < 1e-9);

    collector.stop().unwrap();
}

#[test]
fn test_samples_take_the_phase_current_at_decode() {
    let (launcher, collector) = running();
    assert_eq!(collector.phase(), Phase::Idle);

    collector.set_phase(Phase::Prefill);
    launcher.send(&record(1.0, 0.0, 0.0, 0.0));
    assert!(wait_until(WAIT, || collector.sample_count() == 1));

    collector.set_phase_named("decode").unwrap();
    launcher.send(&record(2.0, 0.0, 0.0, 0.0));
    assert!(wait_until(WAIT, || collector.sample_count() == 2));

    let phases: Vec<_> = collector.samples().iter().map(|s| s.phase()).collect();
    assert_eq!(phases, vec![Phase::Prefill, Phase::Decode]);

    collector.stop().unwrap();
}

#[test]
fn test_invalid_phase_name_keeps_current_phase() {
    let (_launcher, collector) = running();
    collector.set_phase(Phase::Decode);

    let err = collector.set_phase_named("warmup").unwrap_err();
    assert!(matches!(err, CollectorError::InvalidPhase(_)));
    assert_eq!(collector.phase(), Phase::Decode);

    collector.stop().unwrap();
}

#[test]
fn test_malformed_records_are_skipped() {
    let (launcher, collector) = running();

    launcher.send(b"garbage\0");
    launcher.send(&record(1000.0, 0.0, 0.0, 0.0));
    launcher.send(b"<?xml version=\"1.0\"?><plist version=\"1.0\"><dict/></plist>\0");
    launcher.send(&vec![b'x'; 8192]);
    launcher.send(b"\0");
    launcher.send(&record(2000.0, 0.0, 0.0, 0.0));

    assert!(wait_until(WAIT, || collector.decode_stats().total() == 5));
    let stats = collector.decode_stats();
    assert_eq!(stats.decoded, 2);
    assert_eq!(stats.discarded, 2);
    assert_eq!(stats.oversized, 1);
    assert_eq!(collector.sample_count(), 2);
    assert!(collector.is_running());

    collector.stop().unwrap();
}

#[test]
fn test_records_sent_before_stop_are_kept() {
    let (launcher, collector) = running();

    for _ in 0..10 {
        launcher.send(&record(100.0, 0.0, 0.0, 0.0));
    }
    collector.stop().unwrap();

    assert_eq!(collector.sample_count(), 10);
}

#[test]
fn test_baseline_averages_only_the_window() {
    let (launcher, collector) = running();

    // Pre-window samples must not leak into the baseline.
    for _ in 0..3 {
        launcher.send(&record(9000.0, 0.0, 0.0, 0.0));
    }
    assert!(wait_until(WAIT, || collector.sample_count() == 3));

    let feeder = {
        let launcher = Arc::clone(&launcher);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            for cpu in [100.0, 200.0, 300.0, 400.0, 500.0] {
                launcher.send(&record(cpu, 50.0, 10.0, 40.0));
            }
        })
    };

    let baseline = collector
        .measure_idle_baseline(Duration::from_secs(1))
        .unwrap();
    feeder.join().unwrap();

    assert_eq!(baseline.baseline_sample_count, 5);
    assert!((baseline.baseline_cpu_power_mw - 300.0).abs() < 1e-9);
    assert!((baseline.baseline_gpu_power_mw - 50.0).abs() < 1e-9);
    assert!((baseline.baseline_ane_power_mw - 10.0).abs() < 1e-9);
    assert!((baseline.baseline_dram_power_mw - 40.0).abs() < 1e-9);
    assert!((baseline.baseline_power_mw - 400.0).abs() < 1e-9);

    collector.stop().unwrap();
}

#[test]
fn test_restart_during_baseline_window_is_rejected() {
    let (launcher, collector) = running();

    let baseline = thread::scope(|scope| {
        let measuring = scope.spawn(|| collector.measure_idle_baseline(Duration::from_millis(800)));

        thread::sleep(Duration::from_millis(100));
        collector.stop().unwrap();
        collector.start().unwrap();
        launcher.send(&record(7777.0, 0.0, 0.0, 0.0));
        assert!(wait_until(WAIT, || collector.sample_count() == 1));

        measuring.join().unwrap()
    });

    assert!(matches!(baseline, Err(CollectorError::NotRunning)));
    assert_eq!(collector.sample_count(), 1);
    collector.stop().unwrap();
}

#[test]
fn test_stop_during_baseline_window_keeps_the_run() {
    let (launcher, collector) = running();

    let baseline = thread::scope(|scope| {
        let measuring = scope.spawn(|| collector.measure_idle_baseline(Duration::from_millis(500)));

        thread::sleep(Duration::from_millis(100));
        launcher.send(&record(200.0, 0.0, 0.0, 0.0));
        launcher.send(&record(400.0, 0.0, 0.0, 0.0));
        assert!(wait_until(WAIT, || collector.sample_count() == 2));
        collector.stop().unwrap();

        measuring.join().unwrap()
    })
    .unwrap();

    assert_eq!(baseline.baseline_sample_count, 2);
    assert!((baseline.baseline_power_mw - 300.0).abs() < 1e-9);
}

#[test]
fn test_empty_baseline_window_is_all_zero() {
    let (_launcher, collector) = running();

    let baseline = collector
        .measure_idle_baseline(Duration::from_millis(50))
        .unwrap();
    assert_eq!(baseline.baseline_sample_count, 0);
    assert!(baseline.baseline_power_mw.abs() < f64::EPSILON);

    collector.stop().unwrap();
}

#[test]
fn test_report_covers_the_run() {
    let (launcher, collector) = running();

    collector.set_phase(Phase::Prefill);
    launcher.send(&record(1000.0, 0.0, 0.0, 0.0));
    assert!(wait_until(WAIT, || collector.sample_count() == 1));
    collector.set_phase(Phase::Decode);
    launcher.send(&record(3000.0, 0.0, 0.0, 0.0));
    assert!(wait_until(WAIT, || collector.sample_count() == 2));
    collector.stop().unwrap();

    let summary = collector.summary();
    assert_eq!(summary.sample_count, 2);
    assert!(summary.phase(Phase::Prefill).is_some());
    assert!(summary.phase(Phase::Decode).is_some());

    let dir = tempfile::tempdir().unwrap();
    let config = ReportConfig {
        output_dir: dir.path().to_path_buf(),
        pretty: false,
    };
    let (report, path) = collector.save_report(None, &config).unwrap();

    assert!(path.exists());
    assert!(report.started_at.is_some());
    assert_eq!(report.samples.len(), 2);
    assert_eq!(report.decode_stats.decoded, 2);
    assert_eq!(report.summary, summary);
    assert!((report.peak_power.peak_cpu_mw - 3000.0).abs() < 1e-9);
}
