//! The sampling monitor: reads counters, runs leak detection and writes snapshots.

use std::path::PathBuf;

use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::MonitorConfig;
use crate::detector::{Detection, LeakDetector, Trend};
use crate::sample::{MemorySample, MemorySource};
use crate::snapshot::{HeapSnapshot, LEAK_REASON, MANUAL_REASON, RetentionReport, SnapshotStore};

/// Summary of a monitor's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub latest: Option<MemorySample>,
    pub history_len: usize,
    pub consecutive_leak_count: u32,
    pub leak_warnings: u64,
    pub snapshots_written: u64,
    pub trend: Trend,
}

/// Heap monitor over a [`MemorySource`].
///
/// The monitor itself has no timer: call [`HeapMonitor::collect`] once per tick, or hand it to
/// [`crate::spawn_monitor`] to run it on a tokio interval.
pub struct HeapMonitor<S> {
    source: S,
    detector: LeakDetector,
    store: SnapshotStore,
    clock: Box<dyn Clock>,
    snapshots_written: u64,
}

impl<S: MemorySource> HeapMonitor<S> {
    pub fn new(config: &MonitorConfig, source: S) -> Self {
        Self {
            source,
            detector: LeakDetector::new(config.leak_threshold_bytes(), config.gc_threshold()),
            store: SnapshotStore::new(config.heap_dump_dir(), config.max_heap_dumps()),
            clock: Box::new(SystemClock),
            snapshots_written: 0,
        }
    }

    /// Replaces the clock used for sample and snapshot timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Takes one sample, records it and runs leak detection against the previous one.
    ///
    /// Writes a `leak-detected` snapshot when the growth streak reaches the configured limit.
    pub fn collect(&mut self) -> Detection {
        let sample = self.source.read().at(self.clock.now());
        tracing::trace!(
            heap_used = sample.heap_used,
            heap_total = sample.heap_total,
            rss = sample.rss,
            "collected memory sample"
        );

        let detection = self.detector.record(sample);
        match &detection {
            Detection::Growth {
                warning,
                snapshot_due,
            } => {
                tracing::warn!(
                    count = warning.count,
                    growth_bytes = warning.growth_bytes,
                    heap_used = warning.current_heap_used,
                    timestamp = %warning.timestamp,
                    "possible memory leak: heap grew beyond threshold"
                );
                if *snapshot_due {
                    self.generate_snapshot(LEAK_REASON);
                }
            }
            Detection::Shrink { count } => {
                tracing::debug!(count, heap_used = sample.heap_used, "heap shrank beyond threshold");
            }
            Detection::Baseline | Detection::Steady => {}
        }
        detection
    }

    /// Dumps the heap to a snapshot file, then applies retention.
    ///
    /// Failures are logged and yield `None`.
    pub fn generate_snapshot(&mut self, reason: &str) -> Option<PathBuf> {
        let taken_at = self.clock.now();
        let snapshot = HeapSnapshot {
            reason: reason.to_string(),
            taken_at,
            memory: self.source.read().at(taken_at),
            allocator: self.source.allocator_stats(),
            sites: self.source.allocation_sites(),
            history: self.detector.history().copied().collect(),
        };

        match self.store.write(&snapshot) {
            Ok(path) => {
                self.snapshots_written += 1;
                tracing::info!(path = %path.display(), reason, "heap snapshot written");
                self.cleanup_retention();
                Some(path)
            }
            Err(err) => {
                tracing::error!(reason, error = %err, "failed to write heap snapshot");
                None
            }
        }
    }

    /// Manual snapshot; an empty reason becomes `manual`.
    pub fn snapshot_now(&mut self, reason: &str) -> Option<PathBuf> {
        let reason = if reason.trim().is_empty() {
            MANUAL_REASON
        } else {
            reason
        };
        self.generate_snapshot(reason)
    }

    /// Removes snapshots beyond the retention cap. Failures are logged.
    pub fn cleanup_retention(&self) -> Option<RetentionReport> {
        match self.store.cleanup() {
            Ok(report) => {
                if !report.removed.is_empty() || report.failed > 0 {
                    tracing::info!(
                        kept = report.kept,
                        removed = report.removed.len(),
                        failed = report.failed,
                        "heap snapshot retention applied"
                    );
                }
                Some(report)
            }
            Err(err) => {
                tracing::error!(dir = %self.store.dir().display(), error = %err, "heap snapshot retention failed");
                None
            }
        }
    }

    pub fn trend(&self) -> Trend {
        self.detector.trend()
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            latest: self.detector.latest().copied(),
            history_len: self.detector.history().len(),
            consecutive_leak_count: self.detector.consecutive_leak_count(),
            leak_warnings: self.detector.leak_warnings(),
            snapshots_written: self.snapshots_written,
            trend: self.detector.trend(),
        }
    }

    pub fn detector(&self) -> &LeakDetector {
        &self.detector
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

#[cfg(test)]
pub(crate) mod test {

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::detector::TrendDirection;
    use crate::sample::MemoryCounters;
    use crate::symbols::SiteStats;

    pub(crate) const MB: u64 = 1024 * 1024;

    /// Source replaying scripted heap sizes; repeats the last one when exhausted.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedSource {
        heap: Arc<Mutex<VecDeque<u64>>>,
        last: Arc<AtomicU64>,
    }

    impl ScriptedSource {
        pub(crate) fn new(heap: impl IntoIterator<Item = u64>) -> Self {
            Self {
                heap: Arc::new(Mutex::new(heap.into_iter().collect())),
                last: Arc::new(AtomicU64::new(0)),
            }
        }
    }

    impl MemorySource for ScriptedSource {
        fn read(&self) -> MemoryCounters {
            let next = self.heap.lock().expect("source lock").pop_front();
            let heap_used = match next {
                Some(heap) => {
                    self.last.store(heap, Ordering::SeqCst);
                    heap
                }
                None => self.last.load(Ordering::SeqCst),
            };
            MemoryCounters {
                rss: heap_used + MB,
                heap_used,
                heap_total: heap_used,
                external: MB,
            }
        }

        fn allocation_sites(&self) -> Vec<SiteStats> {
            vec![SiteStats {
                name: "app::leaky".to_string(),
                allocated: self.last.load(Ordering::SeqCst) as usize,
                count: 1,
            }]
        }
    }

    /// Clock advancing one second per reading.
    pub(crate) struct SteppingClock {
        next: Mutex<DateTime<Utc>>,
    }

    impl SteppingClock {
        pub(crate) fn new() -> Self {
            Self {
                next: Mutex::new(
                    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                        .single()
                        .expect("valid date"),
                ),
            }
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            let mut next = self.next.lock().expect("clock lock");
            let now = *next;
            *next = now + chrono::Duration::seconds(1);
            now
        }
    }

    fn config(dir: &TempDir) -> MonitorConfig {
        MonitorConfig::default()
            .with_heap_dump_dir(dir.path())
            .with_max_heap_dumps(2)
            .with_monitor_interval(Duration::from_millis(100))
            .with_leak_threshold_mb(10)
            .with_gc_threshold(3)
    }

    fn monitor(dir: &TempDir, heap: impl IntoIterator<Item = u64>) -> HeapMonitor<ScriptedSource> {
        HeapMonitor::new(&config(dir), ScriptedSource::new(heap)).with_clock(SteppingClock::new())
    }

    fn snapshot_names(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_sustained_growth_writes_one_snapshot() {
        let tmp = TempDir::new().expect("tempdir");
        // baseline, three growths, then a fourth growth and the snapshot read
        let mut monitor = monitor(&tmp, [0, 20 * MB, 40 * MB, 60 * MB, 60 * MB, 80 * MB]);

        assert_eq!(monitor.collect(), Detection::Baseline);
        assert!(!monitor.collect().snapshot_due());
        assert!(!monitor.collect().snapshot_due());
        assert!(monitor.collect().snapshot_due());

        let status = monitor.status();
        assert_eq!(status.snapshots_written, 1);
        assert_eq!(status.consecutive_leak_count, 0);
        assert_eq!(status.leak_warnings, 3);
        assert_eq!(status.history_len, 4);

        let names = snapshot_names(&tmp);
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("heapdump-leak-detected-2024-01-01T00-00-"));
        assert!(names[0].ends_with(".heapsnapshot"));

        let snapshot = SnapshotStore::read(tmp.path().join(&names[0])).expect("readable");
        assert_eq!(snapshot.reason, LEAK_REASON);
        assert_eq!(snapshot.history.len(), 4);
        assert_eq!(snapshot.sites.len(), 1);
        assert_eq!(snapshot.memory.heap_used, 60 * MB);
    }

    #[test]
    fn test_manual_snapshot_and_retention() {
        let tmp = TempDir::new().expect("tempdir");
        let mut monitor = monitor(&tmp, [MB]);
        monitor.collect();

        let first = monitor.snapshot_now("").expect("written");
        assert!(
            first
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("heapdump-manual-"))
        );

        for reason in ["one", "two", "three"] {
            assert!(monitor.snapshot_now(reason).is_some());
        }

        // max_heap_dumps is 2
        assert_eq!(snapshot_names(&tmp).len(), 2);
        assert_eq!(monitor.status().snapshots_written, 4);
    }

    #[test]
    fn test_snapshot_write_failure_is_not_fatal() {
        let tmp = TempDir::new().expect("tempdir");
        let blocker = tmp.path().join("blocked");
        std::fs::write(&blocker, "not a directory").expect("write blocker");

        let config = config(&tmp).with_heap_dump_dir(&blocker).with_gc_threshold(1);
        let mut monitor = HeapMonitor::new(&config, ScriptedSource::new([0, 50 * MB, 100 * MB]));

        monitor.collect();
        assert!(monitor.collect().snapshot_due());
        assert!(monitor.snapshot_now("manual").is_none());
        assert_eq!(monitor.status().snapshots_written, 0);

        // keeps sampling
        assert!(monitor.collect().snapshot_due());
        assert_eq!(monitor.status().history_len, 3);
    }

    #[test]
    fn test_status_reports_trend() {
        let tmp = TempDir::new().expect("tempdir");
        let mut monitor = monitor(&tmp, [100 * MB, 105 * MB, 110 * MB]);
        assert_eq!(
            monitor.trend().direction,
            TrendDirection::InsufficientData
        );
        for _ in 0..3 {
            monitor.collect();
        }

        let status = monitor.status();
        assert_eq!(status.trend.direction, TrendDirection::Increasing);
        assert_eq!(status.trend.average_growth, Some((5 * MB) as f64));
        assert_eq!(status.latest.map(|s| s.heap_used), Some(110 * MB));
        assert_eq!(status.leak_warnings, 0);
        assert!(snapshot_names(&tmp).is_empty());
    }

    #[test]
    fn test_independent_monitors() {
        let first_dir = TempDir::new().expect("tempdir");
        let second_dir = TempDir::new().expect("tempdir");
        let mut first = monitor(&first_dir, [0, 20 * MB]);
        let mut second = monitor(&second_dir, [0, 0]);

        first.collect();
        second.collect();
        first.collect();
        second.collect();

        assert_eq!(first.detector().consecutive_leak_count(), 1);
        assert_eq!(second.detector().consecutive_leak_count(), 0);
    }
}
