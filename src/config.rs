//! Monitor configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HeapwatchError, Result};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Configuration of a [`crate::HeapMonitor`].
///
/// Every field is optional when deserialized; missing keys take the defaults below.
/// Keys are camelCase (`heapDumpDir`, `maxHeapDumps`, `monitorInterval`, `leakThreshold`, `gcThreshold`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Directory heap snapshots are written to
    heap_dump_dir: PathBuf,

    /// Snapshots kept after retention cleanup
    max_heap_dumps: usize,

    /// Sampling interval, in milliseconds
    monitor_interval: u64,

    /// Heap growth between two samples that counts as a leak signal, in MB
    leak_threshold: u64,

    /// Consecutive leak signals before a snapshot is written
    gc_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heap_dump_dir: PathBuf::from("./heapdumps"),
            max_heap_dumps: 5,
            monitor_interval: 5000,
            leak_threshold: 10,
            gc_threshold: 3,
        }
    }
}

impl MonitorConfig {
    /// Parses a JSON document over the defaults and validates it.
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or a value is out of range.
    ///
    /// # Examples
    ///
    /// ```
    /// # use heapwatch::MonitorConfig;
    /// let config = MonitorConfig::from_json_str(r#"{ "maxHeapDumps": 2 }"#).unwrap();
    /// assert_eq!(config.max_heap_dumps(), 2);
    /// assert_eq!(config.gc_threshold(), 3);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()
    }

    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is malformed, or holds out-of-range values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json =
            std::fs::read_to_string(path).map_err(|e| HeapwatchError::io(path, e))?;
        Self::from_json_str(&json)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`HeapwatchError::InvalidConfig`] if:
    /// - the snapshot directory is empty
    /// - `max_heap_dumps`, `monitor_interval` or `gc_threshold` is 0
    pub fn validate(self) -> Result<Self> {
        if self.heap_dump_dir.as_os_str().is_empty() {
            return Err(HeapwatchError::InvalidConfig(
                "heapDumpDir cannot be empty".to_string(),
            ));
        }
        if self.max_heap_dumps == 0 {
            return Err(HeapwatchError::InvalidConfig(
                "maxHeapDumps must be at least 1".to_string(),
            ));
        }
        if self.monitor_interval == 0 {
            return Err(HeapwatchError::InvalidConfig(
                "monitorInterval must be greater than 0".to_string(),
            ));
        }
        if self.gc_threshold == 0 {
            return Err(HeapwatchError::InvalidConfig(
                "gcThreshold must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }

    #[must_use]
    pub fn with_heap_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.heap_dump_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_max_heap_dumps(mut self, max: usize) -> Self {
        self.max_heap_dumps = max;
        self
    }

    /// Sets the sampling interval, rounded up to whole milliseconds.
    #[must_use]
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        let millis = interval.as_nanos().div_ceil(1_000_000);
        self.monitor_interval = u64::try_from(millis).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_leak_threshold_mb(mut self, mb: u64) -> Self {
        self.leak_threshold = mb;
        self
    }

    #[must_use]
    pub fn with_gc_threshold(mut self, threshold: u32) -> Self {
        self.gc_threshold = threshold;
        self
    }

    /// Get the snapshot directory
    #[must_use]
    pub fn heap_dump_dir(&self) -> &Path {
        &self.heap_dump_dir
    }

    /// Get the retention cap
    #[must_use]
    pub const fn max_heap_dumps(&self) -> usize {
        self.max_heap_dumps
    }

    /// Get the sampling interval
    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval)
    }

    /// Get the leak threshold in MB
    #[must_use]
    pub const fn leak_threshold_mb(&self) -> u64 {
        self.leak_threshold
    }

    /// Get the leak threshold in bytes
    #[must_use]
    pub const fn leak_threshold_bytes(&self) -> u64 {
        self.leak_threshold.saturating_mul(BYTES_PER_MB)
    }

    /// Get the number of consecutive leak signals that triggers a snapshot
    #[must_use]
    pub const fn gc_threshold(&self) -> u32 {
        self.gc_threshold
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.heap_dump_dir(), Path::new("./heapdumps"));
        assert_eq!(config.max_heap_dumps(), 5);
        assert_eq!(config.monitor_interval(), Duration::from_millis(5000));
        assert_eq!(config.leak_threshold_mb(), 10);
        assert_eq!(config.leak_threshold_bytes(), 10 * 1024 * 1024);
        assert_eq!(config.gc_threshold(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = MonitorConfig::from_json_str(
            r#"{ "heapDumpDir": "/tmp/dumps", "leakThreshold": 25, "monitorInterval": 250 }"#,
        )
        .expect("valid config");
        assert_eq!(config.heap_dump_dir(), Path::new("/tmp/dumps"));
        assert_eq!(config.leak_threshold_mb(), 25);
        assert_eq!(config.monitor_interval(), Duration::from_millis(250));
        assert_eq!(config.max_heap_dumps(), 5);
        assert_eq!(config.gc_threshold(), 3);
    }

    #[test]
    fn test_rejects_zero_values() {
        for json in [
            r#"{ "maxHeapDumps": 0 }"#,
            r#"{ "monitorInterval": 0 }"#,
            r#"{ "gcThreshold": 0 }"#,
            r#"{ "heapDumpDir": "" }"#,
        ] {
            assert!(
                matches!(
                    MonitorConfig::from_json_str(json),
                    Err(HeapwatchError::InvalidConfig(_))
                ),
                "{json} should be rejected"
            );
        }
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            MonitorConfig::from_json_str("{ not json"),
            Err(HeapwatchError::Serialize(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("heapwatch.json");
        std::fs::write(&path, r#"{ "gcThreshold": 5 }"#).expect("write config");

        let config = MonitorConfig::from_file(&path).expect("valid config");
        assert_eq!(config.gc_threshold(), 5);

        assert!(matches!(
            MonitorConfig::from_file(dir.path().join("missing.json")),
            Err(HeapwatchError::Io { .. })
        ));
    }

    #[test]
    fn test_builder_setters() {
        let config = MonitorConfig::default()
            .with_heap_dump_dir("dumps")
            .with_max_heap_dumps(2)
            .with_monitor_interval(Duration::from_secs(1))
            .with_leak_threshold_mb(1)
            .with_gc_threshold(4);
        assert_eq!(config.heap_dump_dir(), Path::new("dumps"));
        assert_eq!(config.max_heap_dumps(), 2);
        assert_eq!(config.monitor_interval(), Duration::from_millis(1000));
        assert_eq!(config.leak_threshold_bytes(), 1024 * 1024);
        assert_eq!(config.gc_threshold(), 4);
    }

    #[test]
    fn test_interval_rounds_up_to_millis() {
        let config = MonitorConfig::default().with_monitor_interval(Duration::from_micros(500));
        assert_eq!(config.monitor_interval(), Duration::from_millis(1));
        assert!(config.validate().is_ok());

        let config = MonitorConfig::default().with_monitor_interval(Duration::from_micros(2500));
        assert_eq!(config.monitor_interval(), Duration::from_millis(3));

        let config = MonitorConfig::default().with_monitor_interval(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(HeapwatchError::InvalidConfig(_))
        ));
    }
}
