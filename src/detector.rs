//! Leak detection over a bounded sample history.
//!
//! The detector keeps the last [`HISTORY_CAPACITY`] samples and a consecutive-growth counter.
//! Each sample is compared with the previous one: growth above the threshold bumps the counter,
//! a shrink of the same magnitude lowers it (never below zero). Once the counter reaches the
//! configured limit a snapshot is due and the counter starts over.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sample::MemorySample;

/// Maximum number of samples kept in the history.
pub const HISTORY_CAPACITY: usize = 100;

/// Number of most recent samples the trend is computed over.
pub const TREND_WINDOW: usize = 10;

/// Warning emitted when heap growth between two samples exceeds the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakWarning {
    /// Consecutive-growth count after this sample.
    pub count: u32,
    pub growth_bytes: u64,
    pub current_heap_used: u64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of comparing two samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// First sample, nothing to compare with.
    Baseline,
    /// Change within the threshold.
    Steady,
    /// Heap grew beyond the threshold.
    Growth {
        warning: LeakWarning,
        /// The consecutive count reached the limit; it has been reset.
        snapshot_due: bool,
    },
    /// Heap shrank beyond the threshold.
    Shrink { count: u32 },
}

impl Detection {
    pub fn snapshot_due(&self) -> bool {
        matches!(
            self,
            Detection::Growth {
                snapshot_due: true,
                ..
            }
        )
    }
}

/// Direction of the heap usage trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    InsufficientData,
}

/// Rolling heap usage trend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trend {
    #[serde(rename = "trend")]
    pub direction: TrendDirection,
    /// Mean heap-used difference between successive samples, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_growth: Option<f64>,
    /// Samples the trend was computed over.
    pub samples: usize,
}

impl Trend {
    /// Computes the trend over the given samples, oldest first.
    pub fn over<'a, I>(samples: I) -> Self
    where
        I: IntoIterator<Item = &'a MemorySample>,
    {
        let heap: Vec<i128> = samples
            .into_iter()
            .map(|sample| i128::from(sample.heap_used))
            .collect();

        if heap.len() < 2 {
            return Self {
                direction: TrendDirection::InsufficientData,
                average_growth: None,
                samples: heap.len(),
            };
        }

        let diffs = heap.windows(2).map(|pair| pair[1] - pair[0]);
        let total: i128 = diffs.sum();
        let average = total as f64 / (heap.len() - 1) as f64;

        let direction = match total.signum() {
            1 => TrendDirection::Increasing,
            -1 => TrendDirection::Decreasing,
            _ => TrendDirection::Stable,
        };

        Self {
            direction,
            average_growth: Some(average),
            samples: heap.len(),
        }
    }
}

/// Sample history plus the consecutive-growth counter.
#[derive(Debug, Clone)]
pub struct LeakDetector {
    threshold_bytes: u64,
    gc_threshold: u32,
    history: VecDeque<MemorySample>,
    consecutive: u32,
    warnings: u64,
}

impl LeakDetector {
    /// Creates a detector; `gc_threshold` of 0 behaves like 1.
    pub fn new(threshold_bytes: u64, gc_threshold: u32) -> Self {
        Self {
            threshold_bytes,
            gc_threshold: gc_threshold.max(1),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            consecutive: 0,
            warnings: 0,
        }
    }

    /// Appends a sample to the history and compares it with the previous one.
    pub fn record(&mut self, sample: MemorySample) -> Detection {
        let previous = self.history.back().copied();

        self.history.push_back(sample);
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }

        match previous {
            Some(previous) => self.detect_leak(&sample, &previous),
            None => Detection::Baseline,
        }
    }

    /// Classifies the heap change from `previous` to `current` and updates the counter.
    pub fn detect_leak(&mut self, current: &MemorySample, previous: &MemorySample) -> Detection {
        let threshold = self.threshold_bytes;

        if current.heap_used > previous.heap_used {
            let growth = current.heap_used - previous.heap_used;
            if growth <= threshold {
                return Detection::Steady;
            }

            self.consecutive = self.consecutive.saturating_add(1);
            self.warnings = self.warnings.saturating_add(1);
            let warning = LeakWarning {
                count: self.consecutive,
                growth_bytes: growth,
                current_heap_used: current.heap_used,
                timestamp: current.timestamp,
            };

            let snapshot_due = self.consecutive >= self.gc_threshold;
            if snapshot_due {
                self.consecutive = 0;
            }
            Detection::Growth {
                warning,
                snapshot_due,
            }
        } else {
            let shrink = previous.heap_used - current.heap_used;
            if shrink <= threshold {
                return Detection::Steady;
            }

            self.consecutive = self.consecutive.saturating_sub(1);
            Detection::Shrink {
                count: self.consecutive,
            }
        }
    }

    /// Trend over the last [`TREND_WINDOW`] samples.
    pub fn trend(&self) -> Trend {
        let skip = self.history.len().saturating_sub(TREND_WINDOW);
        Trend::over(self.history.iter().skip(skip))
    }

    /// Samples, oldest first.
    pub fn history(&self) -> impl ExactSizeIterator<Item = &MemorySample> {
        self.history.iter()
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<&MemorySample> {
        self.history.back()
    }

    pub fn consecutive_leak_count(&self) -> u32 {
        self.consecutive
    }

    /// Total leak warnings emitted so far.
    pub fn leak_warnings(&self) -> u64 {
        self.warnings
    }
}
