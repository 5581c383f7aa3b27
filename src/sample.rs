//! Memory samples and the sources they are read from.

mod proc;

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alloc::{self, AllocatorStats, HeapwatchAllocator};
use crate::symbols::SiteStats;

pub use self::proc::resident_set_bytes;

/// Raw memory counters, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCounters {
    /// Resident set size of the process.
    pub rss: u64,
    /// Live heap bytes.
    pub heap_used: u64,
    /// High-water mark of live heap bytes.
    pub heap_total: u64,
    /// Resident memory not accounted for by the tracked heap.
    pub external: u64,
}

impl MemoryCounters {
    /// Stamps the counters, producing a [`MemorySample`].
    pub fn at(self, timestamp: DateTime<Utc>) -> MemorySample {
        MemorySample {
            timestamp,
            rss: self.rss,
            heap_used: self.heap_used,
            heap_total: self.heap_total,
            external: self.external,
        }
    }
}

/// Memory counters recorded at one monitor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub rss: u64,
    pub heap_used: u64,
    pub heap_total: u64,
    pub external: u64,
}

/// Where the monitor reads memory counters and heap contents from.
pub trait MemorySource {
    /// Reads the current counters. Never fails; unavailable counters read as 0.
    fn read(&self) -> MemoryCounters;

    /// Allocator counters, if the source has any.
    fn allocator_stats(&self) -> Option<AllocatorStats> {
        None
    }

    /// Live allocation sites, largest first. Empty when the source does not track sites.
    fn allocation_sites(&self) -> Vec<SiteStats> {
        Vec::new()
    }
}

/// [`MemorySource`] backed by a [`HeapwatchAllocator`] installed as the global allocator,
/// plus the process resident set size.
pub struct AllocatorSource {
    allocator: &'static HeapwatchAllocator,
    rss_unavailable: AtomicBool,
}

impl AllocatorSource {
    pub fn new(allocator: &'static HeapwatchAllocator) -> Self {
        Self {
            allocator,
            rss_unavailable: AtomicBool::new(false),
        }
    }

    fn resident_set(&self) -> u64 {
        if self.rss_unavailable.load(Ordering::Relaxed) {
            return 0;
        }
        match resident_set_bytes() {
            Ok(rss) => rss,
            Err(err) => {
                tracing::warn!(error = %err, "resident set size unavailable; reporting 0 from now on");
                self.rss_unavailable.store(true, Ordering::Relaxed);
                0
            }
        }
    }
}

impl MemorySource for AllocatorSource {
    fn read(&self) -> MemoryCounters {
        let stats = self.allocator.stats();
        let heap_used = stats.allocated as u64;
        let rss = self.resident_set();
        MemoryCounters {
            rss,
            heap_used,
            heap_total: stats.peak as u64,
            external: rss.saturating_sub(heap_used),
        }
    }

    fn allocator_stats(&self) -> Option<AllocatorStats> {
        Some(self.allocator.stats())
    }

    fn allocation_sites(&self) -> Vec<SiteStats> {
        alloc::with_symbol_table(|table| table.sites()).unwrap_or_else(|err| {
            tracing::debug!(error = %err, "allocation site tracing disabled");
            Vec::new()
        })
    }
}

#[cfg(test)]
mod test {

    use super::*;

    static IDLE_ALLOCATOR: HeapwatchAllocator = HeapwatchAllocator::init();

    #[test]
    fn test_should_stamp_counters() {
        let counters = MemoryCounters {
            rss: 10,
            heap_used: 4,
            heap_total: 8,
            external: 6,
        };
        let now = Utc::now();
        let sample = counters.at(now);
        assert_eq!(sample.timestamp, now);
        assert_eq!(sample.heap_used, 4);
        assert_eq!(sample.heap_total, 8);
        assert_eq!(sample.rss, 10);
        assert_eq!(sample.external, 6);
    }

    #[test]
    fn test_should_serialize_sample_in_camel_case() {
        let sample = MemoryCounters {
            heap_used: 42,
            ..MemoryCounters::default()
        }
        .at(Utc::now());
        let json = serde_json::to_value(sample).expect("serializable");
        assert_eq!(json["heapUsed"], 42);
        assert!(json.get("heapTotal").is_some());
    }

    #[test]
    fn test_allocator_source_reads_allocator_counters() {
        let source = AllocatorSource::new(&IDLE_ALLOCATOR);
        let counters = source.read();
        // not installed as the global allocator, so nothing is ever allocated through it
        assert_eq!(counters.heap_used, 0);
        assert_eq!(counters.heap_total, 0);
        assert_eq!(counters.external, counters.rss);
        assert_eq!(source.allocator_stats(), Some(AllocatorStats::default()));
    }
}
