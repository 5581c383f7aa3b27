#![crate_name = "heapwatch"]
#![crate_type = "lib"]

//! # Heapwatch
//!
//! A heap growth monitor that periodically samples memory counters and writes heap snapshots to disk
//! when the heap keeps growing.
//!
//! ## Introduction
//!
//! Heapwatch samples the live heap size on a fixed interval, compares every sample with the previous one
//! and counts how many times in a row the heap grew by more than a threshold. When that count reaches the
//! configured limit, a **heap snapshot** is written: the memory counters, the allocator statistics, the
//! recent sample history and, if enabled, the live bytes attributed to each allocating function.
//!
//! A single noisy sample never triggers a snapshot: it takes sustained growth. A significant shrink
//! lowers the count again, so a heap that grows and is then released does not accumulate suspicion.
//!
//! Snapshot files are capped: after every write, only the newest files (by modification time) are kept.
//!
//! ## Usage
//!
//! ### Cargo.toml
//!
//! Add the following to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! heapwatch = "0.1"
//! ```
//!
//! ### Setup
//!
//! The heap counters come from the [`HeapwatchAllocator`], which must be **set as the global allocator**:
//!
//! ```rust
//! use heapwatch::HeapwatchAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: HeapwatchAllocator = HeapwatchAllocator::init();
//! ```
//!
//! Optionally, turn on allocation site tracing so snapshots tell you *where* the memory was allocated.
//! It takes the names of the crates you want allocations attributed to:
//!
//! ```rust
//! heapwatch::init_symbol_table(&["my_crate_name"]);
//! ```
//!
//! Site tracing captures a backtrace on every allocation, so keep it for debugging sessions.
//!
//! ### Running the monitor
//!
//! ```rust,no_run
//! use heapwatch::{AllocatorSource, HeapMonitor, HeapwatchAllocator, MonitorConfig, spawn_monitor};
//!
//! #[global_allocator]
//! static ALLOCATOR: HeapwatchAllocator = HeapwatchAllocator::init();
//!
//! #[tokio::main]
//! async fn main() -> Result<(), heapwatch::HeapwatchError> {
//!     let config = MonitorConfig::default().with_heap_dump_dir("./heapdumps");
//!     let monitor = HeapMonitor::new(&config, AllocatorSource::new(&ALLOCATOR));
//!     let handle = spawn_monitor(monitor, config.monitor_interval());
//!
//!     // ... run the application ...
//!
//!     handle.snapshot_now("before-shutdown").await?;
//!     println!("{:?}", handle.trend().await?);
//!     handle.join().await?;
//!     Ok(())
//! }
//! ```
//!
//! [`HeapMonitor`] has no timer of its own, so it can also be driven by hand with [`HeapMonitor::collect`].
//!
//! ## Configuration
//!
//! | key               | default       | meaning                                             |
//! |-------------------|---------------|-----------------------------------------------------|
//! | `heapDumpDir`     | `./heapdumps` | directory snapshots are written to                  |
//! | `maxHeapDumps`    | `5`           | snapshots kept after retention                      |
//! | `monitorInterval` | `5000`        | sampling interval in milliseconds                   |
//! | `leakThreshold`   | `10`          | growth between two samples that counts, in MB       |
//! | `gcThreshold`     | `3`           | consecutive growths before a snapshot is written    |
//!
//! See [`MonitorConfig::from_file`] to load them from JSON.
//!
//! ## Snapshot files
//!
//! Snapshots are JSON documents ([`HeapSnapshot`]) named
//! `heapdump-<reason>-<timestamp>.heapsnapshot`, where the reason is `leak-detected`, `manual` or any
//! string passed to [`HeapMonitor::snapshot_now`].
//!

#![doc(html_playground_url = "https://play.rust-lang.org")]

mod alloc;
mod clock;
mod config;
mod detector;
mod error;
mod monitor;
mod sample;
mod scheduler;
mod snapshot;
mod symbols;

pub use self::alloc::{
    AllocatorStats, HeapwatchAllocator, init_symbol_table, is_tracing_enabled, with_symbol_table,
};
pub use self::clock::{Clock, SystemClock};
pub use self::config::MonitorConfig;
pub use self::detector::{
    Detection, HISTORY_CAPACITY, LeakDetector, LeakWarning, TREND_WINDOW, Trend, TrendDirection,
};
pub use self::error::{HeapwatchError, Result};
pub use self::monitor::{HeapMonitor, MonitorStatus};
pub use self::sample::{
    AllocatorSource, MemoryCounters, MemorySample, MemorySource, resident_set_bytes,
};
pub use self::scheduler::{MIN_INTERVAL, MonitorHandle, spawn_monitor};
pub use self::snapshot::{
    HeapSnapshot, LEAK_REASON, MANUAL_REASON, RetentionReport, SNAPSHOT_EXTENSION, SnapshotFile,
    SnapshotStore,
};
pub use self::symbols::{SiteStats, Symbol, SymbolTable};
