//! Leaks memory on purpose and lets the monitor catch it.
//!
//! ```sh
//! cargo run --example leak [config.json]
//! ```
//!
//! Stop with Ctrl-C; snapshots are left in the configured directory.

use std::time::Duration;

use heapwatch::{AllocatorSource, HeapMonitor, HeapwatchAllocator, MonitorConfig, spawn_monitor};
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;

#[global_allocator]
static ALLOCATOR: HeapwatchAllocator = HeapwatchAllocator::init();

/// Bytes leaked on every leak tick.
const LEAK_CHUNK: usize = 4 * 1024 * 1024;

const LEAK_EVERY: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_log()?;
    heapwatch::init_symbol_table(&["leak"]);

    let config = match std::env::args().nth(1) {
        Some(path) => MonitorConfig::from_file(path)?,
        None => MonitorConfig::default()
            .with_monitor_interval(Duration::from_secs(1))
            .with_max_heap_dumps(3),
    };

    tracing::info!(
        dir = %config.heap_dump_dir().display(),
        interval_ms = config.monitor_interval().as_millis() as u64,
        threshold_mb = config.leak_threshold_mb(),
        "starting leak demo"
    );

    let monitor = HeapMonitor::new(&config, AllocatorSource::new(&ALLOCATOR));
    let handle = spawn_monitor(monitor, config.monitor_interval());

    let leaker = tokio::spawn(async {
        let mut retained: Vec<Vec<u8>> = Vec::new();
        let mut ticker = tokio::time::interval(LEAK_EVERY);
        loop {
            ticker.tick().await;
            leak_chunk(&mut retained);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, stopping");

    leaker.abort();
    handle.stop();
    let monitor = handle.join().await?;
    tracing::info!(
        allocated = ALLOCATOR.allocated(),
        peak = ALLOCATOR.peak(),
        snapshots = monitor.status().snapshots_written,
        trend = ?monitor.trend().direction,
        "leak demo finished"
    );

    Ok(())
}

fn leak_chunk(retained: &mut Vec<Vec<u8>>) {
    retained.push(vec![0xAB; LEAK_CHUNK]);
}

fn init_log() -> Result<(), Box<dyn std::error::Error>> {
    let stdout_logger = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(true)
        .with_line_number(true)
        .with_writer(std::io::stdout);

    let registry = tracing_subscriber::registry()
        .with(stdout_logger.with_filter(LevelFilter::from(Level::INFO)));

    tracing::subscriber::set_global_default(registry)?;

    Ok(())
}
