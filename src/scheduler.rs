//! Runs a [`HeapMonitor`] on a tokio interval.
//!
//! The monitor is moved into a single task which owns it for its whole life. Ticks, manual
//! snapshot requests and queries are handled one at a time by that task, so a manual snapshot
//! never overlaps a timer-driven one. [`MonitorHandle::stop`] is observed between operations: a
//! snapshot being written when it is called is finished first.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::detector::Trend;
use crate::error::{HeapwatchError, Result};
use crate::monitor::{HeapMonitor, MonitorStatus};
use crate::sample::MemorySource;

/// Shortest sampling interval; shorter ones are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

enum Command {
    Snapshot {
        reason: String,
        reply: oneshot::Sender<Option<PathBuf>>,
    },
    Trend(oneshot::Sender<Trend>),
    Status(oneshot::Sender<MonitorStatus>),
}

/// Handle to a monitor running in the background.
pub struct MonitorHandle<S> {
    stop: watch::Sender<bool>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<HeapMonitor<S>>,
}

/// Spawns `monitor` on the current tokio runtime, sampling every `interval`.
///
/// The first sample is taken one interval after the call. An `interval` below [`MIN_INTERVAL`]
/// is raised to it.
pub fn spawn_monitor<S>(monitor: HeapMonitor<S>, interval: Duration) -> MonitorHandle<S>
where
    S: MemorySource + Send + 'static,
{
    let interval = interval.max(MIN_INTERVAL);
    let (stop, stop_rx) = watch::channel(false);
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(monitor, interval, stop_rx, commands_rx));

    tracing::info!(interval_ms = interval.as_millis() as u64, "heap monitor started");

    MonitorHandle {
        stop,
        commands,
        task,
    }
}

async fn run<S: MemorySource>(
    mut monitor: HeapMonitor<S>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> HeapMonitor<S> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            Some(command) = commands.recv() => handle(&mut monitor, command),
            _ = ticker.tick() => {
                monitor.collect();
            }
        }
    }

    tracing::info!("heap monitor stopped");
    monitor
}

fn handle<S: MemorySource>(monitor: &mut HeapMonitor<S>, command: Command) {
    // a dropped receiver only means the caller stopped waiting
    match command {
        Command::Snapshot { reason, reply } => {
            let _ = reply.send(monitor.snapshot_now(&reason));
        }
        Command::Trend(reply) => {
            let _ = reply.send(monitor.trend());
        }
        Command::Status(reply) => {
            let _ = reply.send(monitor.status());
        }
    }
}

impl<S> MonitorHandle<S> {
    /// Stops future ticks. Calling it again has no effect.
    pub fn stop(&self) {
        let was_stopped = self.stop.send_replace(true);
        if !was_stopped {
            tracing::debug!("heap monitor stop requested");
        }
    }

    /// Whether [`MonitorHandle::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the monitor to write a snapshot now and waits for the file path.
    ///
    /// Resolves to `None` if the write failed (the failure is logged by the monitor).
    ///
    /// # Errors
    ///
    /// Returns [`HeapwatchError::MonitorStopped`] if the monitor task is gone.
    pub async fn snapshot_now(&self, reason: impl Into<String>) -> Result<Option<PathBuf>> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Snapshot {
            reason: reason.into(),
            reply,
        })?;
        response.await.map_err(|_| HeapwatchError::MonitorStopped)
    }

    /// Current trend of the running monitor.
    ///
    /// # Errors
    ///
    /// Returns [`HeapwatchError::MonitorStopped`] if the monitor task is gone.
    pub async fn trend(&self) -> Result<Trend> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Trend(reply))?;
        response.await.map_err(|_| HeapwatchError::MonitorStopped)
    }

    /// Current status of the running monitor.
    ///
    /// # Errors
    ///
    /// Returns [`HeapwatchError::MonitorStopped`] if the monitor task is gone.
    pub async fn status(&self) -> Result<MonitorStatus> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Status(reply))?;
        response.await.map_err(|_| HeapwatchError::MonitorStopped)
    }

    /// Stops the monitor and waits for the task, returning the monitor.
    ///
    /// # Errors
    ///
    /// Returns [`HeapwatchError::Task`] if the task panicked or was aborted.
    pub async fn join(self) -> Result<HeapMonitor<S>> {
        self.stop();
        self.task
            .await
            .map_err(|err| HeapwatchError::Task(err.to_string()))
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.is_stopped() {
            return Err(HeapwatchError::MonitorStopped);
        }
        self.commands
            .send(command)
            .map_err(|_| HeapwatchError::MonitorStopped)
    }
}
