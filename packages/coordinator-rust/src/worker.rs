//! Background worker for periodic and on-demand tasks.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc
//! channel via a `BackgroundRunnable` implementation and calls its tick
//! callback on a schedule the runnable chooses after every tick.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
///
/// Implementors define how individual tasks are processed, what happens on
/// each tick, how long to wait before the next tick, and how to clean up on
/// shutdown.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called when the tick delay elapses. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Delay before the next tick. Consulted at startup and after every tick
    /// or task, so the schedule can change at runtime.
    fn next_tick_delay(&self) -> Duration;

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// The worker spawns a tokio task that:
/// 1. Listens for tasks on the mpsc channel
/// 2. Calls `BackgroundRunnable::run()` for each task
/// 3. Calls `BackgroundRunnable::on_tick()` whenever the current tick deadline passes
/// 4. Calls `BackgroundRunnable::shutdown()` when stopped
///
/// The stop signal is observed at every loop iteration; an in-progress tick
/// or task always runs to completion first.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the background worker with the given runnable.
    ///
    /// Must be called from within a Tokio runtime. The first tick fires after
    /// `runnable.next_tick_delay()`, not immediately. The channel capacity is
    /// fixed at 256.
    pub fn start(mut runnable: R) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(256);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut deadline = Instant::now() + runnable.next_tick_delay();

            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => {
                        break;
                    }
                    task = rx.recv() => {
                        match task {
                            Some(t) => {
                                runnable.run(t).await;
                                // A task may change the schedule (e.g. pressure
                                // detected); never push the deadline later.
                                deadline = deadline.min(Instant::now() + runnable.next_tick_delay());
                            }
                            None => break, // Channel closed.
                        }
                    }
                    () = tokio::time::sleep_until(deadline) => {
                        runnable.on_tick().await;
                        deadline = Instant::now() + runnable.next_tick_delay();
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submit a task to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped or the channel is closed.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// A clone of the task sender, for submitting without borrowing the worker.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<R::Task>> {
        self.tx.clone()
    }

    /// True until `stop()` is called or the worker task exits on its own.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker gracefully, waiting for the worker task to complete.
    ///
    /// Idempotent: calling `stop()` on a stopped worker does nothing.
    pub async fn stop(&mut self) {
        // Signal shutdown.
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Close the task channel.
        self.tx.take();
        // Wait for the worker task to finish.
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl<R: BackgroundRunnable> Drop for BackgroundWorker<R> {
    /// Signals the loop to exit without waiting for it.
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
