//! Status delegate and its fire-and-forget dispatcher.
//!
//! Defines [`StatusDelegate`], the single observer a host may install to hear
//! about status changes, and [`StatusNotifier`], which delivers those changes
//! off the caller's path. Notifications are queued on an unbounded channel
//! while the registry lock is still held and drained by a dispatcher task.
//! Queueing never blocks, so a slow delegate never delays admission or
//! cleanup, and the delegate sees changes in the order the registry applied
//! them even when several callers race.
//!
//! Without a Tokio runtime there is no dispatcher. Changes are then handed
//! back to the caller and delivered inline after the lock is released, which
//! keeps per-call order but not order across threads.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use opcoord_core::Operation;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::log::{LogLevel, LogSink};

/// Observer for operation status changes.
///
/// Called once per transition (admission and every terminal transition) with
/// a snapshot of the operation after the change. Used as
/// `Arc<dyn StatusDelegate>`.
pub trait StatusDelegate: Send + Sync {
    fn on_status_changed(&self, operation: &Operation);
}

impl<F> StatusDelegate for F
where
    F: Fn(&Operation) + Send + Sync,
{
    fn on_status_changed(&self, operation: &Operation) {
        self(operation);
    }
}

type DelegateSlot = ArcSwapOption<Arc<dyn StatusDelegate>>;

/// Holds the installed delegate and the channel feeding the dispatcher task.
pub struct StatusNotifier {
    slot: Arc<DelegateSlot>,
    log: Arc<dyn LogSink>,
    tx: mpsc::UnboundedSender<Operation>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Operation>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl StatusNotifier {
    #[must_use]
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            slot: Arc::new(ArcSwapOption::empty()),
            log,
            tx,
            rx: Mutex::new(Some(rx)),
            dispatcher: Mutex::new(None),
        }
    }

    /// Installs `delegate`, replacing any previous one. `None` uninstalls.
    pub fn set(&self, delegate: Option<Arc<dyn StatusDelegate>>) {
        self.slot.store(delegate.map(Arc::new));
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.slot.load().is_some()
    }

    /// Queues `changes` for the dispatcher, in order, and returns the ones
    /// that could not be queued. Never blocks and never calls the delegate,
    /// so it is safe under the registry lock.
    ///
    /// Inside a Tokio runtime the dispatcher task is spawned on first use.
    /// Without a runtime, or once the dispatcher has gone away, every change
    /// is returned for [`deliver_now`](Self::deliver_now).
    #[must_use]
    pub fn enqueue(&self, changes: &[Operation]) -> Vec<Operation> {
        if changes.is_empty() || !self.is_installed() {
            return Vec::new();
        }
        self.ensure_dispatcher();
        let mut rejected = Vec::new();
        for op in changes {
            if let Err(mpsc::error::SendError(op)) = self.try_queue(op.clone()) {
                rejected.push(op);
            }
        }
        rejected
    }

    /// Delivers `changes` on the calling thread. Must be called without the
    /// registry lock held.
    pub fn deliver_now(&self, changes: &[Operation]) {
        for op in changes {
            deliver(&self.slot, &self.log, op);
        }
    }

    fn try_queue(&self, op: Operation) -> Result<(), mpsc::error::SendError<Operation>> {
        if self.dispatcher.lock().is_none() {
            return Err(mpsc::error::SendError(op));
        }
        self.tx.send(op)
    }

    fn ensure_dispatcher(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let Some(mut rx) = self.rx.lock().take() else {
            return;
        };
        let slot = Arc::clone(&self.slot);
        let log = Arc::clone(&self.log);
        *dispatcher = Some(handle.spawn(async move {
            while let Some(op) = rx.recv().await {
                deliver(&slot, &log, &op);
            }
        }));
    }
}

impl Drop for StatusNotifier {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

fn deliver(slot: &DelegateSlot, log: &Arc<dyn LogSink>, op: &Operation) {
    let Some(delegate) = slot.load_full() else {
        return;
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| delegate.on_status_changed(op)));
    if outcome.is_err() {
        log.log(
            LogLevel::Warn,
            "delegate",
            "status delegate panicked",
            &[
                ("operation_id", op.id().to_string()),
                ("status", op.status().to_string()),
            ],
        );
    }
}
