//! Single-slot cancel-and-restart timer.
//!
//! Holds at most one scheduled task. Scheduling again replaces (aborts) the
//! pending one, so a burst of triggers coalesces into a single firing. Once a
//! task starts running it detaches itself from the slot: a later `cancel`
//! or `schedule` no longer aborts work that is already in flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Slot {
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

/// Owned by a document entry; one slot per concern (save, GC).
#[derive(Clone, Default)]
pub struct TimerSlot {
    inner: Arc<Mutex<Slot>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing whatever was pending.
    pub fn schedule<F, Fut>(&self, delay: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.inner.lock();
        if let Some(previous) = slot.pending.take() {
            previous.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;
        let inner = self.inner.clone();

        slot.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = inner.lock();
                if slot.generation != generation {
                    return;
                }
                // Disarm: from here on this run cannot be aborted by the slot
                slot.pending = None;
            }
            task().await;
        }));
    }

    /// Cancel the pending task. Returns true if one was pending.
    pub fn cancel(&self) -> bool {
        let mut slot = self.inner.lock();
        slot.generation += 1;
        match slot.pending.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a task is scheduled and has not started yet.
    pub fn is_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }
}
