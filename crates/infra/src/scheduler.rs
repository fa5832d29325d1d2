//! Holds not-yet-due work until its execution time.
//!
//! Each scheduled item waits on its own tokio task, so a long delay never
//! blocks anything else. Delays are lower bounds: an item runs at or after its
//! deadline, never before.
//!
//! An item ends in exactly one of three ways:
//! - **due**: the delay elapsed, `on_due` runs
//! - **cancelled**: [`Scheduler::cancel`] was called, `on_cancel` runs
//! - **abandoned**: [`Scheduler::abandon_all`] (shutdown), neither runs

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use rollcall_core::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Cancel,
    Abandon,
}

#[derive(Debug)]
struct Slot {
    task_id: TaskId,
    release: oneshot::Sender<Release>,
}

type Slots = Arc<Mutex<HashMap<u64, Slot>>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<u64, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds delayed items, one tokio task per item. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    slots: Slots,
    next_slot: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `task_id` for `delay`, then run `on_due`.
    ///
    /// The same task id may be scheduled more than once (redelivery); every
    /// schedule is an independent item.
    pub fn schedule<D, C>(&self, task_id: TaskId, delay: Duration, on_due: D, on_cancel: C) -> JoinHandle<()>
    where
        D: Future<Output = ()> + Send + 'static,
        C: Future<Output = ()> + Send + 'static,
    {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        lock(&self.slots).insert(slot, Slot { task_id, release: tx });

        let slots = self.slots.clone();
        tokio::spawn(async move {
            let released = tokio::select! {
                _ = tokio::time::sleep(delay) => None,
                received = &mut rx => Some(received.unwrap_or(Release::Abandon)),
            };

            // A release that raced the timer wins: it already removed the slot.
            let release = match released {
                Some(release) => Some(release),
                None if lock(&slots).remove(&slot).is_some() => None,
                None => Some(rx.try_recv().unwrap_or(Release::Abandon)),
            };

            match release {
                None => on_due.await,
                Some(Release::Cancel) => on_cancel.await,
                Some(Release::Abandon) => debug!(task_id = %task_id, "scheduled task abandoned"),
            }
        })
    }

    /// Cancel every pending item for `task_id`. Returns whether any was pending.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        let mut slots = lock(&self.slots);
        let matching: Vec<u64> = slots
            .iter()
            .filter(|(_, s)| s.task_id == task_id)
            .map(|(k, _)| *k)
            .collect();

        for key in &matching {
            if let Some(slot) = slots.remove(key) {
                let _ = slot.release.send(Release::Cancel);
            }
        }
        !matching.is_empty()
    }

    /// Drop every pending item without running either callback.
    pub fn abandon_all(&self) -> usize {
        let mut slots = lock(&self.slots);
        let count = slots.len();
        for (_, slot) in slots.drain() {
            let _ = slot.release.send(Release::Abandon);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_pending(&self, task_id: TaskId) -> bool {
        lock(&self.slots).values().any(|s| s.task_id == task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default, Clone)]
    struct Calls {
        due: Arc<AtomicUsize>,
        cancelled: Arc<AtomicUsize>,
    }

    impl Calls {
        fn schedule(&self, scheduler: &Scheduler, task_id: TaskId, delay: Duration) -> JoinHandle<()> {
            let due = self.due.clone();
            let cancelled = self.cancelled.clone();
            scheduler.schedule(
                task_id,
                delay,
                async move {
                    due.fetch_add(1, Ordering::SeqCst);
                },
                async move {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                },
            )
        }

        fn counts(&self) -> (usize, usize) {
            (self.due.load(Ordering::SeqCst), self.cancelled.load(Ordering::SeqCst))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_at_deadline_not_before() {
        let scheduler = Scheduler::new();
        let calls = Calls::default();
        let task = TaskId::new();
        let join = calls.schedule(&scheduler, task, Duration::from_secs(300));

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(calls.counts(), (0, 0));
        assert!(scheduler.is_pending(task));

        join.await.unwrap();
        assert_eq!(calls.counts(), (1, 0));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_runs_cancel_callback_only() {
        let scheduler = Scheduler::new();
        let calls = Calls::default();
        let task = TaskId::new();
        let join = calls.schedule(&scheduler, task, Duration::from_secs(60));

        assert!(scheduler.cancel(task));
        join.await.unwrap();

        assert_eq!(calls.counts(), (0, 1));
        assert!(!scheduler.cancel(task));
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_runs_nothing() {
        let scheduler = Scheduler::new();
        let calls = Calls::default();
        let a = calls.schedule(&scheduler, TaskId::new(), Duration::from_secs(60));
        let b = calls.schedule(&scheduler, TaskId::new(), Duration::from_secs(90));

        assert_eq!(scheduler.abandon_all(), 2);
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(calls.counts(), (0, 0));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn items_are_independent() {
        let scheduler = Scheduler::new();
        let calls = Calls::default();
        let slow = TaskId::new();
        let fast = calls.schedule(&scheduler, TaskId::new(), Duration::from_secs(1));
        let _slow = calls.schedule(&scheduler, slow, Duration::from_secs(3600));

        fast.await.unwrap();
        assert_eq!(calls.counts(), (1, 0));
        assert!(scheduler.is_pending(slow));
    }
}
