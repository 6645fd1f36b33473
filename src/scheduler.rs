//! Bounded-concurrency runner for units of work.
//!
//! Units are queued into a bounded buffer. A dispatch loop moves them into
//! its own backlog straight away and starts them, oldest first, as permits
//! free up. The scheduler never looks at what a unit did:
//! results travel through [`Branch`] facts, and the only signal the caller
//! gets back is [`Scheduler::wait`] returning once nothing is pending.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::branch::Branch;

struct Unit {
    branch: Branch,
    label: &'static str,
    run: BoxFuture<'static, ()>,
}

/// Decrements the pending count when dropped, so a unit that panics or is
/// discarded still counts as finished.
struct PendingGuard(Arc<watch::Sender<usize>>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

pub struct Scheduler {
    queue: mpsc::Sender<Unit>,
    pending: Arc<watch::Sender<usize>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Start a scheduler running at most `max_concurrency` units at once with
    /// room for `queue_capacity` units waiting to start.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(max_concurrency: usize, queue_capacity: usize) -> Self {
        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        let pending = Arc::new(watch::channel(0usize).0);
        let shutdown = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));

        tokio::spawn(dispatch(rx, permits, pending.clone(), shutdown.clone()));

        Self {
            queue,
            pending,
            shutdown,
        }
    }

    /// Queue `action(payload)` on behalf of the session owning `branch`.
    ///
    /// Dropped without a trace when the branch is already cancelled or the
    /// scheduler has been closed; waits only while the buffer is full.
    /// Returns whether the unit was accepted.
    pub async fn submit<P, F, Fut>(
        &self,
        branch: &Branch,
        label: &'static str,
        payload: P,
        action: F,
    ) -> bool
    where
        P: Send + 'static,
        F: FnOnce(P) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if branch.is_cancelled() || self.shutdown.is_cancelled() {
            trace!(label, "dropping submission");
            return false;
        }

        self.pending.send_modify(|n| *n += 1);
        let unit = Unit {
            branch: branch.clone(),
            label,
            run: async move { action(payload).await }.boxed(),
        };

        let sent = tokio::select! {
            sent = self.queue.send(unit) => sent.is_ok(),
            _ = self.shutdown.cancelled() => false,
        };
        if !sent {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            debug!(label, "scheduler closed while queueing");
        }
        sent
    }

    /// Block until every accepted unit has finished or been discarded.
    pub async fn wait(&self) {
        let mut rx = self.pending.subscribe();
        // The sender is owned by `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Stop accepting work and stop starting queued units. Units already
    /// running finish on their own. Safe to call any number of times.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<Unit>,
    permits: Arc<Semaphore>,
    pending: Arc<watch::Sender<usize>>,
    shutdown: CancellationToken,
) {
    // Units leave the bounded buffer as soon as they arrive, whether or not a
    // permit is free, so a running unit blocked in `submit` always gets room.
    let mut backlog: VecDeque<(Unit, PendingGuard)> = VecDeque::new();
    let mut open = true;
    while open || !backlog.is_empty() {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = permits.clone().acquire_owned(), if !backlog.is_empty() => {
                let Ok(permit) = permit else { break };
                if let Some((unit, guard)) = backlog.pop_front() {
                    tokio::spawn(run_unit(unit, guard, permit));
                }
            }
            unit = rx.recv(), if open => match unit {
                Some(unit) => backlog.push_back((unit, PendingGuard(pending.clone()))),
                None => open = false,
            },
        }
    }

    // Whatever is still waiting will never run; release it so `wait` returns.
    for (unit, _guard) in backlog.drain(..) {
        trace!(label = unit.label, "discarding backlogged unit on shutdown");
    }
    rx.close();
    while let Ok(unit) = rx.try_recv() {
        drop(PendingGuard(pending.clone()));
        trace!(label = unit.label, "discarding queued unit on shutdown");
    }
    debug!("scheduler dispatch loop stopped");
}

async fn run_unit(unit: Unit, guard: PendingGuard, permit: OwnedSemaphorePermit) {
    let _permit = permit;
    let _guard = guard;
    if unit.branch.is_cancelled() {
        trace!(label = unit.label, "discarding unit of cancelled session");
        return;
    }
    if let Err(panic) = AssertUnwindSafe(unit.run).catch_unwind().await {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(label = unit.label, "unit panicked: {reason}");
    }
}
