//! Bounded dispatch with commit-group gating
//!
//! A single producer (intake) feeds competing consumers (workers) through a
//! bounded channel whose receiver is shared behind a mutex. Dequeue passes a
//! commit-group barrier: transactions sharing an upstream `last_committed`
//! value replay in parallel, while a transaction from a strictly later group
//! is withheld until every in-flight transaction of earlier groups has
//! finished (committed or failed). Late redeliveries of earlier groups pass
//! ungated and rely on GTID idempotence downstream.
//!
//! `close()` drops the producer side; `recv()` then drains what is buffered
//! and returns `None`, which is the workers' graceful-exit signal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gtid_relay_core::Transaction;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

use crate::error::{ApplierError, Result};
use crate::stats::ApplierStats;

/// Bounded single-producer multi-consumer handoff between intake and the
/// worker pool.
pub struct DispatchQueue {
    tx: Mutex<Option<mpsc::Sender<Transaction>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Transaction>>,
    barrier: GroupBarrier,
    pending: AtomicUsize,
}

impl DispatchQueue {
    pub fn new(capacity: usize, stats: Arc<ApplierStats>) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            barrier: GroupBarrier::new(stats),
            pending: AtomicUsize::new(0),
        }
    }

    /// Enqueue a transaction; blocks while the queue is at capacity, which
    /// is how worker backpressure reaches the intake.
    pub async fn send(&self, txn: Transaction) -> Result<()> {
        let sender = self.tx.lock().clone().ok_or(ApplierError::Shutdown)?;
        sender.send(txn).await.map_err(|_| ApplierError::Shutdown)?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Dequeue the next transaction, honoring the commit-group barrier.
    /// Returns `None` once the queue is closed and drained.
    ///
    /// The receiver lock is held across the barrier wait on purpose: a
    /// withheld head-of-queue transaction withholds everything behind it,
    /// preserving FIFO handoff across groups.
    pub async fn recv(&self) -> Option<Transaction> {
        let mut rx = self.rx.lock().await;
        let txn = rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.barrier.enter(txn.last_committed).await;
        Some(txn)
    }

    /// Mark the transaction taken by the last successful `recv` as finished
    /// (committed or failed), releasing the barrier.
    pub fn complete(&self) {
        self.barrier.leave();
    }

    /// Stop accepting new transactions; buffered ones still drain.
    pub fn close(&self) {
        *self.tx.lock() = None;
    }

    /// Transactions buffered but not yet handed to a worker.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transactions handed to workers and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.barrier.active()
    }
}

/// Barrier enforcing happens-before between commit groups.
struct GroupBarrier {
    state: Mutex<BarrierState>,
    wakeup: Notify,
    stats: Arc<ApplierStats>,
}

#[derive(Debug, Default)]
struct BarrierState {
    /// Highest group admitted so far
    current: Option<i64>,
    /// Transactions admitted and not yet finished
    active: usize,
}

impl GroupBarrier {
    fn new(stats: Arc<ApplierStats>) -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            wakeup: Notify::new(),
            stats,
        }
    }

    /// Admit a transaction of group `group`. Transactions without a group
    /// join the current one ungated; a strictly later group waits until the
    /// in-flight count drains to zero, then advances.
    async fn enter(&self, group: Option<i64>) {
        loop {
            let wakeup = self.wakeup.notified();
            tokio::pin!(wakeup);
            // Register interest before checking state so a `leave` between
            // the check and the await cannot be lost.
            wakeup.as_mut().enable();

            {
                let mut state = self.state.lock();
                let admitted = match (group, state.current) {
                    (None, _) | (Some(_), None) => true,
                    (Some(g), Some(current)) => g <= current || state.active == 0,
                };
                if admitted {
                    if let Some(g) = group {
                        if state.current.map_or(true, |current| g > current) {
                            trace!(group = g, "commit group advanced");
                            state.current = Some(g);
                            self.stats.record_group_advance();
                        }
                    }
                    state.active += 1;
                    return;
                }
            }

            wakeup.await;
        }
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            drop(state);
            self.wakeup.notify_waiters();
        }
    }

    fn active(&self) -> usize {
        self.state.lock().active
    }
}
