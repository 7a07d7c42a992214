//! Pipeline statistics
//!
//! Lock-free counters updated on the hot path, read via cheap snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared across intake, dispatch, and workers.
#[derive(Debug, Default)]
pub struct ApplierStats {
    /// Frames received from the bus
    pub frames_received: AtomicU64,
    /// Frames dropped as malformed
    pub decode_errors: AtomicU64,
    /// Transactions committed downstream
    pub txs_applied: AtomicU64,
    /// Empty transactions skipped at intake
    pub txs_skipped: AtomicU64,
    /// Transactions that failed to apply
    pub txs_failed: AtomicU64,
    /// Transactions above the big-tx threshold
    pub big_txs: AtomicU64,
    /// Commit-group barrier advances
    pub groups_advanced: AtomicU64,
    /// Credit-park episodes at intake
    pub credit_parks: AtomicU64,
}

impl ApplierStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_applied(&self) {
        self.txs_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.txs_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.txs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_big_tx(&self) {
        self.big_txs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_group_advance(&self) {
        self.groups_advanced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_credit_park(&self) {
        self.credit_parks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ApplierStatsSnapshot {
        ApplierStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            txs_applied: self.txs_applied.load(Ordering::Relaxed),
            txs_skipped: self.txs_skipped.load(Ordering::Relaxed),
            txs_failed: self.txs_failed.load(Ordering::Relaxed),
            big_txs: self.big_txs.load(Ordering::Relaxed),
            groups_advanced: self.groups_advanced.load(Ordering::Relaxed),
            credit_parks: self.credit_parks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ApplierStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplierStatsSnapshot {
    pub frames_received: u64,
    pub decode_errors: u64,
    pub txs_applied: u64,
    pub txs_skipped: u64,
    pub txs_failed: u64,
    pub big_txs: u64,
    pub groups_advanced: u64,
    pub credit_parks: u64,
}
