//! Byte-credit flow control
//!
//! A signed atomic counter bounds the bytes of decoded transactions that
//! have not yet committed. The intake debits before dispatch and the workers
//! credit after commit (or failure), so at quiescence the balance equals the
//! configured limit.
//!
//! The balance is allowed to go negative: a transaction larger than the
//! whole limit is still accepted, it just blocks acceptance of further
//! frames until enough credit returns.

use std::sync::atomic::{AtomicI64, Ordering};

/// Lock-free byte-credit counter.
#[derive(Debug)]
pub struct CreditGate {
    balance: AtomicI64,
    initial: i64,
}

impl CreditGate {
    pub fn new(limit: u64) -> Self {
        let initial = i64::try_from(limit).unwrap_or(i64::MAX);
        Self {
            balance: AtomicI64::new(initial),
            initial,
        }
    }

    /// Atomically subtract `bytes` and return the post-subtraction balance.
    /// A negative result means the caller must park before accepting more
    /// work; the debited transaction itself still proceeds.
    pub fn debit(&self, bytes: u64) -> i64 {
        let delta = i64::try_from(bytes).unwrap_or(i64::MAX);
        self.balance.fetch_sub(delta, Ordering::AcqRel) - delta
    }

    /// Return credit after a transaction commits, fails, or is skipped.
    pub fn credit(&self, bytes: u64) {
        let delta = i64::try_from(bytes).unwrap_or(i64::MAX);
        self.balance.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn balance(&self) -> i64 {
        self.balance.load(Ordering::Acquire)
    }

    pub fn is_exhausted(&self) -> bool {
        self.balance() < 0
    }

    /// The configured limit; equals the balance at quiescence.
    pub fn initial(&self) -> i64 {
        self.initial
    }
}
