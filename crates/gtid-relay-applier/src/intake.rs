//! Subscription intake
//!
//! Consumes frames from the bus subscription, decodes them, accounts credit,
//! and hands transactions to the dispatch queue. Decode failures drop the
//! frame and surface an error; they never stop the pipeline. When a debit
//! leaves the credit balance negative, the intake parks with exponential
//! backoff before accepting further frames - the already-debited transaction
//! still proceeds, so a frame larger than the whole limit is eventually
//! applied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gtid_relay_core::decode;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::bus::Subscription;
use crate::credit::CreditGate;
use crate::dispatch::DispatchQueue;
use crate::error::{ApplierError, PipelineError};
use crate::stats::ApplierStats;

pub(crate) struct Intake {
    pub sub: Subscription,
    pub queue: Arc<DispatchQueue>,
    pub credit: Arc<CreditGate>,
    pub errors: mpsc::Sender<PipelineError>,
    pub stats: Arc<ApplierStats>,
    pub shutdown: Arc<Notify>,
    pub stopping: Arc<AtomicBool>,
    pub big_tx_threshold: u64,
    pub wait_time: Duration,
    pub max_wait_time: Duration,
}

impl Intake {
    pub async fn run(mut self) {
        info!("intake started");
        loop {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = self.shutdown.notified() => break,
                msg = self.sub.recv() => match msg {
                    Some(payload) => {
                        if !self.handle(payload).await {
                            break;
                        }
                    }
                    None => {
                        if !self.stopping.load(Ordering::Acquire) {
                            let _ = self
                                .errors
                                .send(PipelineError::intake(ApplierError::bus(
                                    "subscription closed unexpectedly",
                                )))
                                .await;
                        }
                        break;
                    }
                },
            }
        }
        self.sub.close();
        info!("intake stopped");
    }

    /// Process one frame; returns false when the pipeline is shutting down.
    async fn handle(&mut self, payload: Bytes) -> bool {
        self.stats.record_frame();

        let txn = match decode(&payload) {
            Ok(txn) => txn,
            Err(e) => {
                self.stats.record_decode_error();
                warn!(error = %e, bytes = payload.len(), "dropping malformed frame");
                let _ = self.errors.send(PipelineError::intake(e.into())).await;
                return true;
            }
        };

        if txn.event_size > self.big_tx_threshold {
            self.stats.record_big_tx();
            warn!(
                gtid = %txn.gtid,
                size = txn.event_size,
                threshold = self.big_tx_threshold,
                "large transaction"
            );
        }

        let post_balance = self.credit.debit(txn.event_size);

        if txn.is_empty() {
            self.credit.credit(txn.event_size);
            self.stats.record_skipped();
            debug!(gtid = %txn.gtid, "skipping empty transaction");
        } else {
            let size = txn.event_size;
            if self.queue.send(txn).await.is_err() {
                // Queue closed mid-shutdown; the transaction is dropped, so
                // its credit comes back.
                self.credit.credit(size);
                return false;
            }
        }

        if post_balance < 0 {
            self.park().await;
        }
        true
    }

    /// Sleep with exponential backoff until the credit balance returns
    /// non-negative, honoring shutdown promptly.
    async fn park(&self) {
        self.stats.record_credit_park();
        let mut wait = self.wait_time;
        while self.credit.is_exhausted() {
            if self.stopping.load(Ordering::Acquire) {
                return;
            }
            debug!(balance = self.credit.balance(), wait = ?wait, "credit exhausted, parking");
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            wait = (wait * 2).min(self.max_wait_time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtid_relay_core::{encode, Transaction};
    use tokio::sync::mpsc;

    fn txn(gno: u64, queries: &[&str], size: u64) -> Transaction {
        Transaction {
            gtid: format!("11111111-1111-1111-1111-111111111111:{gno}"),
            fde: String::new(),
            queries: queries.iter().map(|q| q.to_string()).collect(),
            event_size: size,
            last_committed: None,
        }
    }

    struct Harness {
        feed: mpsc::Sender<Bytes>,
        queue: Arc<DispatchQueue>,
        credit: Arc<CreditGate>,
        errors: mpsc::Receiver<PipelineError>,
        stats: Arc<ApplierStats>,
        shutdown: Arc<Notify>,
        stopping: Arc<AtomicBool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn harness(limit: u64) -> Harness {
        let (feed, rx) = mpsc::channel(64);
        let (err_tx, errors) = mpsc::channel(64);
        let stats = Arc::new(ApplierStats::new());
        let queue = Arc::new(DispatchQueue::new(100, stats.clone()));
        let credit = Arc::new(CreditGate::new(limit));
        let shutdown = Arc::new(Notify::new());
        let stopping = Arc::new(AtomicBool::new(false));

        let intake = Intake {
            sub: Subscription::new(rx),
            queue: queue.clone(),
            credit: credit.clone(),
            errors: err_tx,
            stats: stats.clone(),
            shutdown: shutdown.clone(),
            stopping: stopping.clone(),
            big_tx_threshold: 1024,
            wait_time: Duration::from_millis(1),
            max_wait_time: Duration::from_millis(10),
        };
        let task = tokio::spawn(intake.run());

        Harness {
            feed,
            queue,
            credit,
            errors,
            stats,
            shutdown,
            stopping,
            task,
        }
    }

    #[tokio::test]
    async fn test_decodes_and_dispatches() {
        let mut h = harness(1000);
        let frame = encode(&txn(1, &["INSERT 1"], 100)).unwrap();
        h.feed.send(Bytes::from(frame)).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), h.queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.event_size, 100);
        assert_eq!(h.credit.balance(), 900);
        h.queue.complete();

        h.stopping.store(true, Ordering::Release);
        h.shutdown.notify_one();
        h.task.await.unwrap();
        assert!(h.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_isolated() {
        let mut h = harness(1000);
        h.feed
            .send(Bytes::from_static(b"\x00\x01garbage"))
            .await
            .unwrap();
        h.feed
            .send(Bytes::from(encode(&txn(2, &["INSERT 2"], 50)).unwrap()))
            .await
            .unwrap();

        // The valid frame behind the bad one still arrives.
        let got = tokio::time::timeout(Duration::from_secs(1), h.queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.event_size, 50);
        h.queue.complete();

        let err = tokio::time::timeout(Duration::from_secs(1), h.errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err.error, ApplierError::Codec(_)));
        assert!(!err.is_fatal());
        assert_eq!(h.stats.snapshot().decode_errors, 1);

        h.stopping.store(true, Ordering::Release);
        h.shutdown.notify_one();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_transaction_skipped_and_credit_returned() {
        let h = harness(1000);
        h.feed
            .send(Bytes::from(encode(&txn(3, &[], 400)).unwrap()))
            .await
            .unwrap();

        // Wait for the skip to be recorded.
        tokio::time::timeout(Duration::from_secs(1), async {
            while h.stats.snapshot().txs_skipped == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(h.credit.balance(), 1000);
        assert!(h.queue.is_empty());

        h.stopping.store(true, Ordering::Release);
        h.shutdown.notify_one();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_parks_while_credit_negative() {
        let h = harness(100);
        // 150 > limit: accepted, balance goes negative, intake parks.
        h.feed
            .send(Bytes::from(encode(&txn(1, &["BIG"], 150)).unwrap()))
            .await
            .unwrap();
        h.feed
            .send(Bytes::from(encode(&txn(2, &["NEXT"], 10)).unwrap()))
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), h.queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.event_size, 150);

        // While parked, the second frame must not be decoded/dispatched.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.queue.is_empty());
        assert!(h.stats.snapshot().credit_parks >= 1);

        // Committing the big transaction releases the intake.
        h.credit.credit(150);
        h.queue.complete();
        let second = tokio::time::timeout(Duration::from_secs(1), h.queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.event_size, 10);
        h.queue.complete();

        h.stopping.store(true, Ordering::Release);
        h.shutdown.notify_one();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_big_transaction_is_counted() {
        let h = harness(1_000_000);
        h.feed
            .send(Bytes::from(encode(&txn(1, &["HUGE"], 4096)).unwrap()))
            .await
            .unwrap();

        let _ = tokio::time::timeout(Duration::from_secs(1), h.queue.recv())
            .await
            .unwrap()
            .unwrap();
        h.queue.complete();
        assert_eq!(h.stats.snapshot().big_txs, 1);

        h.stopping.store(true, Ordering::Release);
        h.shutdown.notify_one();
        h.task.await.unwrap();
    }
}
