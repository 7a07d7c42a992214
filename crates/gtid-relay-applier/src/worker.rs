//! Apply workers
//!
//! Each worker owns one database connection for its whole life and competes
//! with its siblings on the dispatch queue (blocking receive; transactions
//! of the same commit group interleave freely across workers). On success
//! the worker returns credit and publishes the committed GTID; on failure it
//! reports the error and keeps draining - the supervisor decides whether the
//! pipeline stops. A tainted connection is closed and replaced, first from
//! the supervisor's reserve, otherwise through the factory.

use std::sync::Arc;

use gtid_relay_core::{Gtid, Transaction};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::apply::TxnApplier;
use crate::credit::CreditGate;
use crate::dispatch::DispatchQueue;
use crate::error::PipelineError;
use crate::sql::{ConnFactory, SqlConn};
use crate::stats::ApplierStats;

pub(crate) type ReserveConn = Arc<tokio::sync::Mutex<Option<Box<dyn SqlConn>>>>;

pub(crate) struct Worker {
    pub id: usize,
    pub applier: TxnApplier,
    pub queue: Arc<DispatchQueue>,
    pub credit: Arc<CreditGate>,
    pub progress: mpsc::Sender<Gtid>,
    pub errors: mpsc::Sender<PipelineError>,
    pub stats: Arc<ApplierStats>,
    pub reserve: ReserveConn,
    pub factory: Arc<dyn ConnFactory>,
}

impl Worker {
    pub async fn run(mut self) {
        debug!(worker = self.id, "apply worker started");
        // Graceful exit is the drained queue returning `None`; a worker
        // stuck past the shutdown deadline is aborted by the supervisor.
        while let Some(txn) = self.queue.recv().await {
            if !self.handle(txn).await {
                break;
            }
        }
        if let Err(e) = self.applier.close().await {
            debug!(worker = self.id, error = %e, "error closing worker connection");
        }
        debug!(worker = self.id, "apply worker stopped");
    }

    /// Apply one transaction; returns false when the worker cannot continue
    /// (no replacement connection available).
    async fn handle(&mut self, txn: Transaction) -> bool {
        let size = txn.event_size;
        let mut alive = true;

        match self.applier.apply(&txn).await {
            Ok(gtid) => {
                self.stats.record_applied();
                debug!(worker = self.id, gtid = %gtid, "transaction committed");
                // Publication happens-after the commit above.
                let _ = self.progress.send(gtid).await;
            }
            Err(e) => {
                self.stats.record_failed();
                error!(
                    worker = self.id,
                    gtid = %txn.gtid,
                    error = %e,
                    "failed to apply transaction"
                );
                let tainted = self.applier.is_tainted();
                let _ = self.errors.send(PipelineError::worker(e)).await;
                if tainted {
                    alive = self.replace_conn().await;
                }
            }
        }

        // The transaction is destroyed either way; its credit and barrier
        // slot come back.
        self.credit.credit(size);
        self.queue.complete();
        alive
    }

    async fn replace_conn(&mut self) -> bool {
        if let Some(conn) = self.reserve.lock().await.take() {
            info!(worker = self.id, "replacing tainted connection from reserve");
            if let Err(e) = self.applier.close().await {
                debug!(worker = self.id, error = %e, "error closing tainted connection");
            }
            self.applier.replace(conn);
            return true;
        }

        match self.factory.connect().await {
            Ok(conn) => {
                info!(worker = self.id, "reconnected after taint");
                if let Err(e) = self.applier.close().await {
                    debug!(worker = self.id, error = %e, "error closing tainted connection");
                }
                self.applier.replace(conn);
                true
            }
            Err(e) => {
                warn!(worker = self.id, error = %e, "cannot replace tainted connection, worker exiting");
                let _ = self.errors.send(PipelineError::worker(e)).await;
                false
            }
        }
    }
}
