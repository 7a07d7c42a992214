//! Applier supervisor
//!
//! Owns the pipeline lifecycle:
//!
//! 1. Start the embedded bus (when not handed an external one) and wait for
//!    readiness within the configured deadline.
//! 2. Open the singleton connection and verify `@@gtid_mode = ON`.
//! 3. Open `worker_count + 1` connections (workers plus one reserve kept for
//!    replacing the first tainted worker connection). Connections are stored
//!    on the supervisor as they open, so a failure later in startup closes
//!    every one of them.
//! 4. Subscribe on the bus.
//! 5. Spawn intake, workers, and the progress/error fan tasks.
//!
//! Shutdown is idempotent: stop intake, close the dispatch queue, join the
//! workers under the drain deadline (stragglers are aborted), close the held
//! connections, stop the embedded bus. The first fatal error on the fan-in
//! channel begins shutdown on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gtid_relay_core::{Gtid, GtidSet};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::apply::TxnApplier;
use crate::bus::{EmbeddedBus, MessageBus};
use crate::config::ApplierConfig;
use crate::credit::CreditGate;
use crate::dispatch::DispatchQueue;
use crate::error::{ApplierError, PipelineError, Result};
use crate::intake::Intake;
use crate::sql::{ConnFactory, SqlConn};
use crate::stats::{ApplierStats, ApplierStatsSnapshot};
use crate::worker::{ReserveConn, Worker};

/// Capacity of the outbound progress and error streams.
const OUTBOUND_BUFFER: usize = 4096;
/// Capacity of the internal fan-in channels.
const INTERNAL_BUFFER: usize = 1024;

/// The transaction apply pipeline.
pub struct Applier {
    inner: Arc<Inner>,
}

struct Inner {
    config: ApplierConfig,
    factory: Arc<dyn ConnFactory>,
    external_bus: Option<Arc<dyn MessageBus>>,
    embedded: Mutex<Option<EmbeddedBus>>,

    credit: Arc<CreditGate>,
    queue: Arc<DispatchQueue>,
    stats: Arc<ApplierStats>,
    executed: Arc<Mutex<GtidSet>>,

    /// Prototype senders the tasks clone; taking them at shutdown ends the
    /// fan tasks.
    progress_tx: Mutex<Option<mpsc::Sender<Gtid>>>,
    errors_tx: Mutex<Option<mpsc::Sender<PipelineError>>>,
    progress_out: Mutex<Option<mpsc::Receiver<Gtid>>>,
    errors_out: Mutex<Option<mpsc::Receiver<PipelineError>>>,
    progress_out_tx: mpsc::Sender<Gtid>,
    errors_out_tx: mpsc::Sender<PipelineError>,

    intake_shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    started: AtomicBool,
    shutdown_started: AtomicBool,

    singleton: tokio::sync::Mutex<Option<Box<dyn SqlConn>>>,
    reserve: ReserveConn,
    /// Worker connections between open and hand-off to the worker tasks;
    /// whatever is still here when startup fails gets closed by rollback.
    worker_conns: tokio::sync::Mutex<Vec<Box<dyn SqlConn>>>,

    intake_task: Mutex<Option<JoinHandle<()>>>,
    worker_tasks: Mutex<Vec<JoinHandle<()>>>,
    fan_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Applier {
    /// Build an applier against an externally managed bus.
    pub fn new(
        config: ApplierConfig,
        factory: Arc<dyn ConnFactory>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self::build(config, factory, Some(bus))
    }

    /// Build an applier that starts its own embedded bus on
    /// [`start`](Self::start).
    pub fn embedded(config: ApplierConfig, factory: Arc<dyn ConnFactory>) -> Self {
        Self::build(config, factory, None)
    }

    fn build(
        config: ApplierConfig,
        factory: Arc<dyn ConnFactory>,
        external_bus: Option<Arc<dyn MessageBus>>,
    ) -> Self {
        let stats = Arc::new(ApplierStats::new());
        let (progress_out_tx, progress_out) = mpsc::channel(OUTBOUND_BUFFER);
        let (errors_out_tx, errors_out) = mpsc::channel(OUTBOUND_BUFFER);

        Self {
            inner: Arc::new(Inner {
                credit: Arc::new(CreditGate::new(config.memory_limit)),
                queue: Arc::new(DispatchQueue::new(config.dispatch_capacity, stats.clone())),
                stats,
                executed: Arc::new(Mutex::new(GtidSet::new())),
                progress_tx: Mutex::new(None),
                errors_tx: Mutex::new(None),
                progress_out: Mutex::new(Some(progress_out)),
                errors_out: Mutex::new(Some(errors_out)),
                progress_out_tx,
                errors_out_tx,
                intake_shutdown: Arc::new(Notify::new()),
                stopping: Arc::new(AtomicBool::new(false)),
                started: AtomicBool::new(false),
                shutdown_started: AtomicBool::new(false),
                singleton: tokio::sync::Mutex::new(None),
                reserve: Arc::new(tokio::sync::Mutex::new(None)),
                worker_conns: tokio::sync::Mutex::new(Vec::new()),
                intake_task: Mutex::new(None),
                worker_tasks: Mutex::new(Vec::new()),
                fan_tasks: Mutex::new(Vec::new()),
                embedded: Mutex::new(None),
                external_bus,
                factory,
                config,
            }),
        }
    }

    /// Run the startup sequence. Returns once the pipeline is live.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.inner.clone().start_inner().await {
            // Roll back whatever came up before the failure, including
            // worker connections not yet handed to a worker task.
            self.inner.started.store(false, Ordering::SeqCst);
            self.inner.close_connections().await;
            if let Some(bus) = self.inner.embedded.lock().take() {
                bus.stop();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Take the stream of committed GTIDs (once).
    pub fn take_progress(&self) -> Option<mpsc::Receiver<Gtid>> {
        self.inner.progress_out.lock().take()
    }

    /// Take the stream of pipeline errors (once).
    pub fn take_errors(&self) -> Option<mpsc::Receiver<PipelineError>> {
        self.inner.errors_out.lock().take()
    }

    /// Handle on the embedded bus, available after [`start`](Self::start)
    /// when no external bus was supplied. Deployments colocating the
    /// extractor publish through this.
    pub fn embedded_bus(&self) -> Option<EmbeddedBus> {
        self.inner.embedded.lock().clone()
    }

    /// Snapshot of the GTID set committed by this pipeline so far.
    pub fn executed_set(&self) -> GtidSet {
        self.inner.executed.lock().clone()
    }

    pub fn stats(&self) -> ApplierStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Current credit balance; equals the configured limit at quiescence.
    pub fn credit_balance(&self) -> i64 {
        self.inner.credit.balance()
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Graceful, idempotent shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }
}

impl Inner {
    async fn start_inner(self: Arc<Self>) -> Result<()> {
        self.config.validate()?;
        info!(
            workers = self.config.worker_count,
            subject = %self.config.subject,
            "starting applier"
        );

        // 1. Bus first; nothing downstream matters if it cannot come up.
        let bus: Arc<dyn MessageBus> = match &self.external_bus {
            Some(bus) => Arc::clone(bus),
            None => {
                let bus = EmbeddedBus::start((&self.config).into()).await?;
                *self.embedded.lock() = Some(bus.clone());
                Arc::new(bus)
            }
        };

        // 2. Singleton connection and preflight.
        let mut singleton = self.factory.connect().await?;
        let mode = singleton
            .query_scalar("SELECT @@gtid_mode")
            .await?
            .ok_or_else(|| ApplierError::preflight("server did not report @@gtid_mode"))?;
        if !mode.eq_ignore_ascii_case("ON") {
            let _ = singleton.close().await;
            return Err(ApplierError::preflight(format!(
                "gtid_mode must be ON, found {mode}"
            )));
        }
        *self.singleton.lock().await = Some(singleton);

        // 3. Worker connections plus the reserve.
        for _ in 0..self.config.worker_count {
            let conn = self.factory.connect().await?;
            self.worker_conns.lock().await.push(conn);
        }
        *self.reserve.lock().await = Some(self.factory.connect().await?);

        // 4. Subscribe before workers exist; the queue buffers the head.
        let sub = bus.subscribe(&self.config.subject).await?;

        // 5. Channels and the task set.
        let (progress_tx, progress_rx) = mpsc::channel(INTERNAL_BUFFER);
        let (errors_tx, errors_rx) = mpsc::channel(INTERNAL_BUFFER);
        *self.progress_tx.lock() = Some(progress_tx.clone());
        *self.errors_tx.lock() = Some(errors_tx.clone());
        self.spawn_fan_tasks(progress_rx, errors_rx);

        let intake = Intake {
            sub,
            queue: self.queue.clone(),
            credit: self.credit.clone(),
            errors: errors_tx.clone(),
            stats: self.stats.clone(),
            shutdown: self.intake_shutdown.clone(),
            stopping: self.stopping.clone(),
            big_tx_threshold: self.config.big_tx_threshold,
            wait_time: self.config.wait_time,
            max_wait_time: self.config.max_wait_time,
        };
        *self.intake_task.lock() = Some(tokio::spawn(intake.run()));

        let conns = std::mem::take(&mut *self.worker_conns.lock().await);
        let mut workers = self.worker_tasks.lock();
        for (id, conn) in conns.into_iter().enumerate() {
            let worker = Worker {
                id,
                applier: TxnApplier::new(conn),
                queue: self.queue.clone(),
                credit: self.credit.clone(),
                progress: progress_tx.clone(),
                errors: errors_tx.clone(),
                stats: self.stats.clone(),
                reserve: self.reserve.clone(),
                factory: self.factory.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        drop(workers);

        info!("applier started");
        Ok(())
    }

    fn spawn_fan_tasks(
        self: &Arc<Self>,
        mut progress_rx: mpsc::Receiver<Gtid>,
        mut errors_rx: mpsc::Receiver<PipelineError>,
    ) {
        let mut fan = self.fan_tasks.lock();

        // Progress fan-out: merge into the executed set, forward to the
        // caller's stream. Forwarding never blocks the workers; a full or
        // untaken outbound stream drops the forwarded copy only.
        let executed = self.executed.clone();
        let out = self.progress_out_tx.clone();
        fan.push(tokio::spawn(async move {
            while let Some(gtid) = progress_rx.recv().await {
                executed.lock().add_gtid(&gtid);
                let _ = out.try_send(gtid);
            }
            debug!("progress fan-out finished");
        }));

        // Error fan-in: classify, forward, and begin shutdown on the first
        // fatal error.
        let inner = Arc::clone(self);
        let out = self.errors_out_tx.clone();
        fan.push(tokio::spawn(async move {
            while let Some(pe) = errors_rx.recv().await {
                if pe.is_fatal() {
                    error!(origin = %pe.origin, error = %pe.error, "fatal pipeline error");
                    let first = !inner.stopping.load(Ordering::Acquire);
                    let _ = out.try_send(pe);
                    if first {
                        inner.begin_shutdown();
                    }
                } else {
                    warn!(origin = %pe.origin, error = %pe.error, "pipeline error");
                    let _ = out.try_send(pe);
                }
            }
            debug!("error fan-in finished");
        }));
    }

    /// Signal-only shutdown: stop accepting frames and let the queue drain.
    /// Safe to call from the fan tasks.
    fn begin_shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.intake_shutdown.notify_one();
        self.queue.close();
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) || self.shutdown_started.swap(true, Ordering::SeqCst)
        {
            return Ok(());
        }
        info!("shutting down applier");
        let deadline = Instant::now() + self.config.shutdown_timeout;

        // Close the subscription side first.
        self.stopping.store(true, Ordering::Release);
        self.intake_shutdown.notify_one();
        if let Some(handle) = self.intake_task.lock().take() {
            join_until(handle, deadline, "intake").await;
        }

        // Workers drain the closed queue and exit; joining under the
        // deadline is the drain wait, and stragglers past it are aborted.
        self.queue.close();
        for handle in std::mem::take(&mut *self.worker_tasks.lock()) {
            join_until(handle, deadline, "worker").await;
        }

        // Closing the prototype senders ends the fan tasks.
        self.progress_tx.lock().take();
        self.errors_tx.lock().take();
        for handle in std::mem::take(&mut *self.fan_tasks.lock()) {
            join_until(handle, deadline + Duration::from_secs(1), "fan task").await;
        }

        self.close_connections().await;
        if let Some(bus) = self.embedded.lock().take() {
            bus.stop();
        }

        info!("applier shut down");
        Ok(())
    }

    /// Close every connection the supervisor still holds: un-handed worker
    /// connections, the reserve, and the singleton.
    async fn close_connections(&self) {
        for mut conn in self.worker_conns.lock().await.drain(..) {
            let _ = conn.close().await;
        }
        if let Some(mut conn) = self.reserve.lock().await.take() {
            let _ = conn.close().await;
        }
        if let Some(mut conn) = self.singleton.lock().await.take() {
            let _ = conn.close().await;
        }
    }
}

async fn join_until(mut handle: JoinHandle<()>, deadline: Instant, what: &str) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match tokio::time::timeout(remaining, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task = what, error = %e, "task panicked"),
        Err(_) => {
            warn!(task = what, "task did not stop before the deadline, aborting");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, EmbeddedBus};
    use crate::config::StoreType;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct NoServerFactory;

    #[async_trait]
    impl ConnFactory for NoServerFactory {
        async fn connect(&self) -> Result<Box<dyn SqlConn>> {
            Err(ApplierError::sql("Lost connection to MySQL server"))
        }
    }

    /// Counts opens and closes; optionally fails after a number of opens.
    struct CountingFactory {
        gtid_mode: &'static str,
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        fail_after: Option<usize>,
    }

    struct CountingConn {
        gtid_mode: &'static str,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SqlConn for CountingConn {
        async fn exec(&mut self, _stmt: &str) -> Result<()> {
            Ok(())
        }

        async fn query_scalar(&mut self, _stmt: &str) -> Result<Option<String>> {
            Ok(Some(self.gtid_mode.to_string()))
        }

        async fn ping(&mut self) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ConnFactory for CountingFactory {
        async fn connect(&self) -> Result<Box<dyn SqlConn>> {
            let opened = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_after.is_some_and(|n| opened > n) {
                return Err(ApplierError::sql("Lost connection to MySQL server"));
            }
            Ok(Box::new(CountingConn {
                gtid_mode: self.gtid_mode,
                closed: self.closed.clone(),
            }))
        }
    }

    fn config() -> ApplierConfig {
        ApplierConfig::builder()
            .conn_url("mysql://root:pw@127.0.0.1:3306/")
            .subject("tx")
            .worker_count(2)
            .build()
    }

    async fn test_bus() -> Arc<dyn MessageBus> {
        let bus = EmbeddedBus::start(BusConfig {
            addr: "127.0.0.1:0".to_string(),
            store: StoreType::Memory,
            filestore_dir: None,
            connect_wait: Duration::from_secs(5),
        })
        .await
        .unwrap();
        Arc::new(bus)
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let bus = test_bus().await;
        let mut bad = config();
        bad.subject.clear();
        let factory = Arc::new(CountingFactory {
            gtid_mode: "ON",
            opened: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            fail_after: None,
        });
        let applier = Applier::new(bad, factory, bus);
        assert!(matches!(applier.start().await, Err(ApplierError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_fails_when_database_unreachable() {
        let bus = test_bus().await;
        let applier = Applier::new(config(), Arc::new(NoServerFactory), bus);
        assert!(applier.start().await.is_err());
        assert!(!applier.is_running());
    }

    #[tokio::test]
    async fn test_preflight_requires_gtid_mode_on() {
        let bus = test_bus().await;
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let applier = Applier::new(
            config(),
            Arc::new(CountingFactory {
                gtid_mode: "OFF",
                opened: opened.clone(),
                closed: closed.clone(),
                fail_after: None,
            }),
            bus,
        );
        match applier.start().await {
            Err(ApplierError::Preflight(msg)) => assert!(msg.contains("OFF")),
            other => panic!("expected preflight failure, got {other:?}"),
        }
        // The singleton was the only connection opened, and it was closed.
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_startup_closes_opened_connections() {
        let bus = test_bus().await;
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        // Singleton and both worker connections open, the reserve fails.
        let applier = Applier::new(
            config(),
            Arc::new(CountingFactory {
                gtid_mode: "ON",
                opened: opened.clone(),
                closed: closed.clone(),
                fail_after: Some(3),
            }),
            bus,
        );
        assert!(applier.start().await.is_err());
        assert_eq!(opened.load(Ordering::SeqCst), 4);
        assert_eq!(closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let bus = test_bus().await;
        let applier = Applier::new(
            config(),
            Arc::new(CountingFactory {
                gtid_mode: "ON",
                opened: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicUsize::new(0)),
                fail_after: None,
            }),
            bus,
        );
        applier.shutdown().await.unwrap();
        applier.shutdown().await.unwrap();
    }
}
