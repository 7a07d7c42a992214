//! Message bus transport
//!
//! The pipeline treats the bus as an opaque at-least-once pub/sub transport
//! behind the [`MessageBus`] trait. [`EmbeddedBus`] is the in-process broker
//! used by single-binary deployments: it claims its configured address at
//! startup (so a misconfigured or occupied port fails preflight inside the
//! readiness deadline), retains published messages for redelivery, and with
//! [`StoreType::File`] persists them to a per-subject append-only log that
//! is replayed to new subscriptions after a restart.
//!
//! Delivery is at-least-once; ordering across a restart replay is not
//! guaranteed and is not required by the applier.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ApplierConfig, StoreType};
use crate::error::{ApplierError, Result};

/// Capacity of each subscriber channel; publishers await when a subscriber
/// lags this far behind.
const SUBSCRIBER_BUFFER: usize = 1024;

/// Opaque at-least-once pub/sub transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription>;
}

/// Handle on one subject subscription. Dropping it (or calling `close`)
/// detaches from the bus.
pub struct Subscription {
    rx: mpsc::Receiver<Bytes>,
    closer: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wrap a raw receiver; used by bus implementations and test doubles.
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx, closer: None }
    }

    pub fn with_closer(rx: mpsc::Receiver<Bytes>, closer: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            rx,
            closer: Some(Box::new(closer)),
        }
    }

    /// Receive the next message; `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Configuration for [`EmbeddedBus::start`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub addr: String,
    pub store: StoreType,
    pub filestore_dir: Option<PathBuf>,
    pub connect_wait: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:4222".to_string(),
            store: StoreType::Memory,
            filestore_dir: None,
            connect_wait: Duration::from_secs(10),
        }
    }
}

impl From<&ApplierConfig> for BusConfig {
    fn from(config: &ApplierConfig) -> Self {
        Self {
            addr: config.bus_addr.clone(),
            store: config.store_type,
            filestore_dir: config.filestore_dir.clone(),
            connect_wait: config.connect_wait,
        }
    }
}

struct SubEntry {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

#[derive(Default)]
struct Topic {
    retained: Vec<Bytes>,
    subs: Vec<SubEntry>,
}

struct BusInner {
    topics: Mutex<HashMap<String, Topic>>,
    stores: Mutex<HashMap<String, FileStore>>,
    filestore_dir: Option<PathBuf>,
    listener: Mutex<Option<TcpListener>>,
    next_sub_id: AtomicU64,
    stopped: AtomicBool,
}

impl BusInner {
    fn unsubscribe(&self, subject: &str, id: u64) {
        let mut topics = self.topics.lock();
        if let Some(topic) = topics.get_mut(subject) {
            topic.subs.retain(|s| s.id != id);
        }
    }
}

/// In-process pub/sub broker with optional file-backed persistence.
#[derive(Clone)]
pub struct EmbeddedBus {
    inner: Arc<BusInner>,
}

impl EmbeddedBus {
    /// Start the broker: claim the configured address, recover the file
    /// store, and become ready - all within `connect_wait`.
    pub async fn start(config: BusConfig) -> Result<Self> {
        let deadline = config.connect_wait;
        tokio::time::timeout(deadline, Self::start_inner(config))
            .await
            .map_err(|_| {
                ApplierError::timeout(format!("bus not ready within {deadline:?}"))
            })?
    }

    async fn start_inner(config: BusConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.addr)
            .await
            .map_err(|e| ApplierError::bus(format!("cannot claim {}: {e}", config.addr)))?;

        let mut topics = HashMap::new();
        let mut stores = HashMap::new();
        let filestore_dir = match config.store {
            StoreType::File => {
                let dir = config.filestore_dir.ok_or_else(|| {
                    ApplierError::config("filestore_dir is required when store_type is file")
                })?;
                recover_stores(&dir, &mut topics, &mut stores)?;
                Some(dir)
            }
            StoreType::Memory => None,
        };

        info!(
            addr = %config.addr,
            store = %config.store,
            subjects = topics.len(),
            "embedded bus ready"
        );

        Ok(Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(topics),
                stores: Mutex::new(stores),
                filestore_dir,
                listener: Mutex::new(Some(listener)),
                next_sub_id: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Stop the broker: flush stores and release the claimed address.
    /// Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for store in self.inner.stores.lock().values_mut() {
            if let Err(e) = store.flush() {
                warn!(error = %e, "failed to flush bus store");
            }
        }
        self.inner.listener.lock().take();
        self.inner.topics.lock().clear();
        info!("embedded bus stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(ApplierError::bus("bus is stopped"));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for EmbeddedBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.ensure_running()?;

        if let Some(dir) = &self.inner.filestore_dir {
            let mut stores = self.inner.stores.lock();
            let store = match stores.entry(subject.to_string()) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(v) => {
                    let (store, _) = FileStore::open(&store_path(dir, subject))
                        .map_err(|e| ApplierError::bus(format!("store open: {e}")))?;
                    v.insert(store)
                }
            };
            store
                .append(&payload)
                .map_err(|e| ApplierError::bus(format!("store append: {e}")))?;
        }

        let senders: Vec<(u64, mpsc::Sender<Bytes>)> = {
            let mut topics = self.inner.topics.lock();
            let topic = topics.entry(subject.to_string()).or_default();
            topic.retained.push(payload.clone());
            topic.subs.iter().map(|s| (s.id, s.tx.clone())).collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in senders {
            if tx.send(payload.clone()).await.is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            self.inner.unsubscribe(subject, id);
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        self.ensure_running()?;

        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let retained: Vec<Bytes> = {
            let mut topics = self.inner.topics.lock();
            let topic = topics.entry(subject.to_string()).or_default();
            topic.subs.push(SubEntry { id, tx: tx.clone() });
            topic.retained.clone()
        };

        if !retained.is_empty() {
            debug!(subject, count = retained.len(), "replaying retained messages");
            tokio::spawn(async move {
                for msg in retained {
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }

        let inner = Arc::clone(&self.inner);
        let subject = subject.to_string();
        Ok(Subscription::with_closer(rx, move || {
            inner.unsubscribe(&subject, id)
        }))
    }
}

fn store_path(dir: &Path, subject: &str) -> PathBuf {
    let safe: String = subject
        .chars()
        .map(|c| if std::path::is_separator(c) || c == '\0' { '_' } else { c })
        .collect();
    dir.join(format!("{safe}.log"))
}

fn recover_stores(
    dir: &Path,
    topics: &mut HashMap<String, Topic>,
    stores: &mut HashMap<String, FileStore>,
) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| ApplierError::config(format!("cannot create {}: {e}", dir.display())))?;

    for entry in fs::read_dir(dir)
        .map_err(|e| ApplierError::bus(format!("cannot read {}: {e}", dir.display())))?
    {
        let entry = entry.map_err(|e| ApplierError::bus(e.to_string()))?;
        let path = entry.path();
        if path.extension() != Some(std::ffi::OsStr::new("log")) {
            continue;
        }
        let Some(subject) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
            continue;
        };

        let (store, records) =
            FileStore::open(&path).map_err(|e| ApplierError::bus(format!("store recovery: {e}")))?;
        info!(subject, messages = records.len(), "recovered bus store");
        topics.insert(
            subject.clone(),
            Topic {
                retained: records,
                subs: Vec::new(),
            },
        );
        stores.insert(subject, store);
    }
    Ok(())
}

/// Per-subject append-only message log.
///
/// Record layout: `len: u32 LE | crc32: u32 LE | payload`. Recovery stops at
/// the first short or corrupt record and truncates the tail, bounding loss
/// to un-flushed in-flight frames.
struct FileStore {
    writer: BufWriter<File>,
}

impl FileStore {
    fn open(path: &Path) -> std::io::Result<(Self, Vec<Bytes>)> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        let mut offset = 0usize;
        while data.len() - offset >= 8 {
            let len = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            let crc = u32::from_le_bytes([
                data[offset + 4],
                data[offset + 5],
                data[offset + 6],
                data[offset + 7],
            ]);
            let Some(payload) = data.get(offset + 8..offset + 8 + len) else {
                break;
            };
            if crc32fast::hash(payload) != crc {
                break;
            }
            records.push(Bytes::copy_from_slice(payload));
            offset += 8 + len;
        }
        if offset < data.len() {
            warn!(
                path = %path.display(),
                dropped = data.len() - offset,
                "truncating torn tail of bus store"
            );
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(offset as u64)?;
        file.seek(SeekFrom::End(0))?;

        Ok((
            Self {
                writer: BufWriter::new(file),
            },
            records,
        ))
    }

    fn append(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.writer
            .write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&crc32fast::hash(payload).to_le_bytes())?;
        self.writer.write_all(payload)?;
        self.writer.flush()
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
