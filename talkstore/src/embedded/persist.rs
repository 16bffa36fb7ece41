//! Collection files and the debounced write buffer.
//!
//! ```text
//! mutation ──Dirty(c)──▶ writer task ──(quiet for `debounce`)──▶ flush all dirty
//!                                     ──(10 × `debounce` since first dirty)──▶ flush all dirty
//! flush()  ──Flush────▶ writer task ──▶ flush now, reply with the result
//! close()  ──Shutdown─▶ writer task ──▶ final flush, exit
//! ```
//!
//! Files are `<data_dir>/<collection>.json`, pretty JSON arrays, replaced
//! atomically through a temp file and a rename.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::StoreData;
use crate::collection::Collection;
use crate::constants::EMBEDDED_SAVE_DELAY_WINDOWS_MAX;
use crate::document::Document;
use crate::dst::FaultInjector;
use crate::error::{StorageError, StorageResult};

// =============================================================================
// Files
// =============================================================================

/// Path of a collection file.
pub(crate) fn collection_path(dir: &Path, collection: Collection) -> PathBuf {
    dir.join(format!("{}.json", collection.as_str()))
}

/// Load a collection file, creating an empty one when absent.
pub(crate) async fn read_collection_file(
    dir: &Path,
    collection: Collection,
    faults: &FaultInjector,
) -> StorageResult<Vec<Document>> {
    if let Some(fault) = faults.should_inject("disk_read") {
        return Err(fault.to_error("disk_read"));
    }

    let path = collection_path(dir, collection);
    match tokio::fs::read(&path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            StorageError::serialization(format!("malformed {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::write(&path, b"[]").await?;
            tracing::debug!(path = %path.display(), "created empty collection file");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// Replace a collection file atomically.
pub(crate) async fn write_collection_file(
    dir: &Path,
    collection: Collection,
    docs: &[Document],
    faults: &FaultInjector,
) -> StorageResult<()> {
    if let Some(fault) = faults.should_inject("disk_write") {
        return Err(fault.to_error("disk_write"));
    }

    let bytes = serde_json::to_vec_pretty(docs)?;
    let path = collection_path(dir, collection);
    let tmp = dir.join(format!("{}.json.tmp", collection.as_str()));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

// =============================================================================
// WriteBuffer
// =============================================================================

#[derive(Debug)]
enum Command {
    Dirty(Collection),
    Flush(oneshot::Sender<StorageResult<()>>),
    Shutdown(oneshot::Sender<StorageResult<()>>),
}

/// Counters shared between the store and its writer task.
#[derive(Debug, Default)]
pub(crate) struct WriterStats {
    /// Collections waiting to be written
    pub(crate) pending: AtomicUsize,
    /// Flushes that wrote at least one collection
    pub(crate) flushes: AtomicU64,
}

/// Handle to the background writer task.
#[derive(Debug)]
pub(crate) struct WriteBuffer {
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl WriteBuffer {
    pub(crate) fn spawn(
        dir: PathBuf,
        debounce: Duration,
        data: Arc<RwLock<StoreData>>,
        faults: Arc<FaultInjector>,
        stats: Arc<WriterStats>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Writer {
            dir,
            debounce,
            data,
            faults,
            stats,
            dirty: BTreeSet::new(),
        };
        let task = tokio::spawn(writer.run(rx));
        Self { tx, task }
    }

    /// Record a mutation; (re)arms the debounce deadline.
    pub(crate) fn mark_dirty(&self, collection: Collection) {
        if self.tx.send(Command::Dirty(collection)).is_err() {
            tracing::warn!(collection = %collection, "write buffer stopped, change not queued");
        }
    }

    pub(crate) fn flusher(&self) -> Flusher {
        Flusher {
            tx: self.tx.clone(),
        }
    }

    /// Final flush, then stop the task.
    pub(crate) async fn shutdown(self) -> StorageResult<()> {
        let (reply, result) = oneshot::channel();
        let outcome = if self.tx.send(Command::Shutdown(reply)).is_ok() {
            result
                .await
                .unwrap_or_else(|_| Err(StorageError::internal("writer task dropped reply")))
        } else {
            Err(StorageError::internal("writer task already stopped"))
        };
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "writer task panicked");
        }
        outcome
    }
}

/// Sender for explicit flushes, usable without holding the store's locks.
#[derive(Debug, Clone)]
pub(crate) struct Flusher {
    tx: mpsc::UnboundedSender<Command>,
}

impl Flusher {
    pub(crate) async fn flush(&self) -> StorageResult<()> {
        let (reply, result) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .map_err(|_| StorageError::internal("writer task stopped"))?;
        result
            .await
            .map_err(|_| StorageError::internal("writer task dropped reply"))?
    }
}

struct Writer {
    dir: PathBuf,
    debounce: Duration,
    data: Arc<RwLock<StoreData>>,
    faults: Arc<FaultInjector>,
    stats: Arc<WriterStats>,
    dirty: BTreeSet<Collection>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut deadline: Option<Instant> = None;
        // Set by the first mutation after a flush; bounds how far `deadline` moves.
        let mut first_dirty: Option<Instant> = None;

        loop {
            let command = match deadline {
                Some(at) => tokio::select! {
                    command = rx.recv() => command,
                    () = tokio::time::sleep_until(at) => {
                        deadline = None;
                        first_dirty = None;
                        // Failures are logged; the collection stays dirty.
                        let _ = self.flush().await;
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            match command {
                Some(Command::Dirty(collection)) => {
                    self.dirty.insert(collection);
                    self.stats.pending.store(self.dirty.len(), Ordering::Release);
                    let now = Instant::now();
                    let latest = *first_dirty.get_or_insert(now)
                        + self.debounce * EMBEDDED_SAVE_DELAY_WINDOWS_MAX;
                    deadline = Some((now + self.debounce).min(latest));
                }
                Some(Command::Flush(reply)) => {
                    deadline = None;
                    first_dirty = None;
                    let _ = reply.send(self.flush().await);
                }
                Some(Command::Shutdown(reply)) => {
                    let _ = reply.send(self.flush().await);
                    return;
                }
                None => {
                    let _ = self.flush().await;
                    return;
                }
            }
        }
    }

    /// Write every dirty collection; the first failure is returned.
    async fn flush(&mut self) -> StorageResult<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        let mut written = 0usize;
        for collection in self.dirty.clone() {
            let docs = self.data.read().snapshot(collection);
            match write_collection_file(&self.dir, collection, &docs, &self.faults).await {
                Ok(()) => {
                    self.dirty.remove(&collection);
                    written += 1;
                }
                Err(e) => {
                    tracing::error!(collection = %collection, error = %e, "failed to save collection");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.stats.pending.store(self.dirty.len(), Ordering::Release);
        if written > 0 {
            self.stats.flushes.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(collections = written, "flushed collections");
        }
        first_error.map_or(Ok(()), Err)
    }
}
