//! Disk cache with a bounded in-memory key index
//!
//! Values are stored content-addressed: the file name is the MD5 hex of the
//! cache key, sharded two directory levels deep (`c0/ff/c0ffee…`) to bound
//! per-directory entry counts. The live key set is mirrored in a bounded
//! TinyLFU index; when the index evicts a key for capacity, the
//! corresponding file is erased, keeping disk and index in lock-step.
//!
//! Operations can emit events on a bounded channel. Sends never block the
//! foreground operation: on overflow the event is dropped and counted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use md5::{Digest, Md5};
use moka::notification::RemovalCause;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::error::Result;

/// Cache operation described by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Get,
    Set,
    Delete,
}

/// Event emitted after a cache operation.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub op: CacheOp,
    pub key: String,
    pub file: String,
    pub error: Option<String>,
}

/// Content-addressed disk cache whose key set is capped by an in-memory
/// LFU index.
pub struct DiskCache {
    base_dir: PathBuf,
    key_index: moka::sync::Cache<String, ()>,
    events_tx: Option<mpsc::Sender<CacheEvent>>,
    lost_events: AtomicU64,
}

impl DiskCache {
    /// Open (or create) a disk cache rooted at `base_dir`, indexing at most
    /// `capacity` keys.
    pub fn new(base_dir: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        Self::build(base_dir, capacity, None)
    }

    /// Like [`DiskCache::new`], additionally returning the receiving end of
    /// a bounded event channel.
    pub fn with_events(
        base_dir: impl AsRef<Path>,
        capacity: u64,
        channel_size: usize,
    ) -> Result<(Self, mpsc::Receiver<CacheEvent>)> {
        let (tx, rx) = mpsc::channel(channel_size);
        let cache = Self::build(base_dir, capacity, Some(tx))?;
        Ok((cache, rx))
    }

    fn build(
        base_dir: impl AsRef<Path>,
        capacity: u64,
        events_tx: Option<mpsc::Sender<CacheEvent>>,
    ) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;

        let eviction_base = base_dir.clone();
        let key_index = moka::sync::Cache::builder()
            .max_capacity(capacity)
            .eviction_listener(move |file: Arc<String>, _v: (), cause: RemovalCause| {
                // only capacity pressure erases the backing file; explicit
                // removal already did, and a replace keeps the file live
                if cause == RemovalCause::Size {
                    let path = shard_path(&eviction_base, &file);
                    if let Err(e) = std::fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!("failed to erase evicted cache file {path:?}: {e}");
                        }
                    } else {
                        debug!("key index eviction erased {path:?}");
                    }
                }
            })
            .build();

        let cache = DiskCache {
            base_dir,
            key_index,
            events_tx,
            lost_events: AtomicU64::new(0),
        };
        cache.load_keys_from_disk(capacity);
        Ok(cache)
    }

    /// Walk the base directory and seed the key index with existing files,
    /// bounded by capacity so startup cannot trigger an eviction storm.
    fn load_keys_from_disk(&self, capacity: u64) {
        let mut loaded: u64 = 0;
        let mut stack = vec![self.base_dir.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if loaded >= capacity {
                        info!("key index at capacity ({capacity}), remaining files unindexed");
                        return;
                    }
                    self.key_index.insert(name.to_string(), ());
                    loaded += 1;
                }
            }
        }
        info!("loaded {loaded} keys from disk into key index");
    }

    fn emit(&self, op: CacheOp, key: &str, file: &str, error: Option<String>) {
        if let Some(tx) = &self.events_tx {
            let event = CacheEvent {
                op,
                key: key.to_string(),
                file: file.to_string(),
                error,
            };
            if tx.try_send(event).is_err() {
                self.lost_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of events dropped because the channel was full.
    pub fn lost_events(&self) -> u64 {
        self.lost_events.load(Ordering::Relaxed)
    }

    /// Process pending index maintenance (evictions run lazily). Exposed so
    /// tests can observe evictions deterministically.
    pub fn sync_index(&self) {
        self.key_index.run_pending_tasks();
    }

    /// Number of keys currently indexed.
    pub fn indexed_keys(&self) -> u64 {
        self.key_index.entry_count()
    }

    fn path_for(&self, file: &str) -> PathBuf {
        shard_path(&self.base_dir, file)
    }
}

impl Cache for DiskCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let file = key_to_filename(key);
        let result = std::fs::read(self.path_for(&file));
        match result {
            Ok(value) => {
                // record the access so the index keeps hot keys alive
                self.key_index.get(&file);
                self.emit(CacheOp::Get, key, &file, None);
                Some(value)
            }
            Err(_) => {
                self.emit(CacheOp::Get, key, &file, Some("not found".to_string()));
                None
            }
        }
    }

    fn set(&self, key: &str, value: &[u8]) {
        let file = key_to_filename(key);
        let path = self.path_for(&file);
        let write = path
            .parent()
            .map(std::fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| std::fs::write(&path, value));

        match write {
            Ok(()) => {
                self.key_index.insert(file.clone(), ());
                self.emit(CacheOp::Set, key, &file, None);
            }
            Err(e) => {
                warn!("disk cache write failed for {path:?}: {e}");
                self.emit(CacheOp::Set, key, &file, Some(e.to_string()));
            }
        }
    }

    fn delete(&self, key: &str) {
        let file = key_to_filename(key);
        let path = self.path_for(&file);
        let removed = std::fs::remove_file(&path);
        self.key_index.invalidate(&file);
        match removed {
            Ok(()) => self.emit(CacheOp::Delete, key, &file, None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.emit(CacheOp::Delete, key, &file, None)
            }
            Err(e) => {
                warn!("disk cache delete failed for {path:?}: {e}");
                self.emit(CacheOp::Delete, key, &file, Some(e.to_string()));
            }
        }
    }
}

/// MD5-hex file name for a cache key.
fn key_to_filename(key: &str) -> String {
    hex::encode(Md5::digest(key.as_bytes()))
}

/// `c0ffee…` is stored as `c0/ff/c0ffee…`.
fn shard_path(base: &Path, file: &str) -> PathBuf {
    if file.len() >= 4 {
        base.join(&file[0..2]).join(&file[2..4]).join(file)
    } else {
        base.join(file)
    }
}

/// Consume cache events and keep a small secondary LFU over original-image
/// keys (those without an options fragment), deleting them from the cache on
/// eviction. Transformed derivatives are cheap to keep and expensive to
/// recompute, so pressure is biased toward re-fetchable originals.
pub fn spawn_original_evictor(
    cache: Arc<DiskCache>,
    limit: u64,
    mut events: mpsc::Receiver<CacheEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let delete_target = cache.clone();
        let originals = moka::sync::Cache::builder()
            .max_capacity(limit)
            .eviction_listener(move |key: Arc<String>, _v: (), cause: RemovalCause| {
                if cause == RemovalCause::Size {
                    debug!("secondary eviction of original image {key}");
                    delete_target.delete(&key);
                }
            })
            .build();

        while let Some(event) = events.recv().await {
            if event.op == CacheOp::Set && event.error.is_none() && !event.key.contains('#') {
                originals.insert(event.key, ());
                // keep evictions lock-step with inserts
                originals.run_pending_tasks();
            }
        }
    })
}
