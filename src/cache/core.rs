//! The process-wide, async disk block cache.
//!
//! Producers call [`BlockCache::write_block_async`], which never blocks on
//! disk I/O itself: it only waits on the `hard_limit` semaphore for a free
//! in-flight slot, then hands the buffer to the active `pending` map and
//! wakes the single writer thread via `blocks_pending`. The writer thread
//! swaps the pending/completed buffer pairs so producers are never blocked
//! behind a drain in progress (REDESIGN FLAG: the original's POSIX-AIO
//! writes with sigval completion callbacks become a detached worker thread
//! per write that posts its result into the inactive `completed` buffer —
//! the producer/consumer contract is unchanged).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::driver::Driver;
use crate::errors::{GatewayError, GwResult};

use super::config::CacheConfig;
use super::key::BlockKey;
use super::metrics::CacheMetrics;
use super::semaphore::CountingSemaphore;

struct PendingWrite {
    data: Arc<Vec<u8>>,
}

struct CompletedWrite {
    key: BlockKey,
    result: GwResult<()>,
}

#[derive(Default)]
struct Side<T> {
    a: Mutex<Vec<T>>,
    b: Mutex<Vec<T>>,
    active_is_b: AtomicBool,
}

impl<T> Side<T> {
    fn active(&self) -> &Mutex<Vec<T>> {
        if self.active_is_b.load(Ordering::Acquire) { &self.b } else { &self.a }
    }

    /// Flips which buffer is active and returns everything that was in the
    /// now-inactive (about to be drained) buffer.
    fn swap_and_take_inactive(&self) -> Vec<T> {
        let was_b = self.active_is_b.fetch_xor(true, Ordering::AcqRel);
        let inactive = if was_b { &self.b } else { &self.a };
        std::mem::take(&mut inactive.lock())
    }
}

#[derive(Default)]
struct PendingMap {
    a: Mutex<HashMap<BlockKey, PendingWrite>>,
    b: Mutex<HashMap<BlockKey, PendingWrite>>,
    active_is_b: AtomicBool,
}

impl PendingMap {
    fn insert(&self, key: BlockKey, data: Arc<Vec<u8>>) {
        let map = if self.active_is_b.load(Ordering::Acquire) { &self.b } else { &self.a };
        map.lock().insert(key, PendingWrite { data });
    }

    fn swap_and_take_inactive(&self) -> HashMap<BlockKey, PendingWrite> {
        let was_b = self.active_is_b.fetch_xor(true, Ordering::AcqRel);
        let inactive = if was_b { &self.b } else { &self.a };
        std::mem::take(&mut inactive.lock())
    }
}

/// The process-wide async disk block cache.
pub struct BlockCache {
    data_root: PathBuf,
    config: CacheConfig,
    driver: Arc<dyn Driver>,
    metrics: Arc<CacheMetrics>,
    hard_limit: Arc<CountingSemaphore>,
    blocks_pending: Arc<CountingSemaphore>,
    pending: PendingMap,
    completed: Side<CompletedWrite>,
    lru: RwLock<LruCache<BlockKey, ()>>,
    shutting_down: AtomicBool,
    writer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BlockCache {
    #[must_use]
    pub fn new(data_root: impl Into<PathBuf>, config: CacheConfig, driver: Arc<dyn Driver>) -> Arc<Self> {
        let hard_limit = Arc::new(CountingSemaphore::new(config.hard_limit));
        let blocks_pending = Arc::new(CountingSemaphore::new(0));
        let lru_capacity = NonZeroUsize::new(config.hard_limit.max(1) * 2).unwrap_or(NonZeroUsize::new(1).unwrap());
        let cache = Arc::new(Self {
            data_root: data_root.into(),
            config,
            driver,
            metrics: Arc::new(CacheMetrics::default()),
            hard_limit,
            blocks_pending,
            pending: PendingMap::default(),
            completed: Side::default(),
            lru: RwLock::new(LruCache::new(lru_capacity)),
            shutting_down: AtomicBool::new(false),
            writer: Mutex::new(None),
        });
        let writer_cache = Arc::clone(&cache);
        let handle = thread::spawn(move || writer_cache.writer_loop());
        *cache.writer.lock() = Some(handle);
        cache
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<CacheMetrics> {
        Arc::clone(&self.metrics)
    }

    #[must_use]
    pub fn hard_limit_available(&self) -> usize {
        self.hard_limit.available()
    }

    #[must_use]
    pub fn num_blocks_written(&self) -> usize {
        self.metrics.num_blocks_written() as usize
    }

    fn block_path(&self, key: BlockKey) -> PathBuf {
        self.data_root.join(key.relative_path())
    }

    /// The on-disk path a flushed block lives (or will live) at. Exposed so
    /// a freshly flushed [`crate::dirty_block::DirtyBlock`] can record its
    /// temp file descriptor once the write pipeline commits it.
    #[must_use]
    pub fn path_for(&self, key: BlockKey) -> PathBuf {
        self.block_path(key)
    }

    /// Enqueues `data` — already driver-encoded bytes — to be written to
    /// disk under `key`. Never blocks on disk I/O; blocks only on
    /// `hard_limit` if `H` writes are already in flight.
    ///
    /// # Errors
    /// Returns [`GatewayError::Again`] if the cache is shutting down.
    pub fn write_block_async(&self, key: BlockKey, data: Vec<u8>) -> GwResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(GatewayError::Again("block cache is shutting down".into()));
        }
        self.hard_limit.acquire();
        self.pending.insert(key, Arc::new(data));
        self.blocks_pending.release();
        Ok(())
    }

    /// Reads a previously flushed block straight off disk, decoding it
    /// through the driver. Returns [`GatewayError::NotFound`] on a cache
    /// miss.
    pub fn read_block(&self, key: BlockKey) -> GwResult<Vec<u8>> {
        self.driver.decode_chunk(&self.read_block_encoded(key)?)
    }

    /// Reads a previously flushed block's on-disk (driver-encoded) bytes
    /// without decoding them — used by replication, which streams the
    /// already-encoded bytes to RGs rather than re-encoding plaintext.
    pub fn read_block_encoded(&self, key: BlockKey) -> GwResult<Vec<u8>> {
        let path = self.block_path(key);
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GatewayError::NotFound(format!("block {key:?} not in disk cache"))
            } else {
                GatewayError::Io(e)
            }
        })
    }

    /// Renames the entire `<fid>/<old_fver>` subtree to `<fid>/<new_fver>`,
    /// used on truncate-induced file version bumps.
    ///
    /// # Errors
    /// Propagates the underlying filesystem error.
    pub fn revert_file_version(
        &self,
        fid: crate::types::FileId,
        old_fver: crate::types::FileVersion,
        new_fver: crate::types::FileVersion,
    ) -> GwResult<()> {
        let base = self.data_root.join("files").join(format!("{:x}", fid.0));
        let old = base.join(old_fver.0.to_string());
        let new = base.join(new_fver.0.to_string());
        if old.exists() {
            std::fs::rename(&old, &new)?;
        }
        Ok(())
    }

    /// Evicts a single key from disk, unconditionally (used by eviction
    /// hints and consistency-driven truncation).
    pub fn evict(&self, key: BlockKey) {
        let path = self.block_path(key);
        let _ = std::fs::remove_file(path);
        if self.lru.write().pop(&key).is_some() {
            self.metrics.record_eviction();
        }
    }

    /// Signals shutdown and joins the writer thread after it drains
    /// whatever is already in flight.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.blocks_pending.release();
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
    }

    fn writer_loop(self: Arc<Self>) {
        log::info!("block cache writer thread starting");
        loop {
            self.blocks_pending.acquire();
            if self.shutting_down.load(Ordering::Acquire) {
                self.drain_completions();
                log::info!("block cache writer thread shutting down");
                return;
            }
            self.issue_pending_writes();
            self.drain_completions();
            self.trim_to_soft_limit();
        }
    }

    fn issue_pending_writes(&self) {
        let batch = self.pending.swap_and_take_inactive();
        if batch.is_empty() {
            return;
        }
        let completed_slot = self.completed.active();
        thread::scope(|scope| {
            for (key, write) in &batch {
                self.metrics.record_aio_write_issued();
                let path = self.block_path(*key);
                scope.spawn(move || {
                    let result = write_block_to_disk(&path, &write.data);
                    completed_slot.lock().push(CompletedWrite { key: *key, result });
                });
            }
        });
    }

    fn drain_completions(&self) {
        let batch = self.completed.swap_and_take_inactive();
        for completed in batch {
            match completed.result {
                Ok(()) => {
                    self.lru.write().put(completed.key, ());
                    self.metrics.record_block_written();
                }
                Err(e) => {
                    log::warn!("block write failed for {:?}: {e}", completed.key);
                    let path = self.block_path(completed.key);
                    let _ = std::fs::remove_file(path);
                    self.metrics.record_write_failure();
                    self.hard_limit.release();
                }
            }
        }
    }

    fn trim_to_soft_limit(&self) {
        while self.metrics.num_blocks_written() as usize > self.config.soft_limit {
            let Some((key, ())) = self.lru.write().pop_lru() else { break };
            let path = self.block_path(key);
            let _ = std::fs::remove_file(path);
            self.metrics.record_eviction();
            self.hard_limit.release();
        }
    }
}

/// Writes already driver-encoded bytes to disk. Callers (the write
/// pipeline's flush step, the read pipeline's remote-fetch cache-fill)
/// encode through [`Driver::encode_chunk`] themselves before handing the
/// buffer to [`BlockCache::write_block_async`] — the bytes that reach this
/// function are exactly what [`BlockCache::read_block_encoded`] will later
/// hand back, so the caller's hash-of-encoded-bytes stays valid.
fn write_block_to_disk(path: &Path, data: &[u8]) -> GwResult<()> {
    if let Some(dir) = path.parent() {
        create_dir_mode_0700(dir)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

#[cfg(unix)]
fn create_dir_mode_0700(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_dir_mode_0700(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::IdentityDriver;
    use crate::types::{BlockId, BlockVersion, FileId, FileVersion};
    use std::time::Duration;

    fn key(fid: u64, fver: i64, bid: u64, bver: i64) -> BlockKey {
        BlockKey::new(FileId(fid), FileVersion(fver), BlockId(bid), BlockVersion(bver))
    }

    fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        pred()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlockCache::new(dir.path(), CacheConfig::new(10, 20), Arc::new(IdentityDriver));
        let k = key(1, 1, 0, 1);
        cache.write_block_async(k, b"hello block".to_vec()).unwrap();
        assert!(wait_until(|| cache.num_blocks_written() == 1, Duration::from_secs(2)));
        let data = cache.read_block(k).unwrap();
        assert_eq!(data, b"hello block");
        cache.shutdown();
    }

    #[test]
    fn read_miss_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlockCache::new(dir.path(), CacheConfig::new(10, 20), Arc::new(IdentityDriver));
        let err = cache.read_block(key(9, 1, 0, 1)).unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        cache.shutdown();
    }

    #[test]
    fn eviction_respects_soft_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlockCache::new(dir.path(), CacheConfig::new(2, 10), Arc::new(IdentityDriver));
        for i in 0..5u64 {
            cache.write_block_async(key(1, 1, i, 1), vec![i as u8; 8]).unwrap();
        }
        assert!(wait_until(|| cache.num_blocks_written() <= 2, Duration::from_secs(2)));
        assert!(cache.num_blocks_written() <= 2);
        cache.shutdown();
    }

    #[test]
    fn write_block_async_rejects_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlockCache::new(dir.path(), CacheConfig::new(2, 10), Arc::new(IdentityDriver));
        cache.shutdown();
        let err = cache.write_block_async(key(1, 1, 0, 1), vec![1]).unwrap_err();
        assert!(matches!(err, GatewayError::Again(_)));
    }
}
