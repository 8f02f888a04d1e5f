use std::sync::atomic::{AtomicU64, Ordering};

/// Writer-thread counters, readable from any thread without locking.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    num_aio_writes: AtomicU64,
    num_blocks_written: AtomicU64,
    num_write_failures: AtomicU64,
    num_evicted: AtomicU64,
}

impl CacheMetrics {
    pub fn record_aio_write_issued(&self) {
        self.num_aio_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_written(&self) {
        self.num_blocks_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.num_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A block left the `num_blocks_written` count via LRU eviction or a
    /// failed write's cleanup.
    pub fn record_eviction(&self) {
        self.num_evicted.fetch_add(1, Ordering::Relaxed);
        self.num_blocks_written.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn num_aio_writes(&self) -> u64 {
        self.num_aio_writes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn num_blocks_written(&self) -> u64 {
        self.num_blocks_written.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn num_write_failures(&self) -> u64 {
        self.num_write_failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn num_evicted(&self) -> u64 {
        self.num_evicted.load(Ordering::Relaxed)
    }
}
