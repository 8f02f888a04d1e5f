//! Per-open-file eviction hints.
//!
//! A handle that created a disk-cache block purely to satisfy a read (not
//! a write) remembers `(block_id, block_version)` and evicts it on close
//! if the block is still non-dirty and still at that version — this keeps
//! read-caused blocks from polluting the dirty set after the handle goes
//! away.

use std::collections::HashMap;

use crate::cache::BlockCache;
use crate::inode::Inode;
use crate::types::{BlockId, BlockVersion, FileId, FileVersion};

pub struct FileHandle {
    pub file_id: FileId,
    hints: HashMap<BlockId, BlockVersion>,
}

impl FileHandle {
    #[must_use]
    pub fn new(file_id: FileId) -> Self {
        Self { file_id, hints: HashMap::new() }
    }

    /// Remembers that `bid`@`bver` was read-caused and may be evicted on
    /// close if nothing else claims it in the meantime.
    pub fn record_eviction_hint(&mut self, bid: BlockId, bver: BlockVersion) {
        self.hints.insert(bid, bver);
    }

    /// Drops a hint, e.g. because the block was subsequently written and
    /// is no longer purely read-caused.
    pub fn clear_eviction_hint(&mut self, bid: BlockId) {
        self.hints.remove(&bid);
    }

    /// On handle close: evicts every hinted block from the disk cache,
    /// provided it is still non-dirty and still at the hinted version.
    pub fn apply_eviction_hints_on_close(&self, inode: &Inode, fver: FileVersion, cache: &BlockCache) {
        let s = inode.read();
        for (&bid, &bver) in &self.hints {
            let still_non_dirty_at_version = match s.manifest.get_block(bid) {
                Some(info) => !info.dirty && info.version == bver,
                None => true,
            };
            if still_non_dirty_at_version && !s.dirty_blocks.contains_key(&bid) {
                cache.evict(crate::cache::BlockKey::new(inode.file_id, fver, bid, bver));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::IdentityDriver;
    use crate::types::{GatewayId, InodeType, Timespec, VolumeId};
    use std::sync::Arc;

    #[test]
    fn hinted_clean_block_is_evicted_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlockCache::new(dir.path(), crate::cache::CacheConfig::new(10, 20), Arc::new(IdentityDriver));
        let ino = Inode::new(FileId(1), VolumeId(1), "f".into(), None, InodeType::File, GatewayId(1), Timespec::new(0, 0));
        let key = crate::cache::BlockKey::new(FileId(1), FileVersion(1), BlockId(0), BlockVersion(1));
        cache.write_block_async(key, vec![1, 2, 3]).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while cache.read_block(key).is_err() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        ino.write().manifest.put_block(
            BlockId(0),
            crate::manifest::BlockInfo::new(BlockVersion(1), crate::crypto::hash::block_hash(&[1, 2, 3]), crate::manifest::BlockType::Block),
            true,
        ).unwrap();

        let mut handle = FileHandle::new(FileId(1));
        handle.record_eviction_hint(BlockId(0), BlockVersion(1));
        handle.apply_eviction_hints_on_close(&ino, FileVersion(1), &cache);

        assert!(matches!(cache.read_block(key), Err(crate::errors::GatewayError::NotFound(_))));
        cache.shutdown();
    }
}
