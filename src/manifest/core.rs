//! The manifest: an ordered `block_id -> BlockInfo` map plus the file-level
//! metadata (version, size, coordinator, modtime) that travels with it.
//!
//! `merge_blocks` implements the block-reconciliation rule from the
//! consistency engine: a block we hold dirty is never clobbered by an
//! incoming manifest, a manifest strictly older than ours contributes
//! nothing, and ties (equal modtime) are broken deterministically by
//! `(version, hash)` so that merging the same manifest twice, or merging
//! three manifests in any order, converges to the same result.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{GatewayError, GwResult};
use crate::types::{BlockId, FileId, FileVersion, GatewayId, Timespec, VolumeId};

use super::block::BlockInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub file_id: FileId,
    pub volume_id: VolumeId,
    pub file_version: FileVersion,
    pub coordinator_id: GatewayId,
    pub size: u64,
    pub modtime: Timespec,
    pub stale: bool,
    blocks: BTreeMap<BlockId, BlockInfo>,
}

impl Manifest {
    #[must_use]
    pub fn new(
        file_id: FileId,
        volume_id: VolumeId,
        file_version: FileVersion,
        coordinator_id: GatewayId,
    ) -> Self {
        Self {
            file_id,
            volume_id,
            file_version,
            coordinator_id,
            size: 0,
            modtime: Timespec::default(),
            stale: false,
            blocks: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn get_block(&self, bid: BlockId) -> Option<&BlockInfo> {
        self.blocks.get(&bid)
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn iter_blocks(&self) -> impl Iterator<Item = (BlockId, &BlockInfo)> {
        self.blocks.iter().map(|(bid, info)| (*bid, info))
    }

    #[must_use]
    pub fn highest_block_id(&self) -> Option<BlockId> {
        self.blocks.keys().next_back().copied()
    }

    /// Inserts or replaces a single block entry. With `replace = false`,
    /// refuses to clobber an existing entry (used when a block is being
    /// introduced for the first time and a collision indicates a bug
    /// upstream).
    ///
    /// # Errors
    /// Returns [`GatewayError::Conflict`] if `replace` is `false` and `bid`
    /// already has an entry.
    pub fn put_block(&mut self, bid: BlockId, info: BlockInfo, replace: bool) -> GwResult<()> {
        if !replace && self.blocks.contains_key(&bid) {
            return Err(GatewayError::Conflict(format!(
                "block {} already present in manifest for file {:?}",
                bid.0, self.file_id
            )));
        }
        self.blocks.insert(bid, info);
        Ok(())
    }

    /// Drops every block at or beyond `max_block_id` (exclusive). Used by
    /// truncate to shrink the block-version map to the new file size.
    pub fn truncate(&mut self, max_block_id: BlockId) {
        self.blocks.retain(|bid, _| *bid < max_block_id);
    }

    /// Whether `self`'s manifest snapshot is strictly newer than `other`'s,
    /// by `(modtime, file_version)` — used by `manifest_ensure_fresh` to
    /// decide whether a freshly downloaded manifest is worth merging at
    /// all.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        (self.modtime, self.file_version) > (other.modtime, other.file_version)
    }

    /// Merges `other`'s blocks into `self`, in place. Returns the set of
    /// block ids whose local entry was overwritten (and must therefore be
    /// evicted from the disk cache and, if present, dropped as a
    /// now-superseded dirty block).
    ///
    /// Per-block rule: a dirty local entry is never overwritten. Otherwise
    /// the manifest with the later `modtime` wins; on an exact `modtime`
    /// tie, the entry with the higher `(version, hash)` wins. This makes
    /// the merge commutative, associative, and idempotent across any set of
    /// manifests sharing a `file_id`.
    pub fn merge_blocks(&mut self, other: &Self) -> Vec<BlockId> {
        let mut evicted = Vec::new();
        for (bid, other_info) in &other.blocks {
            let local = self.blocks.get(bid);
            if let Some(local_info) = local {
                if local_info.dirty {
                    continue;
                }
            }
            let other_wins = match (local, other.modtime.cmp(&self.modtime)) {
                (_, std::cmp::Ordering::Less) => false,
                (_, std::cmp::Ordering::Greater) => true,
                (None, std::cmp::Ordering::Equal) => true,
                (Some(local_info), std::cmp::Ordering::Equal) => {
                    (other_info.version, other_info.hash) > (local_info.version, local_info.hash)
                }
            };
            if other_wins {
                if local.is_some() {
                    evicted.push(*bid);
                }
                self.blocks.insert(*bid, other_info.clone());
            }
        }
        evicted
    }

    /// Builds a manifest containing only the listed blocks, with the same
    /// file-level metadata as `self`. Used to build a replication
    /// context's `write_delta`.
    #[must_use]
    pub fn subset(&self, ids: &[BlockId]) -> Self {
        let mut out = Self {
            file_id: self.file_id,
            volume_id: self.volume_id,
            file_version: self.file_version,
            coordinator_id: self.coordinator_id,
            size: self.size,
            modtime: self.modtime,
            stale: self.stale,
            blocks: BTreeMap::new(),
        };
        for &id in ids {
            if let Some(info) = self.blocks.get(&id) {
                out.blocks.insert(id, info.clone());
            }
        }
        out
    }

    /// Marks a block dirty in place (used by the write pipeline right
    /// after a block's new version is assigned and flushed to the disk
    /// cache, before the write is committed to the manifest).
    pub fn mark_dirty(&mut self, bid: BlockId, dirty: bool) {
        if let Some(info) = self.blocks.get_mut(&bid) {
            info.dirty = dirty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::block::BlockType;

    fn manifest_at(sec: i64, fver: i64) -> Manifest {
        let mut m = Manifest::new(FileId(1), VolumeId(1), FileVersion(fver), GatewayId(1));
        m.modtime = Timespec::new(sec, 0);
        m
    }

    fn block(version: i64, tag: u8) -> BlockInfo {
        BlockInfo::new(crate::types::BlockVersion(version), [tag; 32], BlockType::Block)
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = manifest_at(10, 1);
        a.put_block(BlockId(0), block(1, 1), true).unwrap();

        let mut b = manifest_at(20, 1);
        b.put_block(BlockId(0), block(2, 2), true).unwrap();
        b.put_block(BlockId(1), block(1, 3), true).unwrap();

        let mut once = a.clone();
        once.merge_blocks(&b);
        let mut twice = once.clone();
        twice.merge_blocks(&b);

        assert_eq!(once.get_block(BlockId(0)), twice.get_block(BlockId(0)));
        assert_eq!(once.get_block(BlockId(1)), twice.get_block(BlockId(1)));
        assert_eq!(once.block_count(), twice.block_count());
    }

    #[test]
    fn merge_is_commutative() {
        let mut a = manifest_at(10, 1);
        a.put_block(BlockId(0), block(1, 1), true).unwrap();

        let mut b = manifest_at(20, 1);
        b.put_block(BlockId(0), block(2, 2), true).unwrap();

        let mut c = manifest_at(15, 1);
        c.put_block(BlockId(1), block(5, 9), true).unwrap();

        let mut ab = a.clone();
        ab.merge_blocks(&b);
        ab.modtime = b.modtime;
        let mut ab_c = ab.clone();
        ab_c.merge_blocks(&c);

        let mut ac = a.clone();
        ac.merge_blocks(&c);
        ac.modtime = c.modtime;
        let mut ac_b = ac.clone();
        ac_b.merge_blocks(&b);
        ac_b.modtime = b.modtime;

        assert_eq!(ab_c.get_block(BlockId(0)).unwrap().version, ac_b.get_block(BlockId(0)).unwrap().version);
        assert_eq!(ab_c.get_block(BlockId(1)), ac_b.get_block(BlockId(1)));
    }

    #[test]
    fn merge_never_overwrites_dirty_local_block() {
        let mut local = manifest_at(10, 1);
        let mut dirty_block = block(1, 1);
        dirty_block.dirty = true;
        local.put_block(BlockId(0), dirty_block.clone(), true).unwrap();

        let mut remote = manifest_at(99, 1);
        remote.put_block(BlockId(0), block(50, 2), true).unwrap();

        let evicted = local.merge_blocks(&remote);
        assert!(evicted.is_empty());
        assert_eq!(local.get_block(BlockId(0)), Some(&dirty_block));
    }

    #[test]
    fn merge_ignores_strictly_older_manifest() {
        let mut local = manifest_at(100, 2);
        local.put_block(BlockId(0), block(5, 1), true).unwrap();

        let mut stale = manifest_at(10, 1);
        stale.put_block(BlockId(0), block(99, 2), true).unwrap();
        stale.put_block(BlockId(1), block(1, 3), true).unwrap();

        let evicted = local.merge_blocks(&stale);
        assert!(evicted.is_empty());
        assert_eq!(local.get_block(BlockId(0)).unwrap().version.0, 5);
        assert!(local.get_block(BlockId(1)).is_none());
    }

    #[test]
    fn truncate_drops_blocks_at_or_beyond_cutoff() {
        let mut m = manifest_at(1, 1);
        for i in 0..5u64 {
            m.put_block(BlockId(i), block(1, 1), true).unwrap();
        }
        m.truncate(BlockId(3));
        assert_eq!(m.block_count(), 3);
        assert!(m.get_block(BlockId(3)).is_none());
        assert!(m.get_block(BlockId(2)).is_some());
    }

    #[test]
    fn put_block_without_replace_rejects_existing() {
        let mut m = manifest_at(1, 1);
        m.put_block(BlockId(0), block(1, 1), true).unwrap();
        let err = m.put_block(BlockId(0), block(2, 2), false).unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }
}
