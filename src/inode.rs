//! The per-file/per-directory inode record and the invariants its write
//! lock protects.
//!
//! Inodes expose mutation through typed accessor methods rather than
//! public fields, so every mutation is observable and lockable uniformly;
//! this crate keeps all mutable state behind `RwLock<InodeState>`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::crypto::hash::Sha256Digest;
use crate::dirty_block::DirtyBlock;
use crate::errors::{self, GatewayError, GwResult};
use crate::manifest::Manifest;
use crate::ms::types::MdEntry;
use crate::sync::SyncContext;
use crate::types::{
    BlockId, BlockVersion, FileId, FileVersion, GatewayId, InodeType, Timespec, VolumeId, WriteNonce, XattrNonce,
};

/// A block that was committed to the manifest and has since been
/// superseded by a write; lives here until vacuumed.
#[derive(Debug, Clone)]
pub struct ReplacedBlock {
    pub bid: BlockId,
    pub version: BlockVersion,
    pub hash: Sha256Digest,
}

/// The inode's garbage set, plus the single `modtime` that made them
/// garbage: preserved across writes until a successful fsync clears it,
/// so the vacuumer can tell which manifest generation a batch of garbage
/// belongs to.
#[derive(Debug, Clone, Default)]
pub struct ReplacedBlocks {
    pub modtime: Option<Timespec>,
    pub blocks: Vec<ReplacedBlock>,
}

impl ReplacedBlocks {
    fn push(&mut self, block: ReplacedBlock, old_manifest_modtime: Timespec) {
        if self.modtime.is_none() {
            self.modtime = Some(old_manifest_modtime);
        }
        self.blocks.push(block);
    }

    fn clear(&mut self) {
        self.modtime = None;
        self.blocks.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessBounds {
    pub max_read_freshness_ms: u64,
    pub max_write_freshness_ms: u64,
}

/// All of an inode's mutable state, guarded by [`Inode`]'s single
/// reader-writer lock.
pub struct InodeState {
    pub name: String,
    pub parent_id: Option<FileId>,
    pub inode_type: InodeType,

    pub file_version: FileVersion,
    pub write_nonce: WriteNonce,
    pub xattr_nonce: XattrNonce,
    pub generation: u64,
    pub ms_num_children: u64,
    pub ms_capacity: u64,

    pub owner: GatewayId,
    pub mode: u32,
    pub coordinator_id: GatewayId,

    pub ctime: Timespec,
    pub mtime: Timespec,
    pub manifest_mtime: Timespec,
    pub refresh_time: Timespec,
    pub manifest_refresh_time: Timespec,
    pub children_refresh_time: Timespec,

    pub freshness: FreshnessBounds,

    pub size: u64,

    pub read_stale: bool,
    pub dirty: bool,
    pub deleting: bool,
    pub creating: bool,
    pub renaming: bool,
    pub vacuuming: bool,
    pub vacuumed: bool,

    pub manifest: Manifest,
    pub replaced_blocks: ReplacedBlocks,
    pub dirty_blocks: HashMap<BlockId, DirtyBlock>,
    pub sync_queue: VecDeque<Arc<SyncContext>>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub ms_xattr_hash: Sha256Digest,
}

/// An inode. `file_id`/`volume_id` never change for the lifetime of the
/// struct so they live outside the lock; everything else is in
/// [`InodeState`].
pub struct Inode {
    pub file_id: FileId,
    pub volume_id: VolumeId,
    state: RwLock<InodeState>,
}

impl Inode {
    #[must_use]
    pub fn new(
        file_id: FileId,
        volume_id: VolumeId,
        name: String,
        parent_id: Option<FileId>,
        inode_type: InodeType,
        coordinator_id: GatewayId,
        now: Timespec,
    ) -> Self {
        let manifest = Manifest::new(file_id, volume_id, FileVersion(1), coordinator_id);
        let state = InodeState {
            name,
            parent_id,
            inode_type,
            file_version: FileVersion(1),
            write_nonce: WriteNonce(0),
            xattr_nonce: XattrNonce(0),
            generation: 0,
            ms_num_children: 0,
            ms_capacity: 0,
            owner: coordinator_id,
            mode: 0o644,
            coordinator_id,
            ctime: now,
            mtime: now,
            manifest_mtime: now,
            refresh_time: now,
            manifest_refresh_time: now,
            children_refresh_time: now,
            freshness: FreshnessBounds { max_read_freshness_ms: 5_000, max_write_freshness_ms: 1_000 },
            size: 0,
            read_stale: false,
            dirty: false,
            deleting: false,
            creating: false,
            renaming: false,
            vacuuming: false,
            vacuumed: false,
            manifest,
            replaced_blocks: ReplacedBlocks::default(),
            dirty_blocks: HashMap::new(),
            sync_queue: VecDeque::new(),
            xattrs: BTreeMap::new(),
            ms_xattr_hash: [0u8; 32],
        };
        Self { file_id, volume_id, state: RwLock::new(state) }
    }

    #[must_use]
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, InodeState> {
        self.state.read()
    }

    #[must_use]
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, InodeState> {
        self.state.write()
    }

    #[must_use]
    pub fn is_coordinator(&self, self_id: GatewayId) -> bool {
        self.read().coordinator_id == self_id
    }

    /// Copies the MS's view of a file onto this inode: ownership, mode,
    /// mtime, freshness bounds, and generation, then resets
    /// `refresh_time` to now.
    pub fn adopt_attrs(&self, entry: &MdEntry, now: Timespec) {
        let mut s = self.write();
        s.owner = entry.owner;
        s.mode = entry.mode;
        s.mtime = entry.mtime;
        s.generation = entry.generation;
        s.ms_num_children = entry.ms_num_children;
        s.ms_capacity = entry.ms_capacity;
        s.freshness = FreshnessBounds {
            max_read_freshness_ms: entry.max_read_freshness_ms,
            max_write_freshness_ms: entry.max_write_freshness_ms,
        };
        s.refresh_time = now;
    }

    /// Validates a downloaded `MdEntry` against this inode's identity
    /// before importing it: a mismatch on file_id/volume_id/type
    /// indicates a broken invariant upstream, not an environmental fault,
    /// so it aborts rather than silently importing garbage.
    pub fn import_checked(&self, entry: &MdEntry) -> GwResult<()> {
        if entry.file_id != self.file_id {
            errors::bug(format!("inode_import: file_id mismatch {:?} != {:?}", entry.file_id, self.file_id));
        }
        if entry.volume_id != self.volume_id {
            errors::bug(format!("inode_import: volume_id mismatch {:?} != {:?}", entry.volume_id, self.volume_id));
        }
        Ok(())
    }

    /// Exports this inode's attributes as an `MdEntry`.
    #[must_use]
    pub fn export(&self) -> MdEntry {
        let s = self.read();
        MdEntry {
            file_id: self.file_id,
            volume_id: self.volume_id,
            name: s.name.clone(),
            parent_id: s.parent_id,
            inode_type: s.inode_type,
            file_version: s.file_version,
            write_nonce: s.write_nonce,
            xattr_nonce: s.xattr_nonce,
            generation: s.generation,
            ms_num_children: s.ms_num_children,
            ms_capacity: s.ms_capacity,
            owner: s.owner,
            mode: s.mode,
            coordinator_id: s.coordinator_id,
            ctime: s.ctime,
            mtime: s.mtime,
            manifest_mtime: s.manifest_mtime,
            max_read_freshness_ms: s.freshness.max_read_freshness_ms,
            max_write_freshness_ms: s.freshness.max_write_freshness_ms,
            size: s.size,
            xattr_hash: s.ms_xattr_hash,
        }
    }

    /// Whether this inode is fresh for reads: not marked stale and within
    /// the read-freshness window.
    #[must_use]
    pub fn is_fresh(&self, now: Timespec, clock: &dyn crate::clock::Clock) -> bool {
        let s = self.read();
        !s.read_stale && clock.elapsed_ms(s.refresh_time) <= s.freshness.max_read_freshness_ms
            && now.sec >= s.refresh_time.sec
    }

    /// Whether the manifest is fresh: the coordinator is always its own
    /// source of truth.
    #[must_use]
    pub fn manifest_is_fresh(&self, self_id: GatewayId, clock: &dyn crate::clock::Clock) -> bool {
        let s = self.read();
        if s.coordinator_id == self_id && !s.manifest.stale {
            return true;
        }
        !s.manifest.stale && clock.elapsed_ms(s.manifest_refresh_time) <= s.freshness.max_read_freshness_ms
    }
}

impl InodeState {
    /// Moves a committed block's old `(bid, version, hash)` into
    /// `replaced_blocks`, preserving the prior manifest modtime as the
    /// garbage-set's timestamp if not already set.
    pub fn replace_block(&mut self, old: ReplacedBlock, old_manifest_modtime: Timespec) {
        self.replaced_blocks.push(old, old_manifest_modtime);
    }

    /// Clears the garbage set after a successful fsync has handed it to
    /// the vacuum engine, recording the now-replicated manifest as the new
    /// baseline.
    pub fn clear_replaced_blocks(&mut self) {
        self.replaced_blocks.clear();
    }

    /// Asserts the core size invariant: `size == manifest.size`. Call
    /// after any mutation that touches either.
    pub fn check_size_invariant(&self) {
        if self.size != self.manifest.size {
            errors::bug(format!(
                "inode size invariant violated: inode.size={} manifest.size={}",
                self.size, self.manifest.size
            ));
        }
    }

    /// Only the coordinator may mutate the manifest et al.
    pub fn require_coordinator(&self, self_id: GatewayId) -> GwResult<()> {
        if self.coordinator_id != self_id {
            return Err(GatewayError::Forbidden(format!(
                "gateway {self_id:?} is not the coordinator ({:?})",
                self.coordinator_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timespec;

    fn inode() -> Inode {
        Inode::new(FileId(1), VolumeId(1), "a".into(), Some(FileId(0)), InodeType::File, GatewayId(1), Timespec::new(100, 0))
    }

    #[test]
    fn new_inode_is_self_coordinated_and_clean() {
        let ino = inode();
        assert!(ino.is_coordinator(GatewayId(1)));
        assert!(!ino.read().dirty);
        assert_eq!(ino.read().size, 0);
    }

    #[test]
    fn replace_block_sets_modtime_once() {
        let ino = inode();
        let mut s = ino.write();
        s.replace_block(ReplacedBlock { bid: BlockId(0), version: BlockVersion(1), hash: [0; 32] }, Timespec::new(50, 0));
        s.replace_block(ReplacedBlock { bid: BlockId(1), version: BlockVersion(1), hash: [1; 32] }, Timespec::new(999, 0));
        assert_eq!(s.replaced_blocks.modtime, Some(Timespec::new(50, 0)));
        assert_eq!(s.replaced_blocks.blocks.len(), 2);
    }

    #[test]
    fn clear_replaced_blocks_resets_modtime() {
        let ino = inode();
        {
            let mut s = ino.write();
            s.replace_block(ReplacedBlock { bid: BlockId(0), version: BlockVersion(1), hash: [0; 32] }, Timespec::new(50, 0));
        }
        ino.write().clear_replaced_blocks();
        let s = ino.read();
        assert!(s.replaced_blocks.modtime.is_none());
        assert!(s.replaced_blocks.blocks.is_empty());
    }

    #[test]
    fn require_coordinator_rejects_non_coordinator() {
        let ino = inode();
        let s = ino.read();
        assert!(s.require_coordinator(GatewayId(1)).is_ok());
        assert!(s.require_coordinator(GatewayId(2)).is_err());
    }
}
