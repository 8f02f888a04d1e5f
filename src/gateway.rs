//! The top-level orchestrator: one [`Gateway`] per running UG process,
//! bundling the local disk cache, the cached directory tree, and the
//! MS/RG/UG collaborators every pipeline operation needs (spec §3, §4).

use std::sync::Arc;

use crate::cache::{BlockCache, CacheConfig};
use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::crypto::signing::GatewayKeypair;
use crate::driver::Driver;
use crate::errors::{GatewayError, GwResult};
use crate::file_handle::FileHandle;
use crate::fs_tree::{FsEntry, FsTree};
use crate::inode::Inode;
use crate::ms::client::MsClient;
use crate::replication::{ReplicaHints, build_replica_context};
use crate::rg::client::RgClient;
use crate::types::{BlockId, InodeType, Timespec};
use crate::ug::UgClient;
use crate::vacuum::Vacuumer;

/// One UG process's worth of state: the local block cache, the cached
/// tree, and handles to every external collaborator (MS, RG, UG, vacuum
/// worker) the pipelines in [`crate::read`], [`crate::write`],
/// [`crate::sync`], and [`crate::consistency`] call into.
pub struct Gateway {
    pub config: GatewayConfig,
    pub clock: Arc<dyn Clock>,
    pub driver: Arc<dyn Driver>,
    pub cache: Arc<BlockCache>,
    pub ms: Arc<dyn MsClient>,
    pub rg: Arc<dyn RgClient>,
    pub ug: Arc<dyn UgClient>,
    pub signer: GatewayKeypair,
    pub tree: FsTree,
    pub vacuumer: Arc<Vacuumer>,
}

impl Gateway {
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        clock: Arc<dyn Clock>,
        driver: Arc<dyn Driver>,
        ms: Arc<dyn MsClient>,
        rg: Arc<dyn RgClient>,
        ug: Arc<dyn UgClient>,
        signer: GatewayKeypair,
    ) -> Self {
        let cache = BlockCache::new(config.data_root.clone(), CacheConfig::new(config.cache_soft_limit, config.cache_hard_limit), Arc::clone(&driver));
        let rg_ids = ms.list_replica_gateway_ids();
        let vacuumer = Vacuumer::spawn(config.gateway_id, Arc::clone(&ms), Arc::clone(&rg), rg_ids);
        let now = clock.now();
        let root = Arc::new(Inode::new(crate::types::FileId(0), config.volume_id, String::new(), None, InodeType::Dir, config.gateway_id, now));
        let tree = FsTree::new(root);
        Self { config, clock, driver, cache, ms, rg, ug, signer, tree, vacuumer }
    }

    /// Creates a new file or directory as a child of `parent_path` and
    /// grafts it onto the cached tree.
    ///
    /// # Errors
    /// Propagates an MS failure or a path resolution failure.
    pub fn create(&self, parent_path: &str, name: &str, inode_type: InodeType) -> GwResult<Arc<FsEntry>> {
        let parent = crate::consistency::path_ensure_fresh(self, parent_path)?;
        let md = self.ms.create(parent.inode.file_id, name, inode_type, self.config.gateway_id, 0o644)?;
        let now = self.clock.now();
        let inode = Arc::new(Inode::new(md.file_id, md.volume_id, md.name.clone(), md.parent_id, md.inode_type, md.coordinator_id, now));
        inode.adopt_attrs(&md, now);
        self.tree.graft(&parent, &[name.to_string()], vec![inode])
    }

    /// Resolves `path` and opens a fresh eviction-hint tracker for a
    /// session of reads against it (§4.4 step 7). Pair with
    /// [`Gateway::close`] once the caller is done reading.
    ///
    /// # Errors
    /// Propagates a path resolution failure.
    pub fn open(&self, path: &str) -> GwResult<(Arc<FsEntry>, FileHandle)> {
        let entry = crate::consistency::path_ensure_fresh(self, path)?;
        let handle = FileHandle::new(entry.inode.file_id);
        Ok((entry, handle))
    }

    /// Reads `buf.len()` bytes of `entry` at `offset` through an open
    /// handle, recording a close-time eviction hint for any block fetched
    /// purely to satisfy this read (§4.4 step 7).
    ///
    /// # Errors
    /// Propagates a manifest-freshness or block-fetch failure.
    pub fn read_with_handle(&self, entry: &Arc<FsEntry>, handle: &mut FileHandle, buf: &mut [u8], offset: u64) -> GwResult<usize> {
        if !entry.inode.is_coordinator(self.config.gateway_id) {
            crate::consistency::manifest_ensure_fresh(self, entry)?;
        }
        crate::read::read_pipeline(self, &entry.inode, Some(handle), buf, offset)
    }

    /// Closes a handle opened by [`Gateway::open`], evicting any blocks it
    /// hinted that are still non-dirty and unclaimed (§4.4 step 7).
    pub fn close(&self, entry: &Arc<FsEntry>, handle: FileHandle) {
        let file_version = entry.inode.read().file_version;
        handle.apply_eviction_hints_on_close(&entry.inode, file_version, &self.cache);
    }

    /// Reads `buf.len()` bytes of `path` at `offset` (§4.5): a convenience
    /// wrapper that opens a transient handle for this single call and
    /// closes it before returning, applying any eviction hint it recorded.
    ///
    /// # Errors
    /// Propagates a path resolution, manifest-freshness, or block-fetch
    /// failure.
    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> GwResult<usize> {
        let (entry, mut handle) = self.open(path)?;
        let n = self.read_with_handle(&entry, &mut handle, buf, offset)?;
        self.close(&entry, handle);
        Ok(n)
    }

    /// Writes `buf` to `path` at `offset` (§4.5, §4.8).
    ///
    /// # Errors
    /// Propagates a path resolution, forwarding, or local-write failure.
    pub fn write(&self, path: &str, buf: &[u8], offset: u64) -> GwResult<usize> {
        let entry = crate::consistency::path_ensure_fresh(self, path)?;
        if !entry.inode.is_coordinator(self.config.gateway_id) {
            crate::consistency::manifest_ensure_fresh(self, &entry)?;
        }
        crate::write::write_pipeline(self, &entry, buf, offset)
    }

    /// Flushes and replicates `path`'s dirty blocks (§4.8).
    ///
    /// # Errors
    /// Propagates a path resolution or replication failure.
    pub fn fsync(&self, path: &str) -> GwResult<()> {
        let entry = crate::consistency::path_ensure_fresh(self, path)?;
        crate::sync::fsync(self, &entry)
    }

    /// Attempts to become `path`'s coordinator (§4.8).
    ///
    /// # Errors
    /// Propagates a path resolution or coordinate-race failure.
    pub fn chcoord(&self, path: &str) -> GwResult<()> {
        let entry = crate::consistency::path_ensure_fresh(self, path)?;
        crate::sync::chcoord(self, &entry)
    }

    /// Shrinks or grows `path` to `new_size`, vacuuming any blocks the
    /// shrink drops directly (not through the vacuum log, since nothing
    /// else could still be reading the dropped tail once the coordinator
    /// commits the new size).
    ///
    /// # Errors
    /// Returns [`GatewayError::Forbidden`] if this gateway is not the
    /// coordinator, or propagates a cache/RG/MS failure.
    pub fn truncate(&self, path: &str, new_size: u64) -> GwResult<()> {
        let entry = crate::consistency::path_ensure_fresh(self, path)?;
        let inode = &entry.inode;
        inode.require_coordinator(self.config.gateway_id)?;

        let block_size = self.config.block_size.max(1);
        let new_max_block_id = BlockId(new_size.div_ceil(block_size));
        let old_file_version = inode.read().file_version;
        let new_file_version = crate::types::FileVersion(old_file_version.0 + 1);

        let dropped: Vec<(BlockId, crate::types::BlockVersion)> = {
            let s = inode.read();
            s.manifest.iter_blocks().filter(|(bid, _)| bid.0 >= new_max_block_id.0).map(|(bid, info)| (bid, info.version)).collect()
        };

        {
            let mut s = inode.write();
            s.manifest.truncate(new_max_block_id);
            s.manifest.file_version = new_file_version;
            s.file_version = new_file_version;
            s.size = new_size;
            s.manifest.size = new_size;
            let now = self.clock.now();
            s.mtime = now;
            s.manifest_mtime = now;
            s.manifest.modtime = now;
        }

        self.cache.revert_file_version(inode.file_id, old_file_version, new_file_version)?;

        let rg_ids = self.ms.list_replica_gateway_ids();
        let mut ctx = build_replica_context(inode, &entry.name, &self.cache, self.driver.as_ref(), &self.signer, self.config.gateway_id, rg_ids.clone())?;
        ctx.apply_hints(ReplicaHints { no_rg_vacuum: true, ..Default::default() });
        ctx.drive(self.config.gateway_id, self.ms.as_ref(), self.rg.as_ref())?;

        for rg_id in rg_ids {
            let _ = self.rg.delete_blocks(rg_id, inode.file_id, old_file_version, &dropped);
        }

        Ok(())
    }

    pub fn shutdown(&self) {
        self.tree.shutdown();
        self.cache.shutdown();
        self.vacuumer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::driver::IdentityDriver;
    use crate::test_support::{FakeMsClient, FakeRgClient, FakeUgClient};
    use crate::types::{Capability, GatewayId, VolumeId};

    fn test_gateway() -> (Gateway, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ms = Arc::new(FakeMsClient::new(VolumeId(1)));
        ms.set_gateway_caps(GatewayId(1), vec![Capability::Read, Capability::Write, Capability::Coordinate]);
        let config = GatewayConfig { gateway_id: GatewayId(1), volume_id: VolumeId(1), data_root: dir.path().to_path_buf(), block_size: 16, ..Default::default() };
        let gw = Gateway::new(config, Arc::new(SystemClock), Arc::new(IdentityDriver), ms, Arc::new(FakeRgClient::new()), Arc::new(FakeUgClient::unreachable()), GatewayKeypair::generate());
        (gw, dir)
    }

    #[test]
    fn create_then_write_then_read_round_trips() {
        let (gw, _dir) = test_gateway();
        let entry = gw.create("/", "f", InodeType::File).unwrap();
        let n = gw.write(&entry.name, b"hello", 0).unwrap();
        assert_eq!(n, 5);
        let mut buf = [0u8; 5];
        let read = gw.read(&entry.name, &mut buf, 0).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf, b"hello");
        gw.shutdown();
    }

    #[test]
    fn open_read_close_evicts_read_caused_block() {
        use crate::types::{BlockVersion, FileId, FileVersion};

        let (gw, _dir) = test_gateway();

        // This gateway is a non-coordinator for this file, so the read goes
        // through the remote-fetch path and `fetch_block` records a hint —
        // a locally-applied write's block is never un-dirtied (nothing in
        // the write path clears `BlockInfo.dirty`), so it would never be
        // eligible for eviction.
        let inode = Arc::new(Inode::new(FileId(1), VolumeId(1), "f".into(), None, InodeType::File, GatewayId(2), Timespec::new(0, 0)));
        inode.write().size = 16;
        let entry = gw.tree.graft(&gw.tree.root.clone(), &["f".to_string()], vec![inode]).unwrap();

        let plaintext = b"abcdefghijklmnop".to_vec();
        let encoded = gw.driver.encode_chunk(&plaintext).unwrap();
        let hash = crate::crypto::hash::block_hash(&encoded);
        let version = BlockVersion(7);
        entry.inode.write().manifest.put_block(BlockId(0), crate::manifest::BlockInfo::new(version, hash, crate::manifest::BlockType::Block), true).unwrap();
        gw.rg.set_block(GatewayId(2), FileId(1), FileVersion(1), BlockId(0), encoded);

        let (opened, mut handle) = gw.open(&entry.name).unwrap();
        let mut buf = [0u8; 16];
        let n = gw.read_with_handle(&opened, &mut handle, &mut buf, 0).unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf, plaintext.as_slice());

        let key = crate::cache::BlockKey::new(opened.inode.file_id, FileVersion(1), BlockId(0), version);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while gw.cache.read_block(key).is_err() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(gw.cache.read_block(key).is_ok());

        gw.close(&opened, handle);
        assert!(matches!(gw.cache.read_block(key), Err(GatewayError::NotFound(_))));
        gw.shutdown();
    }

    #[test]
    fn fsync_then_truncate_drops_tail_blocks() {
        let (gw, _dir) = test_gateway();
        let entry = gw.create("/", "f", InodeType::File).unwrap();
        gw.write(&entry.name, &[1u8; 32], 0).unwrap();
        gw.fsync(&entry.name).unwrap();
        gw.truncate(&entry.name, 16).unwrap();
        assert_eq!(entry.inode.read().size, 16);
        gw.shutdown();
    }
}
