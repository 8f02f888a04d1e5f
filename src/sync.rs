//! The sync/coordinator component: `fsync`, which flushes and replicates
//! an inode's dirty blocks, and `chcoord`, the linearizable
//! coordinator-transfer protocol.
//!
//! [`SyncContext`] is the FIFO ticket an inode's `sync_queue` holds: per
//! inode, at most one fsync replicates at a time; every later caller waits
//! on its own context's condvar until the one ahead of it signals done.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::errors::{GatewayError, GwResult};
use crate::fs_tree::FsEntry;
use crate::gateway::Gateway;
use crate::ms::types::CoordinateOutcome;
use crate::replication::build_replica_context;
use crate::types::Capability;
use crate::vacuum::{VacuumKind, VacuumRequest, VacuumSnapshot};
use crate::write::flush_unflushed_dirty_blocks;

/// One inode's FIFO fsync ticket. A fresh context starts "not done"; the
/// fsync ahead of it in the queue signals it once that fsync has finished
/// driving its replica context (success or failure).
pub struct SyncContext {
    done: Mutex<bool>,
    cond: Condvar,
}

impl SyncContext {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self { done: Mutex::new(false), cond: Condvar::new() })
    }

    fn wait_turn(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn signal(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

/// Flushes every remaining dirty block, replicates the result, and hands
/// the garbage it supersedes to the background vacuumer.
///
/// # Errors
/// Propagates the first fatal error from flushing or from driving the
/// replica context; on failure the inode's dirty blocks and garbage set are
/// left untouched so a retry can pick up where this attempt left off.
pub fn fsync(gw: &Gateway, entry: &Arc<FsEntry>) -> GwResult<()> {
    let inode = &entry.inode;

    flush_unflushed_dirty_blocks(gw, inode)?;

    let had_prior_garbage = inode.read().replaced_blocks.modtime.is_some();

    let ticket = SyncContext::new();
    let must_wait = {
        let mut s = inode.write();
        let must_wait = !s.sync_queue.is_empty();
        s.sync_queue.push_back(Arc::clone(&ticket));
        must_wait
    };
    if must_wait {
        ticket.wait_turn();
    }

    let result = drive_replication(gw, entry, had_prior_garbage);

    {
        let mut s = inode.write();
        s.sync_queue.pop_front();
        if let Some(next) = s.sync_queue.front() {
            next.signal();
        }
    }

    result
}

fn drive_replication(gw: &Gateway, entry: &Arc<FsEntry>, had_prior_garbage: bool) -> GwResult<()> {
    let inode = &entry.inode;
    let rg_ids = gw.ms.list_replica_gateway_ids();
    let mut ctx = build_replica_context(
        inode,
        &entry.name,
        &gw.cache,
        gw.driver.as_ref(),
        &gw.signer,
        gw.config.gateway_id,
        rg_ids,
    )?;

    ctx.drive(gw.config.gateway_id, gw.ms.as_ref(), gw.rg.as_ref())?;

    {
        let mut s = inode.write();
        for bid in &ctx.affected_blocks {
            s.dirty_blocks.remove(bid);
        }
        s.clear_replaced_blocks();
    }

    if had_prior_garbage {
        let (file_version, manifest_mtime) = {
            let mut s = inode.write();
            s.vacuuming = true;
            (s.file_version, s.manifest.modtime)
        };
        gw.vacuumer.submit(VacuumRequest {
            fs_path: entry.name.clone(),
            inode: Arc::clone(inode),
            snapshot: VacuumSnapshot {
                volume_id: inode.volume_id,
                file_id: inode.file_id,
                file_version,
                manifest_mtime,
            },
            kind: VacuumKind::Write,
        });
    }

    Ok(())
}

/// Attempts to become `entry`'s coordinator.
///
/// # Errors
/// Returns [`GatewayError::Forbidden`] if this gateway lacks the
/// `Coordinate` capability, or propagates an MS/RG failure. On losing the
/// race, sets the inode's `coordinator_id` to the winner and returns
/// [`GatewayError::Again`] so the caller retries against the new
/// coordinator.
pub fn chcoord(gw: &Gateway, entry: &Arc<FsEntry>) -> GwResult<()> {
    let caps = gw.ms.get_gateway_caps(gw.config.gateway_id)?;
    if !caps.contains(&Capability::Coordinate) {
        return Err(GatewayError::Forbidden(format!("gateway {:?} lacks Coordinate capability", gw.config.gateway_id)));
    }

    let inode = &entry.inode;
    let now = gw.clock.now();

    let bundle = gw.ms.fetchxattrs(inode.volume_id, inode.file_id, inode.read().xattr_nonce, inode.read().ms_xattr_hash)?;
    let new_xattr_hash = crate::crypto::hash::xattr_hash(inode.volume_id, inode.file_id, inode.read().xattr_nonce, &bundle);

    let mut md_entry = inode.export();
    md_entry.coordinator_id = gw.config.gateway_id;
    md_entry.write_nonce = crate::types::WriteNonce(md_entry.write_nonce.0 + 1);
    md_entry.xattr_hash = new_xattr_hash;

    let pre_rpc_write_nonce = inode.read().write_nonce;

    match gw.ms.coordinate(&md_entry, new_xattr_hash)? {
        CoordinateOutcome::Confirmed(confirmed) => {
            // The RPC above runs without holding the inode's write lock, so a
            // local write can advance write_nonce while it is in flight. Only
            // adopt the MS's reply if nothing raced it; otherwise the local
            // write_nonce/mtime are newer than what the MS just confirmed and
            // must not be stomped.
            let raced = inode.read().write_nonce != pre_rpc_write_nonce;
            if raced {
                inode.write().read_stale = true;
            } else {
                {
                    let mut s = inode.write();
                    s.xattrs = bundle;
                    s.ms_xattr_hash = confirmed.xattr_hash;
                    s.coordinator_id = confirmed.coordinator_id;
                    s.write_nonce = confirmed.write_nonce;
                    s.mtime = confirmed.mtime;
                }
                inode.adopt_attrs(&confirmed, now);
            }
            Ok(())
        }
        CoordinateOutcome::Lost { winner } => {
            inode.write().coordinator_id = winner;
            Err(GatewayError::Again(format!("lost coordinate race for {:?} to {winner:?}", inode.file_id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::crypto::signing::GatewayKeypair;
    use crate::driver::IdentityDriver;
    use crate::fs_tree::FsTree;
    use crate::inode::Inode;
    use crate::test_support::{FakeMsClient, FakeRgClient, FakeUgClient};
    use crate::types::{Capability, FileId, GatewayId, InodeType, VolumeId};
    use std::sync::Arc;

    fn test_gateway(gateway_id: GatewayId) -> (Arc<Gateway>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ms = Arc::new(FakeMsClient::new(VolumeId(1)));
        ms.set_gateway_caps(gateway_id, vec![Capability::Read, Capability::Write, Capability::Coordinate]);
        let config = crate::config::GatewayConfig {
            gateway_id,
            volume_id: VolumeId(1),
            data_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let gw = Gateway::new(config, Arc::new(SystemClock), Arc::new(IdentityDriver), ms, Arc::new(FakeRgClient::new()), Arc::new(FakeUgClient::unreachable()), GatewayKeypair::generate());
        (Arc::new(gw), dir)
    }

    #[test]
    fn fsync_with_no_dirty_blocks_replicates_empty_delta() {
        let (gw, _dir) = test_gateway(GatewayId(1));
        let now = gw.clock.now();
        let inode = Arc::new(Inode::new(FileId(1), VolumeId(1), "f".into(), None, InodeType::File, GatewayId(1), now));
        let tree = FsTree::new(Arc::new(Inode::new(FileId(0), VolumeId(1), String::new(), None, InodeType::Dir, GatewayId(1), now)));
        let entry = tree.graft(&tree.root.clone(), &["f".to_string()], vec![inode]).unwrap();

        let result = fsync(&gw, &entry);
        assert!(result.is_ok());
        tree.shutdown();
    }

    #[test]
    fn chcoord_without_capability_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let ms = Arc::new(FakeMsClient::new(VolumeId(1)));
        let config = crate::config::GatewayConfig { gateway_id: GatewayId(2), volume_id: VolumeId(1), data_root: dir.path().to_path_buf(), ..Default::default() };
        let gw = Gateway::new(config, Arc::new(SystemClock), Arc::new(IdentityDriver), ms, Arc::new(FakeRgClient::new()), Arc::new(FakeUgClient::unreachable()), GatewayKeypair::generate());
        let now = gw.clock.now();
        let inode = Arc::new(Inode::new(FileId(1), VolumeId(1), "f".into(), None, InodeType::File, GatewayId(1), now));
        let tree = FsTree::new(Arc::new(Inode::new(FileId(0), VolumeId(1), String::new(), None, InodeType::Dir, GatewayId(1), now)));
        let entry = tree.graft(&tree.root.clone(), &["f".to_string()], vec![inode]).unwrap();

        let err = chcoord(&gw, &entry).unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
        tree.shutdown();
    }
}
