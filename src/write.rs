//! The write pipeline (spec §4.5): a coordinator applies writes locally,
//! flushing every touched block but the last to the disk cache; a
//! non-coordinator forwards the write over [`crate::ug::UgClient`] and
//! falls back to `chcoord` on a forwarding failure (§4.8, scenario "write
//! during coordinator failover").

use std::sync::Arc;

use crate::cache::BlockKey;
use crate::crypto::hash::block_hash;
use crate::dirty_block::DirtyBlock;
use crate::errors::GwResult;
use crate::fs_tree::FsEntry;
use crate::gateway::Gateway;
use crate::inode::{Inode, InodeState};
use crate::manifest::{BlockInfo, BlockType};
use crate::read::fetch_block;
use crate::types::{BlockId, BlockVersion};
use crate::wire::RequestKind;

/// Writes `buf` at `offset`, returning the number of bytes written.
///
/// # Errors
/// Propagates a cache/RG failure, or the forwarding failure from a
/// non-coordinator whose `chcoord` retry also failed.
pub fn write_pipeline(gw: &Gateway, entry: &Arc<FsEntry>, buf: &[u8], offset: u64) -> GwResult<usize> {
    let inode = &entry.inode;
    if inode.is_coordinator(gw.config.gateway_id) {
        return apply_local_write(gw, inode, buf, offset);
    }

    let coordinator_id = inode.read().coordinator_id;
    let file_version = inode.read().file_version;
    let kind = RequestKind::Write { file_id: inode.file_id, file_version, offset, data: buf.to_vec() };
    let request = crate::wire::Request::sign(gw.config.gateway_id, kind, &gw.signer)?;

    match gw.ug.send(coordinator_id, &request) {
        Ok(reply) => {
            if let Some(md) = reply.ent_out {
                crate::consistency::inode_reload(gw, entry, &md, gw.clock.now())?;
            }
            Ok(buf.len())
        }
        Err(_) => {
            crate::sync::chcoord(gw, entry)?;
            apply_local_write(gw, inode, buf, offset)
        }
    }
}

/// Applies a write directly against a coordinated inode (§4.5 steps 5-8).
fn apply_local_write(gw: &Gateway, inode: &Inode, buf: &[u8], offset: u64) -> GwResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }

    let block_size = gw.config.block_size.max(1);
    let first_block = offset / block_size;
    let last_block = (offset + buf.len() as u64 - 1) / block_size;

    let mut written: u64 = 0;
    for bid_raw in first_block..=last_block {
        let bid = BlockId(bid_raw);
        let block_start = bid_raw * block_size;
        let in_block_offset = offset.max(block_start) - block_start;
        let remaining = buf.len() as u64 - written;
        let in_block_len = (block_size - in_block_offset).min(remaining);
        let is_aligned = in_block_offset == 0 && in_block_len == block_size;
        let is_last_touched = bid_raw == last_block;

        let mut plaintext = if is_aligned {
            vec![0u8; block_size as usize]
        } else {
            fetch_block(gw, inode, bid, None).unwrap_or_else(|_| vec![0u8; block_size as usize])
        };
        if plaintext.len() < block_size as usize {
            plaintext.resize(block_size as usize, 0);
        }
        let src_start = written as usize;
        let src_end = src_start + in_block_len as usize;
        let dst_start = in_block_offset as usize;
        plaintext[dst_start..dst_start + in_block_len as usize].copy_from_slice(&buf[src_start..src_end]);

        let version = BlockVersion(rand::random());
        if is_last_touched {
            let mut s = inode.write();
            s.dirty_blocks.insert(bid, DirtyBlock::new(version, Arc::new(plaintext)));
            s.manifest.mark_dirty(bid, true);
        } else {
            let mut s = inode.write();
            flush_and_commit_block(gw, inode.file_id, &mut s, bid, version, plaintext)?;
        }

        written += in_block_len;
    }

    let mut s = inode.write();
    let new_size = (offset + buf.len() as u64).max(s.size);
    s.size = new_size;
    s.manifest.size = new_size;
    if inode.is_coordinator(gw.config.gateway_id) {
        let now = gw.clock.now();
        s.mtime = now;
        s.manifest_mtime = now;
        s.manifest.modtime = now;
        s.write_nonce = crate::types::WriteNonce(s.write_nonce.0 + 1);
    }
    s.dirty = true;
    s.check_size_invariant();
    drop(s);

    Ok(buf.len())
}

/// Encodes, hashes, and durably flushes one block to the local disk
/// cache, retiring its prior version into the inode's replaced-block set
/// and committing the new version into the manifest. The block stays
/// tracked in `dirty_blocks` (now `flushed`) until a successful `fsync`
/// replicates it — per the manifest's dirty-until-replicated invariant.
///
/// # Errors
/// Propagates an encode or disk cache failure.
pub(crate) fn flush_and_commit_block(gw: &Gateway, file_id: crate::types::FileId, s: &mut InodeState, bid: BlockId, version: BlockVersion, plaintext: Vec<u8>) -> GwResult<()> {
    let encoded = gw.driver.encode_chunk(&plaintext)?;
    let hash = block_hash(&encoded);
    let key = BlockKey::new(file_id, s.file_version, bid, version);

    gw.cache.write_block_async(key, encoded)?;
    wait_for_flush(gw, key)?;

    if let Some(old) = s.manifest.get_block(bid) {
        let old_bid_info = crate::inode::ReplacedBlock { bid, version: old.version, hash: old.hash };
        let old_modtime = s.manifest.modtime;
        s.replace_block(old_bid_info, old_modtime);
    }

    s.manifest.put_block(bid, BlockInfo::new(version, hash, BlockType::Block), true)?;
    s.manifest.mark_dirty(bid, true);

    let mut dirty = DirtyBlock::new(version, Arc::new(plaintext));
    dirty.mark_flushed(gw.cache.path_for(key), hash);
    s.dirty_blocks.insert(bid, dirty);

    Ok(())
}

/// Flushes every dirty block not yet flushed (i.e. the single block fsync
/// kept resident in RAM from the last write) before replication.
///
/// # Errors
/// Propagates a cache failure from the flush.
pub fn flush_unflushed_dirty_blocks(gw: &Gateway, inode: &Inode) -> GwResult<()> {
    let pending: Vec<(BlockId, BlockVersion, Vec<u8>)> = {
        let s = inode.read();
        s.dirty_blocks
            .iter()
            .filter(|(_, db)| !db.flushed)
            .map(|(bid, db)| (*bid, db.version, db.buf().to_vec()))
            .collect()
    };
    if pending.is_empty() {
        return Ok(());
    }
    let mut s = inode.write();
    for (bid, version, plaintext) in pending {
        flush_and_commit_block(gw, inode.file_id, &mut s, bid, version, plaintext)?;
    }
    Ok(())
}

fn wait_for_flush(gw: &Gateway, key: BlockKey) -> GwResult<()> {
    for _ in 0..200 {
        if gw.cache.read_block_encoded(key).is_ok() {
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    gw.cache.read_block_encoded(key).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::crypto::signing::GatewayKeypair;
    use crate::driver::IdentityDriver;
    use crate::fs_tree::FsTree;
    use crate::test_support::{FakeMsClient, FakeRgClient, FakeUgClient};
    use crate::types::{FileId, GatewayId, InodeType, Timespec, VolumeId};

    fn test_gateway() -> (Gateway, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ms = Arc::new(FakeMsClient::new(VolumeId(1)));
        let config = crate::config::GatewayConfig { gateway_id: GatewayId(1), volume_id: VolumeId(1), data_root: dir.path().to_path_buf(), block_size: 16, ..Default::default() };
        let gw = Gateway::new(config, Arc::new(SystemClock), Arc::new(IdentityDriver), ms, Arc::new(FakeRgClient::new()), Arc::new(FakeUgClient::unreachable()), GatewayKeypair::generate());
        (gw, dir)
    }

    #[test]
    fn aligned_write_then_read_round_trips() {
        let (gw, _dir) = test_gateway();
        let inode = Inode::new(FileId(1), VolumeId(1), "f".into(), None, InodeType::File, GatewayId(1), Timespec::new(0, 0));
        let n = apply_local_write(&gw, &inode, b"hello world!!!!!", 0).unwrap();
        assert_eq!(n, 16);
        let mut buf = [0u8; 16];
        let read = crate::read::read_pipeline(&gw, &inode, None, &mut buf, 0).unwrap();
        assert_eq!(read, 16);
        assert_eq!(&buf, b"hello world!!!!!");
        gw.shutdown();
    }

    #[test]
    fn unaligned_write_preserves_surrounding_bytes() {
        let (gw, _dir) = test_gateway();
        let inode = Inode::new(FileId(1), VolumeId(1), "f".into(), None, InodeType::File, GatewayId(1), Timespec::new(0, 0));
        apply_local_write(&gw, &inode, b"0123456789abcdef", 0).unwrap();
        apply_local_write(&gw, &inode, b"XY", 4).unwrap();
        let mut buf = [0u8; 16];
        crate::read::read_pipeline(&gw, &inode, None, &mut buf, 0).unwrap();
        assert_eq!(&buf[0..4], b"0123");
        assert_eq!(&buf[4..6], b"XY");
        assert_eq!(&buf[6..16], b"6789abcdef");
        gw.shutdown();
    }

    #[test]
    fn write_pipeline_forwards_then_falls_back_on_unreachable_coordinator() {
        let (gw, _dir) = test_gateway();
        let tree = FsTree::new(Arc::new(Inode::new(FileId(0), VolumeId(1), String::new(), None, InodeType::Dir, GatewayId(1), Timespec::new(0, 0))));
        let inode = Arc::new(Inode::new(FileId(2), VolumeId(1), "f".into(), Some(FileId(0)), InodeType::File, GatewayId(99), Timespec::new(0, 0)));
        let entry = tree.graft(&tree.root.clone(), &["f".to_string()], vec![inode]).unwrap();

        let n = write_pipeline(&gw, &entry, b"hi", 0).unwrap_err();
        assert!(matches!(n, crate::errors::GatewayError::Forbidden(_)));
        tree.shutdown();
        gw.shutdown();
    }

    #[test]
    fn write_pipeline_forwards_payload_to_reachable_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let ms = Arc::new(FakeMsClient::new(VolumeId(1)));
        let ug = Arc::new(FakeUgClient::reachable());
        let config = crate::config::GatewayConfig { gateway_id: GatewayId(1), volume_id: VolumeId(1), data_root: dir.path().to_path_buf(), block_size: 16, ..Default::default() };
        let gw = Gateway::new(
            config,
            Arc::new(SystemClock),
            Arc::new(IdentityDriver),
            ms,
            Arc::new(FakeRgClient::new()),
            Arc::clone(&ug) as Arc<dyn crate::ug::UgClient>,
            GatewayKeypair::generate(),
        );

        let tree = FsTree::new(Arc::new(Inode::new(FileId(0), VolumeId(1), String::new(), None, InodeType::Dir, GatewayId(1), Timespec::new(0, 0))));
        let inode = Arc::new(Inode::new(FileId(2), VolumeId(1), "f".into(), Some(FileId(0)), InodeType::File, GatewayId(99), Timespec::new(0, 0)));
        let entry = tree.graft(&tree.root.clone(), &["f".to_string()], vec![inode]).unwrap();

        let n = write_pipeline(&gw, &entry, b"hello", 4).unwrap();
        assert_eq!(n, 5);

        let sent = ug.last_request().unwrap();
        match sent.kind {
            RequestKind::Write { offset, data, .. } => {
                assert_eq!(offset, 4);
                assert_eq!(data, b"hello");
            }
            other => panic!("expected a Write request, got {other:?}"),
        }

        tree.shutdown();
        gw.shutdown();
    }
}
