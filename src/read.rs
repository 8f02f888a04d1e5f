//! The read pipeline (spec §4.5): partitions a read span into blocks and
//! serves each from the dirty set, the local disk cache, or a remote RG/AG
//! in that order, zero-filling write-holes the manifest has no entry for.

use crate::cache::BlockKey;
use crate::errors::{GatewayError, GwResult};
use crate::file_handle::FileHandle;
use crate::gateway::Gateway;
use crate::inode::Inode;
use crate::types::{BlockId, BlockVersion};

/// Reads `buf.len()` bytes starting at `offset`, returning the number of
/// bytes actually copied (short only at end-of-file, mirroring a POSIX
/// `read`). When `handle` is given, every block fetched purely to satisfy
/// this read (not already dirty) is recorded on it as a close-time
/// eviction hint (§4.4 step 7).
///
/// # Errors
/// Propagates a cache or remote RG failure for a block neither dirty nor
/// already cached.
pub fn read_pipeline(gw: &Gateway, inode: &Inode, mut handle: Option<&mut FileHandle>, buf: &mut [u8], offset: u64) -> GwResult<usize> {
    let size = inode.read().size;
    if offset >= size {
        return Ok(0);
    }

    let block_size = gw.config.block_size.max(1);
    let to_read = (buf.len() as u64).min(size - offset);
    let first_block = offset / block_size;
    let last_block = (offset + to_read.max(1) - 1) / block_size;

    let mut copied: u64 = 0;
    for bid_raw in first_block..=last_block {
        let bid = BlockId(bid_raw);
        let block_start = bid_raw * block_size;
        let in_block_offset = offset.max(block_start) - block_start;
        let remaining = to_read - copied;
        let in_block_len = (block_size - in_block_offset).min(remaining);

        let data = fetch_block(gw, inode, bid, handle.as_deref_mut())?;
        let src_start = in_block_offset as usize;
        let src_end = (src_start + in_block_len as usize).min(data.len());
        let dst_start = copied as usize;
        let n = src_end.saturating_sub(src_start);
        if n > 0 {
            buf[dst_start..dst_start + n].copy_from_slice(&data[src_start..src_end]);
        }
        copied += in_block_len;
    }

    Ok(copied as usize)
}

/// Fetches one block's plaintext, checking the dirty set, then the local
/// disk cache, then every known remote source in order (§4.5 step 2).
/// Exposed so the write pipeline can read-before-write on a boundary
/// block. A block served from the dirty set is not read-caused, so any
/// stale hint for it is cleared rather than recorded.
///
/// # Errors
/// Propagates the last remote failure if no source has the block.
pub(crate) fn fetch_block(gw: &Gateway, inode: &Inode, bid: BlockId, mut handle: Option<&mut FileHandle>) -> GwResult<Vec<u8>> {
    {
        let s = inode.read();
        if let Some(dirty) = s.dirty_blocks.get(&bid) {
            if let Some(h) = handle.as_deref_mut() {
                h.clear_eviction_hint(bid);
            }
            return Ok(dirty.buf().to_vec());
        }
    }

    let (file_version, manifest_has_block, block_version) = {
        let s = inode.read();
        match s.manifest.get_block(bid) {
            Some(info) => (s.file_version, true, info.version),
            None => (s.file_version, false, BlockVersion(0)),
        }
    };

    if !manifest_has_block {
        let block_size = gw.config.block_size.max(1);
        return Ok(vec![0u8; block_size as usize]);
    }

    let key = BlockKey::new(inode.file_id, file_version, bid, block_version);
    if let Ok(data) = gw.cache.read_block(key) {
        if let Some(h) = handle.as_deref_mut() {
            h.record_eviction_hint(bid, block_version);
        }
        return Ok(data);
    }

    let coordinator_id = inode.read().coordinator_id;
    let mut candidates = vec![coordinator_id];
    for rg_id in gw.ms.list_replica_gateway_ids() {
        if !candidates.contains(&rg_id) {
            candidates.push(rg_id);
        }
    }

    let mut last_err = GatewayError::NoData(format!("no source had block {bid:?} of {:?}", inode.file_id));
    for rg_id in candidates {
        match gw.rg.get_block(rg_id, inode.file_id, file_version, bid) {
            Ok(encoded) => {
                let plaintext = gw.driver.decode_chunk(&encoded)?;
                let _ = gw.cache.write_block_async(key, encoded);
                if let Some(h) = handle.as_deref_mut() {
                    h.record_eviction_hint(bid, block_version);
                }
                return Ok(plaintext);
            }
            Err(e) => last_err = e,
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::crypto::signing::GatewayKeypair;
    use crate::driver::IdentityDriver;
    use crate::test_support::{FakeMsClient, FakeRgClient, FakeUgClient};
    use crate::types::{FileId, GatewayId, InodeType, Timespec, VolumeId};
    use std::sync::Arc;

    fn test_gateway() -> (Gateway, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ms = Arc::new(FakeMsClient::new(VolumeId(1)));
        let config = crate::config::GatewayConfig { gateway_id: GatewayId(1), volume_id: VolumeId(1), data_root: dir.path().to_path_buf(), block_size: 16, ..Default::default() };
        let gw = Gateway::new(config, Arc::new(SystemClock), Arc::new(IdentityDriver), ms, Arc::new(FakeRgClient::new()), Arc::new(FakeUgClient::unreachable()), GatewayKeypair::generate());
        (gw, dir)
    }

    #[test]
    fn read_past_eof_returns_zero() {
        let (gw, _dir) = test_gateway();
        let inode = Inode::new(FileId(1), VolumeId(1), "f".into(), None, InodeType::File, GatewayId(1), Timespec::new(0, 0));
        let mut buf = [0u8; 4];
        let n = read_pipeline(&gw, &inode, None, &mut buf, 0).unwrap();
        assert_eq!(n, 0);
        gw.shutdown();
    }

    #[test]
    fn read_hole_zero_fills() {
        let (gw, _dir) = test_gateway();
        let inode = Inode::new(FileId(1), VolumeId(1), "f".into(), None, InodeType::File, GatewayId(1), Timespec::new(0, 0));
        inode.write().size = 16;
        let mut buf = [0xFFu8; 8];
        let n = read_pipeline(&gw, &inode, None, &mut buf, 0).unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf, [0u8; 8]);
        gw.shutdown();
    }

    #[test]
    fn read_dirty_block_sees_unflushed_write() {
        let (gw, _dir) = test_gateway();
        let inode = Inode::new(FileId(1), VolumeId(1), "f".into(), None, InodeType::File, GatewayId(1), Timespec::new(0, 0));
        {
            let mut s = inode.write();
            s.size = 16;
            s.dirty_blocks.insert(BlockId(0), crate::dirty_block::DirtyBlock::new(BlockVersion(1), Arc::new(b"hello world!!!!!".to_vec())));
        }
        let mut buf = [0u8; 5];
        let n = read_pipeline(&gw, &inode, None, &mut buf, 0).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        gw.shutdown();
    }

    #[test]
    fn handle_records_hint_for_remote_fetched_block_and_evicts_on_close() {
        let (gw, _dir) = test_gateway();
        let inode = Inode::new(FileId(1), VolumeId(1), "f".into(), None, InodeType::File, GatewayId(2), Timespec::new(0, 0));
        inode.write().size = 16;

        let plaintext = b"abcdefghijklmnop".to_vec();
        let encoded = gw.driver.encode_chunk(&plaintext).unwrap();
        let hash = crate::crypto::hash::block_hash(&encoded);
        let version = BlockVersion(7);
        inode.write().manifest.put_block(
            BlockId(0),
            crate::manifest::BlockInfo::new(version, hash, crate::manifest::BlockType::Block),
            true,
        ).unwrap();
        gw.rg.set_block(GatewayId(2), FileId(1), crate::types::FileVersion(1), BlockId(0), encoded);

        let mut handle = FileHandle::new(FileId(1));
        let mut buf = [0u8; 16];
        let n = read_pipeline(&gw, &inode, Some(&mut handle), &mut buf, 0).unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf, plaintext.as_slice());

        let key = BlockKey::new(FileId(1), crate::types::FileVersion(1), BlockId(0), version);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while gw.cache.read_block(key).is_err() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(gw.cache.read_block(key).is_ok(), "block should have been cached by the remote fetch");

        handle.apply_eviction_hints_on_close(&inode, crate::types::FileVersion(1), &gw.cache);
        assert!(matches!(gw.cache.read_block(key), Err(crate::errors::GatewayError::NotFound(_))));
        gw.shutdown();
    }
}
