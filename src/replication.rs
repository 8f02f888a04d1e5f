//! The replication engine (spec §4.6): two-phase, restartable.
//!
//! Phase A ([`build_replica_context`]) snapshots an inode and its flushed
//! dirty blocks into a [`ReplicaContext`] independent of subsequent inode
//! mutation. Phase B ([`ReplicaContext::drive`]) runs the vacuum-log
//! append, RG fan-out, and MS metadata update RPCs, each gated by a
//! progress flag so a partially failed context can be re-driven.

use std::sync::Arc;

use crate::cache::BlockCache;
use crate::crypto::signing::GatewayKeypair;
use crate::errors::{GatewayError, GwResult};
use crate::inode::Inode;
use crate::manifest::{BlockType, Manifest};
use crate::ms::client::MsClient;
use crate::ms::types::VacuumLogEntry;
use crate::rg::client::RgClient;
use crate::types::{BlockId, FileId, FileVersion, GatewayId, Timespec, VolumeId};
use crate::wire::{ChunkDescriptor, Request, RequestKind};

/// Pre-set progress flags a caller may seed before driving a context
/// (§4.6 "A caller may pre-set any of the progress flags via
/// `replica_hint`"). Truncate sets `no_rg_vacuum` because it vacuums its
/// own removed-block set separately.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicaHints {
    pub no_ms_update: bool,
    pub no_rg_vacuum: bool,
    pub no_rg_blocks: bool,
}

/// An independent snapshot of the blocks and manifest delta being
/// replicated, plus everything needed to drive the RPC sequence (§3
/// "Replica Context").
pub struct ReplicaContext {
    pub file_id: FileId,
    pub volume_id: VolumeId,
    pub file_version: FileVersion,
    pub fs_path: String,
    pub md_entry: crate::ms::types::MdEntry,
    pub affected_blocks: Vec<BlockId>,
    pub write_delta: Manifest,
    pub request: Request,
    data_plane: memmap2::Mmap,
    pub rg_ids: Vec<GatewayId>,
    pub old_manifest_mtime: Option<Timespec>,

    pub flushed_blocks: bool,
    pub sent_vacuum_log: bool,
    pub replicated_blocks: bool,
    pub sent_ms_update: bool,
}

impl ReplicaContext {
    #[must_use]
    pub fn data_plane(&self) -> &[u8] {
        &self.data_plane
    }

    pub fn apply_hints(&mut self, hints: ReplicaHints) {
        if hints.no_ms_update {
            self.sent_ms_update = true;
        }
        if hints.no_rg_vacuum {
            self.sent_vacuum_log = true;
        }
        if hints.no_rg_blocks {
            self.replicated_blocks = true;
        }
    }

    /// Drives phase B: vacuum-log append, then RG fan-out, then MS
    /// update, each skipped if its progress flag is already set. Returns
    /// the worst error on partial failure; the context remains valid for
    /// re-invocation (§4.6 "Failure semantics").
    pub fn drive(&mut self, self_id: GatewayId, ms: &dyn MsClient, rg: &dyn RgClient) -> GwResult<()> {
        if !self.sent_vacuum_log {
            let entry = VacuumLogEntry {
                volume_id: self.volume_id,
                gateway_id: self_id,
                file_id: self.file_id,
                file_version: self.file_version,
                manifest_mtime: self.write_delta.modtime,
                affected_blocks: self.affected_blocks.clone(),
            };
            ms.append_vacuum_log_entry(entry)?;
            self.sent_vacuum_log = true;
        }

        if !self.replicated_blocks {
            for &rg_id in &self.rg_ids {
                let reply = rg.put_chunks(rg_id, &self.request, &self.data_plane)?;
                if !reply.is_success() {
                    return Err(GatewayError::RemoteIO(format!(
                        "RG {rg_id:?} rejected PUTCHUNKS for file {:?}: code {}", self.file_id, reply.error_code
                    )));
                }
            }
            self.replicated_blocks = true;
        }

        if !self.sent_ms_update {
            // A non-coordinator context is only ever built for a file this
            // gateway has since lost coordinatorship of mid-flight; its MS
            // update still goes through `ms.update`, which forwards to the
            // real coordinator on the MS side. The inter-UG WRITE envelope
            // (§4.5 step "send a signed WRITE request to the coordinator")
            // is used by the write pipeline before a context is ever built,
            // not here.
            let xattr_hash = self.md_entry.xattr_hash;
            ms.update(&self.md_entry, &self.write_delta, xattr_hash)?;
            self.sent_ms_update = true;
        }

        Ok(())
    }
}

/// Builds a [`ReplicaContext`] from the inode's currently flushed dirty
/// blocks (§4.6 phase A). Every block in `affected_blocks` MUST already be
/// flushed to the disk cache (write pipeline step 6) before this is
/// called.
///
/// # Errors
/// Returns an error if a flushed block's bytes are missing from the disk
/// cache, or if signing/encoding fails.
pub fn build_replica_context(
    inode: &Inode,
    fs_path: &str,
    cache: &BlockCache,
    driver: &dyn crate::driver::Driver,
    signer: &GatewayKeypair,
    self_id: GatewayId,
    rg_ids: Vec<GatewayId>,
) -> GwResult<ReplicaContext> {
    let (md_entry, affected_blocks, write_delta, file_version, old_manifest_mtime, is_coordinator) = {
        let s = inode.read();
        let affected: Vec<BlockId> =
            s.dirty_blocks.iter().filter(|(_, b)| b.flushed).map(|(&bid, _)| bid).collect();
        let write_delta = s.manifest.subset(&affected);
        (inode.export(), affected, write_delta, s.file_version, s.replaced_blocks.modtime, s.coordinator_id == self_id)
    };

    let mut descriptors = Vec::new();
    let mut payload = Vec::new();

    if is_coordinator {
        let manifest_bytes = bincode::serde::encode_to_vec(&write_delta, bincode::config::standard())
            .map_err(GatewayError::Encode)?;
        let encoded = driver.encode_chunk(&manifest_bytes)?;
        let hash = crate::crypto::hash::block_hash(&encoded);
        descriptors.push(ChunkDescriptor {
            id: BlockId(u64::MAX),
            version: crate::types::BlockVersion(0),
            hash,
            block_type: BlockType::Manifest,
            offset: payload.len() as u64,
            size: encoded.len() as u64,
        });
        payload.extend_from_slice(&encoded);
    }

    for &bid in &affected_blocks {
        let key = crate::cache::BlockKey::new(inode.file_id, file_version, bid, write_delta.get_block(bid).map(|b| b.version).unwrap_or(crate::types::BlockVersion(0)));
        let encoded = cache.read_block_encoded(key)?;
        let hash = crate::crypto::hash::block_hash(&encoded);
        let version = write_delta.get_block(bid).map(|b| b.version).unwrap_or(crate::types::BlockVersion(0));
        descriptors.push(ChunkDescriptor {
            id: bid,
            version,
            hash,
            block_type: BlockType::Block,
            offset: payload.len() as u64,
            size: encoded.len() as u64,
        });
        payload.extend_from_slice(&encoded);
    }

    let kind = RequestKind::PutChunks {
        file_id: inode.file_id,
        file_version,
        coordinator_id: md_entry.coordinator_id,
        blocks: descriptors,
    };
    let request = Request::sign(self_id, kind, signer)?;

    let data_plane = mmap_anonymous_payload(&payload)?;

    Ok(ReplicaContext {
        file_id: inode.file_id,
        volume_id: inode.volume_id,
        file_version,
        fs_path: fs_path.to_string(),
        md_entry,
        affected_blocks,
        write_delta,
        request,
        data_plane,
        rg_ids,
        old_manifest_mtime,
        flushed_blocks: true,
        sent_vacuum_log: false,
        replicated_blocks: false,
        sent_ms_update: false,
    })
}

/// Writes `payload` to an anonymous (already-unlinked) temp file and maps
/// it into memory, per §6's ".replica-XXXXXX mkostemp file... unlinked
/// immediately after creation so it disappears on process exit".
/// `tempfile::tempfile()` gives exactly that on Unix: a file handle with
/// no surviving directory entry.
fn mmap_anonymous_payload(payload: &[u8]) -> GwResult<memmap2::Mmap> {
    use std::io::Write;
    let mut file = tempfile::tempfile()?;
    if payload.is_empty() {
        // mmap of a zero-length file is invalid; pad with one byte the
        // descriptor list never references.
        file.write_all(&[0u8])?;
    } else {
        file.write_all(payload)?;
    }
    file.sync_all()?;
    // Safety: `mmap` requires the mapped file not be truncated by another
    // process while mapped. This file has no path (unlinked on creation,
    // on platforms where `tempfile` supports it) and is private to this
    // call, so nothing else can reach it.
    unsafe { memmap2::Mmap::map(&file).map_err(GatewayError::Io) }
}
