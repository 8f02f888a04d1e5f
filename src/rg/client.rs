//! The RG wire protocol client interface. TLS/HTTP transport details are
//! out of scope; this trait is the boundary a real deployment's HTTP(S)
//! client implements and tests fake in memory.

use crate::errors::GwResult;
use crate::manifest::Manifest;
use crate::types::{BlockId, BlockVersion, FileId, FileVersion, GatewayId};
use crate::wire::{Reply, Request};

pub trait RgClient: Send + Sync {
    /// Sends the signed control-plane `Request` (kind = `PutChunks`)
    /// followed by the mmap'd data-plane body to one RG.
    fn put_chunks(&self, rg_id: GatewayId, request: &Request, data_plane: &[u8]) -> GwResult<Reply>;

    /// Downloads and verifies a file's current manifest from one RG. Used
    /// by `manifest_ensure_fresh` and by the vacuum engine's old-manifest
    /// fetch.
    fn get_manifest(&self, rg_id: GatewayId, file_id: FileId) -> GwResult<Manifest>;

    /// Downloads one block's encoded bytes from one RG, for the read
    /// pipeline's remote fallback. The caller decodes through the driver.
    fn get_block(
        &self,
        rg_id: GatewayId,
        file_id: FileId,
        file_version: FileVersion,
        block_id: BlockId,
    ) -> GwResult<Vec<u8>>;

    /// Issues deletes for a set of now-garbage blocks, for the vacuum
    /// engine. `NotFound` for an already-removed block is absorbed by the
    /// caller, not this trait.
    fn delete_blocks(
        &self,
        rg_id: GatewayId,
        file_id: FileId,
        file_version: FileVersion,
        block_ids: &[(BlockId, BlockVersion)],
    ) -> GwResult<()>;
}
