//! The Metadata Service client interface (spec §6). The MS's own storage
//! is explicitly out of scope (§1) — this crate only consumes it through
//! this trait, so a real deployment's HTTP(S) client and this crate's
//! in-memory test fake are interchangeable.

use crate::crypto::hash::Sha256Digest;
use crate::errors::GwResult;
use crate::manifest::Manifest;
use crate::types::{Capability, FileId, FileVersion, GatewayId, GatewayType, InodeType, Timespec, VolumeId, XattrNonce};

use super::types::{CoordinateOutcome, GetattrOutcome, MdEntry, PathEnt, VacuumLogEntry, XattrBundle};

pub trait MsClient: Send + Sync {
    fn getattr(&self, path_ent: &PathEnt) -> GwResult<GetattrOutcome>;

    fn getattr_multi(&self, path_ents: &[PathEnt]) -> GwResult<Vec<GetattrOutcome>> {
        path_ents.iter().map(|p| self.getattr(p)).collect()
    }

    /// Resolves a suffix of path component names to their `MdEntry`s.
    fn path_download(&self, names: &[String]) -> GwResult<Vec<MdEntry>>;

    fn listdir(&self, file_id: FileId, num_children: u64, capacity: u64) -> GwResult<Vec<MdEntry>>;

    fn diffdir(&self, file_id: FileId, num_children: u64, least_unknown_generation: u64) -> GwResult<Vec<MdEntry>>;

    fn create(&self, parent_id: FileId, name: &str, inode_type: InodeType, owner: GatewayId, mode: u32) -> GwResult<MdEntry>;

    fn mkdir(&self, parent_id: FileId, name: &str, owner: GatewayId, mode: u32) -> GwResult<MdEntry> {
        self.create(parent_id, name, InodeType::Dir, owner, mode)
    }

    /// Applies a coordinator's metadata+block update (replication phase B
    /// step 3).
    fn update(&self, entry: &MdEntry, write_delta: &Manifest, xattr_hash: Sha256Digest) -> GwResult<MdEntry>;

    fn delete(&self, file_id: FileId) -> GwResult<()>;

    fn rename(&self, old_path: &str, new_path: &str) -> GwResult<MdEntry>;

    /// Attempts to become the coordinator of `entry.file_id` (§4.8
    /// `chcoord`). Linearizable on the MS: concurrent callers for the same
    /// file see exactly one [`CoordinateOutcome::Confirmed`].
    fn coordinate(&self, entry: &MdEntry, xattr_hash: Sha256Digest) -> GwResult<CoordinateOutcome>;

    fn append_vacuum_log_entry(&self, entry: VacuumLogEntry) -> GwResult<()>;

    /// Returns the oldest (head) entry for `(volume_id, file_id)`, if any.
    fn peek_vacuum_log(&self, volume_id: VolumeId, file_id: FileId) -> GwResult<Option<VacuumLogEntry>>;

    fn remove_vacuum_log_entry(
        &self,
        volume_id: VolumeId,
        file_id: FileId,
        file_version: FileVersion,
        manifest_mtime: Timespec,
    ) -> GwResult<()>;

    /// Fetches and verifies (server-side) the xattr bundle for a file. The
    /// caller supplies `expected_hash` so the MS can short-circuit when the
    /// bundle is unchanged.
    fn fetchxattrs(
        &self,
        volume_id: VolumeId,
        file_id: FileId,
        xattr_nonce: XattrNonce,
        expected_hash: Sha256Digest,
    ) -> GwResult<XattrBundle>;

    fn get_volume_id(&self) -> VolumeId;

    fn get_volume_blocksize(&self) -> u64;

    fn get_gateway_type(&self, id: GatewayId) -> GwResult<GatewayType>;

    fn get_gateway_caps(&self, id: GatewayId) -> GwResult<Vec<Capability>>;

    fn list_replica_gateway_ids(&self) -> Vec<GatewayId>;
}
