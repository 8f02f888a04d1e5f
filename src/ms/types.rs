//! Wire shapes exchanged with the Metadata Service (spec §6). `MdEntry` is
//! the transport form of an [`crate::inode::Inode`]'s attributes — what
//! the MS hands back from `getattr`/`path_download`/`coordinate`, and what
//! a coordinator sends up via `update`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::hash::Sha256Digest;
use crate::types::{FileId, FileVersion, GatewayId, InodeType, Timespec, VolumeId, WriteNonce, XattrNonce};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdEntry {
    pub file_id: FileId,
    pub volume_id: VolumeId,
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
    pub max_read_freshness_ms: u64,
    pub max_write_freshness_ms: u64,
    pub size: u64,
    pub xattr_hash: Sha256Digest,
}

/// A locally cached path entry, sent to `getattr_multi` so the MS can
/// report whether it changed (§4.3 `path_ensure_fresh` step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathEnt {
    pub path: String,
    pub file_id: FileId,
    pub file_version: FileVersion,
    pub write_nonce: WriteNonce,
}

/// Result of a single `getattr`/`getattr_multi` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GetattrOutcome {
    NoChange,
    Removed,
    New(MdEntry),
    NotFound,
}

/// One record in the MS-resident per-file vacuum log (§6, GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VacuumLogEntry {
    pub volume_id: VolumeId,
    pub gateway_id: GatewayId,
    pub file_id: FileId,
    pub file_version: FileVersion,
    pub manifest_mtime: Timespec,
    pub affected_blocks: Vec<crate::types::BlockId>,
}

/// Outcome of a `coordinate` call (§4.8 `chcoord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinateOutcome {
    Confirmed(MdEntry),
    /// Another gateway won the race; the caller should set
    /// `coordinator_id` to `winner` and return `Again`.
    Lost { winner: GatewayId },
}

pub type XattrBundle = BTreeMap<String, Vec<u8>>;
