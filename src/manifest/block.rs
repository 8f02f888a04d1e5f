use serde::{Deserialize, Serialize};

use crate::crypto::hash::Sha256Digest;
use crate::types::BlockVersion;

/// What a manifest entry describes: a regular content block, or the
/// manifest chunk itself (used only in the replication control-plane
/// descriptor list, never stored as a manifest entry of itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockType {
    Block,
    Manifest,
}

/// One manifest entry: `block_id -> {version, hash, type, dirty}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub version: BlockVersion,
    pub hash: Sha256Digest,
    pub block_type: BlockType,
    pub dirty: bool,
}

impl BlockInfo {
    #[must_use]
    pub const fn new(version: BlockVersion, hash: Sha256Digest, block_type: BlockType) -> Self {
        Self { version, hash, block_type, dirty: false }
    }
}
