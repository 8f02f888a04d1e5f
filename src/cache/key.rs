use serde::{Deserialize, Serialize};

use crate::types::{BlockId, BlockVersion, FileId, FileVersion};

/// Identifies one on-disk block image: `<fid>/<fver>/<bid>.<bver>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockKey {
    pub fid: FileId,
    pub fver: FileVersion,
    pub bid: BlockId,
    pub bver: BlockVersion,
}

impl BlockKey {
    #[must_use]
    pub const fn new(fid: FileId, fver: FileVersion, bid: BlockId, bver: BlockVersion) -> Self {
        Self { fid, fver, bid, bver }
    }

    /// Path fragment relative to the cache's `data_root`.
    #[must_use]
    pub fn relative_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from("files")
            .join(format!("{:x}", self.fid.0))
            .join(self.fver.0.to_string())
            .join(format!("{}.{}", self.bid.0, self.bver.0))
    }

    /// Directory holding this key's file, relative to `data_root`.
    #[must_use]
    pub fn dir(&self) -> std::path::PathBuf {
        std::path::PathBuf::from("files")
            .join(format!("{:x}", self.fid.0))
            .join(self.fver.0.to_string())
    }
}
