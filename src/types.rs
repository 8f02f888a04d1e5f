//! Core identity and versioning types shared by every module: file/volume/
//! gateway ids, block ids, and the timestamp pair used for manifest modtimes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit file identifier, MS-assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

/// Volume identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub u64);

/// Gateway identifier (UG, RG, or AG — disambiguated by `GatewayType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GatewayId(pub u64);

/// Block identifier within a file, 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

/// Monotonic per-file version. Reversioned on truncate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileVersion(pub i64);

/// Per-block version, randomly reassigned on every modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockVersion(pub i64);

/// Monotonic per-file write counter, bumped on each local write by the
/// coordinator; used to detect concurrent writes across unlock/relock gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriteNonce(pub i64);

/// Monotonic per-file xattr counter, committed to the MS alongside the
/// xattr hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct XattrNonce(pub i64);

/// Inode type: regular file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeType {
    File,
    Dir,
}

/// Gateway kind, as reported by the MS's certificate/cap queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayType {
    User,
    Replica,
    Acquisition,
}

/// Seconds/nanoseconds pair used for manifest and inode modtimes. Kept as a
/// direct tuple (not collapsed into a `Duration`/`SystemTime`) because
/// comparisons must match the exact `(sec, nsec)` ordering semantics used
/// when deciding whether a peer's manifest is newer than ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i32,
}

impl Timespec {
    #[must_use]
    pub const fn new(sec: i64, nsec: i32) -> Self {
        Self { sec, nsec }
    }

    #[must_use]
    pub fn now() -> Self {
        let d = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self { sec: d.as_secs() as i64, nsec: d.subsec_nanos() as i32 }
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// A volume-scoped capability bit, as granted by the MS to a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    Read,
    Write,
    Coordinate,
}
