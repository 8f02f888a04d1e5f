use thiserror::Error;

/// Crate-wide error type.
///
/// Variants through `OutOfMemory` map directly onto the error kinds a
/// caller can observe and (sometimes) recover from. Transient kinds are
/// retried by callers; `Forbidden`/hash/signature failures are fatal for
/// the specific call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("codec error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("serde JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    /// Transient: timeout, coordinator mid-change, xattr hash moved underfoot.
    /// Caller retries, possibly after a backoff.
    #[error("transient failure, retry: {0}")]
    Again(String),

    /// All candidate gateways failed, or there is nothing to fetch.
    #[error("no data available: {0}")]
    NoData(String),

    /// Wire-level failure talking to an RG/MS/peer UG.
    #[error("remote I/O failure: {0}")]
    RemoteIO(String),

    /// Capability check failed on the MS or a peer. Fatal for the call.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Inode or block absent on the MS or an RG.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent rename (or similar) of the same path. Caller retries.
    #[error("busy: {0}")]
    Busy(String),

    /// Peer turned out not to be the coordinator we believed it was.
    #[error("stale coordinator: {0}")]
    Stale(String),

    /// Allocation failed. Background work retries with backoff; user-facing
    /// calls propagate it.
    #[error("out of memory")]
    OutOfMemory,

    /// A block or manifest's hash did not match its signed descriptor.
    #[error("hash mismatch: {0}")]
    HashMismatch(String),

    /// A signature failed to verify.
    #[error("signature verification failed: {0}")]
    BadSignature(String),

    /// Conflict the caller must resolve explicitly (e.g. a graft that
    /// would collide with an existing child).
    #[error("conflict: {0}")]
    Conflict(String),

    /// An internal invariant was violated. See [`bug`].
    #[error("internal invariant violated: {0}")]
    Bug(String),
}

pub type GwResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// True for errors worth retrying after a backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Again(_) | Self::OutOfMemory)
    }
}

/// Record an internal invariant violation and abort the process.
///
/// Manifest-is-null, inode-missing-from-a-valid-handle, and import
/// type/id/volume/size mismatches are unrecoverable BUG conditions: they
/// indicate a broken invariant elsewhere in the gateway, not a bad
/// environment, so recovering "gracefully" would just corrupt more state.
/// This is the one place in the crate that terminates the process instead
/// of returning a `Result`.
#[cold]
pub fn bug(msg: impl Into<String>) -> ! {
    let msg = msg.into();
    log::error!("internal invariant violated, aborting: {msg}");
    std::process::abort();
}
