//! A unit of in-RAM, modified file content held by an inode until it is
//! flushed to the disk cache and committed into the manifest.

use std::path::PathBuf;
use std::sync::Arc;

use crate::crypto::hash::Sha256Digest;
use crate::types::BlockVersion;

/// One in-flight modification to a block.
///
/// A block is **shared** when `buf` aliases a caller-supplied region (the
/// common case for a fresh write) and **unshared** once it owns a private
/// copy. Flushing or committing a shared block requires cloning its buffer
/// first — `ensure_unshared` does this lazily so a block that is flushed
/// without ever being aliased again never pays the copy.
#[derive(Debug, Clone)]
pub struct DirtyBlock {
    pub version: BlockVersion,
    buf: Arc<Vec<u8>>,
    unshared: bool,
    pub fd: Option<PathBuf>,
    pub dirty: bool,
    pub flushing: bool,
    pub flushed: bool,
    pub mmaped: bool,
    pub hash: Option<Sha256Digest>,
}

impl DirtyBlock {
    /// A freshly written block: shared buffer, not yet flushed.
    #[must_use]
    pub fn new(version: BlockVersion, buf: Arc<Vec<u8>>) -> Self {
        Self {
            version,
            buf,
            unshared: false,
            fd: None,
            dirty: true,
            flushing: false,
            flushed: false,
            mmaped: false,
            hash: None,
        }
    }

    #[must_use]
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        !self.unshared
    }

    /// Clones the buffer into a privately owned copy if it is still shared.
    /// Must be called before a shared block is flushed or committed, per
    /// the dirty-block model: the caller's region may be reused or freed
    /// the instant this call returns.
    pub fn ensure_unshared(&mut self) {
        if !self.unshared {
            self.buf = Arc::new((*self.buf).clone());
            self.unshared = true;
        }
    }

    /// Records the result of a successful flush: the temp file descriptor
    /// the encoded bytes were written to, and their hash. `dirty` stays set
    /// until the block is committed to the manifest.
    pub fn mark_flushed(&mut self, fd: PathBuf, hash: Sha256Digest) {
        self.fd = Some(fd);
        self.hash = Some(hash);
        self.flushing = false;
        self.flushed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_unshared_copies_buffer_once() {
        let shared = Arc::new(vec![1u8, 2, 3]);
        let mut block = DirtyBlock::new(BlockVersion(1), Arc::clone(&shared));
        assert!(block.is_shared());

        block.ensure_unshared();
        assert!(!block.is_shared());
        assert_eq!(block.buf(), &[1, 2, 3]);
        assert_eq!(Arc::strong_count(&shared), 1, "private copy must not alias the caller's buffer");
    }

    #[test]
    fn mark_flushed_clears_flushing_keeps_dirty_until_commit() {
        let mut block = DirtyBlock::new(BlockVersion(1), Arc::new(vec![0u8; 4]));
        block.flushing = true;
        block.mark_flushed(PathBuf::from("/tmp/x"), [7u8; 32]);
        assert!(block.flushed);
        assert!(!block.flushing);
        assert!(block.dirty);
        assert_eq!(block.hash, Some([7u8; 32]));
    }
}
