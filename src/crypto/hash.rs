//! The two canonical SHA-256 hashes the gateway computes: the block hash
//! (over serialized, driver-encoded bytes as stored on disk — never the
//! in-RAM plaintext) and the xattr hash (over a canonical encoding of a
//! file's extended attributes, used by the MS to let peers verify the
//! current xattr bundle without trusting the coordinator).

use sha2::{Digest, Sha256};

use crate::types::{FileId, VolumeId, XattrNonce};

pub type Sha256Digest = [u8; 32];

/// SHA-256 over the serialized (driver-encoded) block bytes as stored on
/// disk, not the plaintext.
#[must_use]
pub fn block_hash(encoded_bytes: &[u8]) -> Sha256Digest {
    let mut hasher = Sha256::new();
    hasher.update(encoded_bytes);
    hasher.finalize().into()
}

/// SHA-256 over `(volume_id | file_id | xattr_nonce | Σᵢ (len(nameᵢ) |
/// nameᵢ | len(valᵢ) | valᵢ))` with all names sorted lexicographically.
#[must_use]
pub fn xattr_hash(
    volume_id: VolumeId,
    file_id: FileId,
    xattr_nonce: XattrNonce,
    xattrs: &std::collections::BTreeMap<String, Vec<u8>>,
) -> Sha256Digest {
    // BTreeMap already iterates in lexicographic key order.
    let mut hasher = Sha256::new();
    hasher.update(volume_id.0.to_be_bytes());
    hasher.update(file_id.0.to_be_bytes());
    hasher.update(xattr_nonce.0.to_be_bytes());
    for (name, value) in xattrs {
        hasher.update((name.len() as u64).to_be_bytes());
        hasher.update(name.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xattr_hash_is_order_independent_of_insertion() {
        let mut a = std::collections::BTreeMap::new();
        a.insert("zeta".to_string(), b"z".to_vec());
        a.insert("alpha".to_string(), b"a".to_vec());
        let mut b = std::collections::BTreeMap::new();
        b.insert("alpha".to_string(), b"a".to_vec());
        b.insert("zeta".to_string(), b"z".to_vec());

        let h1 = xattr_hash(VolumeId(1), FileId(2), XattrNonce(3), &a);
        let h2 = xattr_hash(VolumeId(1), FileId(2), XattrNonce(3), &b);
        assert_eq!(h1, h2);
    }

    #[test]
    fn block_hash_reflects_encoded_bytes() {
        let h1 = block_hash(b"plaintext");
        let h2 = block_hash(b"different");
        assert_ne!(h1, h2);
    }
}
