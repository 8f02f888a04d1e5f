//! The signed request/reply envelope used by both the RG wire protocol and
//! the inter-UG protocol. Bincode-serialized and signed; the control plane
//! here has no need of a dedicated protobuf toolchain.

use serde::{Deserialize, Serialize};

use crate::crypto::hash::Sha256Digest;
use crate::errors::{GatewayError, GwResult};
use crate::manifest::BlockType;
use crate::types::{BlockId, BlockVersion, FileId, FileVersion, GatewayId};

/// One chunk (block or manifest) carried in the data-plane body, described
/// by its position in the control-plane descriptor list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub id: BlockId,
    pub version: BlockVersion,
    pub hash: Sha256Digest,
    pub block_type: BlockType,
    pub offset: u64,
    pub size: u64,
}

/// The operation a `Request` carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestKind {
    /// RG fan-out: a manifest chunk (optional) plus block chunks.
    PutChunks { file_id: FileId, file_version: FileVersion, coordinator_id: GatewayId, blocks: Vec<ChunkDescriptor> },
    /// Non-coordinator → coordinator: apply a write and return the updated entry.
    Write { file_id: FileId, file_version: FileVersion, offset: u64, data: Vec<u8> },
    Truncate { file_id: FileId, new_size: u64 },
    Rename { file_id: FileId, new_name: String },
    Detach { file_id: FileId },
    GetManifest { file_id: FileId },
}

/// A signed control-plane message. `signature` is computed over the
/// bincode encoding of `(sender, kind)`, per [`Request::sign`]/
/// [`Request::verify`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub sender: GatewayId,
    pub kind: RequestKind,
    pub signature: Vec<u8>,
}

impl Request {
    /// Builds and signs a request. The signature covers the bincode
    /// encoding of `(sender, kind)`.
    ///
    /// # Errors
    /// Returns [`GatewayError::Encode`] if `kind` fails to serialize.
    pub fn sign(sender: GatewayId, kind: RequestKind, signer: &impl crate::crypto::signing::Signer) -> GwResult<Self> {
        let bytes = signable_bytes(sender, &kind)?;
        let signature = signer.sign(&bytes);
        Ok(Self { sender, kind, signature })
    }

    /// Verifies this request's signature against the sender's certificate.
    ///
    /// # Errors
    /// Returns [`GatewayError::BadSignature`] if verification fails or the
    /// certificate/signature is malformed.
    pub fn verify(&self, public_pem: &str, verifier: &impl crate::crypto::signing::Verifier) -> GwResult<()> {
        let bytes = signable_bytes(self.sender, &self.kind)?;
        if verifier.verify(public_pem, &bytes, &self.signature)? {
            Ok(())
        } else {
            Err(GatewayError::BadSignature(format!("request from gateway {:?} failed verification", self.sender)))
        }
    }
}

fn signable_bytes(sender: GatewayId, kind: &RequestKind) -> GwResult<Vec<u8>> {
    let config = bincode::config::standard();
    bincode::serde::encode_to_vec((sender, kind), config).map_err(GatewayError::Encode)
}

/// Error codes mirroring an HTTP-status mapping: `0` success, 4xx and 5xx
/// map onto the crate's error kinds at the call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub error_code: i32,
    pub ent_out: Option<crate::ms::types::MdEntry>,
}

impl Reply {
    #[must_use]
    pub fn ok(ent_out: Option<crate::ms::types::MdEntry>) -> Self {
        Self { error_code: 0, ent_out }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signing::{GatewayKeypair, P256Verifier};

    #[test]
    fn sign_then_verify_roundtrip() {
        let kp = GatewayKeypair::generate();
        let kind = RequestKind::GetManifest { file_id: FileId(1) };
        let req = Request::sign(GatewayId(1), kind, &kp).unwrap();
        req.verify(&kp.public_pem, &P256Verifier).unwrap();
    }

    #[test]
    fn tampered_kind_fails_verification() {
        let kp = GatewayKeypair::generate();
        let kind = RequestKind::GetManifest { file_id: FileId(1) };
        let mut req = Request::sign(GatewayId(1), kind, &kp).unwrap();
        req.kind = RequestKind::GetManifest { file_id: FileId(2) };
        assert!(req.verify(&kp.public_pem, &P256Verifier).is_err());
    }
}
