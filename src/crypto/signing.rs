//! P-256/ECDSA signing of wire-protocol `Request` envelopes.
//!
//! Every RG PUTCHUNKS and every inter-UG request (`WRITE`, `TRUNCATE`, ...)
//! carries a signature over its control-plane bytes; the receiving gateway
//! verifies the signature using the sender's certificate before trusting
//! any chunk hash in the message.

use p256::ecdsa::{
    Signature, SigningKey, VerifyingKey,
    signature::{Signer as _, Verifier as _},
};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};

use crate::errors::{GatewayError, GwResult};

/// Generates a fresh P-256 keypair, PEM-encoded. Used to provision a
/// gateway's certificate in tests and in deployment tooling (outside this
/// crate's scope).
#[must_use]
pub fn generate_keypair_pem() -> (String, String) {
    use p256::elliptic_curve::rand_core::OsRng;
    let sk = SigningKey::random(&mut OsRng);
    let vk = sk.verifying_key();
    let priv_pem = sk.to_pkcs8_pem(Default::default()).expect("PEM encode of signing key").to_string();
    let pub_pem = vk.to_public_key_pem(Default::default()).expect("PEM encode of verifying key");
    (priv_pem, pub_pem)
}

/// A gateway's own signing identity.
pub struct GatewayKeypair {
    signing_key: SigningKey,
    pub public_pem: String,
}

impl GatewayKeypair {
    /// # Errors
    /// Returns an error if `priv_pem` is not a valid PKCS#8 P-256 key.
    pub fn from_pem(priv_pem: &str) -> GwResult<Self> {
        let signing_key = SigningKey::from_pkcs8_pem(priv_pem)
            .map_err(|e| GatewayError::BadSignature(format!("invalid signing key: {e}")))?;
        let public_pem = signing_key
            .verifying_key()
            .to_public_key_pem(Default::default())
            .map_err(|e| GatewayError::BadSignature(format!("PEM encode: {e}")))?;
        Ok(Self { signing_key, public_pem })
    }

    #[must_use]
    pub fn generate() -> Self {
        let (priv_pem, _) = generate_keypair_pem();
        Self::from_pem(&priv_pem).expect("freshly generated key must parse")
    }
}

/// Signs arbitrary control-plane bytes (the serialized `Request`, minus its
/// own signature field).
pub trait Signer {
    fn sign(&self, bytes: &[u8]) -> Vec<u8>;
}

impl Signer for GatewayKeypair {
    fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        let sig: Signature = self.signing_key.sign(bytes);
        sig.to_der().as_bytes().to_vec()
    }
}

/// Verifies a signature against a sender's certificate (PEM-encoded public
/// key, as the MS would hand back via `get_gateway_caps`/a cert lookup).
pub trait Verifier {
    fn verify(&self, public_pem: &str, bytes: &[u8], sig_der: &[u8]) -> GwResult<bool>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct P256Verifier;

impl Verifier for P256Verifier {
    fn verify(&self, public_pem: &str, bytes: &[u8], sig_der: &[u8]) -> GwResult<bool> {
        let vk = VerifyingKey::from_public_key_pem(public_pem)
            .map_err(|e| GatewayError::BadSignature(format!("invalid certificate: {e}")))?;
        let sig = Signature::from_der(sig_der)
            .map_err(|e| GatewayError::BadSignature(format!("malformed signature: {e}")))?;
        Ok(vk.verify(bytes, &sig).is_ok())
    }
}
