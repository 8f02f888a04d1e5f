//! Signing/verification of wire-protocol requests, and the two canonical
//! SHA-256 hashes the gateway relies on (block hash, xattr hash).

pub mod hash;
pub mod signing;

pub use hash::{block_hash, xattr_hash};
pub use signing::{GatewayKeypair, Signer, Verifier, generate_keypair_pem};
