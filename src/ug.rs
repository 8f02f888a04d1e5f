//! The inter-UG protocol (spec §6): a non-coordinator gateway forwards a
//! write/truncate/rename/detach to whichever gateway it currently believes
//! is the coordinator, reusing the signed [`crate::wire::Request`] envelope
//! also used for the RG control plane.
//!
//! The MS's own storage and a real UG-to-UG transport are both out of this
//! crate's scope (§1); this trait is the boundary a deployment's HTTP(S)
//! client implements and tests fake in memory.

use crate::errors::GwResult;
use crate::types::GatewayId;
use crate::wire::{Reply, Request};

pub trait UgClient: Send + Sync {
    /// Sends a signed request to the gateway believed to be `target`'s
    /// coordinator. A transport failure (peer down, connection refused)
    /// should surface as [`crate::errors::GatewayError::RemoteIO`] or
    /// [`crate::errors::GatewayError::Again`] so the write pipeline knows to
    /// fall back to `chcoord` (§4.8).
    fn send(&self, target: GatewayId, request: &Request) -> GwResult<Reply>;
}
