//! The RG wire protocol client interface.

pub mod client;

pub use client::RgClient;
