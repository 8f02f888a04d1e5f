//! The Metadata Service client interface and its wire types (spec §6).

pub mod client;
pub mod types;

pub use client::MsClient;
pub use types::{CoordinateOutcome, GetattrOutcome, MdEntry, PathEnt, VacuumLogEntry, XattrBundle};
