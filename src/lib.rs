#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod net;
pub mod node;
pub mod store;
pub mod telemetry;
pub mod topology;
pub mod wire;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the identifiers and the topology value at the crate root;
// nearly every consumer wants these.
pub use crate::core::{
    Cond, Generator, NextInfo, PendingMigration, Positions, RmId, Root, Topology, TxnId, VarIdPos,
    VarUuid, MOST_RANDOM_BYTE_INDEX, TOPOLOGY_VAR_UUID, VERSION_ZERO,
};
