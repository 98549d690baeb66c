//! Core domain types, in dependency order:
//! - ids: VarUuid, TxnId, RmId
//! - positions: placement bytes and the RM permutation they induce
//! - topology: the cluster topology value and its successor
//! - cond: placement-condition algebra
//! - txn: transaction frames and outcomes

pub mod cond;
pub mod ids;
pub mod positions;
pub mod topology;
pub mod txn;

pub use cond::{Cond, CondError, Generator};
pub use ids::{
    RmId, TxnId, VarUuid, MOST_RANDOM_BYTE_INDEX, TOPOLOGY_VAR_UUID, VERSION_ONE, VERSION_ZERO,
};
pub use positions::Positions;
pub use topology::{NextInfo, PendingMigration, Root, Topology, TopologyError};
pub use txn::{Abort, Action, Allocation, TxnFrame, TxnOutcome, Update, UpdateAction, VarIdPos};
