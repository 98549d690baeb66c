//! Cluster reconfiguration: the transmogrifier state machine and its
//! collaborators.

pub mod change;
pub mod emigration;
pub mod immigration;
pub mod target;
pub mod transmogrifier;
pub mod txns;

pub use change::{SubscriberKind, TopologyChange};
pub use emigration::{EmigrationPeer, MigrationSink, MIGRATION_BATCH_SIZE};
pub use immigration::ImmigrationLedger;
pub use target::{calculate_target, TargetOutcome};
pub use transmogrifier::{
    install_connection_forwarder, install_topology_subscriber, GoalError, GoalResult,
    Transmogrifier, TransmogrifierDeps, TransmogrifierHandle,
};
pub use txns::{
    BootCounts, Rewrite, RootAttempt, TopologyTxnError, TopologyWriter, TxnRunner, TxnRunnerError,
};
