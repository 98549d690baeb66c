//! Topology transactions: discovery, creation, and read-modify-write of
//! the distinguished topology variable, plus cluster-root creation.
//!
//! The consensus layer sits behind [`TxnRunner`]; this module only
//! builds frames and interprets outcomes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::core::ids::VERSION_ONE;
use crate::core::{
    Abort, Action, Allocation, Positions, RmId, Root, Topology, TxnFrame, TxnId, TxnOutcome,
    Update, UpdateAction, VarIdPos, VarUuid, TOPOLOGY_VAR_UUID, VERSION_ZERO,
};
use crate::error::Transience;
use crate::store::{StoreError, VarStore};
use crate::wire::value::{topology_from_bytes, topology_to_bytes};
use crate::wire::{ProtoDecodeError, ProtoEncodeError, WireLimits};

/// The seam to the transaction layer. `Ok(None)` means the layer is
/// shutting down and no outcome will arrive.
pub trait TxnRunner: Send + Sync {
    fn run_txn(
        &self,
        frame: TxnFrame,
        assign_id: bool,
        actives: &[RmId],
    ) -> Result<Option<TxnOutcome>, TxnRunnerError>;
}

#[derive(Debug, Error)]
pub enum TxnRunnerError {
    #[error("transaction layer unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Boot counts of currently-active peer connections, plus our own.
pub type BootCounts = BTreeMap<RmId, u32>;

/// Result of a read-modify-write against the topology variable.
#[derive(Debug)]
pub enum Rewrite {
    Committed(Topology),
    /// Transient conflict; retry with randomized backoff.
    Resubmit,
    /// Our read was stale. Carries what was observed; informative only,
    /// the subscriber will deliver it again.
    BadRead(Topology),
}

/// Result of an attempt to create the cluster root variable.
#[derive(Debug)]
pub enum RootAttempt {
    Created(Root),
    Resubmit,
    /// Some required RM is not currently connected.
    NotReady,
}

pub struct TopologyWriter {
    runner: Arc<dyn TxnRunner>,
    store: Arc<dyn VarStore>,
    rm_id: RmId,
    boot_count: u32,
    counter: AtomicU64,
    limits: WireLimits,
}

impl TopologyWriter {
    pub fn new(
        runner: Arc<dyn TxnRunner>,
        store: Arc<dyn VarStore>,
        rm_id: RmId,
        boot_count: u32,
    ) -> Self {
        TopologyWriter {
            runner,
            store,
            rm_id,
            boot_count,
            counter: AtomicU64::new(1),
            limits: WireLimits::default(),
        }
    }

    pub fn rm_id(&self) -> RmId {
        self.rm_id
    }

    fn next_txn_id(&self) -> TxnId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        TxnId::new(counter, self.rm_id, self.boot_count)
    }

    fn next_var_uuid(&self) -> VarUuid {
        VarUuid(*self.next_txn_id().as_bytes())
    }

    /// Builds the single-action frame every topology transaction uses:
    /// no read and no write is discovery, write-only is creation,
    /// read-and-write is modification.
    fn topology_frame(
        &self,
        read: Option<&Topology>,
        write: Option<&Topology>,
        active: &[RmId],
        passive: &[RmId],
        boot_counts: &BootCounts,
    ) -> Result<TxnFrame, TopologyTxnError> {
        let action = match (read, write) {
            (None, None) => Action::Read {
                version: VERSION_ZERO,
            },
            (None, Some(write)) => Action::Create {
                value: topology_to_bytes(write)?,
                // Placement of the topology variable is fixed; these
                // positions exist for shape, not for routing.
                positions: Positions::identity(write.max_rm_count),
                refs: Vec::new(),
            },
            (Some(read), Some(write)) => {
                let refs = match &write.root {
                    Some(root) => vec![VarIdPos {
                        var: root.var,
                        positions: root.positions.clone(),
                    }],
                    None => Vec::new(),
                };
                Action::ReadWrite {
                    version: read.db_version,
                    value: topology_to_bytes(write)?,
                    refs,
                }
            }
            (Some(_), None) => {
                panic!("topology transaction with a read but no write is unsupported")
            }
        };

        Ok(TxnFrame {
            id: None,
            submitter: self.rm_id,
            submitter_boot_count: self.boot_count,
            actions: vec![(TOPOLOGY_VAR_UUID, action)],
            allocations: self.allocations(active, passive, boot_counts),
            f_inc: active.len() as u8,
            topology_version: read.map(|read| read.version).unwrap_or(0),
        })
    }

    fn allocations(
        &self,
        active: &[RmId],
        passive: &[RmId],
        boot_counts: &BootCounts,
    ) -> Vec<Allocation> {
        let mut allocations = Vec::with_capacity(active.len() + passive.len());
        for rm_id in active {
            let boot_count = if *rm_id == self.rm_id {
                self.boot_count
            } else {
                boot_counts.get(rm_id).copied().unwrap_or(1)
            };
            allocations.push(Allocation {
                rm_id: *rm_id,
                active_boot_count: boot_count,
                action_indices: vec![0],
            });
        }
        for rm_id in passive {
            allocations.push(Allocation {
                rm_id: *rm_id,
                active_boot_count: 0,
                action_indices: vec![0],
            });
        }
        allocations
    }

    /// Discovery: a read at version zero against only ourselves. The
    /// local copy has always moved past version zero, so the read
    /// aborts and the rerun payload carries the current value.
    pub fn read_local(&self) -> Result<Option<Topology>, TopologyTxnError> {
        if self.store.is_empty()? {
            return Ok(None);
        }

        loop {
            let frame =
                self.topology_frame(None, None, &[self.rm_id], &[], &BootCounts::new())?;
            let outcome = match self.runner.run_txn(frame, true, &[self.rm_id])? {
                Some(outcome) => outcome,
                None => return Ok(None), // shutting down
            };
            match outcome {
                TxnOutcome::Commit { .. } => {
                    return Err(TopologyTxnError::Invariant(
                        "read of topology at version zero failed to abort",
                    ))
                }
                TxnOutcome::Abort(Abort::Resubmit) => continue,
                TxnOutcome::Abort(Abort::Rerun(updates)) => {
                    return self.topology_from_rerun(updates).map(Some)
                }
            }
        }
    }

    /// Creation: writes the bootstrap topology into an empty store,
    /// always under [`VERSION_ONE`] so that every joining node holds the
    /// same compare-and-swap witness.
    pub fn create_topology_zero(&self, blank: &Topology) -> Result<Topology, TopologyTxnError> {
        let mut frame =
            self.topology_frame(None, Some(blank), &[self.rm_id], &[], &BootCounts::new())?;
        frame.id = Some(VERSION_ONE);
        let outcome = match self.runner.run_txn(frame, false, &[self.rm_id])? {
            Some(outcome) => outcome,
            None => return Err(TopologyTxnError::ShuttingDown),
        };
        match outcome {
            TxnOutcome::Commit { txn_id } => {
                let mut created = blank.clone();
                created.db_version = txn_id;
                debug!(topology = %created, "bootstrap topology written");
                Ok(created)
            }
            TxnOutcome::Abort(_) => Err(TopologyTxnError::Invariant(
                "unable to write bootstrap topology to the local store",
            )),
        }
    }

    /// Modification: compare-and-swap on `read.db_version`.
    pub fn rewrite(
        &self,
        read: &Topology,
        write: &Topology,
        active: &[RmId],
        passive: &[RmId],
        boot_counts: &BootCounts,
    ) -> Result<Rewrite, TopologyTxnError> {
        let frame = self.topology_frame(Some(read), Some(write), active, passive, boot_counts)?;
        let outcome = match self.runner.run_txn(frame, true, active)? {
            Some(outcome) => outcome,
            None => return Err(TopologyTxnError::ShuttingDown),
        };
        match outcome {
            TxnOutcome::Commit { txn_id } => {
                let mut committed = write.clone();
                committed.db_version = txn_id;
                debug!(topology = %committed, "topology txn committed");
                Ok(Rewrite::Committed(committed))
            }
            TxnOutcome::Abort(Abort::Resubmit) => Ok(Rewrite::Resubmit),
            TxnOutcome::Abort(Abort::Rerun(updates)) => {
                let observed = self.topology_from_rerun(updates)?;
                debug!(topology = %observed, "topology txn bad read");
                Ok(Rewrite::BadRead(observed))
            }
        }
    }

    /// Creates the cluster root variable: value empty, positions fixed,
    /// `F+1` actives and `F` passives drawn from the topology's RMs.
    pub fn attempt_create_root(
        &self,
        topology: &Topology,
        connected: &BootCounts,
    ) -> Result<RootAttempt, TopologyTxnError> {
        let non_empty = topology.rms_non_empty();
        if non_empty.len() < topology.two_f_inc() {
            return Ok(RootAttempt::NotReady);
        }
        for rm_id in &non_empty {
            if *rm_id != self.rm_id && !connected.contains_key(rm_id) {
                return Ok(RootAttempt::NotReady);
            }
        }
        let active: Vec<RmId> = non_empty[..topology.f_inc()].to_vec();
        let passive: Vec<RmId> = non_empty[topology.f_inc()..topology.two_f_inc()].to_vec();

        let uuid = self.next_var_uuid();
        let positions = Positions::identity(topology.max_rm_count);
        debug!(%uuid, ?active, ?passive, "creating cluster root");

        let frame = TxnFrame {
            id: None,
            submitter: self.rm_id,
            submitter_boot_count: self.boot_count,
            actions: vec![(
                uuid,
                Action::Create {
                    value: Bytes::new(),
                    positions: positions.clone(),
                    refs: Vec::new(),
                },
            )],
            allocations: self.allocations(&active, &passive, connected),
            f_inc: topology.f_inc() as u8,
            topology_version: topology.version,
        };
        let outcome = match self.runner.run_txn(frame, true, &active)? {
            Some(outcome) => outcome,
            None => return Err(TopologyTxnError::ShuttingDown),
        };
        match outcome {
            TxnOutcome::Commit { .. } => Ok(RootAttempt::Created(Root {
                var: uuid,
                positions,
            })),
            TxnOutcome::Abort(Abort::Resubmit) => Ok(RootAttempt::Resubmit),
            TxnOutcome::Abort(Abort::Rerun(_)) => Err(TopologyTxnError::Invariant(
                "creation of the cluster root gave a rerun outcome",
            )),
        }
    }

    /// A rerun payload for a topology transaction must hold exactly one
    /// update with exactly one write of the topology variable.
    fn topology_from_rerun(&self, updates: Vec<Update>) -> Result<Topology, TopologyTxnError> {
        let update = match updates.as_slice() {
            [update] => update,
            _ => {
                return Err(TopologyTxnError::Invariant(
                    "topology rerun carried more than one update",
                ))
            }
        };
        let (var, action) = match update.actions.as_slice() {
            [entry] => entry,
            _ => {
                return Err(TopologyTxnError::Invariant(
                    "topology rerun update carried more than one action",
                ))
            }
        };
        if *var != TOPOLOGY_VAR_UUID {
            return Err(TopologyTxnError::Invariant(
                "topology rerun update was not for the topology variable",
            ));
        }
        let (value, refs) = match action {
            UpdateAction::Write { value, refs } => (value, refs),
            UpdateAction::Missing => {
                return Err(TopologyTxnError::Invariant(
                    "topology rerun update was not a write",
                ))
            }
        };
        let root = refs.first().map(|var_ref| Root {
            var: var_ref.var,
            positions: var_ref.positions.clone(),
        });
        topology_from_bytes(value, update.txn_id, root, &self.limits)
            .map_err(TopologyTxnError::Corrupt)
    }
}

#[derive(Debug, Error)]
pub enum TopologyTxnError {
    #[error("internal invariant violated: {0}")]
    Invariant(&'static str),
    #[error("local topology corrupt: {0}")]
    Corrupt(#[source] ProtoDecodeError),
    #[error(transparent)]
    Encode(#[from] ProtoEncodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runner(#[from] TxnRunnerError),
    #[error("transaction layer shutting down")]
    ShuttingDown,
}

impl TopologyTxnError {
    pub fn transience(&self) -> Transience {
        match self {
            TopologyTxnError::Invariant(_) | TopologyTxnError::Corrupt(_) => Transience::Fatal,
            TopologyTxnError::Encode(_) => Transience::Fatal,
            TopologyTxnError::Store(StoreError::Corrupt { .. }) => Transience::Fatal,
            TopologyTxnError::Store(StoreError::Unavailable { .. })
            | TopologyTxnError::Runner(_) => Transience::Retryable,
            TopologyTxnError::ShuttingDown => Transience::Ignored,
        }
    }
}
