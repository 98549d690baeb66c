//! Transaction frames as submitted to the consensus layer, and the
//! outcomes it hands back.

use bytes::Bytes;

use crate::core::ids::{RmId, TxnId, VarUuid};
use crate::core::positions::Positions;

/// A reference held by a variable: target id plus the target's immutable
/// positions, so a receiver can place the referent without a lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarIdPos {
    pub var: VarUuid,
    pub positions: Positions,
}

/// One action within a transaction, against a single variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Read {
        version: TxnId,
    },
    Write {
        value: Bytes,
        refs: Vec<VarIdPos>,
    },
    ReadWrite {
        version: TxnId,
        value: Bytes,
        refs: Vec<VarIdPos>,
    },
    Create {
        value: Bytes,
        positions: Positions,
        refs: Vec<VarIdPos>,
    },
    /// Rewrites a variable's version without changing its meaning, so
    /// old history can be dropped.
    Roll {
        version: TxnId,
        value: Bytes,
        refs: Vec<VarIdPos>,
    },
}

/// Which RMs vote on (active) or merely learn (passive) an action.
/// Passive allocations carry boot count zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub rm_id: RmId,
    pub active_boot_count: u32,
    pub action_indices: Vec<u16>,
}

impl Allocation {
    pub fn is_active(&self) -> bool {
        self.active_boot_count > 0
    }
}

/// A complete transaction submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnFrame {
    pub id: Option<TxnId>,
    pub submitter: RmId,
    pub submitter_boot_count: u32,
    pub actions: Vec<(VarUuid, Action)>,
    pub allocations: Vec<Allocation>,
    pub f_inc: u8,
    /// The topology version the submitter believed current; receivers
    /// discard frames from the past.
    pub topology_version: u32,
}

/// What a variable looked like when a read-dependent transaction aborted:
/// the payload of a rerun.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub txn_id: TxnId,
    pub actions: Vec<(VarUuid, UpdateAction)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateAction {
    Write { value: Bytes, refs: Vec<VarIdPos> },
    Missing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOutcome {
    Commit { txn_id: TxnId },
    Abort(Abort),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Abort {
    /// Transient conflict; resubmit after a randomized delay.
    Resubmit,
    /// The reads were stale; the payload carries what was observed.
    Rerun(Vec<Update>),
}

impl TxnOutcome {
    pub fn committed(&self) -> bool {
        matches!(self, TxnOutcome::Commit { .. })
    }
}
