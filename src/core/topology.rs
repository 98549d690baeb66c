//! The cluster topology value: membership, quorum parameters, and the
//! in-progress successor used during reconfiguration.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

use crate::core::cond::Cond;
use crate::core::ids::{RmId, TxnId, VarUuid, VERSION_ZERO};
use crate::core::positions::Positions;

/// Pointer to the cluster root variable, set on first bootstrap and
/// immutable thereafter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Root {
    pub var: VarUuid,
    pub positions: Positions,
}

/// One RM's outstanding migration window: the predicate selecting the
/// variables it must receive, plus the senders that have finished
/// supplying it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingMigration {
    pub cond: Cond,
    pub received: BTreeSet<RmId>,
}

impl PendingMigration {
    pub fn new(cond: Cond) -> Self {
        PendingMigration {
            cond,
            received: BTreeSet::new(),
        }
    }
}

/// The in-progress successor embedded inside an active topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NextInfo {
    pub target: Box<Topology>,
    pub all_hosts: Vec<String>,
    pub new_rm_ids: Vec<RmId>,
    pub surviving_rm_ids: Vec<RmId>,
    pub lost_rm_ids: Vec<RmId>,
    /// RMs that have not yet been told about this successor.
    pub install_pending: Vec<RmId>,
    /// RMs still owed data, keyed by recipient.
    pub pending: BTreeMap<RmId, PendingMigration>,
}

impl NextInfo {
    /// The machine is done with a successor when nobody remains to be
    /// told and nobody is owed data; at that point it is promoted.
    pub fn installed_everywhere(&self) -> bool {
        self.install_pending.is_empty()
    }

    pub fn promotable(&self) -> bool {
        self.install_pending.is_empty() && self.pending.is_empty()
    }
}

/// Cluster membership and quorum parameters, stored as a distinguished
/// variable in the cluster itself.
#[derive(Clone, PartialEq, Eq)]
pub struct Topology {
    pub cluster_id: String,
    pub version: u32,
    pub hosts: Vec<String>,
    pub f: u8,
    pub max_rm_count: u8,
    /// Ordered RM slots; `RmId::EMPTY` marks a gap left by a removal.
    pub rms: Vec<RmId>,
    /// Monotonically growing: once removed, an RM identity never returns.
    pub rms_removed: BTreeSet<RmId>,
    pub root: Option<Root>,
    /// The transaction that wrote this value; the compare-and-swap
    /// witness for the next modification.
    pub db_version: TxnId,
    pub next: Option<NextInfo>,
}

impl Topology {
    /// The blank topology written at bootstrap, before the cluster has
    /// agreed on anything.
    pub fn blank(cluster_id: String, max_rm_count: u8) -> Self {
        Topology {
            cluster_id,
            version: 0,
            hosts: Vec::new(),
            f: 0,
            max_rm_count,
            rms: Vec::new(),
            rms_removed: BTreeSet::new(),
            root: None,
            db_version: VERSION_ZERO,
            next: None,
        }
    }

    /// A goal topology as supplied by an operator: membership and quorum
    /// parameters only, no runtime state.
    pub fn goal(
        cluster_id: String,
        version: u32,
        hosts: Vec<String>,
        f: u8,
        max_rm_count: u8,
    ) -> Self {
        Topology {
            cluster_id,
            version,
            hosts,
            f,
            max_rm_count,
            rms: Vec::new(),
            rms_removed: BTreeSet::new(),
            root: None,
            db_version: VERSION_ZERO,
            next: None,
        }
    }

    pub fn two_f_inc(&self) -> usize {
        2 * self.f as usize + 1
    }

    pub fn f_inc(&self) -> usize {
        self.f as usize + 1
    }

    pub fn rms_non_empty(&self) -> Vec<RmId> {
        self.rms.iter().copied().filter(|rm| !rm.is_empty()).collect()
    }

    pub fn next(&self) -> Option<&NextInfo> {
        self.next.as_ref()
    }

    pub fn next_mut(&mut self) -> Option<&mut NextInfo> {
        self.next.as_mut()
    }

    /// Splits `hosts` into this node's own entry and the remainder.
    pub fn partition_hosts(&self, local: &str) -> Result<(String, Vec<String>), TopologyError> {
        let mut remote = Vec::with_capacity(self.hosts.len());
        let mut found = None;
        for host in &self.hosts {
            if host == local && found.is_none() {
                found = Some(host.clone());
            } else {
                remote.push(host.clone());
            }
        }
        match found {
            Some(local) => Ok((local, remote)),
            None => Err(TopologyError::LocalHostMissing {
                local: local.to_string(),
                hosts: self.hosts.clone(),
            }),
        }
    }

    /// Checks that `newer` may legally replace this topology on a node
    /// that has already observed `self`.
    pub fn check_observation(&self, newer: &Topology) -> Result<(), TopologyError> {
        if self.cluster_id != newer.cluster_id {
            return Err(TopologyError::ClusterIdMismatch {
                active: self.cluster_id.clone(),
                observed: newer.cluster_id.clone(),
            });
        }
        if newer.version < self.version {
            return Err(TopologyError::VersionRegression {
                active: self.version,
                observed: newer.version,
            });
        }
        Ok(())
    }

    /// While a successor is in flight, rolls are forbidden: a roll would
    /// reorder a variable's history underneath the migration scan.
    pub fn roll_allowed(&self) -> bool {
        self.next.is_none()
    }

    /// Promotes the completed successor into the active slot. The
    /// caller supplies the commit witness afterwards.
    pub fn promote_next(&self) -> Result<Topology, TopologyError> {
        let next = self.next.as_ref().ok_or(TopologyError::NothingToPromote)?;
        if !next.promotable() {
            return Err(TopologyError::PromotionBlocked {
                install_pending: next.install_pending.len(),
                pending: next.pending.len(),
            });
        }
        if next.target.version <= self.version {
            return Err(TopologyError::VersionRegression {
                active: self.version,
                observed: next.target.version,
            });
        }
        let mut promoted = (*next.target).clone();
        promoted.cluster_id = self.cluster_id.clone();
        promoted.max_rm_count = self.max_rm_count;
        promoted.root = self.root.clone();
        promoted.rms_removed = self
            .rms_removed
            .union(&next.target.rms_removed)
            .copied()
            .collect();
        promoted.next = None;
        Ok(promoted)
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("cluster_id", &self.cluster_id)
            .field("version", &self.version)
            .field("hosts", &self.hosts)
            .field("f", &self.f)
            .field("rms", &self.rms)
            .field("rms_removed", &self.rms_removed)
            .field("root", &self.root.as_ref().map(|r| r.var))
            .field("next", &self.next.as_ref().map(|n| n.target.version))
            .finish()
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@v{} (hosts {:?}, f {}",
            self.cluster_id, self.version, self.hosts, self.f
        )?;
        if let Some(next) = &self.next {
            write!(f, ", next v{}", next.target.version)?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("cluster id mismatch: active '{active}', observed '{observed}'")]
    ClusterIdMismatch { active: String, observed: String },
    #[error("topology version regressed: active {active}, observed {observed}")]
    VersionRegression { active: u32, observed: u32 },
    #[error("host '{local}' does not appear in topology hosts {hosts:?}")]
    LocalHostMissing { local: String, hosts: Vec<String> },
    #[error("no successor to promote")]
    NothingToPromote,
    #[error(
        "successor not promotable: {install_pending} installs and {pending} migrations outstanding"
    )]
    PromotionBlocked {
        install_pending: usize,
        pending: usize,
    },
}
