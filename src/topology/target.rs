//! Computing the target of a topology change: host classification, RM
//! translation, slot assignment, and the per-RM migration conditions.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::debug;

use crate::core::{
    Cond, Generator, NextInfo, PendingMigration, RmId, Topology, TopologyError,
};

/// What we know about each reachable host: the RM identity answering on
/// it right now.
pub type HostRms = BTreeMap<String, RmId>;

#[derive(Debug)]
pub enum TargetOutcome {
    /// Cannot classify yet: connect to these hosts first.
    NeedConnections(Vec<String>),
    /// The active topology with `next` filled in, ready to be written.
    Target(Box<Topology>),
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("goal re-adds removed RM {rm_id}")]
    RemovedRmReturned { rm_id: RmId },
}

/// Classifies hosts as survived / removed / added, translates to RM
/// identities (a wiped-and-readded host changes identity), assigns new
/// RMs to vacated slots, and derives the migration conditions.
pub fn calculate_target(
    active: &Topology,
    goal: &Topology,
    local_host: &str,
    host_rms: &HostRms,
) -> Result<TargetOutcome, TargetError> {
    let mut hosts_removed: BTreeSet<String> = active.hosts.iter().cloned().collect();
    let mut hosts_survived: BTreeSet<String> = BTreeSet::new();
    let mut hosts_added: BTreeSet<String> = BTreeSet::new();

    for host in &goal.hosts {
        if hosts_removed.remove(host) {
            hosts_survived.insert(host.clone());
        } else {
            hosts_added.insert(host.clone());
        }
    }

    let mut all_hosts: Vec<String> = active.hosts.clone();
    for host in &goal.hosts {
        if !all_hosts.contains(host) {
            all_hosts.push(host.clone());
        }
    }

    let missing: Vec<String> = all_hosts
        .iter()
        .filter(|host| *host != local_host && !host_rms.contains_key(*host))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Ok(TargetOutcome::NeedConnections(missing));
    }

    // Cross-reference hosts with RM identities: a host that survived in
    // name but answers with a fresh RM has been wiped and re-added.
    let mut rms_removed: BTreeSet<RmId> = active.rms_non_empty().into_iter().collect();
    let mut rms_survived: BTreeSet<RmId> = BTreeSet::new();
    let mut rms_added: Vec<RmId> = Vec::new();

    for host in hosts_survived.clone() {
        let rm_id = host_rms[&host];
        if rms_removed.remove(&rm_id) {
            rms_survived.insert(rm_id);
        } else {
            hosts_survived.remove(&host);
            hosts_added.insert(host);
            rms_added.push(rm_id);
        }
    }
    for host in &hosts_added {
        let rm_id = host_rms[host];
        if !rms_added.contains(&rm_id) {
            rms_added.push(rm_id);
        }
    }

    for rm_id in &rms_added {
        if active.rms_removed.contains(rm_id) {
            return Err(TargetError::RemovedRmReturned { rm_id: *rm_id });
        }
    }

    // Survivors keep their slots; newcomers fill the gaps in order.
    let mut rms_new: Vec<RmId> = active
        .rms
        .iter()
        .map(|rm_id| {
            if rms_survived.contains(rm_id) {
                *rm_id
            } else {
                RmId::EMPTY
            }
        })
        .collect();
    let mut added_iter = rms_added.iter().copied();
    for slot in rms_new.iter_mut() {
        if slot.is_empty() {
            match added_iter.next() {
                Some(rm_id) => *slot = rm_id,
                None => break,
            }
        }
    }
    rms_new.extend(added_iter);

    let lost: Vec<RmId> = rms_removed
        .iter()
        .copied()
        .filter(|rm_id| !active.rms_removed.contains(rm_id))
        .collect();
    let survived: Vec<RmId> = rms_survived.iter().copied().collect();

    let mut target = goal.clone();
    target.rms = rms_new;
    target.max_rm_count = active.max_rm_count;
    target.root = active.root.clone();
    target.rms_removed = active.rms_removed.union(&rms_removed).copied().collect();

    let pending = compute_pending(active, &target, &rms_added, &lost, &survived);

    debug!(
        ?hosts_removed,
        ?hosts_survived,
        ?hosts_added,
        added = ?rms_added,
        ?lost,
        "target classification"
    );

    let mut with_next = active.clone();
    with_next.next = Some(NextInfo {
        target: Box::new(target),
        all_hosts,
        new_rm_ids: rms_added.clone(),
        surviving_rm_ids: survived,
        lost_rm_ids: lost,
        install_pending: rms_added,
        pending,
    });
    Ok(TargetOutcome::Target(Box::new(with_next)))
}

/// The condition rules. All clauses for the same RM are OR-combined.
fn compute_pending(
    old: &Topology,
    new: &Topology,
    added: &[RmId],
    lost: &[RmId],
    survived: &[RmId],
) -> BTreeMap<RmId, PendingMigration> {
    let old_len = old.rms_non_empty().len();
    let new_len = new.rms_non_empty().len();
    let two_f_inc_old = old.two_f_inc();
    let two_f_inc_new = new.two_f_inc();

    let mut clauses: BTreeMap<RmId, Cond> = BTreeMap::new();
    let mut add_clause = |rm_id: RmId, cond: Cond| {
        clauses
            .entry(rm_id)
            .and_modify(|existing| *existing = existing.clone().or(cond.clone()))
            .or_insert(cond);
    };

    // Rule 1: every added RM takes its share of the new quorums.
    for rm_id in added {
        add_clause(
            *rm_id,
            Cond::Generator(Generator {
                rm_id: *rm_id,
                perm_len: new_len,
                start: 0,
                len: two_f_inc_new,
                len_adjust_intersect: Vec::new(),
                includes: true,
            }),
        );
    }

    // Rule 2: with RMs lost and spare capacity beyond the old quorum,
    // survivors cover the tail the lost RMs were holding.
    if !lost.is_empty() && two_f_inc_old < old_len && survived.len() > 1 {
        for rm_id in survived {
            add_clause(
                *rm_id,
                Cond::Generator(Generator {
                    rm_id: *rm_id,
                    perm_len: old_len,
                    start: two_f_inc_old,
                    len: old_len - two_f_inc_old,
                    len_adjust_intersect: lost.to_vec(),
                    includes: true,
                }),
            );
        }
    }

    // Rule 3: a widened quorum pulls each survivor into windows it was
    // not previously responsible for.
    if new.f > old.f {
        for rm_id in survived {
            let in_new = Cond::Generator(Generator {
                rm_id: *rm_id,
                perm_len: new_len,
                start: 0,
                len: two_f_inc_new,
                len_adjust_intersect: Vec::new(),
                includes: true,
            });
            let not_in_old = Cond::Generator(Generator {
                rm_id: *rm_id,
                perm_len: old_len,
                start: 0,
                len: two_f_inc_old,
                len_adjust_intersect: Vec::new(),
                includes: false,
            });
            add_clause(*rm_id, in_new.and(not_in_old));
        }
    }

    clauses
        .into_iter()
        .map(|(rm_id, cond)| (rm_id, PendingMigration::new(cond)))
        .collect()
}
