//! Placement conditions: the predicate algebra that decides which
//! variables an RM must receive during a topology change.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ids::RmId;
use crate::core::positions::Positions;
use crate::core::topology::Topology;

/// A single placement predicate leaf.
///
/// The generator asks: within the variable's permutation of the cluster's
/// RMs, truncated to `perm_len`, does `rm_id` fall inside the window
/// `[start, start+len)`? `len_adjust_intersect` shrinks the window by the
/// number of its members found in the permutation prefix covering the
/// window, so that slots surrendered by lost RMs do not widen coverage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generator {
    pub rm_id: RmId,
    pub perm_len: usize,
    pub start: usize,
    pub len: usize,
    pub len_adjust_intersect: Vec<RmId>,
    pub includes: bool,
}

impl Generator {
    pub fn satisfied_by(
        &self,
        topology: &Topology,
        positions: &Positions,
    ) -> Result<bool, CondError> {
        if self.perm_len == 0 {
            return Err(CondError::EmptyPermutation { rm_id: self.rm_id });
        }
        let perm = positions.permute(&topology.rms, self.perm_len);
        let end = (self.start + self.len).min(perm.len());
        let start = self.start.min(end);
        let window = &perm[start..end];

        let len = if self.len_adjust_intersect.is_empty() {
            self.len
        } else {
            let adjust: BTreeSet<RmId> = self.len_adjust_intersect.iter().copied().collect();
            let overlap = perm[..end].iter().filter(|rm| adjust.contains(rm)).count();
            self.len.saturating_sub(overlap)
        };

        let in_window = window.iter().take(len).any(|rm| *rm == self.rm_id);
        Ok(in_window == self.includes)
    }
}

/// Predicate tree over `(topology, positions)`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cond {
    Generator(Generator),
    And { left: Box<Cond>, right: Box<Cond> },
    Or { left: Box<Cond>, right: Box<Cond> },
}

impl Cond {
    pub fn and(self, other: Cond) -> Cond {
        Cond::And {
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn or(self, other: Cond) -> Cond {
        Cond::Or {
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn satisfied_by(
        &self,
        topology: &Topology,
        positions: &Positions,
    ) -> Result<bool, CondError> {
        match self {
            Cond::Generator(gen) => gen.satisfied_by(topology, positions),
            Cond::And { left, right } => Ok(left.satisfied_by(topology, positions)?
                && right.satisfied_by(topology, positions)?),
            Cond::Or { left, right } => Ok(left.satisfied_by(topology, positions)?
                || right.satisfied_by(topology, positions)?),
        }
    }
}

impl fmt::Debug for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cond::Generator(gen) => write!(
                f,
                "{}{}[{}, {}+{})/{}",
                gen.rm_id,
                if gen.includes { " in " } else { " not in " },
                gen.start,
                gen.start,
                gen.len,
                gen.perm_len,
            ),
            Cond::And { left, right } => write!(f, "({left:?} && {right:?})"),
            Cond::Or { left, right } => write!(f, "({left:?} || {right:?})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CondError {
    #[error("generator for {rm_id} has an empty permutation")]
    EmptyPermutation { rm_id: RmId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::VERSION_ZERO;

    fn topology(rm_count: u32) -> Topology {
        let mut t = Topology::blank("test".to_string(), rm_count as u8);
        t.rms = (1..=rm_count).map(RmId).collect();
        t.db_version = VERSION_ZERO;
        t
    }

    fn include_all(rm: u32, perm_len: usize) -> Generator {
        Generator {
            rm_id: RmId(rm),
            perm_len,
            start: 0,
            len: perm_len,
            len_adjust_intersect: Vec::new(),
            includes: true,
        }
    }

    #[test]
    fn full_window_always_includes() {
        let t = topology(5);
        let positions = Positions::new(vec![2, 4, 0, 1, 3]);
        for rm in 1..=5 {
            let gen = include_all(rm, 5);
            assert!(gen.satisfied_by(&t, &positions).unwrap());
        }
    }

    #[test]
    fn excludes_inverts() {
        let t = topology(5);
        let positions = Positions::new(vec![2, 4, 0, 1, 3]);
        for rm in 1..=5 {
            let gen = Generator {
                includes: false,
                ..include_all(rm, 5)
            };
            assert!(!gen.satisfied_by(&t, &positions).unwrap());
        }
    }

    #[test]
    fn window_partitions_the_permutation() {
        // For any positions, an RM is either inside the quorum prefix or
        // in the remainder, never both.
        let t = topology(5);
        for seed in 0u8..32 {
            let positions = Positions::new(vec![seed, seed ^ 3, seed ^ 5, seed ^ 7, seed ^ 11]);
            for rm in 1..=5u32 {
                let head = Generator {
                    rm_id: RmId(rm),
                    perm_len: 5,
                    start: 0,
                    len: 3,
                    len_adjust_intersect: Vec::new(),
                    includes: true,
                };
                let tail = Generator {
                    rm_id: RmId(rm),
                    perm_len: 5,
                    start: 3,
                    len: 2,
                    len_adjust_intersect: Vec::new(),
                    includes: true,
                };
                let in_head = head.satisfied_by(&t, &positions).unwrap();
                let in_tail = tail.satisfied_by(&t, &positions).unwrap();
                assert!(in_head ^ in_tail, "rm {rm} seed {seed}");
            }
        }
    }

    #[test]
    fn len_adjust_shrinks_window() {
        let t = topology(4);
        let positions = Positions::new(vec![0, 0, 0, 0]);
        // Permutation of [1,2,3,4] with zero positions is [1,2,3,4].
        let gen = Generator {
            rm_id: RmId(4),
            perm_len: 4,
            start: 2,
            len: 2,
            // 3 sits within the covered prefix, so the window shrinks to
            // one slot and 4 (at index 3) falls outside it.
            len_adjust_intersect: vec![RmId(3)],
            includes: true,
        };
        assert!(!gen.satisfied_by(&t, &positions).unwrap());

        let unadjusted = Generator {
            len_adjust_intersect: Vec::new(),
            ..gen
        };
        assert!(unadjusted.satisfied_by(&t, &positions).unwrap());
    }

    #[test]
    fn tree_combinators() {
        let t = topology(3);
        let positions = Positions::new(vec![0, 0, 0]);
        let yes = Cond::Generator(include_all(1, 3));
        let no = Cond::Generator(Generator {
            includes: false,
            ..include_all(1, 3)
        });
        assert!(!yes.clone().and(no.clone()).satisfied_by(&t, &positions).unwrap());
        assert!(yes.clone().or(no.clone()).satisfied_by(&t, &positions).unwrap());
        assert!(!no.clone().and(no.clone()).satisfied_by(&t, &positions).unwrap());
    }
}
