//! Variable positions and the RM permutation they induce.
//!
//! Positions are assigned when a variable is created and never change;
//! they are the sole input to object placement. Two variables with the
//! same positions map to the same RM permutation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::ids::RmId;

/// Per-variable placement bytes, one per potential RM slot.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Positions(Vec<u8>);

impl Positions {
    pub fn new(bytes: Vec<u8>) -> Self {
        Positions(bytes)
    }

    /// The identity positions `0, 1, .., len-1`. Used for variables whose
    /// placement is fixed by construction (the topology variable, the
    /// cluster root).
    pub fn identity(len: u8) -> Self {
        Positions((0..len).collect())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The permutation of `rms` this variable induces, truncated to
    /// `perm_len` entries. Gaps in `rms` do not participate. Pick `i` is
    /// taken from the remaining pool at index `positions[i] % |pool|`, so
    /// the permutation is fully determined by the positions bytes and is
    /// stable across nodes.
    pub fn permute(&self, rms: &[RmId], perm_len: usize) -> Vec<RmId> {
        let mut pool: Vec<RmId> = rms.iter().copied().filter(|rm| !rm.is_empty()).collect();
        let take = perm_len.min(pool.len());
        let mut perm = Vec::with_capacity(take);
        for idx in 0..take {
            let byte = self.0.get(idx).copied().unwrap_or(idx as u8) as usize;
            let pick = byte % pool.len();
            perm.push(pool.remove(pick));
        }
        perm
    }
}

impl fmt::Debug for Positions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Positions{:?}", self.0)
    }
}
