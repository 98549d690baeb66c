//! Identifiers: variables, transactions, resource managers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Index of the most random byte of a [`TxnId`]: the low byte of the
/// big-endian submission counter. Used to pick a shard for a variable.
pub const MOST_RANDOM_BYTE_INDEX: usize = 7;

/// The distinguished variable under which the cluster topology lives.
pub const TOPOLOGY_VAR_UUID: VarUuid = VarUuid([0u8; 16]);

/// The transaction id a fresh variable claims before any write reaches it.
pub const VERSION_ZERO: TxnId = TxnId([0u8; 16]);

/// The well-known id of the bootstrap topology write. Every joining node
/// writes its blank topology under this same id, which is what lets the
/// join transaction compare-and-swap across nodes that have never spoken.
pub const VERSION_ONE: TxnId = TxnId([
    0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0,
]);

/// 16-byte variable identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarUuid(pub [u8; 16]);

impl VarUuid {
    pub fn new_random() -> Self {
        VarUuid(*Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(VarUuid(arr))
    }

    /// The byte used to route this variable to a shard.
    pub fn shard_byte(&self) -> u8 {
        self.0[MOST_RANDOM_BYTE_INDEX]
    }
}

impl fmt::Debug for VarUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarUuid({})", Uuid::from_bytes(self.0))
    }
}

impl fmt::Display for VarUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Uuid::from_bytes(self.0), f)
    }
}

/// 16-byte transaction identifier.
///
/// Layout: bytes 0..8 are a big-endian submission counter, bytes 8..12 the
/// submitter's [`RmId`], bytes 12..16 the submitter's boot count. The
/// trailing eight bytes let receivers detect outcomes from a previous
/// incarnation of the submitter.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub [u8; 16]);

impl TxnId {
    pub fn new(counter: u64, submitter: RmId, boot_count: u32) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&counter.to_be_bytes());
        bytes[8..12].copy_from_slice(&submitter.0.to_be_bytes());
        bytes[12..16].copy_from_slice(&boot_count.to_be_bytes());
        TxnId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(TxnId(arr))
    }

    pub fn submitter(&self) -> RmId {
        RmId(u32::from_be_bytes(self.0[8..12].try_into().expect("4 bytes")))
    }

    pub fn boot_count(&self) -> u32 {
        u32::from_be_bytes(self.0[12..16].try_into().expect("4 bytes"))
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Resource manager identity within the cluster. Zero marks a gap in a
/// topology's RM slot list.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct RmId(pub u32);

impl RmId {
    pub const EMPTY: RmId = RmId(0);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for RmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "RM:-")
        } else {
            write!(f, "RM:{}", self.0)
        }
    }
}

impl fmt::Display for RmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
