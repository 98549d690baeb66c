//! The variable store seam.
//!
//! The on-disk key/value engine is an external collaborator; the core
//! depends only on this trait. One record per variable, keyed by UUID,
//! plus a transaction log keyed by txn id so migration can ship a
//! variable's most recent write alongside it.

pub mod memory;

use bytes::Bytes;
use thiserror::Error;

use crate::core::{TxnFrame, TxnId, VarIdPos, VarUuid};
use crate::core::Positions;

pub use memory::MemStore;

/// What the store holds for one variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarRecord {
    pub positions: Positions,
    pub value: Bytes,
    pub refs: Vec<VarIdPos>,
    pub write_txn: TxnId,
}

pub trait VarStore: Send + Sync {
    fn is_empty(&self) -> Result<bool, StoreError>;

    fn load(&self, uuid: &VarUuid) -> Result<Option<VarRecord>, StoreError>;

    /// Single-writer: implementations serialize all writes.
    fn write(&self, uuid: &VarUuid, record: VarRecord) -> Result<(), StoreError>;

    /// Visits every variable in key order within one read-only snapshot.
    fn scan(
        &self,
        visit: &mut dyn FnMut(&VarUuid, &VarRecord) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;

    fn load_txn(&self, txn_id: &TxnId) -> Result<Option<TxnFrame>, StoreError>;

    fn write_txn_record(&self, txn: TxnFrame) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store corrupt: {reason}")]
    Corrupt { reason: String },
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
}
