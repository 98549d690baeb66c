//! A live (in-memory) variable.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::core::{Positions, TxnId, VarIdPos, VarUuid, VERSION_ZERO};
use crate::store::{StoreError, VarRecord, VarStore};

/// Fired after each write reaching the variable, with the writing
/// transaction's id.
pub type WriteSubscriber = Box<dyn Fn(&VarUuid, &Bytes, &[VarIdPos], TxnId) + Send>;

pub struct Var {
    uuid: VarUuid,
    positions: Positions,
    value: Bytes,
    refs: Vec<VarIdPos>,
    write_txn: TxnId,
    in_flight: usize,
    store: Arc<dyn VarStore>,
    subscribers: Vec<WriteSubscriber>,
}

impl Var {
    pub fn from_record(uuid: VarUuid, record: VarRecord, store: Arc<dyn VarStore>) -> Self {
        Var {
            uuid,
            positions: record.positions,
            value: record.value,
            refs: record.refs,
            write_txn: record.write_txn,
            in_flight: 0,
            store,
            subscribers: Vec::new(),
        }
    }

    /// A variable that exists only because someone is about to write it.
    pub fn new_blank(uuid: VarUuid, store: Arc<dyn VarStore>) -> Self {
        Var {
            uuid,
            positions: Positions::new(Vec::new()),
            value: Bytes::new(),
            refs: Vec::new(),
            write_txn: VERSION_ZERO,
            in_flight: 0,
            store,
            subscribers: Vec::new(),
        }
    }

    pub fn uuid(&self) -> &VarUuid {
        &self.uuid
    }

    pub fn positions(&self) -> &Positions {
        &self.positions
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn refs(&self) -> &[VarIdPos] {
        &self.refs
    }

    pub fn write_txn(&self) -> TxnId {
        self.write_txn
    }

    /// Idle variables are evicted from the active set after use. A
    /// subscribed variable never goes idle; it must stay resident to
    /// deliver notifications.
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.subscribers.is_empty()
    }

    /// Quiesced: nothing in flight, current value in the store. Writes
    /// go through the store synchronously, so in-flight is the whole of
    /// it.
    pub fn is_quiesced(&self) -> bool {
        self.in_flight == 0
    }

    pub fn begin_txn(&mut self) {
        self.in_flight += 1;
    }

    pub fn end_txn(&mut self) {
        assert!(self.in_flight > 0, "{} ended a txn it never began", self.uuid);
        self.in_flight -= 1;
    }

    pub fn add_write_subscriber(&mut self, subscriber: WriteSubscriber) {
        self.subscribers.push(subscriber);
    }

    /// Applies a committed write: value, references, and (for creations
    /// and immigrations) the immutable positions. Positions may be set
    /// once; changing them afterwards is a bug upstream, so they are
    /// simply ignored when already present.
    pub fn apply_write(
        &mut self,
        txn_id: TxnId,
        value: Bytes,
        refs: Vec<VarIdPos>,
        positions: Option<Positions>,
    ) -> Result<(), VarError> {
        if self.positions.is_empty() {
            if let Some(positions) = positions {
                self.positions = positions;
            }
        }
        self.value = value;
        self.refs = refs;
        self.write_txn = txn_id;
        self.store.write(
            &self.uuid,
            VarRecord {
                positions: self.positions.clone(),
                value: self.value.clone(),
                refs: self.refs.clone(),
                write_txn: self.write_txn,
            },
        )?;
        for subscriber in &self.subscribers {
            subscriber(&self.uuid, &self.value, &self.refs, self.write_txn);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum VarError {
    #[error("variable {0} not found")]
    NotFound(VarUuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::core::RmId;
    use crate::store::MemStore;

    #[test]
    fn write_goes_through_store_and_notifies() {
        let store = Arc::new(MemStore::new());
        let uuid = VarUuid([3u8; 16]);
        let mut var = Var::new_blank(uuid, store.clone());

        let notified = Arc::new(AtomicUsize::new(0));
        let notified_in_sub = Arc::clone(&notified);
        var.add_write_subscriber(Box::new(move |_, _, _, _| {
            notified_in_sub.fetch_add(1, Ordering::SeqCst);
        }));

        let txn_id = TxnId::new(1, RmId(1), 1);
        var.apply_write(
            txn_id,
            Bytes::from_static(b"v"),
            Vec::new(),
            Some(Positions::new(vec![0, 1, 2])),
        )
        .unwrap();

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        let record = store.load(&uuid).unwrap().expect("written through");
        assert_eq!(record.write_txn, txn_id);
        assert_eq!(record.positions.as_bytes(), &[0, 1, 2]);
    }

    #[test]
    fn positions_are_immutable_after_first_write() {
        let store = Arc::new(MemStore::new());
        let mut var = Var::new_blank(VarUuid([3u8; 16]), store);
        let txn_id = TxnId::new(1, RmId(1), 1);
        var.apply_write(
            txn_id,
            Bytes::new(),
            Vec::new(),
            Some(Positions::new(vec![1, 2])),
        )
        .unwrap();
        var.apply_write(
            TxnId::new(2, RmId(1), 1),
            Bytes::new(),
            Vec::new(),
            Some(Positions::new(vec![9, 9])),
        )
        .unwrap();
        assert_eq!(var.positions().as_bytes(), &[1, 2]);
    }

    #[test]
    fn subscribed_var_is_never_idle() {
        let store = Arc::new(MemStore::new());
        let mut var = Var::new_blank(VarUuid([3u8; 16]), store);
        assert!(var.is_idle());
        var.add_write_subscriber(Box::new(|_, _, _, _| {}));
        assert!(!var.is_idle());
        assert!(var.is_quiesced());
    }
}
