//! In-memory store: the reference implementation of the store seam.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::core::{TxnFrame, TxnId, VarUuid};
use crate::store::{StoreError, VarRecord, VarStore};

#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    vars: BTreeMap<VarUuid, VarRecord>,
    txns: BTreeMap<TxnId, TxnFrame>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner.read().map_err(|_| StoreError::Unavailable {
            reason: "store lock poisoned".to_string(),
        })
    }

    fn write_guard(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner.write().map_err(|_| StoreError::Unavailable {
            reason: "store lock poisoned".to_string(),
        })
    }
}

impl VarStore for MemStore {
    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.read()?.vars.is_empty())
    }

    fn load(&self, uuid: &VarUuid) -> Result<Option<VarRecord>, StoreError> {
        Ok(self.read()?.vars.get(uuid).cloned())
    }

    fn write(&self, uuid: &VarUuid, record: VarRecord) -> Result<(), StoreError> {
        self.write_guard()?.vars.insert(*uuid, record);
        Ok(())
    }

    fn scan(
        &self,
        visit: &mut dyn FnMut(&VarUuid, &VarRecord) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let inner = self.read()?;
        for (uuid, record) in &inner.vars {
            visit(uuid, record)?;
        }
        Ok(())
    }

    fn load_txn(&self, txn_id: &TxnId) -> Result<Option<TxnFrame>, StoreError> {
        Ok(self.read()?.txns.get(txn_id).cloned())
    }

    fn write_txn_record(&self, txn: TxnFrame) -> Result<(), StoreError> {
        let id = match txn.id {
            Some(id) => id,
            None => {
                return Err(StoreError::Corrupt {
                    reason: "txn record without an id".to_string(),
                })
            }
        };
        self.write_guard()?.txns.insert(id, txn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Positions, RmId};
    use bytes::Bytes;

    fn record(byte: u8) -> VarRecord {
        VarRecord {
            positions: Positions::new(vec![byte; 3]),
            value: Bytes::copy_from_slice(&[byte]),
            refs: Vec::new(),
            write_txn: TxnId::new(byte as u64, RmId(1), 1),
        }
    }

    #[test]
    fn scan_is_in_key_order() {
        let store = MemStore::new();
        for byte in [9u8, 3, 7, 1] {
            store.write(&VarUuid([byte; 16]), record(byte)).unwrap();
        }
        let mut seen = Vec::new();
        store
            .scan(&mut |uuid, _| {
                seen.push(uuid.as_bytes()[0]);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![1, 3, 7, 9]);
    }

    #[test]
    fn empty_until_first_write() {
        let store = MemStore::new();
        assert!(store.is_empty().unwrap());
        store.write(&VarUuid([1u8; 16]), record(1)).unwrap();
        assert!(!store.is_empty().unwrap());
    }
}
