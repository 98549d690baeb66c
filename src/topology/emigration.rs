//! The emigrator: streams matching variables and their write
//! transactions to the peers the in-progress topology places them on.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::{Cond, RmId, Topology, TxnFrame, VarUuid};
use crate::net::connection::ConnectionId;
use crate::store::{StoreError, VarStore};
use crate::wire::{
    encode_envelope, Envelope, Message, MigratedVar, Migration, MigrationComplete,
    PROTOCOL_VERSION_V1,
};

/// Variables and transactions are flushed to the peer in batches of
/// this many variables.
pub const MIGRATION_BATCH_SIZE: usize = 64;

/// One outgoing migration stream.
pub struct EmigrationPeer {
    pub rm_id: RmId,
    pub cond: Cond,
    /// The connection identity the stream was started against.
    pub conn_id: ConnectionId,
}

/// Where the stream's messages go. Remote peers get wire envelopes; the
/// local loopback short-circuits into our own inbox.
pub trait MigrationSink: Send {
    fn batch(&self, migration: Migration);
    fn complete(&self, complete: MigrationComplete);
}

/// Encodes and sends through a connection.
pub struct ConnectionSink {
    conn: Arc<dyn crate::net::Connection>,
}

impl ConnectionSink {
    pub fn new(conn: Arc<dyn crate::net::Connection>) -> Self {
        ConnectionSink { conn }
    }

    fn send(&self, message: Message) {
        match encode_envelope(&Envelope {
            version: PROTOCOL_VERSION_V1,
            message,
        }) {
            Ok(bytes) => self.conn.send(bytes.into()),
            Err(err) => warn!(rm = %self.conn.rm_id(), "migration encode failed: {err}"),
        }
    }
}

impl MigrationSink for ConnectionSink {
    fn batch(&self, migration: Migration) {
        self.send(Message::Migration(migration));
    }

    fn complete(&self, complete: MigrationComplete) {
        self.send(Message::MigrationComplete(complete));
    }
}

/// Scans the store in key order and streams everything the peer's
/// condition selects. Run on a dedicated thread per peer; the final
/// complete is sent only if the peer's connection identity is still the
/// one the scan started against, looked up at the end via
/// `current_conn`.
pub fn emigrate_to_peer(
    store: &dyn VarStore,
    eval: &Topology,
    version: u32,
    peer: &EmigrationPeer,
    sink: &dyn MigrationSink,
    current_conn: impl Fn(RmId) -> Option<ConnectionId>,
) {
    let mut batch = Batch::new(version);
    let mut batches_sent = 0usize;

    let result = store.scan(&mut |uuid, record| {
        // The topology variable travels by its own transactions.
        if *uuid == crate::core::TOPOLOGY_VAR_UUID {
            return Ok(());
        }
        let matches = peer
            .cond
            .satisfied_by(eval, &record.positions)
            .map_err(|err| StoreError::Corrupt {
                reason: format!("condition evaluation failed for {uuid}: {err}"),
            })?;
        if !matches {
            return Ok(());
        }

        // If a referenced variable sorted earlier shares this write txn,
        // the txn went out with that variable already.
        let txn_already_sent = record.refs.iter().any(|var_ref| {
            var_ref.var < *uuid
                && matches!(
                    store.load(&var_ref.var),
                    Ok(Some(other)) if other.write_txn == record.write_txn
                )
        });

        let txn = if txn_already_sent {
            None
        } else {
            store.load_txn(&record.write_txn)?
        };
        batch.push(uuid, record, txn);
        if batch.vars.len() >= MIGRATION_BATCH_SIZE {
            batches_sent += 1;
            sink.batch(batch.take());
        }
        Ok(())
    });

    if let Err(err) = result {
        warn!(rm = %peer.rm_id, version, "emigration scan aborted: {err}");
        return;
    }

    if !batch.vars.is_empty() {
        batches_sent += 1;
        sink.batch(batch.take());
    }

    // A reconnected peer gets a fresh emigrator; the complete belongs to
    // the incarnation that saw the batches.
    match current_conn(peer.rm_id) {
        Some(conn_id) if conn_id == peer.conn_id => {
            debug!(rm = %peer.rm_id, version, batches_sent, "emigration complete");
            sink.complete(MigrationComplete { version });
        }
        _ => {
            debug!(
                rm = %peer.rm_id,
                version, batches_sent, "peer connection changed, withholding complete"
            );
        }
    }
}

struct Batch {
    version: u32,
    txns: Vec<TxnFrame>,
    vars: Vec<MigratedVar>,
}

impl Batch {
    fn new(version: u32) -> Self {
        Batch {
            version,
            txns: Vec::new(),
            vars: Vec::new(),
        }
    }

    fn push(&mut self, uuid: &VarUuid, record: &crate::store::VarRecord, txn: Option<TxnFrame>) {
        self.vars.push(MigratedVar {
            uuid: *uuid,
            positions: record.positions.clone(),
            value: record.value.clone(),
            refs: record.refs.clone(),
            write_txn: record.write_txn,
        });
        if let Some(txn) = txn {
            self.txns.push(txn);
        }
    }

    fn take(&mut self) -> Migration {
        Migration {
            version: self.version,
            txns: std::mem::take(&mut self.txns),
            vars: std::mem::take(&mut self.vars),
        }
    }
}
