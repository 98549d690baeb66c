//! Outgoing payload senders.
//!
//! A sender registered with the connection manager is replayed against
//! the current connection set and against every later (re)connection
//! until it reports itself finished or is removed.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::core::RmId;
use crate::net::connection::{ConnMap, Connection};

/// Receives connection-set changes from the manager. The topology state
/// machine and both sender kinds implement this.
pub trait ConnectionObserver: Send + Sync {
    fn connected_rms(&self, conns: &ConnMap);
    fn connection_lost(&self, rm_id: RmId, conns: &ConnMap);
    fn connection_established(&self, rm_id: RmId, conn: &Arc<dyn Connection>, conns: &ConnMap);

    /// When true after a notification, the manager drops the observer.
    fn finished(&self) -> bool {
        false
    }
}

/// Re-broadcasts a payload to its recipients on every reconnection until
/// explicitly removed. Receivers must treat duplicates as idempotent.
pub struct RepeatingSender {
    payload: Bytes,
    recipients: Vec<RmId>,
}

impl RepeatingSender {
    pub fn new(payload: Bytes, recipients: Vec<RmId>) -> Arc<Self> {
        Arc::new(RepeatingSender {
            payload,
            recipients,
        })
    }
}

impl ConnectionObserver for RepeatingSender {
    fn connected_rms(&self, conns: &ConnMap) {
        for rm_id in &self.recipients {
            if let Some(conn) = conns.get(rm_id) {
                conn.send(self.payload.clone());
            }
        }
    }

    fn connection_lost(&self, _rm_id: RmId, _conns: &ConnMap) {}

    fn connection_established(&self, rm_id: RmId, conn: &Arc<dyn Connection>, _conns: &ConnMap) {
        if self.recipients.contains(&rm_id) {
            conn.send(self.payload.clone());
        }
    }
}

/// Sends a payload to each recipient once, then asks to be dropped.
pub struct OneShotSender {
    payload: Bytes,
    remaining: Mutex<BTreeSet<RmId>>,
}

impl OneShotSender {
    pub fn new(payload: Bytes, recipients: Vec<RmId>) -> Arc<Self> {
        Arc::new(OneShotSender {
            payload,
            remaining: Mutex::new(recipients.into_iter().collect()),
        })
    }

    fn send_available(&self, conns: &ConnMap) {
        let mut remaining = self.remaining.lock().expect("one-shot sender lock");
        remaining.retain(|rm_id| match conns.get(rm_id) {
            Some(conn) => {
                conn.send(self.payload.clone());
                false
            }
            None => true,
        });
    }
}

impl ConnectionObserver for OneShotSender {
    fn connected_rms(&self, conns: &ConnMap) {
        self.send_available(conns);
    }

    fn connection_lost(&self, _rm_id: RmId, _conns: &ConnMap) {}

    fn connection_established(&self, _rm_id: RmId, _conn: &Arc<dyn Connection>, conns: &ConnMap) {
        self.send_available(conns);
    }

    fn finished(&self) -> bool {
        self.remaining.lock().expect("one-shot sender lock").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::core::VarUuid;

    struct CountingConn {
        rm_id: RmId,
        sent: AtomicUsize,
    }

    impl CountingConn {
        fn new(rm_id: RmId) -> Arc<Self> {
            Arc::new(CountingConn {
                rm_id,
                sent: AtomicUsize::new(0),
            })
        }
    }

    impl Connection for CountingConn {
        fn host(&self) -> &str {
            "test"
        }
        fn rm_id(&self) -> RmId {
            self.rm_id
        }
        fn boot_count(&self) -> u32 {
            1
        }
        fn tie_break(&self) -> u32 {
            0
        }
        fn root_var(&self) -> Option<VarUuid> {
            None
        }
        fn send(&self, _payload: Bytes) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn repeating_sender_resends_on_reconnect() {
        let conn = CountingConn::new(RmId(2));
        let mut conns: ConnMap = ConnMap::new();
        conns.insert(RmId(2), conn.clone());

        let sender = RepeatingSender::new(Bytes::from_static(b"x"), vec![RmId(2)]);
        sender.connected_rms(&conns);
        sender.connection_established(RmId(2), &(conn.clone() as Arc<dyn Connection>), &conns);
        assert_eq!(conn.sent.load(Ordering::SeqCst), 2);
        assert!(!sender.finished());
    }

    #[test]
    fn one_shot_sender_finishes_after_each_recipient() {
        let a = CountingConn::new(RmId(1));
        let b = CountingConn::new(RmId(2));
        let mut conns: ConnMap = ConnMap::new();
        conns.insert(RmId(1), a.clone());

        let sender = OneShotSender::new(Bytes::from_static(b"x"), vec![RmId(1), RmId(2)]);
        sender.connected_rms(&conns);
        assert_eq!(a.sent.load(Ordering::SeqCst), 1);
        assert!(!sender.finished());

        conns.insert(RmId(2), b.clone());
        sender.connection_established(RmId(2), &(b.clone() as Arc<dyn Connection>), &conns);
        assert_eq!(b.sent.load(Ordering::SeqCst), 1);
        assert!(sender.finished());

        // Reconnection after completion sends nothing further.
        sender.connected_rms(&conns);
        assert_eq!(a.sent.load(Ordering::SeqCst), 1);
        assert_eq!(b.sent.load(Ordering::SeqCst), 1);
    }
}
