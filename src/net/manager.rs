//! The connection manager actor.
//!
//! Owns the set of desired servers, the established connections (with
//! duplicate tie-breaking), the sender registry, and the topology
//! subscriber registry. All mutation happens on its own thread; peers
//! talk to it through [`ConnectionManagerHandle`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::core::RmId;
use crate::net::connection::{ConnMap, Connection, ConnectionId};
use crate::net::sender::ConnectionObserver;
use crate::topology::change::{SubscriberKind, TopologyChange};

/// Receives topology changes from the manager's registry. Kind-specific
/// behavior (the var barrier, proposer installation) lives with the
/// subscriber.
pub trait TopologySubscriber: Send + Sync {
    fn topology_changed(&self, change: &Arc<TopologyChange>);
}

enum Msg {
    SetDesiredServers {
        local: String,
        remote: Vec<String>,
    },
    ServerEstablished {
        conn: Arc<dyn Connection>,
    },
    ServerLost {
        conn_id: ConnectionId,
    },
    AddObserver(Arc<dyn ConnectionObserver>),
    RemoveObserver(Arc<dyn ConnectionObserver>),
    AddTopologySubscriber {
        kind: SubscriberKind,
        subscriber: Arc<dyn TopologySubscriber>,
        installed: Sender<()>,
    },
    SetTopology(Arc<TopologyChange>),
    Snapshot {
        reply: Sender<ConnMap>,
    },
    DesiredServers {
        reply: Sender<(Option<String>, Vec<String>)>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct ConnectionManagerHandle {
    tx: Sender<Msg>,
}

pub struct ConnectionManager {
    handle: ConnectionManagerHandle,
    join: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn spawn(rm_id: RmId) -> Self {
        let (tx, rx) = unbounded();
        let join = std::thread::Builder::new()
            .name(format!("conn-mgr-{}", rm_id.0))
            .spawn(move || run_loop(rm_id, rx))
            .expect("spawn connection manager");
        ConnectionManager {
            handle: ConnectionManagerHandle { tx },
            join: Some(join),
        }
    }

    pub fn handle(&self) -> ConnectionManagerHandle {
        self.handle.clone()
    }

    pub fn shutdown(mut self) {
        let _ = self.handle.tx.send(Msg::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(Msg::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl ConnectionManagerHandle {
    pub fn set_desired_servers(&self, local: String, remote: Vec<String>) {
        let _ = self.tx.send(Msg::SetDesiredServers { local, remote });
    }

    pub fn server_established(&self, conn: Arc<dyn Connection>) {
        let _ = self.tx.send(Msg::ServerEstablished { conn });
    }

    pub fn server_lost(&self, conn_id: ConnectionId) {
        let _ = self.tx.send(Msg::ServerLost { conn_id });
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        let _ = self.tx.send(Msg::AddObserver(observer));
    }

    pub fn remove_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        let _ = self.tx.send(Msg::RemoveObserver(observer));
    }

    /// Synchronous: returns once the subscriber is installed, so the
    /// caller can rely on observing every later change.
    pub fn add_topology_subscriber(
        &self,
        kind: SubscriberKind,
        subscriber: Arc<dyn TopologySubscriber>,
    ) {
        let (installed_tx, installed_rx) = crossbeam::channel::bounded(1);
        let _ = self.tx.send(Msg::AddTopologySubscriber {
            kind,
            subscriber,
            installed: installed_tx,
        });
        let _ = installed_rx.recv();
    }

    pub fn set_topology(&self, change: Arc<TopologyChange>) {
        change.add_one(SubscriberKind::ConnectionManager);
        let _ = self.tx.send(Msg::SetTopology(change));
    }

    pub fn connected(&self) -> ConnMap {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        let _ = self.tx.send(Msg::Snapshot { reply: reply_tx });
        reply_rx.recv().unwrap_or_default()
    }

    pub fn desired_servers(&self) -> (Option<String>, Vec<String>) {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        let _ = self.tx.send(Msg::DesiredServers { reply: reply_tx });
        reply_rx.recv().unwrap_or((None, Vec::new()))
    }
}

struct State {
    rm_id: RmId,
    local_host: Option<String>,
    desired: Vec<String>,
    conns: ConnMap,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    subscribers: Vec<(SubscriberKind, Arc<dyn TopologySubscriber>)>,
}

fn run_loop(rm_id: RmId, rx: Receiver<Msg>) {
    let mut state = State {
        rm_id,
        local_host: None,
        desired: Vec::new(),
        conns: ConnMap::new(),
        observers: Vec::new(),
        subscribers: Vec::new(),
    };

    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::SetDesiredServers { local, remote } => {
                debug!(rm = %rm_id, ?local, ?remote, "desired servers updated");
                state.local_host = Some(local);
                state.desired = remote;
                // Connections to servers no longer desired stay up until
                // the dialer tears them down; nothing to do here.
            }
            Msg::ServerEstablished { conn } => state.server_established(conn),
            Msg::ServerLost { conn_id } => state.server_lost(conn_id),
            Msg::AddObserver(observer) => {
                observer.connected_rms(&state.conns);
                if !observer.finished() {
                    state.observers.push(observer);
                }
            }
            Msg::RemoveObserver(observer) => {
                state
                    .observers
                    .retain(|existing| !Arc::ptr_eq(existing, &observer));
            }
            Msg::AddTopologySubscriber {
                kind,
                subscriber,
                installed,
            } => {
                state.add_topology_subscriber(kind, subscriber);
                let _ = installed.send(());
            }
            Msg::SetTopology(change) => {
                state.deliver_topology(&change);
            }
            Msg::Snapshot { reply } => {
                let _ = reply.send(state.conns.clone());
            }
            Msg::DesiredServers { reply } => {
                let _ = reply.send((state.local_host.clone(), state.desired.clone()));
            }
            Msg::Shutdown => break,
        }
    }
    debug!(rm = %rm_id, "connection manager stopped");
}

impl State {
    fn server_established(&mut self, conn: Arc<dyn Connection>) {
        let incoming = ConnectionId::of(conn.as_ref());
        if let Some(existing) = self.conns.get(&incoming.rm_id) {
            let held = ConnectionId::of(existing.as_ref());
            if !incoming.outranks(&held) {
                warn!(
                    rm = %incoming.rm_id,
                    "duplicate connection loses tie-break, dropping"
                );
                return;
            }
        }
        info!(rm = %incoming.rm_id, host = conn.host(), "server connection established");
        self.conns.insert(incoming.rm_id, Arc::clone(&conn));
        let conns = self.conns.clone();
        self.notify_observers(|observer| {
            observer.connection_established(incoming.rm_id, &conn, &conns)
        });
    }

    fn server_lost(&mut self, conn_id: ConnectionId) {
        match self.conns.get(&conn_id.rm_id) {
            Some(existing) if ConnectionId::of(existing.as_ref()) == conn_id => {}
            _ => return, // a replacement already superseded this identity
        }
        info!(rm = %conn_id.rm_id, "server connection lost");
        self.conns.remove(&conn_id.rm_id);
        let conns = self.conns.clone();
        self.notify_observers(|observer| observer.connection_lost(conn_id.rm_id, &conns));
    }

    fn notify_observers(&mut self, notify: impl Fn(&Arc<dyn ConnectionObserver>)) {
        for observer in &self.observers {
            notify(observer);
        }
        self.observers.retain(|observer| !observer.finished());
    }

    fn add_topology_subscriber(
        &mut self,
        kind: SubscriberKind,
        subscriber: Arc<dyn TopologySubscriber>,
    ) {
        let singleton = matches!(
            kind,
            SubscriberKind::Var | SubscriberKind::ConnectionManager
        );
        if singleton && self.subscribers.iter().any(|(held, _)| *held == kind) {
            panic!("{kind:?} topology subscriber registered twice");
        }
        self.subscribers.push((kind, subscriber));
    }

    fn deliver_topology(&mut self, change: &Arc<TopologyChange>) {
        debug!(rm = %self.rm_id, topology = %change.topology(), "delivering topology change");
        for (kind, _) in &self.subscribers {
            change.add_one(*kind);
        }
        for (_, subscriber) in &self.subscribers {
            subscriber.topology_changed(change);
        }
        // Our own acknowledgement: desired servers were updated by the
        // originator before publication, so nothing remains to absorb.
        change.done(SubscriberKind::ConnectionManager);
        change.release();
    }
}
