//! The topology transmogrifier: the actor that drives cluster
//! reconfiguration end to end.
//!
//! Driven entirely by messages: operator goals, connection-set changes,
//! topology observations from the write-subscriber on the topology
//! variable, and migration traffic. Each significant event re-runs
//! `tick`, which classifies the distance between the active topology
//! and the goal and performs the next step.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Timing;
use crate::core::{NextInfo, RmId, Root, Topology, TxnId, VarUuid, TOPOLOGY_VAR_UUID};
use crate::engine::VarDispatcher;
use crate::error::Transience;
use crate::net::connection::{ConnMap, ConnectionId};
use crate::net::manager::ConnectionManagerHandle;
use crate::net::sender::{ConnectionObserver, RepeatingSender};
use crate::store::VarStore;
use crate::topology::change::{SubscriberKind, TopologyChange};
use crate::topology::emigration::{
    emigrate_to_peer, ConnectionSink, EmigrationPeer, MigrationSink,
};
use crate::topology::immigration::ImmigrationLedger;
use crate::topology::target::{calculate_target, TargetOutcome};
use crate::topology::txns::{BootCounts, RootAttempt, Rewrite, TopologyTxnError, TopologyWriter};
use crate::wire::{
    decode_envelope, encode_envelope, Envelope, Message, Migration, TopologyChangeRequest,
    WireLimits, PROTOCOL_VERSION_V1,
};

/// Why a requested configuration change was not driven to completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GoalError {
    #[error("illegal config: cluster id should be '{expected}' instead of '{got}'")]
    IllegalClusterId { expected: String, got: String },
    #[error("config version {goal} ignored: version {current} already active or targeted")]
    Outdated { goal: u32, current: u32 },
    #[error("goal superseded by a newer configuration")]
    Superseded,
    #[error("illegal cluster operation: {0}")]
    Illegal(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type GoalResult = std::result::Result<(), GoalError>;

enum Msg {
    Shutdown,
    RequestConfigChange {
        config: Topology,
        reply: Option<Sender<GoalResult>>,
    },
    ConnectionsChanged(ConnMap),
    TopologyObserved(Topology),
    MigrationReceived {
        sender: RmId,
        migration: Migration,
    },
    MigrationCompleteReceived {
        sender: RmId,
        version: u32,
    },
    MigrationApplied {
        sender: RmId,
        version: u32,
    },
    VarBarrierReached {
        snapshot: TxnId,
    },
    ChangeInstalled {
        db_version: TxnId,
    },
}

pub struct TransmogrifierDeps {
    pub rm_id: RmId,
    pub boot_count: u32,
    pub local_host: String,
    pub store: Arc<dyn VarStore>,
    pub dispatcher: Arc<VarDispatcher>,
    pub conn_mgr: ConnectionManagerHandle,
    pub writer: Arc<TopologyWriter>,
    pub timing: Timing,
}

#[derive(Clone)]
pub struct TransmogrifierHandle {
    tx: Sender<Msg>,
    fatal: Arc<Mutex<Option<String>>>,
}

pub struct Transmogrifier {
    handle: TransmogrifierHandle,
    join: Option<JoinHandle<()>>,
}

impl Transmogrifier {
    pub fn spawn(deps: TransmogrifierDeps) -> Self {
        let (tx, rx) = unbounded();
        let fatal = Arc::new(Mutex::new(None));
        let handle = TransmogrifierHandle {
            tx: tx.clone(),
            fatal: Arc::clone(&fatal),
        };
        let rm_id = deps.rm_id;
        let join = std::thread::Builder::new()
            .name(format!("transmogrifier-{}", rm_id.0))
            .spawn(move || {
                let mut state = State::new(deps, tx, fatal);
                state.run(rx);
            })
            .expect("spawn transmogrifier");
        Transmogrifier {
            handle,
            join: Some(join),
        }
    }

    pub fn handle(&self) -> TransmogrifierHandle {
        self.handle.clone()
    }

    pub fn shutdown(mut self) {
        let _ = self.handle.tx.send(Msg::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Transmogrifier {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(Msg::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl TransmogrifierHandle {
    /// Asks the machine to drive the cluster to `config`. The returned
    /// receiver yields once the goal is achieved or rejected.
    pub fn request_config_change(&self, config: Topology) -> Receiver<GoalResult> {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        let _ = self.tx.send(Msg::RequestConfigChange {
            config,
            reply: Some(reply_tx),
        });
        reply_rx
    }

    /// A new topology value was observed through the write-subscriber.
    pub fn observe_topology(&self, topology: Topology) {
        let _ = self.tx.send(Msg::TopologyObserved(topology));
    }

    /// Routes an inbound wire payload from `sender`.
    pub fn deliver(&self, sender: RmId, payload: &Bytes) {
        match decode_envelope(payload, &WireLimits::default()) {
            Ok(Envelope { message, .. }) => match message {
                Message::Migration(migration) => {
                    let _ = self.tx.send(Msg::MigrationReceived { sender, migration });
                }
                Message::MigrationComplete(complete) => {
                    let _ = self.tx.send(Msg::MigrationCompleteReceived {
                        sender,
                        version: complete.version,
                    });
                }
                Message::TopologyChangeRequest(request) => {
                    let _ = self.tx.send(Msg::RequestConfigChange {
                        config: request.config,
                        reply: None,
                    });
                }
            },
            Err(err) => warn!(%sender, "discarding undecodable payload: {err}"),
        }
    }

    /// The fatal error that terminated the machine, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().expect("fatal lock").clone()
    }

    fn enqueue_connections(&self, conns: ConnMap) {
        let _ = self.tx.send(Msg::ConnectionsChanged(conns));
    }
}

/// Registered with the connection manager; forwards every change of the
/// connection set into the actor's inbox.
struct ConnSetForwarder {
    handle: TransmogrifierHandle,
}

impl ConnectionObserver for ConnSetForwarder {
    fn connected_rms(&self, conns: &ConnMap) {
        self.handle.enqueue_connections(conns.clone());
    }
    fn connection_lost(&self, _rm_id: RmId, conns: &ConnMap) {
        self.handle.enqueue_connections(conns.clone());
    }
    fn connection_established(
        &self,
        _rm_id: RmId,
        _conn: &Arc<dyn crate::net::Connection>,
        conns: &ConnMap,
    ) {
        self.handle.enqueue_connections(conns.clone());
    }
}

/// Wires the machine into the connection manager. Call once at startup.
pub fn install_connection_forwarder(
    conn_mgr: &ConnectionManagerHandle,
    handle: TransmogrifierHandle,
) {
    conn_mgr.add_observer(Arc::new(ConnSetForwarder { handle }));
}

/// Short-circuits a migration stream we run against ourselves back into
/// our own inbox.
struct LoopbackSink {
    tx: Sender<Msg>,
    sender: RmId,
}

impl LoopbackSink {
    fn new(tx: Sender<Msg>, sender: RmId) -> Self {
        LoopbackSink { tx, sender }
    }
}

impl MigrationSink for LoopbackSink {
    fn batch(&self, migration: Migration) {
        let _ = self.tx.send(Msg::MigrationReceived {
            sender: self.sender,
            migration,
        });
    }

    fn complete(&self, complete: crate::wire::MigrationComplete) {
        let _ = self.tx.send(Msg::MigrationCompleteReceived {
            sender: self.sender,
            version: complete.version,
        });
    }
}

struct Goal {
    config: Topology,
    reply: Option<Sender<GoalResult>>,
}

impl Goal {
    fn finish(&mut self, result: GoalResult) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

struct State {
    rm_id: RmId,
    boot_count: u32,
    local_host: String,
    store: Arc<dyn VarStore>,
    dispatcher: Arc<VarDispatcher>,
    conn_mgr: ConnectionManagerHandle,
    writer: Arc<TopologyWriter>,
    timing: Timing,
    self_tx: Sender<Msg>,
    fatal: Arc<Mutex<Option<String>>>,

    active: Option<Topology>,
    conns: ConnMap,
    goal: Option<Goal>,
    /// Root + rms once settled during an all-joining bootstrap.
    join_target: Option<Topology>,
    /// Repeating topology-change request, when delegating to an
    /// existing cluster.
    change_request: Option<Arc<RepeatingSender>>,
    ledger: ImmigrationLedger,
    /// db_version last confirmed installed by every subscriber.
    installed_db_version: Option<TxnId>,
    /// db_version at which the var barrier was last reached.
    barrier_snapshot: Option<TxnId>,
    barrier_armed: bool,
    /// Next-versions whose emigration streams have been started.
    emigrations_started: Vec<u32>,
    /// Senders that have fully supplied us, per target version. Folded
    /// into the persisted pending entry by `reconcile_supply`.
    finished_suppliers: BTreeMap<u32, std::collections::BTreeSet<RmId>>,
    dead: bool,
}

impl State {
    fn new(deps: TransmogrifierDeps, self_tx: Sender<Msg>, fatal: Arc<Mutex<Option<String>>>) -> Self {
        State {
            rm_id: deps.rm_id,
            boot_count: deps.boot_count,
            local_host: deps.local_host,
            store: deps.store,
            dispatcher: deps.dispatcher,
            conn_mgr: deps.conn_mgr,
            writer: deps.writer,
            timing: deps.timing,
            self_tx,
            fatal,
            active: None,
            conns: ConnMap::new(),
            goal: None,
            join_target: None,
            change_request: None,
            ledger: ImmigrationLedger::new(),
            installed_db_version: None,
            barrier_snapshot: None,
            barrier_armed: false,
            emigrations_started: Vec::new(),
            finished_suppliers: BTreeMap::new(),
            dead: false,
        }
    }

    fn run(&mut self, rx: Receiver<Msg>) {
        while !self.dead {
            let msg = match rx.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            };
            match msg {
                Msg::Shutdown => break,
                Msg::RequestConfigChange { config, reply } => {
                    self.select_goal(Goal { config, reply });
                }
                Msg::ConnectionsChanged(conns) => {
                    self.conns = conns;
                    self.tick();
                }
                Msg::TopologyObserved(topology) => {
                    debug!(rm = %self.rm_id, topology = %topology, "topology observed");
                    self.set_active(topology);
                }
                Msg::MigrationReceived { sender, migration } => {
                    self.migration_received(sender, migration);
                }
                Msg::MigrationCompleteReceived { sender, version } => {
                    debug!(rm = %self.rm_id, %sender, version, "migration complete received");
                    if self.ledger.complete_received(version, sender) {
                        self.sender_finished(version, sender);
                    }
                }
                Msg::MigrationApplied { sender, version } => {
                    if self.ledger.batch_applied(version, sender) {
                        self.sender_finished(version, sender);
                    }
                }
                Msg::VarBarrierReached { snapshot } => {
                    debug!(rm = %self.rm_id, "var barrier reached");
                    self.barrier_armed = false;
                    self.barrier_snapshot = Some(snapshot);
                    self.tick();
                }
                Msg::ChangeInstalled { db_version } => {
                    self.installed_db_version = Some(db_version);
                    self.tick();
                }
            }
        }
        if let Some(goal) = &mut self.goal {
            goal.finish(Err(GoalError::Superseded));
        }
        debug!(rm = %self.rm_id, "transmogrifier stopped");
    }

    fn fail(&mut self, reason: String) {
        error!(rm = %self.rm_id, "fatal: {reason}");
        *self.fatal.lock().expect("fatal lock") = Some(reason.clone());
        if let Some(goal) = &mut self.goal {
            goal.finish(Err(GoalError::Fatal(reason)));
        }
        self.goal = None;
        self.dead = true;
    }

    fn handle_txn_err(&mut self, err: TopologyTxnError) {
        match err.transience() {
            Transience::Fatal => self.fail(err.to_string()),
            Transience::Retryable => warn!(rm = %self.rm_id, "retryable: {err}"),
            Transience::Ignored => debug!(rm = %self.rm_id, "{err}"),
        }
    }

    // -- goal selection -----------------------------------------------------

    fn select_goal(&mut self, mut goal: Goal) {
        if let Some(active) = &self.active {
            if active.cluster_id != goal.config.cluster_id && goal.config.version > 0 {
                goal.finish(Err(GoalError::IllegalClusterId {
                    expected: active.cluster_id.clone(),
                    got: goal.config.cluster_id.clone(),
                }));
                return;
            }
            if active.version > goal.config.version {
                // Version zero goals are the startup placeholder, not an
                // operator error.
                let result = if goal.config.version > 0 {
                    Err(GoalError::Outdated {
                        goal: goal.config.version,
                        current: active.version,
                    })
                } else {
                    Ok(())
                };
                goal.finish(result);
                return;
            }
            if active.version == goal.config.version {
                goal.finish(Ok(()));
                return;
            }
        }

        if let Some(existing) = &mut self.goal {
            if existing.config.cluster_id != goal.config.cluster_id {
                goal.finish(Err(GoalError::IllegalClusterId {
                    expected: existing.config.cluster_id.clone(),
                    got: goal.config.cluster_id.clone(),
                }));
                return;
            }
            if existing.config.version > goal.config.version {
                goal.finish(Err(GoalError::Outdated {
                    goal: goal.config.version,
                    current: existing.config.version,
                }));
                return;
            }
            if existing.config.version == goal.config.version {
                // Already in progress.
                goal.finish(Ok(()));
                return;
            }
            info!(
                rm = %self.rm_id,
                old = existing.config.version,
                new = goal.config.version,
                "abandoning in-flight goal for newer target"
            );
            existing.finish(Err(GoalError::Superseded));
            self.abandon_task();
        }

        info!(rm = %self.rm_id, goal = %goal.config, "topology goal selected");
        self.goal = Some(goal);
        self.tick();
    }

    fn abandon_task(&mut self) {
        self.goal = None;
        self.join_target = None;
        self.barrier_snapshot = None;
        if let Some(sender) = self.change_request.take() {
            self.conn_mgr.remove_observer(sender);
        }
    }

    // -- observation --------------------------------------------------------

    fn set_active(&mut self, topology: Topology) {
        if let Some(active) = &self.active {
            if active.cluster_id != topology.cluster_id {
                self.fail(format!(
                    "cluster id changed from '{}' to '{}'",
                    active.cluster_id, topology.cluster_id
                ));
                return;
            }
            if topology.version < active.version {
                debug!(
                    rm = %self.rm_id,
                    observed = topology.version,
                    current = active.version,
                    "ignoring stale topology"
                );
                return;
            }
            if topology.version == active.version && topology.db_version == active.db_version {
                return;
            }
        }

        info!(rm = %self.rm_id, topology = %topology, "topology now active");
        self.active = Some(topology.clone());
        self.installed_db_version = None;

        let shared = Arc::new(topology.clone());
        let self_tx = self.self_tx.clone();
        let db_version = topology.db_version;
        let change = TopologyChange::new(
            shared,
            &[
                SubscriberKind::Var,
                SubscriberKind::Proposer,
                SubscriberKind::Acceptor,
                SubscriberKind::ConnectionManager,
            ],
            Box::new(move |_| {
                let _ = self_tx.send(Msg::ChangeInstalled { db_version });
            }),
        );

        if topology.version > 0 {
            let hosts = match topology.next() {
                Some(next) => next.all_hosts.clone(),
                None => topology.hosts.clone(),
            };
            match split_hosts(&hosts, &self.local_host) {
                Ok((local, remote)) => self.conn_mgr.set_desired_servers(local, remote),
                Err(missing) => {
                    warn!(rm = %self.rm_id, "{missing}; not adjusting desired servers")
                }
            }
        }
        self.conn_mgr.set_topology(change);

        if topology.rms_removed.contains(&self.rm_id) {
            self.fail("this RM has been removed from the cluster; shutting down".to_string());
            return;
        }

        if let Some(next) = topology.next() {
            // Self-driving resume: an in-progress target means there is
            // work to do even if nobody asked us directly.
            let goal = strip_to_goal(&next.target);
            let _ = self.self_tx.send(Msg::RequestConfigChange {
                config: goal,
                reply: None,
            });
        }
        self.tick();
    }

    // -- classification -----------------------------------------------------

    fn tick(&mut self) {
        if self.dead {
            return;
        }
        let Some(goal_version) = self.goal.as_ref().map(|goal| goal.config.version) else {
            return;
        };

        if let Some(active) = &self.active {
            if active.version >= goal_version {
                if let Some(goal) = &mut self.goal {
                    goal.finish(Ok(()));
                }
                self.abandon_task();
                info!(rm = %self.rm_id, version = goal_version, "topology goal achieved");
                return;
            }
        }

        match &self.active {
            None => self.ensure_local_topology(),
            Some(active) if active.version == 0 => self.join_cluster(),
            Some(active) => match active.next() {
                None => self.install_target_old(),
                Some(next) if next.target.version < goal_version => self.install_target_old(),
                Some(next) if next.target.version == goal_version => {
                    if !next.install_pending.is_empty() {
                        self.install_target_new();
                    } else if !next.pending.is_empty() {
                        self.migrate();
                    } else {
                        self.install_completion();
                    }
                }
                Some(next) => {
                    // The in-progress target is already beyond our goal;
                    // the embedded-goal resume will re-classify us.
                    debug!(
                        rm = %self.rm_id,
                        target = next.target.version,
                        goal = goal_version,
                        "goal behind in-progress target"
                    );
                }
            },
        }
    }

    // -- phase: ensure local topology ---------------------------------------

    fn ensure_local_topology(&mut self) {
        match self.writer.read_local() {
            Ok(Some(topology)) => self.set_active(topology),
            Ok(None) => {
                let config = self
                    .goal
                    .as_ref()
                    .map(|goal| goal.config.clone())
                    .expect("tick requires a goal");
                if config.cluster_id.is_empty() {
                    self.fail(
                        "no configuration supplied and none found in the local store".to_string(),
                    );
                    return;
                }
                info!(rm = %self.rm_id, "creating bootstrap topology");
                let mut blank =
                    Topology::blank(config.cluster_id.clone(), config.max_rm_count);
                if config.version > 0 {
                    blank.next = Some(NextInfo {
                        target: Box::new(config.clone()),
                        all_hosts: config.hosts.clone(),
                        new_rm_ids: Vec::new(),
                        surviving_rm_ids: Vec::new(),
                        lost_rm_ids: Vec::new(),
                        install_pending: Vec::new(),
                        pending: BTreeMap::new(),
                    });
                }
                match self.writer.create_topology_zero(&blank) {
                    Ok(topology) => self.set_active(topology),
                    Err(err) => self.handle_txn_err(err),
                }
            }
            Err(err) => self.handle_txn_err(err),
        }
    }

    // -- phase: join cluster ------------------------------------------------

    fn join_cluster(&mut self) {
        let config = self
            .goal
            .as_ref()
            .map(|goal| goal.config.clone())
            .expect("tick requires a goal");

        let (local, remote) = match config.partition_hosts(&self.local_host) {
            Ok(split) => split,
            Err(err) => {
                if let Some(goal) = &mut self.goal {
                    goal.finish(Err(GoalError::Illegal(err.to_string())));
                }
                self.abandon_task();
                return;
            }
        };
        self.conn_mgr.set_desired_servers(local.clone(), remote);

        let host_conns = self.conns_by_host();
        for host in &config.hosts {
            if host != &local && !host_conns.contains_key(host) {
                debug!(rm = %self.rm_id, host = %host, "waiting for join peer");
                return;
            }
        }

        let mut rm_ids = Vec::new();
        let mut root_id: Option<VarUuid> = None;
        for host in &config.hosts {
            if host == &local {
                continue;
            }
            let conn = &host_conns[host];
            rm_ids.push(conn.rm_id());
            match conn.root_var() {
                None => {} // joining too
                Some(remote_root) => match root_id {
                    None => root_id = Some(remote_root),
                    Some(held) if held == remote_root => {}
                    Some(_) => {
                        if let Some(goal) = &mut self.goal {
                            goal.finish(Err(GoalError::Illegal(
                                "hosts belong to different established clusters".to_string(),
                            )));
                        }
                        self.abandon_task();
                        return;
                    }
                },
            }
        }

        if root_id.is_some() {
            // An established cluster exists. Only its own quorum can
            // safely drive the change: lost members of the old config
            // are invisible to us, so we hand the goal over and wait to
            // observe the result.
            self.delegate_change(&config, rm_ids);
            return;
        }

        self.all_joining(config, rm_ids);
    }

    fn delegate_change(&mut self, config: &Topology, rm_ids: Vec<RmId>) {
        if self.change_request.is_some() {
            return;
        }
        let request = Message::TopologyChangeRequest(TopologyChangeRequest {
            config: config.clone(),
        });
        let payload = match encode_envelope(&Envelope {
            version: PROTOCOL_VERSION_V1,
            message: request,
        }) {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                self.fail(format!("encoding topology change request: {err}"));
                return;
            }
        };
        info!(rm = %self.rm_id, "requesting topology change from existing cluster members");
        let sender = RepeatingSender::new(payload, rm_ids);
        self.conn_mgr.add_observer(sender.clone());
        self.change_request = Some(sender);
    }

    fn all_joining(&mut self, config: Topology, mut rm_ids: Vec<RmId>) {
        rm_ids.push(self.rm_id);

        let mut target = match self.join_target.take() {
            Some(target) => target,
            None => {
                let mut target = config.clone();
                target.rms = rm_ids.clone();
                target
            }
        };

        if target.root.is_none() {
            // Between ticks a peer may have joined another cluster and
            // acquired a root; the check above re-verified the full set
            // just now, so creating the root here is safe.
            loop {
                match self.writer.attempt_create_root(&target, &self.boot_counts()) {
                    Ok(RootAttempt::Created(root)) => {
                        info!(rm = %self.rm_id, root = %root.var, "cluster root created");
                        target.root = Some(root);
                        break;
                    }
                    Ok(RootAttempt::Resubmit) => {
                        std::thread::sleep(self.submit_delay());
                    }
                    Ok(RootAttempt::NotReady) => {
                        self.join_target = Some(target);
                        return;
                    }
                    Err(err) => {
                        self.handle_txn_err(err);
                        return;
                    }
                }
            }
        }

        // For all-joining the whole membership votes: any peer observed
        // rootless may since have joined elsewhere, and unanimity is the
        // only instantaneous proof that everyone is moving together.
        let read = self
            .active
            .clone()
            .expect("join phase requires an active topology");
        self.join_target = Some(target.clone());
        loop {
            match self
                .writer
                .rewrite(&read, &target, &rm_ids, &[], &self.boot_counts())
            {
                Ok(Rewrite::Committed(topology)) => {
                    self.join_target = None;
                    self.set_active(topology);
                    return;
                }
                Ok(Rewrite::Resubmit) => std::thread::sleep(self.submit_delay()),
                Ok(Rewrite::BadRead(observed)) => {
                    self.join_target = None;
                    self.set_active(observed);
                    return;
                }
                Err(err) => {
                    self.handle_txn_err(err);
                    return;
                }
            }
        }
    }

    // -- phase: install target (old members) --------------------------------

    fn install_target_old(&mut self) {
        let active = self.active.clone().expect("phase requires active");
        let goal_config = self
            .goal
            .as_ref()
            .map(|goal| goal.config.clone())
            .expect("tick requires a goal");

        let mut host_rms: BTreeMap<String, RmId> = self
            .conns
            .values()
            .map(|conn| (conn.host().to_string(), conn.rm_id()))
            .collect();
        host_rms.insert(self.local_host.clone(), self.rm_id);

        match calculate_target(&active, &goal_config, &self.local_host, &host_rms) {
            Err(err) => {
                warn!(rm = %self.rm_id, "target calculation rejected: {err}");
                if let Some(goal) = &mut self.goal {
                    goal.finish(Err(GoalError::Illegal(err.to_string())));
                }
                self.abandon_task();
            }
            Ok(TargetOutcome::NeedConnections(missing)) => {
                debug!(rm = %self.rm_id, ?missing, "waiting for connections to classify target");
                let mut all_hosts = active.hosts.clone();
                for host in &goal_config.hosts {
                    if !all_hosts.contains(host) {
                        all_hosts.push(host.clone());
                    }
                }
                if let Ok((local, remote)) = split_hosts(&all_hosts, &self.local_host) {
                    self.conn_mgr.set_desired_servers(local, remote);
                }
            }
            Ok(TargetOutcome::Target(with_next)) => {
                let next = with_next.next().expect("target carries next");
                info!(
                    rm = %self.rm_id,
                    target = next.target.version,
                    added = ?next.new_rm_ids,
                    lost = ?next.lost_rm_ids,
                    "installing topology change target"
                );
                let lost = next.lost_rm_ids.clone();
                self.rewrite_with_old_quorum(&active, &with_next, &lost);
            }
        }
    }

    /// Quorum drawn from the old active RMs; unreachable old members and
    /// the lost are carried as passives so they still learn.
    fn rewrite_with_old_quorum(&mut self, read: &Topology, write: &Topology, lost: &[RmId]) {
        let members = read.rms_non_empty();
        let connected: Vec<RmId> = members
            .iter()
            .copied()
            .filter(|rm_id| *rm_id == self.rm_id || self.conns.contains_key(rm_id))
            .collect();
        if connected.len() < read.f_inc() {
            debug!(rm = %self.rm_id, "quorum of old members unreachable; waiting");
            return;
        }
        let active_set: Vec<RmId> = connected[..read.f_inc()].to_vec();
        let mut passive_set: Vec<RmId> = members
            .iter()
            .copied()
            .filter(|rm_id| !active_set.contains(rm_id))
            .collect();
        for rm_id in lost {
            if !active_set.contains(rm_id) && !passive_set.contains(rm_id) {
                passive_set.push(*rm_id);
            }
        }
        self.rewrite_loop(read.clone(), write.clone(), active_set, passive_set);
    }

    fn rewrite_loop(
        &mut self,
        read: Topology,
        write: Topology,
        active_set: Vec<RmId>,
        passive_set: Vec<RmId>,
    ) {
        loop {
            match self.writer.rewrite(
                &read,
                &write,
                &active_set,
                &passive_set,
                &self.boot_counts(),
            ) {
                Ok(Rewrite::Committed(topology)) => {
                    self.set_active(topology);
                    return;
                }
                Ok(Rewrite::Resubmit) => std::thread::sleep(self.submit_delay()),
                Ok(Rewrite::BadRead(observed)) => {
                    // Informative: the machine will also observe this
                    // through the subscriber and reclassify.
                    self.set_active(observed);
                    return;
                }
                Err(err) => {
                    self.handle_txn_err(err);
                    return;
                }
            }
        }
    }

    // -- phase: install target (new members) --------------------------------

    fn install_target_new(&mut self) {
        let active = self.active.clone().expect("phase requires active");
        let next = active.next().expect("phase requires next");

        let installed_new: Vec<RmId> = next
            .new_rm_ids
            .iter()
            .copied()
            .filter(|rm_id| !next.install_pending.contains(rm_id))
            .collect();
        let mut candidates: Vec<RmId> = next.surviving_rm_ids.clone();
        candidates.extend(installed_new);
        let reachable: Vec<RmId> = candidates
            .into_iter()
            .filter(|rm_id| *rm_id == self.rm_id || self.conns.contains_key(rm_id))
            .collect();
        if reachable.len() < active.f_inc() {
            debug!(rm = %self.rm_id, "cannot form install quorum; waiting for connectivity");
            return;
        }

        // Extend knowledge progressively: the connected prefix of the
        // not-yet-told newcomers rides along as passives this round.
        let prefix: Vec<RmId> = next
            .install_pending
            .iter()
            .copied()
            .take_while(|rm_id| self.conns.contains_key(rm_id))
            .collect();
        if prefix.is_empty() {
            debug!(rm = %self.rm_id, "no installable newcomers connected; waiting");
            return;
        }

        let mut write = active.clone();
        {
            let next_mut = write.next_mut().expect("phase requires next");
            next_mut
                .install_pending
                .retain(|rm_id| !prefix.contains(rm_id));
        }
        info!(
            rm = %self.rm_id,
            told = ?prefix,
            remaining = ?write.next().expect("next").install_pending,
            "extending topology target to new members"
        );

        let mut passive_set = prefix;
        for rm_id in &next.lost_rm_ids {
            if !passive_set.contains(rm_id) {
                passive_set.push(*rm_id);
            }
        }
        self.rewrite_loop(active.clone(), write, reachable, passive_set);
    }

    // -- phase: migrate ------------------------------------------------------

    fn migrate(&mut self) {
        let active = self.active.clone().expect("phase requires active");
        let next = active.next().expect("phase requires next");
        let next_version = next.target.version;

        // Step 1: proposers must have installed this exact configuration.
        if self.installed_db_version != Some(active.db_version) {
            debug!(rm = %self.rm_id, "awaiting subscriber installation of next");
            return;
        }

        // Step 2: quiesce every variable under the old configuration and
        // capture the configuration the barrier was reached under.
        if self.barrier_snapshot != Some(active.db_version) {
            if !self.barrier_armed {
                self.barrier_armed = true;
                let self_tx = self.self_tx.clone();
                let snapshot = active.db_version;
                debug!(rm = %self.rm_id, "arming var quiesce barrier");
                self.dispatcher.force_to_idle(Box::new(move || {
                    let _ = self_tx.send(Msg::VarBarrierReached { snapshot });
                }));
            }
            return;
        }

        // Step 3: the barrier matches the installed next; open the
        // migration window once per target version.
        if !self.emigrations_started.contains(&next_version) {
            self.emigrations_started.push(next_version);
            self.start_emigration(&active, next_version);
        }

        // Step 4: fold any suppliers that have finished into our
        // persisted pending entry. Step 5 is passive: peer writes
        // clearing their own entries arrive through the subscriber.
        self.reconcile_supply();
    }

    fn start_emigration(&mut self, active: &Topology, version: u32) {
        let next = active.next().expect("migration requires next");
        if !active.rms_non_empty().contains(&self.rm_id) {
            debug!(rm = %self.rm_id, "not an old member; nothing to emigrate");
            return;
        }
        info!(rm = %self.rm_id, version, peers = next.pending.len(), "starting emigration");

        for (rm_id, pending) in &next.pending {
            let peer_rm = *rm_id;
            let (sink, conn_id): (Box<dyn MigrationSink>, ConnectionId) = if peer_rm == self.rm_id
            {
                (
                    Box::new(LoopbackSink::new(self.self_tx.clone(), self.rm_id)),
                    ConnectionId {
                        rm_id: self.rm_id,
                        boot_count: self.boot_count,
                        tie_break: 0,
                    },
                )
            } else {
                match self.conns.get(&peer_rm) {
                    Some(conn) => (
                        Box::new(ConnectionSink::new(Arc::clone(conn))),
                        ConnectionId::of(conn.as_ref()),
                    ),
                    None => {
                        debug!(rm = %self.rm_id, peer = %peer_rm, "peer unreachable; skipping stream");
                        continue;
                    }
                }
            };

            let peer = EmigrationPeer {
                rm_id: peer_rm,
                cond: pending.cond.clone(),
                conn_id,
            };
            let store = Arc::clone(&self.store);
            let eval = (*next.target).clone();
            let conn_mgr = self.conn_mgr.clone();
            let own_id = conn_id;
            let self_rm = self.rm_id;
            std::thread::Builder::new()
                .name(format!("emigrate-{}-{}", self.rm_id.0, peer_rm.0))
                .spawn(move || {
                    emigrate_to_peer(store.as_ref(), &eval, version, &peer, sink.as_ref(), |rm| {
                        if rm == self_rm {
                            Some(own_id)
                        } else {
                            conn_mgr
                                .connected()
                                .get(&rm)
                                .map(|conn| ConnectionId::of(conn.as_ref()))
                        }
                    });
                })
                .expect("spawn emigrator");
        }
    }

    fn migration_received(&mut self, sender: RmId, migration: Migration) {
        let Some(active) = &self.active else {
            debug!(rm = %self.rm_id, %sender, "migration before any topology; dropping");
            return;
        };
        if migration.version <= active.version {
            debug!(
                rm = %self.rm_id,
                %sender,
                version = migration.version,
                "stale migration; dropping"
            );
            return;
        }
        debug!(
            rm = %self.rm_id,
            %sender,
            version = migration.version,
            vars = migration.vars.len(),
            txns = migration.txns.len(),
            "migration batch received"
        );
        self.ledger.batch_received(migration.version, sender);

        for txn in migration.txns {
            if let Err(err) = self.store.write_txn_record(txn) {
                warn!(rm = %self.rm_id, "failed to store migrated txn: {err}");
            }
        }

        let outstanding = Arc::new(AtomicUsize::new(migration.vars.len()));
        if migration.vars.is_empty() {
            let _ = self.self_tx.send(Msg::MigrationApplied {
                sender,
                version: migration.version,
            });
            return;
        }
        for var in migration.vars {
            let outstanding = Arc::clone(&outstanding);
            let self_tx = self.self_tx.clone();
            let version = migration.version;
            self.dispatcher.apply_to_var(
                var.uuid,
                true,
                Box::new(move |res| {
                    match res {
                        Ok(live) => {
                            if let Err(err) = live.apply_write(
                                var.write_txn,
                                var.value,
                                var.refs,
                                Some(var.positions),
                            ) {
                                warn!("immigrated var write failed: {err}");
                            }
                        }
                        Err(err) => warn!("immigrated var load failed: {err}"),
                    }
                    if outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let _ = self_tx.send(Msg::MigrationApplied { sender, version });
                    }
                }),
            );
        }
    }

    /// Everything `sender` owed us for `version` has arrived and been
    /// applied.
    fn sender_finished(&mut self, version: u32, sender: RmId) {
        self.finished_suppliers
            .entry(version)
            .or_default()
            .insert(sender);
        self.reconcile_supply();
    }

    /// Folds finished suppliers into our own persisted pending entry,
    /// removing it once enough distinct old-topology members have
    /// supplied us. Idempotent: safe to re-run after any observation.
    fn reconcile_supply(&mut self) {
        let Some(active) = self.active.clone() else {
            return;
        };
        let Some(next) = active.next() else {
            return;
        };
        let version = next.target.version;
        let Some(pending_self) = next.pending.get(&self.rm_id) else {
            return;
        };
        let Some(finished) = self.finished_suppliers.get(&version) else {
            return;
        };

        let old_members = active.rms_non_empty();
        let max_suppliers = old_members.len().saturating_sub(active.f as usize).max(1);

        let mut received = pending_self.received.clone();
        for sender in finished {
            if received.len() >= max_suppliers {
                break;
            }
            if !old_members.contains(sender) {
                warn!(rm = %self.rm_id, %sender, "supplier is not an old-topology member; ignoring");
                continue;
            }
            received.insert(*sender);
        }
        if received == pending_self.received {
            return;
        }

        let mut write = active.clone();
        {
            let next_mut = write.next_mut().expect("checked above");
            if received.len() >= max_suppliers {
                info!(rm = %self.rm_id, version, "all migration suppliers accounted for");
                next_mut.pending.remove(&self.rm_id);
            } else {
                let entry = next_mut
                    .pending
                    .get_mut(&self.rm_id)
                    .expect("checked above");
                entry.received = received;
            }
        }
        let lost = next.lost_rm_ids.clone();
        self.rewrite_with_old_quorum(&active, &write, &lost);
    }

    // -- phase: install completion -------------------------------------------

    fn install_completion(&mut self) {
        let active = self.active.clone().expect("phase requires active");
        let next = active.next().expect("phase requires next");
        let promoted = match active.promote_next() {
            Ok(promoted) => promoted,
            Err(err) => {
                warn!(rm = %self.rm_id, "promotion blocked: {err}");
                return;
            }
        };

        let members = promoted.rms_non_empty();
        let connected: Vec<RmId> = members
            .iter()
            .copied()
            .filter(|rm_id| *rm_id == self.rm_id || self.conns.contains_key(rm_id))
            .collect();
        if connected.len() < promoted.f_inc() {
            debug!(rm = %self.rm_id, "promotion quorum unreachable; waiting");
            return;
        }
        info!(rm = %self.rm_id, version = promoted.version, "promoting topology successor");

        let active_set: Vec<RmId> = connected[..promoted.f_inc()].to_vec();
        let mut passive_set: Vec<RmId> = members
            .iter()
            .copied()
            .filter(|rm_id| !active_set.contains(rm_id))
            .collect();
        for rm_id in &next.lost_rm_ids {
            if !passive_set.contains(rm_id) {
                passive_set.push(*rm_id);
            }
        }
        self.rewrite_loop(active, promoted, active_set, passive_set);
    }

    // -- helpers -------------------------------------------------------------

    fn conns_by_host(&self) -> BTreeMap<String, Arc<dyn crate::net::Connection>> {
        self.conns
            .values()
            .map(|conn| (conn.host().to_string(), Arc::clone(conn)))
            .collect()
    }

    fn boot_counts(&self) -> BootCounts {
        let mut counts: BootCounts = self
            .conns
            .iter()
            .map(|(rm_id, conn)| (*rm_id, conn.boot_count()))
            .collect();
        counts.insert(self.rm_id, self.boot_count);
        counts
    }

    fn submit_delay(&self) -> Duration {
        let cap = self.timing.max_submit_delay_ms.max(1);
        Duration::from_millis(rand::rng().random_range(0..cap))
    }
}

/// A goal is membership and quorum parameters only.
fn strip_to_goal(target: &Topology) -> Topology {
    Topology::goal(
        target.cluster_id.clone(),
        target.version,
        target.hosts.clone(),
        target.f,
        target.max_rm_count,
    )
}

fn split_hosts(hosts: &[String], local: &str) -> Result<(String, Vec<String>), String> {
    let mut remote = Vec::with_capacity(hosts.len());
    let mut found = false;
    for host in hosts {
        if host == local && !found {
            found = true;
        } else {
            remote.push(host.clone());
        }
    }
    if found {
        Ok((local.to_string(), remote))
    } else {
        Err(format!("host '{local}' not present in {hosts:?}"))
    }
}

/// Installs the write-subscriber on the topology variable, feeding every
/// committed write back into the machine. Synchronous: returns once the
/// subscriber is in place.
pub fn install_topology_subscriber(
    dispatcher: &VarDispatcher,
    handle: TransmogrifierHandle,
    limits: WireLimits,
) {
    let installed = crate::engine::apply_to_var_sync(dispatcher, TOPOLOGY_VAR_UUID, true, {
        move |res| match res {
            Ok(var) => {
                var.add_write_subscriber(Box::new(move |_, value, refs, txn_id| {
                    let root = refs.first().map(|var_ref| Root {
                        var: var_ref.var,
                        positions: var_ref.positions.clone(),
                    });
                    match crate::wire::value::topology_from_bytes(value, txn_id, root, &limits) {
                        Ok(topology) => handle.observe_topology(topology),
                        Err(err) => {
                            panic!("unable to deserialize observed topology: {err}")
                        }
                    }
                }));
                true
            }
            Err(err) => panic!("unable to subscribe to the topology variable: {err}"),
        }
    });
    assert_eq!(installed, Some(true), "topology subscriber installation failed");
}
