//! Process assembly: wires the store, the variable engine, the
//! connection manager, and the transmogrifier into one running node.

use std::sync::Arc;

use crossbeam::channel::Receiver;

use crate::config::{ClusterSpec, Timing};
use crate::core::RmId;
use crate::engine::VarDispatcher;
use crate::net::{ConnectionManager, ConnectionManagerHandle, TopologySubscriber};
use crate::store::VarStore;
use crate::topology::change::SubscriberKind;
use crate::topology::{
    install_connection_forwarder, install_topology_subscriber, GoalResult, Transmogrifier,
    TransmogrifierDeps, TransmogrifierHandle, TopologyWriter, TxnRunner,
};
use crate::wire::WireLimits;

pub struct NodeConfig {
    pub rm_id: RmId,
    pub boot_count: u32,
    pub host: String,
    pub var_shards: u8,
    pub timing: Timing,
}

impl NodeConfig {
    pub fn new(rm_id: RmId, boot_count: u32, host: impl Into<String>) -> Self {
        NodeConfig {
            rm_id,
            boot_count,
            host: host.into(),
            var_shards: 4,
            timing: Timing::default(),
        }
    }
}

pub struct Node {
    rm_id: RmId,
    host: String,
    store: Arc<dyn VarStore>,
    dispatcher: Arc<VarDispatcher>,
    conn_mgr: ConnectionManager,
    transmogrifier: Transmogrifier,
}

impl Node {
    pub fn start(
        config: NodeConfig,
        store: Arc<dyn VarStore>,
        runner: Arc<dyn TxnRunner>,
    ) -> Node {
        let dispatcher = VarDispatcher::spawn(config.var_shards, Arc::clone(&store), config.timing);
        let conn_mgr = ConnectionManager::spawn(config.rm_id);
        let var_subscriber: Arc<dyn TopologySubscriber> = Arc::clone(&dispatcher) as _;
        conn_mgr
            .handle()
            .add_topology_subscriber(SubscriberKind::Var, var_subscriber);

        let writer = Arc::new(TopologyWriter::new(
            Arc::clone(&runner),
            Arc::clone(&store),
            config.rm_id,
            config.boot_count,
        ));
        let transmogrifier = Transmogrifier::spawn(TransmogrifierDeps {
            rm_id: config.rm_id,
            boot_count: config.boot_count,
            local_host: config.host.clone(),
            store: Arc::clone(&store),
            dispatcher: Arc::clone(&dispatcher),
            conn_mgr: conn_mgr.handle(),
            writer,
            timing: config.timing,
        });

        install_topology_subscriber(
            &dispatcher,
            transmogrifier.handle(),
            WireLimits::default(),
        );
        install_connection_forwarder(&conn_mgr.handle(), transmogrifier.handle());

        Node {
            rm_id: config.rm_id,
            host: config.host,
            store,
            dispatcher,
            conn_mgr,
            transmogrifier,
        }
    }

    pub fn rm_id(&self) -> RmId {
        self.rm_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn store(&self) -> &Arc<dyn VarStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<VarDispatcher> {
        &self.dispatcher
    }

    pub fn conn_mgr(&self) -> ConnectionManagerHandle {
        self.conn_mgr.handle()
    }

    pub fn topology(&self) -> TransmogrifierHandle {
        self.transmogrifier.handle()
    }

    /// Asks the machine to drive the cluster to the operator's goal.
    pub fn request_config_change(&self, spec: &ClusterSpec) -> Receiver<GoalResult> {
        self.transmogrifier.handle().request_config_change(spec.to_goal())
    }

    pub fn shutdown(self) {
        let Node {
            dispatcher,
            conn_mgr,
            transmogrifier,
            ..
        } = self;
        transmogrifier.shutdown();
        conn_mgr.shutdown();
        dispatcher.shutdown();
    }
}
