//! End-to-end reconfiguration scenarios against an in-process cluster.
//!
//! The consensus layer is scripted: a shared compare-and-swap cell for
//! the topology variable, with committed writes applied through each
//! participant node's var dispatcher exactly as the real transaction
//! layer would, so observations flow through the write-subscriber.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use strata::config::ClusterSpec;
use strata::core::{
    Abort, Action, Cond, Generator, Positions, RmId, Root, Topology, TxnFrame, TxnId, TxnOutcome,
    Update, UpdateAction, VarIdPos, VarUuid, TOPOLOGY_VAR_UUID, VERSION_ONE,
};
use strata::engine::VarDispatcher;
use strata::net::Connection;
use strata::node::{Node, NodeConfig};
use strata::store::{MemStore, VarRecord, VarStore};
use strata::topology::{GoalResult, TransmogrifierHandle, TxnRunner, TxnRunnerError};
use strata::wire::value::topology_from_bytes;
use strata::wire::WireLimits;

// ===========================================================================
// Fixture
// ===========================================================================

#[derive(Clone)]
struct ClusterRecord {
    txn_id: TxnId,
    value: Bytes,
    refs: Vec<VarIdPos>,
}

struct NodeSlot {
    host: String,
    store: Arc<dyn VarStore>,
    dispatcher: Arc<VarDispatcher>,
    handle: TransmogrifierHandle,
    root_cell: Arc<Mutex<Option<VarUuid>>>,
    observed: Arc<Mutex<Vec<(String, u32)>>>,
}

#[derive(Default)]
struct Shared {
    record: Mutex<Option<ClusterRecord>>,
    counter: Mutex<u64>,
    slots: Mutex<BTreeMap<RmId, NodeSlotRef>>,
}

#[derive(Clone)]
struct NodeSlotRef {
    store: Arc<dyn VarStore>,
    dispatcher: Arc<VarDispatcher>,
    root_cell: Arc<Mutex<Option<VarUuid>>>,
    observed: Arc<Mutex<Vec<(String, u32)>>>,
}

impl Shared {
    fn fresh_txn_id(&self, submitter: RmId, boot_count: u32) -> TxnId {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        TxnId::new(1000 + *counter, submitter, boot_count)
    }

    /// Applies a committed topology write to each participant. Called
    /// with the record lock held (for read-modify-writes) so per-node
    /// delivery order matches commit order. A bootstrap write loses
    /// against any value that already landed, the way a creation aborts
    /// against an existing variable.
    fn apply_topology(
        &self,
        participants: &[RmId],
        txn_id: TxnId,
        value: &Bytes,
        refs: &[VarIdPos],
        only_if_fresh: bool,
    ) {
        let slots = self.slots.lock().unwrap();
        for rm_id in participants {
            let Some(slot) = slots.get(rm_id) else {
                continue;
            };
            let value = value.clone();
            let refs = refs.to_vec();
            let root_cell = Arc::clone(&slot.root_cell);
            let observed = Arc::clone(&slot.observed);
            slot.dispatcher.apply_to_var(
                TOPOLOGY_VAR_UUID,
                true,
                Box::new(move |res| {
                    let Ok(var) = res else { return };
                    if only_if_fresh && var.write_txn() != strata::VERSION_ZERO {
                        return;
                    }
                    *root_cell.lock().unwrap() = refs.first().map(|var_ref| var_ref.var);
                    if let Ok(topology) =
                        topology_from_bytes(&value, txn_id, None, &WireLimits::default())
                    {
                        observed
                            .lock()
                            .unwrap()
                            .push((topology.cluster_id.clone(), topology.version));
                    }
                    var.apply_write(txn_id, value, refs, Some(Positions::identity(8)))
                        .expect("topology write applies");
                }),
            );
        }
    }

    fn apply_create(
        &self,
        participants: &[RmId],
        uuid: VarUuid,
        txn_id: TxnId,
        value: &Bytes,
        positions: &Positions,
        refs: &[VarIdPos],
    ) {
        let slots = self.slots.lock().unwrap();
        for rm_id in participants {
            let Some(slot) = slots.get(rm_id) else {
                continue;
            };
            let value = value.clone();
            let refs = refs.to_vec();
            let positions = positions.clone();
            slot.dispatcher.apply_to_var(
                uuid,
                true,
                Box::new(move |res| {
                    if let Ok(var) = res {
                        var.apply_write(txn_id, value, refs, Some(positions))
                            .expect("create applies");
                    }
                }),
            );
        }
    }
}

struct FakeRunner {
    shared: Arc<Shared>,
    rm_id: RmId,
    boot_count: u32,
    store: Arc<dyn VarStore>,
}

impl TxnRunner for FakeRunner {
    fn run_txn(
        &self,
        frame: TxnFrame,
        _assign_id: bool,
        _actives: &[RmId],
    ) -> Result<Option<TxnOutcome>, TxnRunnerError> {
        let (var, action) = frame
            .actions
            .first()
            .expect("topology txns carry one action")
            .clone();
        let participants: Vec<RmId> = frame
            .allocations
            .iter()
            .map(|alloc| alloc.rm_id)
            .collect();

        match action {
            Action::Read { .. } if var == TOPOLOGY_VAR_UUID => {
                let record = self.shared.record.lock().unwrap().clone();
                let record = match record {
                    Some(record) => record,
                    None => match self.store.load(&TOPOLOGY_VAR_UUID).expect("store read") {
                        Some(local) => ClusterRecord {
                            txn_id: local.write_txn,
                            value: local.value,
                            refs: local.refs,
                        },
                        None => panic!("discovery against an empty store"),
                    },
                };
                Ok(Some(TxnOutcome::Abort(Abort::Rerun(vec![Update {
                    txn_id: record.txn_id,
                    actions: vec![(
                        TOPOLOGY_VAR_UUID,
                        UpdateAction::Write {
                            value: record.value,
                            refs: record.refs,
                        },
                    )],
                }]))))
            }
            Action::Create { value, refs, .. } if var == TOPOLOGY_VAR_UUID => {
                // Bootstrap write: local to the submitter.
                let txn_id = frame.id.expect("bootstrap carries a fixed id");
                self.shared
                    .apply_topology(&[frame.submitter], txn_id, &value, &refs, true);
                Ok(Some(TxnOutcome::Commit { txn_id }))
            }
            Action::ReadWrite {
                version,
                value,
                refs,
            } if var == TOPOLOGY_VAR_UUID => {
                let mut guard = self.shared.record.lock().unwrap();
                let matches = match guard.as_ref() {
                    Some(record) => record.txn_id == version,
                    None => version == VERSION_ONE,
                };
                if matches {
                    let txn_id = self.shared.fresh_txn_id(self.rm_id, self.boot_count);
                    *guard = Some(ClusterRecord {
                        txn_id,
                        value: value.clone(),
                        refs: refs.clone(),
                    });
                    self.shared
                        .apply_topology(&participants, txn_id, &value, &refs, false);
                    drop(guard);
                    Ok(Some(TxnOutcome::Commit { txn_id }))
                } else {
                    let record = guard.clone().expect("mismatch implies a record");
                    Ok(Some(TxnOutcome::Abort(Abort::Rerun(vec![Update {
                        txn_id: record.txn_id,
                        actions: vec![(
                            TOPOLOGY_VAR_UUID,
                            UpdateAction::Write {
                                value: record.value,
                                refs: record.refs,
                            },
                        )],
                    }]))))
                }
            }
            Action::Create {
                value,
                positions,
                refs,
            } => {
                // An ordinary variable creation (the cluster root).
                let txn_id = self.shared.fresh_txn_id(self.rm_id, self.boot_count);
                self.shared
                    .apply_create(&participants, var, txn_id, &value, &positions, &refs);
                Ok(Some(TxnOutcome::Commit { txn_id }))
            }
            other => panic!("unexpected action in topology txn: {other:?}"),
        }
    }
}

struct FakeConn {
    host: String,
    rm_id: RmId,
    boot_count: u32,
    sender_rm: RmId,
    deliver_to: TransmogrifierHandle,
    root_cell: Arc<Mutex<Option<VarUuid>>>,
}

impl Connection for FakeConn {
    fn host(&self) -> &str {
        &self.host
    }
    fn rm_id(&self) -> RmId {
        self.rm_id
    }
    fn boot_count(&self) -> u32 {
        self.boot_count
    }
    fn tie_break(&self) -> u32 {
        0
    }
    fn root_var(&self) -> Option<VarUuid> {
        *self.root_cell.lock().unwrap()
    }
    fn send(&self, payload: Bytes) {
        self.deliver_to.deliver(self.sender_rm, &payload);
    }
}

struct ClusterFixture {
    shared: Arc<Shared>,
    nodes: BTreeMap<RmId, Node>,
    slots: BTreeMap<RmId, NodeSlot>,
}

impl ClusterFixture {
    fn new() -> Self {
        ClusterFixture {
            shared: Arc::new(Shared::default()),
            nodes: BTreeMap::new(),
            slots: BTreeMap::new(),
        }
    }

    fn add_node(&mut self, rm: u32, host: &str) -> RmId {
        let rm_id = RmId(rm);
        let store: Arc<dyn VarStore> = Arc::new(MemStore::new());
        let runner = Arc::new(FakeRunner {
            shared: Arc::clone(&self.shared),
            rm_id,
            boot_count: 1,
            store: Arc::clone(&store),
        });
        let node = Node::start(
            NodeConfig::new(rm_id, 1, host),
            Arc::clone(&store),
            runner,
        );

        let slot = NodeSlot {
            host: host.to_string(),
            store: Arc::clone(&store),
            dispatcher: Arc::clone(node.dispatcher()),
            handle: node.topology(),
            root_cell: Arc::new(Mutex::new(None)),
            observed: Arc::new(Mutex::new(Vec::new())),
        };
        self.shared.slots.lock().unwrap().insert(
            rm_id,
            NodeSlotRef {
                store: Arc::clone(&slot.store),
                dispatcher: Arc::clone(&slot.dispatcher),
                root_cell: Arc::clone(&slot.root_cell),
                observed: Arc::clone(&slot.observed),
            },
        );
        self.slots.insert(rm_id, slot);
        self.nodes.insert(rm_id, node);
        rm_id
    }

    fn connect_pair(&self, a: RmId, b: RmId) {
        let slot_a = &self.slots[&a];
        let slot_b = &self.slots[&b];
        self.nodes[&a].conn_mgr().server_established(Arc::new(FakeConn {
            host: slot_b.host.clone(),
            rm_id: b,
            boot_count: 1,
            sender_rm: a,
            deliver_to: slot_b.handle.clone(),
            root_cell: Arc::clone(&slot_b.root_cell),
        }));
        self.nodes[&b].conn_mgr().server_established(Arc::new(FakeConn {
            host: slot_a.host.clone(),
            rm_id: a,
            boot_count: 1,
            sender_rm: b,
            deliver_to: slot_a.handle.clone(),
            root_cell: Arc::clone(&slot_a.root_cell),
        }));
    }

    fn connect_all(&self) {
        let rms: Vec<RmId> = self.nodes.keys().copied().collect();
        for (idx, a) in rms.iter().enumerate() {
            for b in &rms[idx + 1..] {
                self.connect_pair(*a, *b);
            }
        }
    }

    fn spec(version: u32, hosts: &[&str], f: u8) -> ClusterSpec {
        ClusterSpec {
            cluster_id: "c".to_string(),
            version,
            hosts: hosts.iter().map(|host| host.to_string()).collect(),
            f,
            max_rm_count: 5,
            async_flush: false,
            transitioning_to: None,
        }
    }

    fn request(&self, rm: RmId, spec: &ClusterSpec) -> crossbeam::channel::Receiver<GoalResult> {
        self.nodes[&rm].request_config_change(spec)
    }

    fn await_goal(rx: crossbeam::channel::Receiver<GoalResult>) -> GoalResult {
        rx.recv_timeout(Duration::from_secs(20)).expect("goal result")
    }

    fn active_of(&self, rm: RmId) -> Option<Topology> {
        let record = self.slots[&rm]
            .store
            .load(&TOPOLOGY_VAR_UUID)
            .expect("store read")?;
        let root = record.refs.first().map(|var_ref| Root {
            var: var_ref.var,
            positions: var_ref.positions.clone(),
        });
        Some(
            topology_from_bytes(
                &record.value,
                record.write_txn,
                root,
                &WireLimits::default(),
            )
            .expect("stored topology decodes"),
        )
    }

    fn wait_version(&self, rm: RmId, version: u32) -> Topology {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            if let Some(topology) = self.active_of(rm) {
                if topology.version == version && topology.next().is_none() {
                    return topology;
                }
            }
            if Instant::now() > deadline {
                panic!(
                    "{rm} never reached stable version {version}; currently {:?}",
                    self.active_of(rm)
                );
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn seed_var(&self, rm: RmId, byte: u8) -> VarUuid {
        let uuid = VarUuid([
            byte, 0, 0, 0, 0, 0, 0, byte, 0, 0, 0, 0, 0, 0, 0, 1,
        ]);
        let txn_id = TxnId::new(5000 + byte as u64, rm, 1);
        let positions = Positions::new(vec![
            byte % 5,
            byte % 7,
            byte % 3,
            byte % 2,
            byte,
        ]);
        let store = &self.slots[&rm].store;
        store
            .write(
                &uuid,
                VarRecord {
                    positions,
                    value: Bytes::copy_from_slice(&[byte]),
                    refs: Vec::new(),
                    write_txn: txn_id,
                },
            )
            .expect("seed var");
        store
            .write_txn_record(TxnFrame {
                id: Some(txn_id),
                submitter: rm,
                submitter_boot_count: 1,
                actions: Vec::new(),
                allocations: Vec::new(),
                f_inc: 1,
                topology_version: 1,
            })
            .expect("seed txn");
        uuid
    }

    fn assert_observations_monotone(&self) {
        for (rm, slot) in &self.slots {
            let observed = slot.observed.lock().unwrap();
            let mut last = 0;
            for (cluster_id, version) in observed.iter() {
                assert_eq!(cluster_id, "c", "{rm} observed a foreign cluster id");
                assert!(
                    *version >= last,
                    "{rm} observed version {version} after {last}"
                );
                last = *version;
            }
        }
    }
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[test]
fn s1_bootstrap_single_node() {
    let mut fixture = ClusterFixture::new();
    let rm1 = fixture.add_node(1, "h1:7894");

    let spec = ClusterFixture::spec(1, &["h1:7894"], 0);
    let result = ClusterFixture::await_goal(fixture.request(rm1, &spec));
    assert_eq!(result, Ok(()));

    let topology = fixture.wait_version(rm1, 1);
    assert_eq!(topology.cluster_id, "c");
    assert_eq!(topology.rms, vec![rm1]);
    assert!(topology.next().is_none());

    let root = topology.root.expect("root created at bootstrap");
    let root_record = fixture.slots[&rm1]
        .store
        .load(&root.var)
        .expect("store read")
        .expect("root variable present");
    assert_eq!(root_record.positions.len(), 5);
}

#[test]
fn s2_join_two_empty_nodes() {
    let mut fixture = ClusterFixture::new();
    let rm1 = fixture.add_node(1, "h1:7894");
    let rm2 = fixture.add_node(2, "h2:7894");
    fixture.connect_all();

    let spec = ClusterFixture::spec(1, &["h1:7894", "h2:7894"], 0);
    let rx1 = fixture.request(rm1, &spec);
    let rx2 = fixture.request(rm2, &spec);
    assert_eq!(ClusterFixture::await_goal(rx1), Ok(()));
    assert_eq!(ClusterFixture::await_goal(rx2), Ok(()));

    let topology1 = fixture.wait_version(rm1, 1);
    let topology2 = fixture.wait_version(rm2, 1);
    assert_eq!(topology1.rms, topology2.rms);
    assert_eq!(
        topology1.rms.iter().copied().collect::<BTreeSet<_>>(),
        [rm1, rm2].into_iter().collect::<BTreeSet<_>>()
    );

    let root1 = topology1.root.expect("root");
    let root2 = topology2.root.expect("root");
    assert_eq!(root1.var, root2.var, "joiners agree on one root");
    fixture.assert_observations_monotone();
}

#[test]
fn s3_add_one_node_migrates_and_promotes() {
    let mut fixture = ClusterFixture::new();
    for (rm, host) in [(1, "h1:7894"), (2, "h2:7894"), (3, "h3:7894")] {
        fixture.add_node(rm, host);
    }
    fixture.connect_all();

    let v1 = ClusterFixture::spec(1, &["h1:7894", "h2:7894", "h3:7894"], 1);
    let receivers: Vec<_> = (1..=3)
        .map(|rm| fixture.request(RmId(rm), &v1))
        .collect();
    for rx in receivers {
        assert_eq!(ClusterFixture::await_goal(rx), Ok(()));
    }
    for rm in 1..=3 {
        fixture.wait_version(RmId(rm), 1);
    }

    // Seed user data on the established members.
    let mut seeded = Vec::new();
    for byte in 10..30u8 {
        let mut uuid = None;
        for rm in 1..=3 {
            uuid = Some(fixture.seed_var(RmId(rm), byte));
        }
        seeded.push(uuid.expect("seeded"));
    }

    let rm4 = fixture.add_node(4, "h4:7894");
    fixture.connect_pair(RmId(1), rm4);
    fixture.connect_pair(RmId(2), rm4);
    fixture.connect_pair(RmId(3), rm4);

    let v2 = ClusterFixture::spec(2, &["h1:7894", "h2:7894", "h3:7894", "h4:7894"], 1);
    assert_eq!(
        ClusterFixture::await_goal(fixture.request(RmId(1), &v2)),
        Ok(())
    );

    // The bootstrap winner decides the slot order of the original three;
    // the newcomer is appended after them.
    for rm in 1..=4 {
        let topology = fixture.wait_version(RmId(rm), 2);
        assert_eq!(topology.rms.len(), 4);
        assert_eq!(topology.rms[3], rm4, "the newcomer takes the appended slot");
        assert_eq!(
            topology.rms.iter().copied().collect::<BTreeSet<_>>(),
            (1..=4).map(RmId).collect::<BTreeSet<_>>()
        );
        assert!(topology.rms_removed.is_empty());
    }

    // The newcomer received exactly the variables its placement
    // condition selects under the new topology.
    let final_topology = fixture.wait_version(rm4, 2);
    let newcomer_window = Generator {
        rm_id: rm4,
        perm_len: 4,
        start: 0,
        len: 3,
        len_adjust_intersect: Vec::new(),
        includes: true,
    };
    let mut expected = 0;
    for uuid in &seeded {
        let record = fixture.slots[&RmId(1)]
            .store
            .load(uuid)
            .expect("store read")
            .expect("seeded var present");
        let wanted = Cond::Generator(newcomer_window.clone())
            .satisfied_by(&final_topology, &record.positions)
            .expect("condition evaluates");
        let migrated = fixture.slots[&rm4]
            .store
            .load(uuid)
            .expect("store read")
            .is_some();
        assert_eq!(
            migrated, wanted,
            "newcomer store membership for {uuid} should follow its condition"
        );
        if wanted {
            expected += 1;
        }
    }
    assert!(expected > 0, "test seeds should map at least one var onto the newcomer");

    fixture.assert_observations_monotone();
}

#[test]
fn s4_replace_one_node() {
    let mut fixture = ClusterFixture::new();
    for (rm, host) in [(1, "h1:7894"), (2, "h2:7894"), (3, "h3:7894")] {
        fixture.add_node(rm, host);
    }
    fixture.connect_all();

    let v1 = ClusterFixture::spec(1, &["h1:7894", "h2:7894", "h3:7894"], 1);
    let receivers: Vec<_> = (1..=3)
        .map(|rm| fixture.request(RmId(rm), &v1))
        .collect();
    for rx in receivers {
        assert_eq!(ClusterFixture::await_goal(rx), Ok(()));
    }
    let before = fixture.wait_version(RmId(1), 1);
    for rm in 2..=3 {
        fixture.wait_version(RmId(rm), 1);
    }

    let rm4 = fixture.add_node(4, "h4:7894");
    fixture.connect_pair(RmId(1), rm4);
    fixture.connect_pair(RmId(2), rm4);
    fixture.connect_pair(RmId(3), rm4);

    // h3 is dropped, h4 takes its place.
    let v2 = ClusterFixture::spec(2, &["h1:7894", "h2:7894", "h4:7894"], 1);
    assert_eq!(
        ClusterFixture::await_goal(fixture.request(RmId(1), &v2)),
        Ok(())
    );

    // The newcomer slots in exactly where the wiped member sat.
    let expected_rms: Vec<RmId> = before
        .rms
        .iter()
        .map(|rm| if *rm == RmId(3) { rm4 } else { *rm })
        .collect();
    for rm in [1u32, 2, 4] {
        let topology = fixture.wait_version(RmId(rm), 2);
        assert_eq!(topology.rms, expected_rms, "the newcomer takes the vacated slot");
        assert!(topology.rms_removed.contains(&RmId(3)));
    }

    // The removed node observed its own removal (it rode along as a
    // passive in the completion transaction) and refused to continue.
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        if let Some(reason) = fixture.slots[&RmId(3)].handle.fatal_error() {
            assert!(reason.contains("removed"), "unexpected fatal: {reason}");
            break;
        }
        if Instant::now() > deadline {
            panic!("removed node never shut itself down");
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    fixture.assert_observations_monotone();
}

#[test]
fn s5_concurrent_conflicting_goals() {
    let mut fixture = ClusterFixture::new();
    let rm1 = fixture.add_node(1, "h1:7894");
    let rm2 = fixture.add_node(2, "h2:7894");
    let rm3 = fixture.add_node(3, "h3:7894");
    let _rm4 = fixture.add_node(4, "h4:7894");
    fixture.connect_all();

    let v1 = ClusterFixture::spec(1, &["h1:7894", "h2:7894"], 0);
    let rx1 = fixture.request(rm1, &v1);
    let rx2 = fixture.request(rm2, &v1);
    assert_eq!(ClusterFixture::await_goal(rx1), Ok(()));
    assert_eq!(ClusterFixture::await_goal(rx2), Ok(()));
    fixture.wait_version(rm1, 1);
    fixture.wait_version(rm2, 1);

    // Two operators race goals with the same version but different
    // membership. The first in wins; the second is absorbed as
    // already-in-progress, without error.
    let goal_a = ClusterFixture::spec(2, &["h1:7894", "h2:7894", "h3:7894"], 1);
    let goal_b = ClusterFixture::spec(2, &["h1:7894", "h2:7894", "h4:7894"], 1);
    let rx_a = fixture.request(rm1, &goal_a);
    let rx_b = fixture.request(rm1, &goal_b);

    assert_eq!(ClusterFixture::await_goal(rx_a), Ok(()));
    assert_eq!(ClusterFixture::await_goal(rx_b), Ok(()));

    let topology = fixture.wait_version(rm1, 2);
    assert_eq!(
        topology.hosts,
        vec![
            "h1:7894".to_string(),
            "h2:7894".to_string(),
            "h3:7894".to_string()
        ],
        "the first goal's membership was applied"
    );
    assert!(topology.rms.contains(&rm3));
    fixture.assert_observations_monotone();
}
