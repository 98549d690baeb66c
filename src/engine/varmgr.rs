//! Per-shard variable manager.
//!
//! Owns the shard's set of active variables, delegates cold reads to the
//! store, runs the randomized idle beater, and answers the quiesce
//! barrier the topology machine arms before migration.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Sender;
use rand::Rng;
use tracing::debug;

use crate::config::Timing;
use crate::core::{Topology, VarUuid};
use crate::engine::var::{Var, VarError};
use crate::store::VarStore;

/// Work executed on the shard's own thread.
pub enum ShardMsg {
    Apply(Box<dyn FnOnce(&mut VarManager) + Send>),
    Beat { keep_running: Sender<bool> },
    Shutdown,
}

pub struct VarManager {
    shard: usize,
    store: Arc<dyn VarStore>,
    active: HashMap<VarUuid, Var>,
    callbacks: VecDeque<Box<dyn FnOnce() + Send>>,
    beater_live: bool,
    self_tx: Sender<ShardMsg>,
    timing: Timing,
    topology: Option<Arc<Topology>>,
    roll_allowed: bool,
    barrier: Option<Box<dyn FnOnce() + Send>>,
}

impl VarManager {
    pub fn new(
        shard: usize,
        store: Arc<dyn VarStore>,
        self_tx: Sender<ShardMsg>,
        timing: Timing,
    ) -> Self {
        VarManager {
            shard,
            store,
            active: HashMap::new(),
            callbacks: VecDeque::new(),
            beater_live: false,
            self_tx,
            timing,
            topology: None,
            roll_allowed: true,
            barrier: None,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn roll_allowed(&self) -> bool {
        self.roll_allowed
    }

    pub fn topology(&self) -> Option<&Arc<Topology>> {
        self.topology.as_ref()
    }

    pub fn topology_changed(&mut self, topology: Arc<Topology>) {
        self.roll_allowed = topology.roll_allowed();
        self.topology = Some(topology);
    }

    /// Loads (or creates) a variable and runs `fun` against it on this
    /// shard. Once `fun` returns, an idle variable is evicted from the
    /// active set.
    pub fn apply_to_var(
        &mut self,
        uuid: VarUuid,
        create_if_missing: bool,
        fun: impl FnOnce(Result<&mut Var, VarError>),
    ) {
        match self.find(uuid, create_if_missing) {
            Ok(()) => {
                let var = self
                    .active
                    .get_mut(&uuid)
                    .expect("find left the var active");
                fun(Ok(var));
                match self.active.get(&uuid) {
                    Some(var) if var.is_idle() => {
                        debug!(%uuid, shard = self.shard, "var now inactive");
                        self.active.remove(&uuid);
                    }
                    Some(_) => {}
                    None => panic!("{uuid} vanished from the active set while in use"),
                }
                self.check_barrier();
            }
            Err(err) => fun(Err(err)),
        }
    }

    fn find(&mut self, uuid: VarUuid, create_if_missing: bool) -> Result<(), VarError> {
        if self.active.contains_key(&uuid) {
            return Ok(());
        }
        match self.store.load(&uuid)? {
            Some(record) => {
                let var = Var::from_record(uuid, record, Arc::clone(&self.store));
                self.active.insert(uuid, var);
                Ok(())
            }
            None if create_if_missing => {
                debug!(%uuid, shard = self.shard, "new var");
                let var = Var::new_blank(uuid, Arc::clone(&self.store));
                self.active.insert(uuid, var);
                Ok(())
            }
            None => Err(VarError::NotFound(uuid)),
        }
    }

    /// Arms the shard's quiesce barrier: `on_done` fires exactly once,
    /// when every active variable has reached a no-in-flight, on-disk
    /// state. Arming a second barrier while one is outstanding is a bug.
    pub fn force_to_idle(&mut self, on_done: Box<dyn FnOnce() + Send>) {
        assert!(
            self.barrier.is_none(),
            "shard {} quiesce barrier armed twice",
            self.shard
        );
        self.barrier = Some(on_done);
        self.check_barrier();
    }

    fn check_barrier(&mut self) {
        if self.barrier.is_none() {
            return;
        }
        if self.active.values().all(Var::is_quiesced) {
            debug!(shard = self.shard, "quiesce barrier reached");
            let on_done = self.barrier.take().expect("barrier present");
            on_done();
        }
    }

    /// Queues a callback for the next idle beat, starting the beater if
    /// it is not already running.
    pub fn schedule_callback(&mut self, fun: Box<dyn FnOnce() + Send>) {
        self.callbacks.push_back(fun);
        if !self.beater_live {
            self.beater_live = true;
            let tx = self.self_tx.clone();
            let timing = self.timing;
            std::thread::Builder::new()
                .name(format!("var-beater-{}", self.shard))
                .spawn(move || beater(tx, timing))
                .expect("spawn beater");
        }
    }

    /// One beat: drains the callbacks queued so far, in FIFO order.
    /// Returns whether the beater should keep going.
    pub fn beat(&mut self) -> bool {
        let drained = std::mem::take(&mut self.callbacks);
        for fun in drained {
            fun();
        }
        self.check_barrier();
        if self.callbacks.is_empty() {
            self.beater_live = false;
            false
        } else {
            true
        }
    }
}

fn beater(tx: Sender<ShardMsg>, timing: Timing) {
    loop {
        let jitter = rand::rng().random_range(0..=timing.var_idle_timeout_range_ms);
        std::thread::sleep(Duration::from_millis(timing.var_idle_timeout_min_ms + jitter));
        let (keep_tx, keep_rx) = crossbeam::channel::bounded(1);
        if tx.send(ShardMsg::Beat { keep_running: keep_tx }).is_err() {
            return;
        }
        match keep_rx.recv() {
            Ok(true) => {}
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use bytes::Bytes;

    use crate::core::{Positions, RmId, TxnId};
    use crate::store::{MemStore, VarRecord};

    fn manager() -> (VarManager, crossbeam::channel::Receiver<ShardMsg>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        let store = Arc::new(MemStore::new());
        (VarManager::new(0, store, tx, Timing::default()), rx)
    }

    fn seeded_manager(uuids: &[VarUuid]) -> (VarManager, crossbeam::channel::Receiver<ShardMsg>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        let store = Arc::new(MemStore::new());
        for uuid in uuids {
            store
                .write(
                    uuid,
                    VarRecord {
                        positions: Positions::new(vec![0]),
                        value: Bytes::new(),
                        refs: Vec::new(),
                        write_txn: TxnId::new(1, RmId(1), 1),
                    },
                )
                .unwrap();
        }
        (VarManager::new(0, store, tx, Timing::default()), rx)
    }

    #[test]
    fn missing_var_without_create_is_not_found() {
        let (mut mgr, _rx) = manager();
        let mut outcome = None;
        mgr.apply_to_var(VarUuid([1u8; 16]), false, |res| {
            outcome = Some(res.is_err());
        });
        assert_eq!(outcome, Some(true));
    }

    #[test]
    fn idle_var_is_evicted_after_use() {
        let uuid = VarUuid([1u8; 16]);
        let (mut mgr, _rx) = seeded_manager(&[uuid]);
        mgr.apply_to_var(uuid, false, |res| {
            res.expect("loaded");
        });
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn busy_var_stays_active() {
        let uuid = VarUuid([1u8; 16]);
        let (mut mgr, _rx) = seeded_manager(&[uuid]);
        mgr.apply_to_var(uuid, false, |res| {
            res.expect("loaded").begin_txn();
        });
        assert_eq!(mgr.active_count(), 1);
        mgr.apply_to_var(uuid, false, |res| {
            res.expect("loaded").end_txn();
        });
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn barrier_fires_when_last_var_quiesces() {
        let uuid = VarUuid([1u8; 16]);
        let (mut mgr, _rx) = seeded_manager(&[uuid]);
        mgr.apply_to_var(uuid, false, |res| {
            res.expect("loaded").begin_txn();
        });

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        mgr.force_to_idle(Box::new(move || {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        mgr.apply_to_var(uuid, false, |res| {
            res.expect("loaded").end_txn();
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn barrier_fires_immediately_when_already_quiet() {
        let (mut mgr, _rx) = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        mgr.force_to_idle(Box::new(move || {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "armed twice")]
    fn double_barrier_is_a_bug() {
        let uuid = VarUuid([1u8; 16]);
        let (mut mgr, _rx) = seeded_manager(&[uuid]);
        mgr.apply_to_var(uuid, false, |res| {
            res.expect("loaded").begin_txn();
        });
        mgr.force_to_idle(Box::new(|| {}));
        mgr.force_to_idle(Box::new(|| {}));
    }

    #[test]
    fn beat_drains_callbacks_in_fifo_order() {
        let (mut mgr, rx) = manager();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            mgr.schedule_callback(Box::new(move || {
                order.lock().unwrap().push(n);
            }));
        }
        let keep = mgr.beat();
        assert!(!keep, "queue drained, beater should stop");
        assert_eq!(order.lock().unwrap().as_slice(), &[0, 1, 2]);

        // A beater thread was started; it will deliver at least one Beat
        // before giving up on the dropped manager.
        drop(rx);
    }
}
