//! Shards variables across managers and aggregates the quiesce barrier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::config::Timing;
use crate::core::VarUuid;
use crate::engine::var::{Var, VarError};
use crate::engine::varmgr::{ShardMsg, VarManager};
use crate::net::manager::TopologySubscriber;
use crate::store::VarStore;
use crate::topology::change::{SubscriberKind, TopologyChange};

struct Shard {
    tx: Sender<ShardMsg>,
    join: Option<JoinHandle<()>>,
}

pub struct VarDispatcher {
    shards: Vec<Shard>,
}

impl VarDispatcher {
    pub fn spawn(count: u8, store: Arc<dyn VarStore>, timing: Timing) -> Arc<Self> {
        assert!(count > 0, "var dispatcher needs at least one shard");
        let mut shards = Vec::with_capacity(count as usize);
        for shard in 0..count as usize {
            let (tx, rx) = unbounded();
            let manager = VarManager::new(shard, Arc::clone(&store), tx.clone(), timing);
            let join = std::thread::Builder::new()
                .name(format!("var-shard-{shard}"))
                .spawn(move || run_shard(manager, rx))
                .expect("spawn var shard");
            shards.push(Shard {
                tx,
                join: Some(join),
            });
        }
        Arc::new(VarDispatcher { shards })
    }

    fn shard_for(&self, uuid: &VarUuid) -> &Shard {
        let idx = uuid.shard_byte() as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Runs `fun` against the variable on its owning shard's thread.
    pub fn apply_to_var(
        &self,
        uuid: VarUuid,
        create_if_missing: bool,
        fun: Box<dyn FnOnce(Result<&mut Var, VarError>) + Send>,
    ) {
        let _ = self.shard_for(&uuid).tx.send(ShardMsg::Apply(Box::new(
            move |manager: &mut VarManager| {
                manager.apply_to_var(uuid, create_if_missing, fun);
            },
        )));
    }

    /// Arms the quiesce barrier on every shard; `on_done` fires once,
    /// when the last shard reports all variables idle.
    pub fn force_to_idle(&self, on_done: Box<dyn FnOnce() + Send>) {
        let outstanding = Arc::new(AtomicUsize::new(self.shards.len()));
        let on_done = Arc::new(std::sync::Mutex::new(Some(on_done)));
        for shard in &self.shards {
            let outstanding = Arc::clone(&outstanding);
            let on_done = Arc::clone(&on_done);
            let _ = shard.tx.send(ShardMsg::Apply(Box::new(
                move |manager: &mut VarManager| {
                    manager.force_to_idle(Box::new(move || {
                        if outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                            let fun = on_done
                                .lock()
                                .expect("barrier callback lock")
                                .take()
                                .expect("barrier fired twice");
                            fun();
                        }
                    }));
                },
            )));
        }
    }

    pub fn shutdown(&self) {
        for shard in &self.shards {
            let _ = shard.tx.send(ShardMsg::Shutdown);
        }
    }
}

impl Drop for VarDispatcher {
    fn drop(&mut self) {
        for shard in &mut self.shards {
            let _ = shard.tx.send(ShardMsg::Shutdown);
            if let Some(join) = shard.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl TopologySubscriber for VarDispatcher {
    fn topology_changed(&self, change: &Arc<TopologyChange>) {
        for shard in &self.shards {
            change.add_one(SubscriberKind::Var);
            let change = Arc::clone(change);
            let _ = shard.tx.send(ShardMsg::Apply(Box::new(
                move |manager: &mut VarManager| {
                    manager.topology_changed(Arc::clone(change.topology()));
                    change.done(SubscriberKind::Var);
                },
            )));
        }
        // Balance the add_one the delivery itself performed.
        change.done(SubscriberKind::Var);
    }
}

fn run_shard(mut manager: VarManager, rx: Receiver<ShardMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            ShardMsg::Apply(fun) => fun(&mut manager),
            ShardMsg::Beat { keep_running } => {
                let keep = manager.beat();
                let _ = keep_running.send(keep);
            }
            ShardMsg::Shutdown => break,
        }
    }
    debug!("var shard stopped");
}

/// Convenience wrapper mirroring `apply_to_var` but waiting for the
/// closure to run; used where the caller needs the result inline.
pub fn apply_to_var_sync<T: Send + 'static>(
    dispatcher: &VarDispatcher,
    uuid: VarUuid,
    create_if_missing: bool,
    fun: impl FnOnce(Result<&mut Var, VarError>) -> T + Send + 'static,
) -> Option<T> {
    let (tx, rx) = crossbeam::channel::bounded(1);
    dispatcher.apply_to_var(
        uuid,
        create_if_missing,
        Box::new(move |res| {
            let _ = tx.send(fun(res));
        }),
    );
    rx.recv().ok()
}

#[allow(dead_code)]
fn _assert_traits(dispatcher: Arc<VarDispatcher>) -> Arc<dyn TopologySubscriber> {
    dispatcher
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use bytes::Bytes;

    use crate::core::{Positions, RmId, TxnId};
    use crate::store::MemStore;

    #[test]
    fn vars_route_to_stable_shards() {
        let store = Arc::new(MemStore::new());
        let dispatcher = VarDispatcher::spawn(4, store, Timing::default());

        let uuid = VarUuid([9u8; 16]);
        let created = apply_to_var_sync(&dispatcher, uuid, true, |res| {
            let var = res.expect("created");
            var.apply_write(
                TxnId::new(1, RmId(1), 1),
                Bytes::from_static(b"a"),
                Vec::new(),
                Some(Positions::new(vec![0])),
            )
            .unwrap();
            true
        });
        assert_eq!(created, Some(true));

        let value = apply_to_var_sync(&dispatcher, uuid, false, |res| {
            res.expect("found").value().clone()
        });
        assert_eq!(value, Some(Bytes::from_static(b"a")));
    }

    #[test]
    fn cluster_barrier_waits_for_every_shard() {
        let store = Arc::new(MemStore::new());
        let dispatcher = VarDispatcher::spawn(2, store, Timing::default());

        // Hold one var busy on some shard.
        let uuid = VarUuid([1u8; 16]);
        apply_to_var_sync(&dispatcher, uuid, true, |res| {
            res.expect("created").begin_txn();
        });

        let fired = Arc::new(AtomicBool::new(false));
        let fired_in_cb = Arc::clone(&fired);
        dispatcher.force_to_idle(Box::new(move || {
            fired_in_cb.store(true, Ordering::SeqCst);
        }));

        // The busy shard holds the barrier open.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!fired.load(Ordering::SeqCst));

        apply_to_var_sync(&dispatcher, uuid, false, |res| {
            res.expect("found").end_txn();
        });
        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::SeqCst));
    }
}
