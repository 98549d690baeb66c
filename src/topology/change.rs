//! Counted-acknowledgement delivery of topology changes.
//!
//! Each change enumerates the subscriber kinds that must acknowledge it.
//! A subscriber calls `add_one` on receipt and `done` when it has fully
//! absorbed the change; the completion callback fires exactly once, when
//! every acknowledgement has come back.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::Topology;

/// The fixed set of acknowledging subsystems.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriberKind {
    Var,
    Proposer,
    Acceptor,
    ConnectionManager,
}

pub const SUBSCRIBER_KIND_COUNT: usize = 4;

impl SubscriberKind {
    pub fn index(self) -> usize {
        match self {
            SubscriberKind::Var => 0,
            SubscriberKind::Proposer => 1,
            SubscriberKind::Acceptor => 2,
            SubscriberKind::ConnectionManager => 3,
        }
    }
}

pub struct TopologyChange {
    topology: Arc<Topology>,
    /// Outstanding acknowledgements plus one delivery hold, dropped by
    /// `release` once every subscriber has been notified.
    counter: AtomicIsize,
    /// Kinds whose acknowledgement the originator actually awaits.
    callbacks_for: [bool; SUBSCRIBER_KIND_COUNT],
    on_complete: Mutex<Option<Box<dyn FnOnce(Arc<Topology>) + Send>>>,
}

impl TopologyChange {
    pub fn new(
        topology: Arc<Topology>,
        callbacks_for: &[SubscriberKind],
        on_complete: Box<dyn FnOnce(Arc<Topology>) + Send>,
    ) -> Arc<Self> {
        let mut flags = [false; SUBSCRIBER_KIND_COUNT];
        for kind in callbacks_for {
            flags[kind.index()] = true;
        }
        Arc::new(TopologyChange {
            topology,
            counter: AtomicIsize::new(1),
            callbacks_for: flags,
            on_complete: Mutex::new(Some(on_complete)),
        })
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn has_callback_for(&self, kind: SubscriberKind) -> bool {
        self.callbacks_for[kind.index()]
    }

    pub fn add_one(&self, _kind: SubscriberKind) {
        let prev = self.counter.fetch_add(1, Ordering::AcqRel);
        assert!(prev > 0, "topology change acknowledged after completion");
    }

    pub fn done(&self, kind: SubscriberKind) {
        let prev = self.counter.fetch_sub(1, Ordering::AcqRel);
        assert!(
            prev > 0,
            "{kind:?} acknowledged a topology change more than once"
        );
        if prev == 1 {
            self.fire();
        }
    }

    /// Drops the delivery hold taken at construction. Call after every
    /// subscriber has been notified.
    pub fn release(&self) {
        let prev = self.counter.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "topology change released twice");
        if prev == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        let callback = self
            .on_complete
            .lock()
            .expect("topology change lock")
            .take();
        if let Some(callback) = callback {
            callback(Arc::clone(&self.topology));
        }
    }
}
