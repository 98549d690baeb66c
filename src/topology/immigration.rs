//! Immigration accounting: per-sender in-flight counters for migration
//! traffic.
//!
//! Batches from one sender are delivered in order, and the terminal
//! complete is delivered after the last batch; only the *application* of
//! a batch may still be outstanding when the complete arrives. Each
//! entry starts at one; batch receipt adds one, batch application and
//! the terminal complete each subtract one, so the zero crossing
//! happens exactly when every batch has been applied and the complete
//! has been seen.

use std::collections::BTreeMap;

use tracing::debug;

use crate::core::RmId;

#[derive(Default)]
pub struct ImmigrationLedger {
    entries: BTreeMap<(u32, RmId), i64>,
}

impl ImmigrationLedger {
    pub fn new() -> Self {
        ImmigrationLedger::default()
    }

    /// A migration batch arrived from `sender` for target `version`.
    pub fn batch_received(&mut self, version: u32, sender: RmId) {
        let counter = self.entries.entry((version, sender)).or_insert(1);
        *counter += 1;
    }

    /// The var dispatcher finished applying one of `sender`'s batches.
    /// Returns true when the entry reaches zero.
    pub fn batch_applied(&mut self, version: u32, sender: RmId) -> bool {
        self.adjust(version, sender)
    }

    /// `sender`'s terminal complete arrived. Returns true when the
    /// entry reaches zero.
    pub fn complete_received(&mut self, version: u32, sender: RmId) -> bool {
        self.adjust(version, sender)
    }

    fn adjust(&mut self, version: u32, sender: RmId) -> bool {
        let counter = self.entries.entry((version, sender)).or_insert(1);
        *counter -= 1;
        if *counter == 0 {
            debug!(version, %sender, "immigration from sender complete");
            self.entries.remove(&(version, sender));
            true
        } else {
            false
        }
    }

    pub fn outstanding(&self, version: u32) -> Vec<RmId> {
        self.entries
            .keys()
            .filter(|(held, _)| *held == version)
            .map(|(_, sender)| *sender)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V: u32 = 2;
    const SENDER: RmId = RmId(7);

    #[test]
    fn batches_then_applications_then_complete() {
        let mut ledger = ImmigrationLedger::new();
        ledger.batch_received(V, SENDER);
        ledger.batch_received(V, SENDER);
        assert!(!ledger.batch_applied(V, SENDER));
        assert!(!ledger.batch_applied(V, SENDER));
        assert!(ledger.complete_received(V, SENDER));
        assert!(ledger.outstanding(V).is_empty());
    }

    #[test]
    fn complete_may_overtake_the_last_application() {
        let mut ledger = ImmigrationLedger::new();
        ledger.batch_received(V, SENDER);
        assert!(!ledger.complete_received(V, SENDER));
        assert!(ledger.batch_applied(V, SENDER));
    }

    #[test]
    fn complete_with_no_batches_finishes_immediately() {
        // A sender holding nothing for us still sends its complete.
        let mut ledger = ImmigrationLedger::new();
        assert!(ledger.complete_received(V, SENDER));
    }

    #[test]
    fn senders_are_accounted_independently() {
        let mut ledger = ImmigrationLedger::new();
        let other = RmId(8);
        ledger.batch_received(V, SENDER);
        ledger.batch_received(V, other);
        assert_eq!(ledger.outstanding(V), vec![SENDER, other]);

        assert!(!ledger.batch_applied(V, SENDER));
        assert!(ledger.complete_received(V, SENDER));
        assert_eq!(ledger.outstanding(V), vec![other]);

        assert!(!ledger.batch_applied(V, other));
        assert!(ledger.complete_received(V, other));
        assert!(ledger.outstanding(V).is_empty());
    }

    #[test]
    fn versions_are_accounted_independently() {
        let mut ledger = ImmigrationLedger::new();
        ledger.batch_received(2, SENDER);
        ledger.batch_received(3, SENDER);
        assert!(!ledger.batch_applied(2, SENDER));
        assert!(ledger.complete_received(2, SENDER));
        assert_eq!(ledger.outstanding(3), vec![SENDER]);
    }
}
