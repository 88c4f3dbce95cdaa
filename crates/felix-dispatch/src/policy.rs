// Variable decisions of a dispatcher, injected as a strategy.
use ahash::RandomState;
use felix_storage::{Entry, Position, SkipPredicate};
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::redelivery::RedeliveryMode;

/// Stateful filter over replay candidates: `(position, sticky_key_hash) -> keep`.
pub type ReplayFilter = Box<dyn FnMut(Position, Option<u32>) -> bool + Send>;

/// Hooks the read loop consults. The loop itself never changes between policies.
pub trait DispatchPolicy: Send + Sync + fmt::Debug {
    fn is_normal_read_allowed(&self) -> bool {
        true
    }

    /// Called when a normal read was vetoed by [`DispatchPolicy::is_normal_read_allowed`].
    fn on_normal_read_not_allowed(&self) {}

    fn can_replay_messages(&self) -> bool {
        true
    }

    /// Hard cap on entries per normal read.
    fn max_entries_read_limit(&self) -> usize {
        usize::MAX
    }

    /// Fresh filter for one replay selection pass.
    fn replay_filter(&self) -> ReplayFilter {
        Box::new(|_, _| true)
    }

    fn sticky_key_hash(&self, _entry: &Entry) -> Option<u32> {
        None
    }

    /// Positions normal reads should step over.
    fn normal_read_skip(&self) -> Option<SkipPredicate> {
        None
    }

    fn redelivery_mode(&self) -> RedeliveryMode {
        RedeliveryMode::Ordered
    }
}

/// Every consumer may take any message.
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedPolicy;

impl DispatchPolicy for SharedPolicy {}

/// Sticky-key dispatch: replay keeps per-key order and can hold back whole keys.
#[derive(Debug, Default, Clone)]
pub struct KeyedPolicy {
    blocked: Arc<Mutex<HashSet<u32, RandomState>>>,
}

impl KeyedPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds back every pending redelivery with this hash until unblocked.
    pub fn block_hash(&self, hash: u32) {
        self.blocked.lock().insert(hash);
    }

    pub fn unblock_hash(&self, hash: u32) -> bool {
        self.blocked.lock().remove(&hash)
    }

    pub fn is_blocked(&self, hash: u32) -> bool {
        self.blocked.lock().contains(&hash)
    }
}

impl DispatchPolicy for KeyedPolicy {
    fn replay_filter(&self) -> ReplayFilter {
        let blocked = self.blocked.lock().clone();
        Box::new(move |_, hash| hash.is_none_or(|hash| !blocked.contains(&hash)))
    }

    fn sticky_key_hash(&self, entry: &Entry) -> Option<u32> {
        entry.metadata().sticky_key_hash
    }

    fn redelivery_mode(&self) -> RedeliveryMode {
        RedeliveryMode::Keyed
    }
}
