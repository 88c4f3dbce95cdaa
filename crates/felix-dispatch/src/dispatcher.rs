// Per-subscription dispatcher.
// Pulls entries from a managed cursor and spreads them over competing consumers,
// replaying redeliveries first and honoring consumer permits, unacked limits,
// dispatch rate limits and scheduled delivery times.
//
// All mutable state sits behind one lock. Every state transition happens while
// it is held; cursor reads and timers complete on other tasks and re-enter
// through the lock. Cross-cutting flags that are read on hot paths without the
// lock are atomics.
use ahash::RandomState;
use felix_storage::{ManagedCursor, Position};
use futures::future::BoxFuture;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::assignor::ChunkAwareAssignor;
use crate::backoff::Backoff;
use crate::config::DispatcherConfig;
use crate::consumer::{Consumer, ConsumerId};
use crate::delayed::{DelayedDeliveryTracker, DelayedDeliveryTrackerFactory, InMemoryTrackerFactory};
use crate::executor::OrderedExecutor;
use crate::policy::{DispatchPolicy, SharedPolicy};
use crate::rate_limit::DispatchRateLimiter;
use crate::redelivery::{RedeliveryCounts, RedeliveryTracker};

mod read;
mod send;
#[cfg(test)]
mod tests;

pub use send::max_entries_in_this_batch;

// Compare-and-swap attempts on the ack-persistence pause flag before giving up.
const MAX_PAUSE_FLAG_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadKind {
    Normal,
    Replay,
}

impl ReadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadKind::Normal => "normal",
            ReadKind::Replay => "replay",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("subscription {subscription} reached the max consumers limit ({limit})")]
    ConsumerBusy { subscription: String, limit: usize },
}

struct DispatcherState {
    // Sorted by priority level, stable within a level.
    consumers: Vec<Arc<dyn Consumer>>,
    consumer_ids: HashSet<ConsumerId, RandomState>,
    round_robin_index: usize,
    total_available_permits: i64,
    have_pending_read: bool,
    have_pending_replay_read: bool,
    should_rewind_before_reading: bool,
    send_in_progress: bool,
    read_batch_size: usize,
    read_failure_backoff: Backoff,
    retry_backoff: Backoff,
    redelivery: RedeliveryTracker,
    redelivery_counts: RedeliveryCounts,
    delayed: Option<Box<dyn DelayedDeliveryTracker>>,
    delayed_wakeup: Option<tokio::time::Instant>,
    assignor: ChunkAwareAssignor,
    // `None` until a disconnect-all is requested.
    close_waiters: Option<Vec<oneshot::Sender<()>>>,
    last_mark_delete: Option<Position>,
    last_entries_processed: usize,
    skip_next_backoff: bool,
    read_more_calls: u64,
    max_read_position: Option<Position>,
}

struct Inner {
    name: String,
    cursor: Arc<dyn ManagedCursor>,
    config: DispatcherConfig,
    policy: Arc<dyn DispatchPolicy>,
    rate_limiter: Option<Arc<dyn DispatchRateLimiter>>,
    delayed_factory: Arc<dyn DelayedDeliveryTrackerFactory>,
    executor: OrderedExecutor,
    state: Mutex<DispatcherState>,
    closed: AtomicBool,
    transferring: AtomicBool,
    read_more_requested: AtomicBool,
    reschedule_in_progress: AtomicBool,
    blocked_on_unacked: AtomicBool,
    blocked_on_ack_persist: AtomicBool,
    total_unacked: AtomicI64,
    weak: Weak<Inner>,
}

/// Handle to a subscription dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

pub struct DispatcherBuilder {
    name: String,
    cursor: Arc<dyn ManagedCursor>,
    config: DispatcherConfig,
    policy: Arc<dyn DispatchPolicy>,
    rate_limiter: Option<Arc<dyn DispatchRateLimiter>>,
    delayed_factory: Option<Arc<dyn DelayedDeliveryTrackerFactory>>,
}

impl DispatcherBuilder {
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn DispatchPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<dyn DispatchRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn delayed_tracker_factory(mut self, factory: Arc<dyn DelayedDeliveryTrackerFactory>) -> Self {
        self.delayed_factory = Some(factory);
        self
    }

    /// Must be called from inside a Tokio runtime.
    pub fn build(self) -> Dispatcher {
        let config = self.config;
        let delayed_factory = self.delayed_factory.unwrap_or_else(|| {
            Arc::new(InMemoryTrackerFactory::new(config.delayed_delivery_tick()))
        });
        let (failure_initial, failure_max) = config.read_failure_backoff();
        let (retry_initial, retry_max) = config.retry_backoff();
        let state = DispatcherState {
            consumers: Vec::new(),
            consumer_ids: HashSet::with_hasher(RandomState::new()),
            round_robin_index: 0,
            total_available_permits: 0,
            have_pending_read: false,
            have_pending_replay_read: false,
            should_rewind_before_reading: false,
            send_in_progress: false,
            read_batch_size: config.max_read_batch_size,
            read_failure_backoff: Backoff::new(failure_initial, failure_max),
            retry_backoff: Backoff::new(retry_initial, retry_max),
            redelivery: RedeliveryTracker::new(self.policy.redelivery_mode()),
            redelivery_counts: RedeliveryCounts::default(),
            delayed: None,
            delayed_wakeup: None,
            assignor: ChunkAwareAssignor::new(),
            close_waiters: None,
            last_mark_delete: None,
            last_entries_processed: 0,
            skip_next_backoff: false,
            read_more_calls: 0,
            max_read_position: None,
        };
        let executor = OrderedExecutor::spawn(format!("dispatch-{}", self.name));
        tracing::info!(subscription = %self.name, cursor = self.cursor.name(), "dispatcher created");
        let inner = Arc::new_cyclic(|weak| Inner {
            name: self.name,
            cursor: self.cursor,
            config,
            policy: self.policy,
            rate_limiter: self.rate_limiter,
            delayed_factory,
            executor,
            state: Mutex::new(state),
            closed: AtomicBool::new(false),
            transferring: AtomicBool::new(false),
            read_more_requested: AtomicBool::new(false),
            reschedule_in_progress: AtomicBool::new(false),
            blocked_on_unacked: AtomicBool::new(false),
            blocked_on_ack_persist: AtomicBool::new(false),
            total_unacked: AtomicI64::new(0),
            weak: weak.clone(),
        });
        Dispatcher { inner }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn builder(name: impl Into<String>, cursor: Arc<dyn ManagedCursor>) -> DispatcherBuilder {
        DispatcherBuilder {
            name: name.into(),
            cursor,
            config: DispatcherConfig::default(),
            policy: Arc::new(SharedPolicy),
            rate_limiter: None,
            delayed_factory: None,
        }
    }

    pub fn new(name: impl Into<String>, cursor: Arc<dyn ManagedCursor>, config: DispatcherConfig) -> Self {
        Self::builder(name, cursor).config(config).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Attaches a consumer. Attaching to a closed dispatcher disconnects the consumer
    /// and still succeeds.
    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<(), DispatchError> {
        self.inner.add_consumer(consumer)
    }

    /// Detaches a consumer; its unacknowledged messages go back to redelivery.
    pub fn remove_consumer(&self, consumer: &dyn Consumer) {
        self.inner.remove_consumer(consumer);
    }

    /// Credits `permits` more messages to a consumer and asks for a read.
    pub fn consumer_flow(&self, consumer: ConsumerId, permits: u32) {
        self.inner.consumer_flow(consumer, permits);
    }

    /// Requests a read pass on the subscription executor. Concurrent requests
    /// coalesce into one.
    pub fn read_more_entries_async(&self) {
        self.inner.read_more_entries_async();
    }

    /// Runs a read pass on the caller's task.
    pub fn read_more_entries(&self) {
        self.inner.read_more_entries();
    }

    /// Queues every pending ack of `consumer` for redelivery.
    pub fn redeliver_unacknowledged(&self, consumer: &dyn Consumer) {
        self.inner.redeliver_unacknowledged(consumer);
    }

    /// Queues specific positions of `consumer` for redelivery.
    pub fn redeliver_positions(&self, consumer: &dyn Consumer, positions: &[Position]) {
        self.inner.redeliver_positions(consumer, positions);
    }

    /// Adjusts the subscription-wide unacked count; negative deltas release.
    pub fn add_unacked_messages(&self, delta: i64) {
        self.inner.add_unacked_messages(delta);
    }

    /// Called after the cursor persisted (or failed to persist) acknowledgements.
    pub fn after_ack_messages(&self, error: Option<&felix_storage::CursorError>) {
        self.inner.after_ack_messages(error);
    }

    /// Clears the ack-persistence pause when it no longer applies. Returns true when
    /// normal reads may proceed.
    pub fn check_and_resume_if_paused(&self) -> bool {
        self.inner.check_and_resume_if_paused()
    }

    /// Closes the dispatcher. With `disconnect_consumers` the returned future
    /// resolves once every consumer has been removed.
    pub fn close(&self, disconnect_consumers: bool) -> BoxFuture<'static, ()> {
        self.inner.close(disconnect_consumers)
    }

    pub fn disconnect_all_consumers(&self) -> BoxFuture<'static, ()> {
        self.inner.disconnect_all_consumers()
    }

    /// Reopens a closed dispatcher.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.close_waiters = None;
        self.inner.closed.store(false, Ordering::Release);
        tracing::debug!(subscription = %self.inner.name, "dispatcher reset");
    }

    /// Kicks a read when nothing moved since the last probe even though there is
    /// backlog and an available consumer. Returns true when a read was kicked.
    pub fn check_and_unblock_if_stuck(&self) -> bool {
        self.inner.check_and_unblock_if_stuck()
    }

    pub fn clear_delayed_messages(&self) {
        if !self.inner.config.delayed_delivery_enabled {
            return;
        }
        if let Some(tracker) = self.inner.state.lock().delayed.as_mut() {
            tracker.clear();
        }
    }

    /// Marks a handoff of the topic to another owner; reads pause meanwhile.
    pub fn set_transferring(&self, transferring: bool) {
        self.inner.transferring.store(transferring, Ordering::Release);
        if !transferring {
            self.inner.read_more_entries_async();
        }
    }

    /// Normal reads never go past this position.
    pub fn set_max_read_position(&self, position: Option<Position>) {
        self.inner.state.lock().max_read_position = position;
    }

    pub fn consumers(&self) -> Vec<Arc<dyn Consumer>> {
        self.inner.state.lock().consumers.clone()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.state.lock().consumers.len()
    }

    pub fn is_consumer_connected(&self) -> bool {
        !self.inner.state.lock().consumers.is_empty()
    }

    /// True when at least one consumer can take writes right now.
    pub fn is_consumer_writable(&self) -> bool {
        self.inner
            .state
            .lock()
            .consumers
            .iter()
            .any(|consumer| consumer.is_writable())
    }

    /// A consumer may unsubscribe only when it is the sole consumer.
    pub fn can_unsubscribe(&self, consumer: ConsumerId) -> bool {
        let state = self.inner.state.lock();
        state.consumers.len() == 1 && state.consumer_ids.contains(&consumer)
    }

    pub fn total_available_permits(&self) -> i64 {
        self.inner.state.lock().total_available_permits
    }

    pub fn read_batch_size(&self) -> usize {
        self.inner.state.lock().read_batch_size
    }

    pub fn is_have_pending_read(&self) -> bool {
        self.inner.state.lock().have_pending_read
    }

    pub fn is_have_pending_replay_read(&self) -> bool {
        self.inner.state.lock().have_pending_replay_read
    }

    pub fn number_of_messages_in_replay(&self) -> usize {
        self.inner.state.lock().redelivery.len()
    }

    pub fn messages_to_replay(&self) -> Vec<Position> {
        self.inner.state.lock().redelivery.positions().collect()
    }

    pub fn redelivery_count(&self, position: Position) -> u32 {
        self.inner.state.lock().redelivery_counts.get(position)
    }

    pub fn number_of_delayed_messages(&self) -> u64 {
        self.inner
            .state
            .lock()
            .delayed
            .as_ref()
            .map_or(0, |tracker| tracker.number_of_delayed_messages())
    }

    pub fn delayed_tracker_memory_usage(&self) -> u64 {
        self.inner
            .state
            .lock()
            .delayed
            .as_ref()
            .map_or(0, |tracker| tracker.buffer_memory_usage())
    }

    pub fn total_unacked_messages(&self) -> i64 {
        self.inner.total_unacked.load(Ordering::Acquire)
    }

    pub fn is_blocked_on_unacked_messages(&self) -> bool {
        self.inner.blocked_on_unacked.load(Ordering::Acquire)
    }

    pub fn is_blocked_on_ack_persistence(&self) -> bool {
        self.inner.blocked_on_ack_persist.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn read_more_entries_calls(&self) -> u64 {
        self.inner.state.lock().read_more_calls
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // Runs `task` on the subscription executor, optionally after `delay`.
    fn run_later<F>(&self, delay: Option<Duration>, task: F)
    where
        F: FnOnce(&Inner) + Send + 'static,
    {
        let weak = self.weak.clone();
        let job = move || {
            if let Some(inner) = weak.upgrade() {
                task(&inner);
            }
        };
        match delay {
            Some(delay) if !delay.is_zero() => self.executor.schedule(delay, job),
            _ => {
                if !self.executor.execute(job) {
                    tracing::warn!(subscription = %self.name, "subscription executor stopped");
                }
            }
        }
    }

    fn is_consumer_available(consumer: &Arc<dyn Consumer>) -> bool {
        consumer.is_connected() && !consumer.is_blocked() && consumer.available_permits() > 0
    }

    fn first_available_consumer_permits(&self, state: &DispatcherState) -> i64 {
        if self.is_closed() {
            return 0;
        }
        state
            .consumers
            .iter()
            .find(|consumer| Self::is_consumer_available(consumer))
            .map_or(0, |consumer| consumer.available_permits())
    }

    // Round-robin within the lowest priority level that has an available consumer.
    fn next_consumer(&self, state: &mut DispatcherState) -> Option<Arc<dyn Consumer>> {
        if self.is_closed() || state.consumers.is_empty() {
            return None;
        }
        let count = state.consumers.len();
        if state.round_robin_index >= count {
            state.round_robin_index = 0;
        }
        let mut level_start = 0;
        while level_start < count {
            let level = state.consumers[level_start].priority_level();
            let level_end = state.consumers[level_start..]
                .iter()
                .position(|consumer| consumer.priority_level() != level)
                .map_or(count, |offset| level_start + offset);
            let width = level_end - level_start;
            let start = if (level_start..level_end).contains(&state.round_robin_index) {
                state.round_robin_index - level_start
            } else {
                0
            };
            for step in 0..width {
                let idx = level_start + (start + step) % width;
                if Self::is_consumer_available(&state.consumers[idx]) {
                    state.round_robin_index = idx + 1;
                    return Some(Arc::clone(&state.consumers[idx]));
                }
            }
            level_start = level_end;
        }
        None
    }

    fn is_above_mark_delete(&self, position: Position) -> bool {
        self.cursor
            .mark_deleted_position()
            .is_none_or(|mark_delete| position > mark_delete)
    }

    fn add_message_to_replay(
        &self,
        state: &mut DispatcherState,
        position: Position,
        sticky_key_hash: Option<u32>,
    ) -> bool {
        if !self.is_above_mark_delete(position) {
            return false;
        }
        state.redelivery.add(position, sticky_key_hash);
        true
    }

    fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<(), DispatchError> {
        if self.is_closed() {
            tracing::warn!(
                subscription = %self.name,
                consumer = consumer.name(),
                "dispatcher closed, disconnecting consumer"
            );
            consumer.disconnect();
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.consumers.is_empty() {
            if state.have_pending_read || state.have_pending_replay_read {
                // Rewind once the in-flight read lands.
                state.should_rewind_before_reading = true;
            } else {
                self.cursor.rewind();
                metrics::counter!("felix_dispatch_rewinds_total").increment(1);
                state.should_rewind_before_reading = false;
            }
            state.redelivery.clear();
            if let Some(tracker) = state.delayed.as_mut() {
                if !tracker.is_durable() {
                    tracker.clear();
                }
            }
        }
        let limit = self.config.max_consumers_per_subscription;
        if limit > 0 && state.consumers.len() >= limit {
            tracing::warn!(
                subscription = %self.name,
                consumer = consumer.name(),
                limit,
                "max consumers per subscription reached"
            );
            return Err(DispatchError::ConsumerBusy {
                subscription: self.name.clone(),
                limit,
            });
        }
        if state.consumer_ids.contains(&consumer.id()) {
            tracing::warn!(subscription = %self.name, consumer = consumer.name(), "consumer already attached");
        }
        let needs_sort = state
            .consumers
            .last()
            .is_some_and(|last| consumer.priority_level() < last.priority_level());
        state.consumer_ids.insert(consumer.id());
        tracing::info!(
            subscription = %self.name,
            consumer = consumer.name(),
            priority = consumer.priority_level(),
            "consumer added"
        );
        state.consumers.push(consumer);
        if needs_sort {
            state.consumers.sort_by_key(|consumer| consumer.priority_level());
        }
        Ok(())
    }

    fn remove_consumer(&self, consumer: &dyn Consumer) {
        let unacked = i64::try_from(consumer.unacked_messages()).unwrap_or(i64::MAX);
        self.add_unacked_messages(-unacked);
        let id = consumer.id();
        let mut state = self.state.lock();
        if state.consumer_ids.remove(&id) {
            state.consumers.retain(|existing| existing.id() != id);
            state.assignor.remove_consumer(id);
            let pending = consumer.pending_acks();
            tracing::info!(
                subscription = %self.name,
                consumer = consumer.name(),
                pending_acks = pending.len(),
                "consumer removed"
            );
            if state.consumers.is_empty() {
                self.clear_components_after_removed_all_consumers(&mut state);
            } else {
                let mut added = false;
                for ack in pending {
                    added |= self.add_message_to_replay(&mut state, ack.position, ack.sticky_key_hash);
                }
                state.total_available_permits -= consumer.available_permits().max(0);
                if added {
                    metrics::gauge!("felix_dispatch_redelivery_pending").set(state.redelivery.len() as f64);
                    drop(state);
                    self.read_more_entries_async();
                }
            }
        } else {
            tracing::error!(
                subscription = %self.name,
                consumer = consumer.name(),
                "trying to remove a consumer that is not attached"
            );
            state.consumers.retain(|existing| existing.id() != id);
            if state.consumers.is_empty() {
                self.clear_components_after_removed_all_consumers(&mut state);
            }
        }
    }

    fn clear_components_after_removed_all_consumers(&self, state: &mut DispatcherState) {
        self.cancel_pending_read(state);
        state.redelivery.clear();
        state.redelivery_counts.clear();
        state.assignor.clear();
        state.total_available_permits = 0;
        state.round_robin_index = 0;
        if let Some(waiters) = state.close_waiters.as_mut() {
            for waiter in waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
        metrics::gauge!("felix_dispatch_redelivery_pending").set(0.0);
    }

    fn cancel_pending_read(&self, state: &mut DispatcherState) {
        if state.have_pending_read && self.cursor.cancel_pending_read() {
            state.have_pending_read = false;
        }
    }

    fn consumer_flow(&self, consumer: ConsumerId, permits: u32) {
        {
            let mut state = self.state.lock();
            if !state.consumer_ids.contains(&consumer) {
                tracing::debug!(subscription = %self.name, consumer, "flow from unknown consumer ignored");
                return;
            }
            state.total_available_permits += i64::from(permits);
            tracing::debug!(
                subscription = %self.name,
                consumer,
                permits,
                total = state.total_available_permits,
                "consumer flow"
            );
        }
        self.read_more_entries_async();
    }

    fn redeliver_unacknowledged(&self, consumer: &dyn Consumer) {
        let pending = consumer.pending_acks();
        let mut state = self.state.lock();
        let mut added = false;
        for ack in pending {
            if self.add_message_to_replay(&mut state, ack.position, ack.sticky_key_hash) {
                state.redelivery_counts.increment(ack.position);
                added = true;
            }
        }
        tracing::debug!(
            subscription = %self.name,
            consumer = consumer.name(),
            pending = state.redelivery.len(),
            "redelivering unacknowledged messages"
        );
        if added {
            drop(state);
            self.read_more_entries_async();
        }
    }

    fn redeliver_positions(&self, consumer: &dyn Consumer, positions: &[Position]) {
        let hashes: hashbrown::HashMap<Position, Option<u32>, RandomState> = consumer
            .pending_acks()
            .into_iter()
            .map(|ack| (ack.position, ack.sticky_key_hash))
            .collect();
        let mut state = self.state.lock();
        let mut added = false;
        for position in positions {
            let hash = hashes.get(position).copied().flatten();
            if self.add_message_to_replay(&mut state, *position, hash) {
                state.redelivery_counts.increment(*position);
                added = true;
            }
        }
        if added {
            drop(state);
            self.read_more_entries_async();
        }
    }

    fn add_unacked_messages(&self, delta: i64) {
        let max = i64::try_from(self.config.max_unacked_messages_per_subscription).unwrap_or(i64::MAX);
        if max <= 0
            && self.blocked_on_unacked.load(Ordering::Acquire)
            && self
                .blocked_on_unacked
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::info!(subscription = %self.name, "unacked limit disabled, unblocking dispatch");
            self.read_more_entries_async();
        }
        let unacked = self.total_unacked.fetch_add(delta, Ordering::AcqRel) + delta;
        if max > 0
            && unacked >= max
            && self
                .blocked_on_unacked
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::info!(subscription = %self.name, unacked, max, "dispatch blocked on unacked messages");
        } else if self.blocked_on_unacked.load(Ordering::Acquire)
            && unacked < max / 2
            && self
                .blocked_on_unacked
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::info!(subscription = %self.name, unacked, max, "dispatch unblocked");
            self.read_more_entries_async();
        }
    }

    fn should_pause_on_ack_state_persist(&self, kind: ReadKind) -> bool {
        kind == ReadKind::Normal
            && self.config.pause_on_ack_state_persistence
            && self.blocked_on_ack_persist.load(Ordering::Acquire)
    }

    fn after_ack_messages(&self, error: Option<&felix_storage::CursorError>) {
        if let Some(error) = error {
            tracing::debug!(subscription = %self.name, %error, "acknowledgement persistence failed");
        }
        for _ in 0..MAX_PAUSE_FLAG_ATTEMPTS {
            let unpaused = !self.blocked_on_ack_persist.load(Ordering::Acquire);
            let should_pause_now = !self.check_and_resume_if_paused();
            if !(unpaused && should_pause_now) {
                return;
            }
            if self
                .blocked_on_ack_persist
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::info!(subscription = %self.name, "normal reads paused until ack state is persistable");
                return;
            }
        }
        tracing::warn!(subscription = %self.name, "gave up updating ack persistence pause flag");
    }

    fn check_and_resume_if_paused(&self) -> bool {
        let mut should_pause = false;
        for _ in 0..MAX_PAUSE_FLAG_ATTEMPTS {
            let paused = self.blocked_on_ack_persist.load(Ordering::Acquire);
            if !paused && !self.config.pause_on_ack_state_persistence {
                return true;
            }
            should_pause = self.config.pause_on_ack_state_persistence
                && !self.cursor.is_data_fully_persistable();
            if paused == should_pause {
                return !should_pause;
            }
            if !paused {
                return false;
            }
            if self
                .blocked_on_ack_persist
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::info!(subscription = %self.name, "ack state persistable again, resuming reads");
                self.read_more_entries_async();
                return true;
            }
        }
        tracing::warn!(subscription = %self.name, "gave up resuming after conflicting flag updates");
        !should_pause
    }

    fn close(&self, disconnect_consumers: bool) -> BoxFuture<'static, ()> {
        self.closed.store(true, Ordering::Release);
        let tracker = self.state.lock().delayed.take();
        if let Some(mut tracker) = tracker {
            tracker.close();
        }
        if let Some(limiter) = self.rate_limiter.as_ref() {
            limiter.close();
        }
        tracing::info!(subscription = %self.name, disconnect_consumers, "dispatcher closed");
        if disconnect_consumers {
            self.disconnect_all_consumers()
        } else {
            Box::pin(futures::future::ready(()))
        }
    }

    fn disconnect_all_consumers(&self) -> BoxFuture<'static, ()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.consumers.is_empty() {
            let _ = tx.send(());
        } else {
            state.close_waiters.get_or_insert_with(Vec::new).push(tx);
            for consumer in state.consumers.clone() {
                consumer.disconnect();
            }
            self.cancel_pending_read(&mut state);
        }
        Box::pin(async move {
            let _ = rx.await;
        })
    }

    fn check_and_unblock_if_stuck(&self) -> bool {
        if self.cursor.check_and_update_read_position_changed() {
            return false;
        }
        let state = self.state.lock();
        let stuck = self.first_available_consumer_permits(&state) > 0
            && !state.have_pending_read
            && !state.have_pending_replay_read
            && self.cursor.entries_in_backlog() > 0;
        drop(state);
        if stuck {
            tracing::warn!(subscription = %self.name, "dispatch looks stuck, re-triggering read");
            self.read_more_entries_async();
        }
        stuck
    }
}
