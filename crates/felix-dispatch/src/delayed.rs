// Scheduled (delayed) delivery tracking.
// Due positions are handed back to the dispatcher, which funnels them through the
// redelivery set so the regular replay path delivers them.
use felix_storage::Position;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Heap slot: due time + position + heap overhead.
const BYTES_PER_DELAYED_MESSAGE: u64 = 32;

/// Wall-clock source in unix milliseconds.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_millis: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(now_millis),
        })
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, now_millis: u64) {
        self.now.store(now_millis, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

/// Holds messages whose delivery is scheduled for later.
pub trait DelayedDeliveryTracker: Send + fmt::Debug {
    /// Records a delayed message. Returns false when it is already due and should
    /// be delivered right away instead.
    fn add_message(&mut self, position: Position, deliver_at_millis: u64) -> bool;

    fn has_message_available(&self) -> bool;

    /// Removes and returns up to `max` due positions, earliest due time first.
    fn scheduled_messages(&mut self, max: usize) -> Vec<Position>;

    fn number_of_delayed_messages(&self) -> u64;

    fn buffer_memory_usage(&self) -> u64;

    /// When true the dispatcher stops reading altogether.
    fn should_pause_all_deliveries(&self) -> bool;

    /// How long until the next message becomes due, if any is pending.
    fn next_wakeup(&self) -> Option<Duration>;

    fn clear(&mut self);

    fn close(&mut self);

    /// Durable trackers keep their state when the consumer set empties.
    fn is_durable(&self) -> bool {
        false
    }
}

/// Creates a tracker the first time a subscription sees a delayed message.
pub trait DelayedDeliveryTrackerFactory: Send + Sync + fmt::Debug {
    fn create(&self, subscription: &str) -> Box<dyn DelayedDeliveryTracker>;
}

/// Heap-backed tracker that forgets everything on close.
#[derive(Debug)]
pub struct InMemoryDelayedDeliveryTracker {
    queue: BinaryHeap<Reverse<(u64, Position)>>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    // Pause once buffered metadata grows past this many bytes (0 = unbounded).
    memory_limit_bytes: u64,
    // Fixed-delay detection: pause when this many messages are pending and none is due.
    fixed_delay_lookahead: u64,
    highest_deliver_at: u64,
    messages_have_fixed_delay: bool,
}

impl InMemoryDelayedDeliveryTracker {
    pub fn new(clock: Arc<dyn Clock>, tick: Duration) -> Self {
        Self {
            queue: BinaryHeap::new(),
            clock,
            tick,
            memory_limit_bytes: 0,
            fixed_delay_lookahead: 0,
            highest_deliver_at: 0,
            messages_have_fixed_delay: true,
        }
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn with_fixed_delay_lookahead(mut self, lookahead: u64) -> Self {
        self.fixed_delay_lookahead = lookahead;
        self
    }

    fn check_fixed_delay(&mut self, deliver_at_millis: u64) {
        if self.fixed_delay_lookahead == 0 {
            return;
        }
        // Out-of-order due times mean delays are not fixed.
        if deliver_at_millis < self.highest_deliver_at {
            self.messages_have_fixed_delay = false;
        }
        self.highest_deliver_at = self.highest_deliver_at.max(deliver_at_millis);
    }
}

impl DelayedDeliveryTracker for InMemoryDelayedDeliveryTracker {
    fn add_message(&mut self, position: Position, deliver_at_millis: u64) -> bool {
        if deliver_at_millis <= self.clock.now_millis() {
            return false;
        }
        tracing::trace!(%position, deliver_at_millis, "track delayed message");
        self.queue.push(Reverse((deliver_at_millis, position)));
        self.check_fixed_delay(deliver_at_millis);
        true
    }

    fn has_message_available(&self) -> bool {
        self.queue
            .peek()
            .is_some_and(|Reverse((due, _))| *due <= self.clock.now_millis())
    }

    fn scheduled_messages(&mut self, max: usize) -> Vec<Position> {
        let now = self.clock.now_millis();
        let mut due = Vec::new();
        while due.len() < max {
            match self.queue.peek() {
                Some(Reverse((deliver_at, _))) if *deliver_at <= now => {}
                _ => break,
            }
            if let Some(Reverse((_, position))) = self.queue.pop() {
                due.push(position);
            }
        }
        if self.queue.is_empty() {
            self.messages_have_fixed_delay = true;
            self.highest_deliver_at = 0;
        }
        due
    }

    fn number_of_delayed_messages(&self) -> u64 {
        self.queue.len() as u64
    }

    fn buffer_memory_usage(&self) -> u64 {
        self.queue.len() as u64 * BYTES_PER_DELAYED_MESSAGE
    }

    fn should_pause_all_deliveries(&self) -> bool {
        // Due messages still drain while the buffer is full.
        if self.memory_limit_bytes > 0
            && self.buffer_memory_usage() >= self.memory_limit_bytes
            && !self.has_message_available()
        {
            return true;
        }
        self.fixed_delay_lookahead > 0
            && self.messages_have_fixed_delay
            && self.number_of_delayed_messages() >= self.fixed_delay_lookahead
            && !self.has_message_available()
    }

    fn next_wakeup(&self) -> Option<Duration> {
        let Reverse((due, _)) = self.queue.peek()?;
        let delay = due.saturating_sub(self.clock.now_millis());
        if delay == 0 {
            return Some(Duration::ZERO);
        }
        Some(Duration::from_millis(delay).max(self.tick))
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.messages_have_fixed_delay = true;
        self.highest_deliver_at = 0;
    }

    fn close(&mut self) {
        self.clear();
    }
}

/// Factory for [`InMemoryDelayedDeliveryTracker`].
#[derive(Debug, Clone)]
pub struct InMemoryTrackerFactory {
    clock: Arc<dyn Clock>,
    tick: Duration,
    memory_limit_bytes: u64,
    fixed_delay_lookahead: u64,
}

impl InMemoryTrackerFactory {
    pub fn new(tick: Duration) -> Self {
        Self::with_clock(Arc::new(SystemClock), tick)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, tick: Duration) -> Self {
        Self {
            clock,
            tick,
            memory_limit_bytes: 0,
            fixed_delay_lookahead: 0,
        }
    }

    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn fixed_delay_lookahead(mut self, lookahead: u64) -> Self {
        self.fixed_delay_lookahead = lookahead;
        self
    }
}

impl DelayedDeliveryTrackerFactory for InMemoryTrackerFactory {
    fn create(&self, subscription: &str) -> Box<dyn DelayedDeliveryTracker> {
        tracing::debug!(subscription, "create in-memory delayed delivery tracker");
        Box::new(
            InMemoryDelayedDeliveryTracker::new(Arc::clone(&self.clock), self.tick)
                .with_memory_limit(self.memory_limit_bytes)
                .with_fixed_delay_lookahead(self.fixed_delay_lookahead),
        )
    }
}
