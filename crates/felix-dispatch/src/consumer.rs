// Consumer sessions as seen by a dispatcher, plus a channel-backed implementation.
use bytes::Bytes;
use felix_storage::{Entry, Position};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use tokio::sync::mpsc;

pub type ConsumerId = u64;

// Weight of the newest sample in the messages-per-entry moving average.
const AVG_MESSAGES_PER_ENTRY_ALPHA: f64 = 1.0 / 8.0;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("consumer disconnected")]
    Disconnected,
    #[error("send failed: {0}")]
    Failed(String),
}

/// One sub-batch handed to a consumer.
#[derive(Debug, Default)]
pub struct SendBatch {
    pub entries: Vec<Entry>,
    // Messages per entry, parallel to `entries`.
    pub batch_sizes: Vec<u32>,
    // Redelivery count per entry, parallel to `entries`.
    pub redelivery_counts: Vec<u32>,
    pub total_messages: u32,
    pub total_bytes: u64,
    pub total_chunked: u32,
    // Batch indexes inside these entries that were already acknowledged.
    pub acked_indexes: u32,
}

impl SendBatch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.entries.iter().map(Entry::position).collect()
    }

    /// Permits this batch actually consumes.
    pub fn permits_used(&self) -> i64 {
        i64::from(self.total_messages) - i64::from(self.acked_indexes)
    }
}

/// A client session attached to a subscription.
///
/// Dispatchers only read these fields and call [`Consumer::send_messages`]; permit and
/// unacked bookkeeping belongs to the implementation. Methods are invoked while the
/// dispatcher holds its subscription lock and must not call back into it synchronously.
pub trait Consumer: Send + Sync + fmt::Debug {
    fn id(&self) -> ConsumerId;

    fn name(&self) -> &str;

    /// Lower levels are served first.
    fn priority_level(&self) -> i32;

    fn available_permits(&self) -> i64;

    /// False while the transport buffer is full.
    fn is_writable(&self) -> bool;

    /// Blocked consumers hit their unacked-message cap.
    fn is_blocked(&self) -> bool;

    fn is_connected(&self) -> bool;

    fn unacked_messages(&self) -> u64;

    /// 0 means unlimited.
    fn max_unacked_messages(&self) -> u32;

    fn avg_messages_per_entry(&self) -> f64;

    /// Consumers asking for precise flow control get reads sized by their batch ratio.
    fn precise_flow_control(&self) -> bool {
        false
    }

    /// Hands a batch to the session. Bookkeeping happens before this returns; the
    /// future resolves once the batch is written out.
    fn send_messages(&self, batch: SendBatch) -> BoxFuture<'static, Result<(), SendError>>;

    /// Entries delivered to this consumer and not acknowledged yet, in position order.
    fn pending_acks(&self) -> Vec<PendingAck>;

    /// Drops pending acks at or below `upto` and returns how many messages they held.
    fn trim_pending_acks(&self, upto: Position) -> u64;

    fn disconnect(&self);

    fn reached_end_of_topic(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    pub position: Position,
    pub sticky_key_hash: Option<u32>,
}

/// Per-entry delivery as it arrives on a [`ChannelConsumer`] receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub position: Position,
    pub payload: Bytes,
    pub num_messages: u32,
    pub redelivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Messages(Vec<Delivery>),
    EndOfTopic,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub priority_level: i32,
    pub max_unacked_messages: u32,
    pub precise_flow_control: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            priority_level: 0,
            max_unacked_messages: 0,
            precise_flow_control: false,
        }
    }
}

/// Consumer that forwards deliveries to an unbounded channel.
///
/// The receiving half plays the client: it grants permits with
/// [`ChannelConsumer::add_permits`] and acknowledges with [`ChannelConsumer::acknowledge`].
#[derive(Debug)]
pub struct ChannelConsumer {
    id: ConsumerId,
    name: String,
    options: ConsumerOptions,
    permits: AtomicI64,
    unacked: AtomicU64,
    writable: AtomicBool,
    connected: AtomicBool,
    // Cumulative counters, handy for flow-control assertions.
    granted: AtomicU64,
    delivered: AtomicU64,
    avg_messages_per_entry: Mutex<f64>,
    // Delivered, unacknowledged position -> (messages in the entry, sticky key hash).
    pending: Mutex<BTreeMap<Position, (u32, Option<u32>)>>,
    tx: mpsc::UnboundedSender<ConsumerEvent>,
}

impl ChannelConsumer {
    pub fn new(
        id: ConsumerId,
        name: impl Into<String>,
        options: ConsumerOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConsumerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = Arc::new(Self {
            id,
            name: name.into(),
            options,
            permits: AtomicI64::new(0),
            unacked: AtomicU64::new(0),
            writable: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            granted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            avg_messages_per_entry: Mutex::new(1.0),
            pending: Mutex::new(BTreeMap::new()),
            tx,
        });
        (consumer, rx)
    }

    pub fn add_permits(&self, permits: u32) {
        self.permits.fetch_add(i64::from(permits), Ordering::AcqRel);
        self.granted.fetch_add(u64::from(permits), Ordering::AcqRel);
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }

    /// Acknowledges delivered positions and returns how many messages that covered.
    pub fn acknowledge(&self, positions: &[Position]) -> u64 {
        let mut pending = self.pending.lock();
        let mut messages = 0u64;
        for position in positions {
            if let Some((count, _)) = pending.remove(position) {
                messages += u64::from(count);
            }
        }
        drop(pending);
        self.release_unacked(messages);
        messages
    }

    pub fn granted_permits(&self) -> u64 {
        self.granted.load(Ordering::Acquire)
    }

    pub fn delivered_messages(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    fn release_unacked(&self, messages: u64) {
        let _ = self
            .unacked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                Some(value.saturating_sub(messages))
            });
    }

    fn record_batch_ratio(&self, messages: u32, entries: usize) {
        if entries == 0 {
            return;
        }
        let sample = f64::from(messages) / entries as f64;
        let mut avg = self.avg_messages_per_entry.lock();
        *avg += (sample - *avg) * AVG_MESSAGES_PER_ENTRY_ALPHA;
        if *avg < 1.0 {
            *avg = 1.0;
        }
    }
}

impl Consumer for ChannelConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority_level(&self) -> i32 {
        self.options.priority_level
    }

    fn available_permits(&self) -> i64 {
        self.permits.load(Ordering::Acquire)
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    fn is_blocked(&self) -> bool {
        let max = self.options.max_unacked_messages;
        max > 0 && self.unacked_messages() >= u64::from(max)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn unacked_messages(&self) -> u64 {
        self.unacked.load(Ordering::Acquire)
    }

    fn max_unacked_messages(&self) -> u32 {
        self.options.max_unacked_messages
    }

    fn avg_messages_per_entry(&self) -> f64 {
        *self.avg_messages_per_entry.lock()
    }

    fn precise_flow_control(&self) -> bool {
        self.options.precise_flow_control
    }

    fn send_messages(&self, batch: SendBatch) -> BoxFuture<'static, Result<(), SendError>> {
        if !self.is_connected() {
            return Box::pin(futures::future::ready(Err(SendError::Disconnected)));
        }
        self.permits
            .fetch_sub(batch.permits_used(), Ordering::AcqRel);
        self.unacked
            .fetch_add(u64::from(batch.total_messages), Ordering::AcqRel);
        self.delivered
            .fetch_add(u64::from(batch.total_messages), Ordering::AcqRel);
        self.record_batch_ratio(batch.total_messages, batch.entries.len());

        let mut deliveries = Vec::with_capacity(batch.entries.len());
        {
            let mut pending = self.pending.lock();
            for (idx, entry) in batch.entries.into_iter().enumerate() {
                let num_messages = batch.batch_sizes.get(idx).copied().unwrap_or(1);
                pending.insert(
                    entry.position(),
                    (num_messages, entry.metadata().sticky_key_hash),
                );
                deliveries.push(Delivery {
                    position: entry.position(),
                    payload: entry.payload().clone(),
                    num_messages,
                    redelivery_count: batch.redelivery_counts.get(idx).copied().unwrap_or(0),
                });
                // The payload is copied out; the log buffer goes back here.
                entry.release();
            }
        }
        let result = self
            .tx
            .send(ConsumerEvent::Messages(deliveries))
            .map_err(|_| SendError::Disconnected);
        Box::pin(futures::future::ready(result))
    }

    fn pending_acks(&self) -> Vec<PendingAck> {
        self.pending
            .lock()
            .iter()
            .map(|(position, (_, hash))| PendingAck {
                position: *position,
                sticky_key_hash: *hash,
            })
            .collect()
    }

    fn trim_pending_acks(&self, upto: Position) -> u64 {
        let mut pending = self.pending.lock();
        let keep = pending.split_off(&upto.next());
        let trimmed = std::mem::replace(&mut *pending, keep);
        drop(pending);
        let messages: u64 = trimmed.values().map(|(count, _)| u64::from(*count)).sum();
        if messages > 0 {
            self.release_unacked(messages);
        }
        messages
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::debug!(consumer = %self.name, "consumer disconnected");
            let _ = self.tx.send(ConsumerEvent::Disconnected);
        }
    }

    fn reached_end_of_topic(&self) {
        let _ = self.tx.send(ConsumerEvent::EndOfTopic);
    }
}
