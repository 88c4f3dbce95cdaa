// Send phase: splitting a completed read across consumers.
use felix_storage::{Entry, Position};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use super::{DispatcherState, Inner, ReadKind};
use crate::assignor::ConsumerAssignment;
use crate::consumer::{SendBatch, SendError};

/// Entries to hand one consumer in a single round-robin turn.
///
/// Bounded by the messages left in the read, the consumer's permits, its remaining
/// unacked headroom (when `max_unacked > 0`) and `max_round_robin_batch`, converted
/// from messages to entries with `avg_messages_per_entry`. Always at least 1.
pub fn max_entries_in_this_batch(
    remaining_messages: i64,
    max_unacked: u32,
    unacked: u64,
    avg_messages_per_entry: i64,
    available_permits: i64,
    max_round_robin_batch: usize,
) -> usize {
    let mut max_messages = remaining_messages.min(available_permits);
    if max_unacked > 0 {
        let unacked = i64::try_from(unacked).unwrap_or(i64::MAX);
        let headroom = (i64::from(max_unacked) - unacked).max(0);
        max_messages = max_messages.min(headroom);
    }
    let avg = avg_messages_per_entry.max(1);
    let entries = if max_messages <= 0 {
        0
    } else {
        usize::try_from((max_messages + avg - 1) / avg).unwrap_or(usize::MAX)
    };
    entries.min(max_round_robin_batch).max(1)
}

// Totals of what a send round actually handed out.
#[derive(Debug, Default)]
struct Delivered {
    entries: usize,
    messages: u64,
    bytes: u64,
}

impl Delivered {
    fn record(&mut self, batch: &SendBatch) {
        self.entries += batch.len();
        self.messages += u64::from(batch.total_messages);
        self.bytes += batch.total_bytes;
    }
}

impl Inner {
    pub(super) fn handle_sending_and_reading_more(
        &self,
        state: &mut DispatcherState,
        kind: ReadKind,
        entries: Vec<Entry>,
        acquire_send_in_progress: bool,
    ) {
        let trigger_read = self.send_messages_to_consumers(state, kind, entries, acquire_send_in_progress);
        if !trigger_read {
            return;
        }
        if state.last_entries_processed > 0 || state.skip_next_backoff {
            state.retry_backoff.reset();
            state.skip_next_backoff = false;
            self.read_more_entries_locked(state);
        } else {
            self.reschedule_read_with_backoff(state);
        }
    }

    // Returns whether the caller should go on reading.
    fn send_messages_to_consumers(
        &self,
        state: &mut DispatcherState,
        kind: ReadKind,
        entries: Vec<Entry>,
        acquire_send_in_progress: bool,
    ) -> bool {
        if acquire_send_in_progress {
            state.send_in_progress = true;
        }
        let trigger_read = self.try_send_messages_to_consumers(state, kind, entries);
        state.send_in_progress = false;
        trigger_read
    }

    fn try_send_messages_to_consumers(
        &self,
        state: &mut DispatcherState,
        kind: ReadKind,
        entries: Vec<Entry>,
    ) -> bool {
        state.last_entries_processed = 0;
        if entries.is_empty() {
            return true;
        }
        let total_messages: i64 = entries.iter().map(|entry| i64::from(entry.num_messages())).sum();
        if entries.iter().any(Entry::is_chunk) {
            return self.send_chunked_messages(state, kind, entries);
        }
        let entry_count = i64::try_from(entries.len()).unwrap_or(i64::MAX);
        let avg_messages_per_entry = (total_messages / entry_count).max(1);
        let mut remaining_messages = total_messages;
        let mut pending: VecDeque<Entry> = entries.into();
        let mut processed = 0usize;
        let mut delivered = Delivered::default();
        let mut sends = Vec::new();

        while !pending.is_empty() && self.first_available_consumer_permits(state) > 0 {
            let Some(consumer) = self.next_consumer(state) else {
                tracing::info!(subscription = %self.name, "no consumer available, rewinding");
                drop(pending);
                self.cursor.rewind();
                metrics::counter!("felix_dispatch_rewinds_total").increment(1);
                state.last_entries_processed = processed;
                return false;
            };
            let available_permits = if consumer.is_writable() {
                consumer.available_permits()
            } else {
                1
            };
            let batch_entries = max_entries_in_this_batch(
                remaining_messages,
                consumer.max_unacked_messages(),
                consumer.unacked_messages(),
                avg_messages_per_entry,
                available_permits,
                self.config.max_round_robin_batch_size,
            )
            .min(pending.len());
            let slice: Vec<Entry> = pending.drain(..batch_entries).collect();
            if kind == ReadKind::Replay {
                for entry in &slice {
                    state.redelivery.remove(entry.position());
                }
            }
            processed += slice.len();
            let batch = self.filter_entries_for_consumer(state, slice);
            if batch.is_empty() {
                continue;
            }
            remaining_messages -= i64::from(batch.total_messages);
            state.total_available_permits -= batch.permits_used();
            delivered.record(&batch);
            tracing::trace!(
                subscription = %self.name,
                consumer = consumer.name(),
                entries = batch.len(),
                messages = batch.total_messages,
                "dispatching batch"
            );
            sends.push(consumer.send_messages(batch));
        }

        state.last_entries_processed = processed;
        self.finish_round(&delivered);
        self.watch_sends(sends, false);

        if !pending.is_empty() {
            tracing::debug!(
                subscription = %self.name,
                leftover = pending.len(),
                "consumers out of permits, queueing leftovers for redelivery"
            );
            for entry in pending {
                self.add_entry_to_replay(state, entry);
            }
            metrics::gauge!("felix_dispatch_redelivery_pending").set(state.redelivery.len() as f64);
        }
        true
    }

    fn send_chunked_messages(&self, state: &mut DispatcherState, kind: ReadKind, entries: Vec<Entry>) -> bool {
        let num_consumers = state.consumers.len();
        let consumers = state.consumers.clone();
        let mut assignor = std::mem::take(&mut state.assignor);
        let assignment = assignor.assign(
            entries,
            num_consumers,
            || self.next_consumer(state),
            |id| consumers.iter().find(|consumer| consumer.id() == id).cloned(),
        );
        state.assignor = assignor;

        let mut added_to_replay = false;
        for entry in assignment.unassigned {
            added_to_replay |= self.add_entry_to_replay(state, entry);
        }

        let mut processed = 0usize;
        let mut delivered = Delivered::default();
        let mut sends = Vec::new();
        for ConsumerAssignment { consumer, mut entries } in assignment.assigned {
            let permits = usize::try_from(consumer.available_permits()).unwrap_or(0);
            let take = permits.min(entries.len());
            for entry in entries.drain(take..) {
                added_to_replay |= self.add_entry_to_replay(state, entry);
            }
            if take == 0 {
                continue;
            }
            if kind == ReadKind::Replay {
                for entry in &entries {
                    state.redelivery.remove(entry.position());
                }
            }
            processed += entries.len();
            let batch = self.filter_entries_for_consumer(state, entries);
            if batch.is_empty() {
                continue;
            }
            state.total_available_permits -= batch.permits_used();
            delivered.record(&batch);
            sends.push(consumer.send_messages(batch));
        }

        state.last_entries_processed = processed;
        self.finish_round(&delivered);
        metrics::gauge!("felix_dispatch_redelivery_pending").set(state.redelivery.len() as f64);
        let nothing_sent = sends.is_empty();
        // Chunked rounds read more once every consumer has taken its share.
        self.watch_sends(sends, true);
        nothing_sent || added_to_replay
    }

    // Drops entries that went to the delayed tracker and packs the rest.
    fn filter_entries_for_consumer(&self, state: &mut DispatcherState, entries: Vec<Entry>) -> SendBatch {
        let mut batch = SendBatch::default();
        for entry in entries {
            let position = entry.position();
            let metadata = entry.metadata();
            if let Some(deliver_at) = metadata.deliver_at_millis {
                if self.track_delayed_delivery(state, position, deliver_at) {
                    entry.release();
                    continue;
                }
            }
            batch.batch_sizes.push(metadata.num_messages);
            batch.total_messages += metadata.num_messages;
            batch.acked_indexes += metadata.acked_batch_indexes;
            if metadata.chunk.is_some() {
                batch.total_chunked += 1;
            }
            batch.total_bytes += entry.len() as u64;
            batch.redelivery_counts.push(state.redelivery_counts.get(position));
            batch.entries.push(entry);
        }
        batch
    }

    fn track_delayed_delivery(&self, state: &mut DispatcherState, position: Position, deliver_at: u64) -> bool {
        if !self.config.delayed_delivery_enabled {
            return false;
        }
        let tracker = state
            .delayed
            .get_or_insert_with(|| self.delayed_factory.create(&self.name));
        let tracked = tracker.add_message(position, deliver_at);
        if tracked {
            self.arm_delayed_wakeup(state);
        }
        tracked
    }

    fn add_entry_to_replay(&self, state: &mut DispatcherState, entry: Entry) -> bool {
        let hash = self.policy.sticky_key_hash(&entry);
        let position = entry.position();
        entry.release();
        self.add_message_to_replay(state, position, hash)
    }

    fn finish_round(&self, delivered: &Delivered) {
        if delivered.entries == 0 {
            return;
        }
        self.acquire_permits_for_delivered(delivered.messages, delivered.bytes);
        self.add_unacked_messages(i64::try_from(delivered.messages).unwrap_or(i64::MAX));
        metrics::counter!("felix_dispatch_messages_total").increment(delivered.messages);
    }

    fn acquire_permits_for_delivered(&self, messages: u64, bytes: u64) {
        if !(self.config.dispatch_throttling_on_non_backlog || !self.cursor.is_active()) {
            return;
        }
        if let Some(limiter) = self.rate_limiter.as_ref() {
            limiter.consume(messages, bytes);
        }
    }

    // Logs failed sends. With `read_after`, asks for a read once all sends settle.
    fn watch_sends(&self, sends: Vec<BoxFuture<'static, Result<(), SendError>>>, read_after: bool) {
        if sends.is_empty() {
            return;
        }
        let name = self.name.clone();
        let weak = self.weak.clone();
        tokio::spawn(async move {
            for result in futures::future::join_all(sends).await {
                if let Err(error) = result {
                    tracing::warn!(subscription = %name, %error, "send to consumer failed");
                }
            }
            if read_after {
                if let Some(inner) = weak.upgrade() {
                    if !inner.closed.load(Ordering::Acquire) {
                        inner.read_more_entries_async();
                    }
                }
            }
        });
    }
}
