// Read scheduling: deciding whether, what and how much to read, and handling
// the outcome of cursor reads and replays.
use felix_storage::{CursorError, CursorResult, Entry, Position, ReadRequest};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::{DispatcherState, Inner, ReadKind};

// Fixed retry delay for transient log failures.
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(1);

impl Inner {
    pub(super) fn read_more_entries_async(&self) {
        if self
            .read_more_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.run_later(None, |inner| {
                inner.read_more_requested.store(false, Ordering::Release);
                inner.read_more_entries();
            });
        }
    }

    pub(super) fn read_more_entries(&self) {
        let mut state = self.state.lock();
        self.read_more_entries_locked(&mut state);
    }

    pub(super) fn read_more_entries_locked(&self, state: &mut DispatcherState) {
        if self.cursor.is_closed() {
            tracing::debug!(subscription = %self.name, "cursor closed, skipping read");
            return;
        }
        if state.send_in_progress {
            // The send phase reads more once it finishes.
            return;
        }
        if state
            .delayed
            .as_ref()
            .is_some_and(|tracker| tracker.should_pause_all_deliveries())
        {
            tracing::debug!(subscription = %self.name, "delayed delivery paused all deliveries");
            return;
        }
        if self.transferring.load(Ordering::Acquire) {
            tracing::debug!(subscription = %self.name, "topic is transferring, skipping read");
            return;
        }
        state.read_more_calls += 1;
        self.trim_to_mark_delete(state);

        let first_available = self.first_available_consumer_permits(state);
        let current_total = state.total_available_permits.max(first_available);
        if current_total <= 0 || first_available <= 0 {
            tracing::debug!(
                subscription = %self.name,
                total_permits = state.total_available_permits,
                first_available,
                "consumer buffers full, skipping read"
            );
            return;
        }
        let Some((messages, bytes)) = self.calculate_to_read(state, current_total) else {
            return;
        };

        let replay = if self.policy.can_replay_messages() {
            self.messages_to_replay_now(state, messages, bytes)
        } else {
            Vec::new()
        };
        if !replay.is_empty() {
            self.issue_replay_read(state, replay);
        } else if self.blocked_on_unacked.load(Ordering::Acquire) {
            tracing::debug!(subscription = %self.name, "blocked on unacked messages, skipping read");
        } else if !state.have_pending_read {
            if !self.policy.is_normal_read_allowed() {
                self.policy.on_normal_read_not_allowed();
                return;
            }
            if self.should_pause_on_ack_state_persist(ReadKind::Normal) {
                tracing::debug!(subscription = %self.name, "paused until ack state is persistable");
                return;
            }
            self.issue_normal_read(state, messages, bytes);
        } else {
            tracing::debug!(subscription = %self.name, "read already pending");
        }
        self.arm_delayed_wakeup(state);
    }

    // Forgets redeliveries and pending acks the cursor already deleted.
    fn trim_to_mark_delete(&self, state: &mut DispatcherState) {
        let mark_delete = self.cursor.mark_deleted_position();
        if mark_delete == state.last_mark_delete {
            return;
        }
        state.last_mark_delete = mark_delete;
        let Some(mark_delete) = mark_delete else {
            return;
        };
        let trimmed = state.redelivery.remove_all_up_to(mark_delete);
        state.redelivery_counts.remove_all_up_to(mark_delete);
        let released: u64 = state
            .consumers
            .iter()
            .map(|consumer| consumer.trim_pending_acks(mark_delete))
            .sum();
        if released > 0 {
            self.add_unacked_messages(-i64::try_from(released).unwrap_or(i64::MAX));
        }
        if trimmed > 0 {
            tracing::debug!(subscription = %self.name, trimmed, %mark_delete, "trimmed acknowledged redeliveries");
            metrics::gauge!("felix_dispatch_redelivery_pending").set(state.redelivery.len() as f64);
        }
    }

    /// Sizes the next read from consumer permits, the adaptive batch size and the
    /// rate limiter. `None` means do not read now.
    pub(super) fn calculate_to_read(
        &self,
        state: &mut DispatcherState,
        current_total_permits: i64,
    ) -> Option<(usize, u64)> {
        let permits = usize::try_from(current_total_permits).unwrap_or(0);
        let mut messages = permits.min(state.read_batch_size);
        let mut bytes = self.config.max_read_size_bytes;

        if let Some(consumer) = state
            .consumers
            .iter()
            .find(|consumer| consumer.precise_flow_control())
        {
            let avg = consumer.avg_messages_per_entry().max(1.0);
            let entries = (permits as f64 / avg).ceil() as usize;
            messages = entries.min(state.read_batch_size);
        }

        if !state.consumers.iter().any(|consumer| consumer.is_writable()) {
            // Probe with a single entry until some consumer drains its buffer.
            messages = 1;
        }

        if self.config.dispatch_throttling_on_non_backlog || !self.cursor.is_active() {
            if let Some(limiter) = self.rate_limiter.as_ref().filter(|limiter| limiter.is_enabled()) {
                match limiter.cap(messages, bytes) {
                    Some((capped_messages, capped_bytes)) => {
                        messages = capped_messages;
                        bytes = capped_bytes;
                    }
                    None => {
                        tracing::debug!(subscription = %self.name, "dispatch rate exceeded, rescheduling read");
                        self.reschedule_read_in(self.config.rate_limit_backoff());
                        return None;
                    }
                }
            }
        }

        if state.have_pending_replay_read {
            tracing::debug!(subscription = %self.name, "replay read already pending");
            return None;
        }
        Some((messages.max(1), bytes.max(1)))
    }

    // Moves due delayed messages into redelivery, then picks what the policy lets
    // through. Nothing leaves the redelivery set here.
    pub(super) fn messages_to_replay_now(
        &self,
        state: &mut DispatcherState,
        max_messages: usize,
        max_bytes: u64,
    ) -> Vec<Position> {
        let capped = self.cursor.apply_max_size_cap(max_messages, max_bytes).max(1);
        let due = match state.delayed.as_mut() {
            Some(tracker) if tracker.has_message_available() => tracker.scheduled_messages(capped),
            _ => Vec::new(),
        };
        for position in due {
            self.add_message_to_replay(state, position, None);
        }
        if state.redelivery.is_empty() {
            return Vec::new();
        }
        let mut filter = self.policy.replay_filter();
        state
            .redelivery
            .take_eligible(capped, |position, hash| filter(position, hash))
    }

    pub(super) fn issue_replay_read(&self, state: &mut DispatcherState, positions: Vec<Position>) {
        state.have_pending_replay_read = true;
        let deleted = self.cursor.acknowledged_positions(&positions);
        for position in &deleted {
            state.redelivery.remove(*position);
        }
        if deleted.len() == positions.len() {
            // Everything was acknowledged meanwhile; look again.
            state.have_pending_replay_read = false;
            self.read_more_entries_async();
            return;
        }
        let positions: Vec<Position> = positions
            .into_iter()
            .filter(|position| !deleted.contains(position))
            .collect();
        tracing::debug!(subscription = %self.name, count = positions.len(), "scheduling replay read");
        metrics::counter!("felix_dispatch_reads_total", "kind" => ReadKind::Replay.as_str()).increment(1);

        let in_order = self.config.delayed_delivery_enabled;
        let cursor = Arc::clone(&self.cursor);
        let weak = self.weak.clone();
        tokio::spawn(async move {
            let result = cursor.replay_entries(positions, in_order).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_read_result(ReadKind::Replay, result);
            }
        });
    }

    fn issue_normal_read(&self, state: &mut DispatcherState, messages: usize, bytes: u64) {
        state.have_pending_read = true;
        let messages = messages.min(self.policy.max_entries_read_limit());
        let request = ReadRequest::new(messages, bytes)
            .with_max_position(state.max_read_position)
            .with_skip(self.policy.normal_read_skip());
        tracing::debug!(subscription = %self.name, messages, bytes, "scheduling normal read");
        metrics::counter!("felix_dispatch_reads_total", "kind" => ReadKind::Normal.as_str()).increment(1);

        let cursor = Arc::clone(&self.cursor);
        let weak = self.weak.clone();
        tokio::spawn(async move {
            let result = cursor.read_entries_or_wait(request).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_read_result(ReadKind::Normal, result);
            }
        });
    }

    fn on_read_result(&self, kind: ReadKind, result: CursorResult<Vec<Entry>>) {
        match result {
            Ok(entries) => self.read_entries_complete(kind, entries),
            // Whoever cancelled already cleared the pending flag.
            Err(CursorError::Cancelled) => {
                tracing::debug!(subscription = %self.name, kind = kind.as_str(), "read cancelled");
            }
            Err(error) => self.read_entries_failed(kind, error),
        }
    }

    fn read_entries_complete(&self, kind: ReadKind, entries: Vec<Entry>) {
        let mut state = self.state.lock();
        match kind {
            ReadKind::Normal => state.have_pending_read = false,
            ReadKind::Replay => state.have_pending_replay_read = false,
        }
        if state.read_batch_size < self.config.max_read_batch_size {
            state.read_batch_size = (state.read_batch_size * 2).min(self.config.max_read_batch_size);
        }
        state.read_failure_backoff.reduce_to_half();

        if state.should_rewind_before_reading && kind == ReadKind::Normal {
            // Consumers changed under this read; start over from the mark-delete.
            drop(entries);
            self.cursor.rewind();
            metrics::counter!("felix_dispatch_rewinds_total").increment(1);
            state.should_rewind_before_reading = false;
            drop(state);
            self.read_more_entries_async();
            return;
        }
        tracing::debug!(
            subscription = %self.name,
            kind = kind.as_str(),
            entries = entries.len(),
            "read completed"
        );

        if self.config.dispatch_in_subscription_thread {
            state.send_in_progress = true;
            drop(state);
            self.run_later(None, move |inner| {
                let mut state = inner.state.lock();
                inner.handle_sending_and_reading_more(&mut state, kind, entries, false);
            });
        } else {
            self.handle_sending_and_reading_more(&mut state, kind, entries, true);
        }
    }

    fn read_entries_failed(&self, kind: ReadKind, error: CursorError) {
        let mut state = self.state.lock();
        let mut wait = Some(state.read_failure_backoff.next());
        match &error {
            CursorError::AlreadyClosed => {
                tracing::debug!(subscription = %self.name, "cursor closed, stopping reads");
                wait = None;
            }
            CursorError::NoMoreEntries => {
                if self.cursor.entries_in_backlog() == 0 {
                    for consumer in &state.consumers {
                        consumer.reached_end_of_topic();
                    }
                }
            }
            error if error.is_transient() => {
                tracing::debug!(subscription = %self.name, %error, "transient read failure");
                wait = Some(TRANSIENT_RETRY_DELAY);
            }
            CursorError::TooManyRequests => {
                tracing::debug!(subscription = %self.name, %error, "read throttled by the log");
            }
            error => {
                tracing::error!(subscription = %self.name, kind = kind.as_str(), %error, "read failed");
            }
        }
        metrics::counter!("felix_dispatch_read_failures_total", "kind" => kind.as_str()).increment(1);

        if state.should_rewind_before_reading {
            state.should_rewind_before_reading = false;
            self.cursor.rewind();
            metrics::counter!("felix_dispatch_rewinds_total").increment(1);
        }
        match kind {
            ReadKind::Normal => state.have_pending_read = false,
            ReadKind::Replay => {
                state.have_pending_replay_read = false;
                if matches!(error, CursorError::InvalidReplayPosition(_)) {
                    if let Some(mark_delete) = self.cursor.mark_deleted_position() {
                        state.redelivery.remove_all_up_to(mark_delete);
                    }
                }
            }
        }
        state.read_batch_size = self.config.min_read_batch_size;
        drop(state);

        if let Some(wait) = wait {
            self.schedule_read_with_delay(kind, wait);
        }
    }

    fn schedule_read_with_delay(&self, kind: ReadKind, wait: Duration) {
        self.run_later(Some(wait), move |inner| {
            let mut state = inner.state.lock();
            if !state.have_pending_read || kind == ReadKind::Replay {
                tracing::info!(subscription = %inner.name, kind = kind.as_str(), "retrying read");
                inner.read_more_entries_locked(&mut state);
            } else {
                tracing::info!(subscription = %inner.name, "skipping retry, a read is already pending");
            }
        });
    }

    /// Schedules one read after `delay`; further requests while one is pending are dropped.
    pub(super) fn reschedule_read_in(&self, delay: Duration) {
        if self
            .reschedule_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(subscription = %self.name, delay_ms = delay.as_millis() as u64, "rescheduling read");
            self.run_later(Some(delay), |inner| {
                inner.reschedule_in_progress.store(false, Ordering::Release);
                inner.read_more_entries();
            });
        }
    }

    pub(super) fn reschedule_read_with_backoff(&self, state: &mut DispatcherState) {
        let delay = state.retry_backoff.next();
        self.reschedule_read_in(delay);
    }

    // Wakes the read loop when the earliest delayed message comes due.
    pub(super) fn arm_delayed_wakeup(&self, state: &mut DispatcherState) {
        let Some(delay) = state.delayed.as_ref().and_then(|tracker| tracker.next_wakeup()) else {
            return;
        };
        if delay.is_zero() {
            return;
        }
        let deadline = tokio::time::Instant::now() + delay;
        if state.delayed_wakeup.is_some_and(|armed| armed <= deadline) {
            return;
        }
        state.delayed_wakeup = Some(deadline);
        self.run_later(Some(delay), |inner| {
            inner.state.lock().delayed_wakeup = None;
            inner.read_more_entries_async();
        });
    }
}
