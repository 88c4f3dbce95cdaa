use super::*;
use bytes::Bytes;
use felix_storage::{ChunkInfo, CursorError, EntryMetadata, MemoryCursor, MemoryLedger, ReadRequest};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use crate::consumer::{
    ChannelConsumer, ConsumerEvent, ConsumerOptions, Delivery, PendingAck, SendBatch, SendError,
};
use crate::delayed::{InMemoryTrackerFactory, ManualClock};
use crate::rate_limit::TokenBucketRateLimiter;

const WAIT: Duration = Duration::from_secs(2);

fn setup(config: DispatcherConfig) -> (Arc<MemoryLedger>, Arc<MemoryCursor>, Dispatcher) {
    let ledger = MemoryLedger::new("persistent://tenant/ns/orders");
    let cursor = ledger.open_cursor("sub");
    let dispatcher = Dispatcher::new("orders-sub", cursor.clone(), config);
    (ledger, cursor, dispatcher)
}

fn publish(ledger: &MemoryLedger, count: usize) -> Vec<Position> {
    (0..count)
        .map(|i| ledger.append(Bytes::from(format!("m{i}")), EntryMetadata::default()))
        .collect()
}

fn attach(
    dispatcher: &Dispatcher,
    id: ConsumerId,
    options: ConsumerOptions,
) -> (Arc<ChannelConsumer>, UnboundedReceiver<ConsumerEvent>) {
    let (consumer, rx) = ChannelConsumer::new(id, format!("c{id}"), options);
    dispatcher.add_consumer(consumer.clone()).expect("add consumer");
    (consumer, rx)
}

fn grant(dispatcher: &Dispatcher, consumer: &ChannelConsumer, permits: u32) {
    consumer.add_permits(permits);
    dispatcher.consumer_flow(consumer.id(), permits);
}

async fn receive(rx: &mut UnboundedReceiver<ConsumerEvent>, expected: usize) -> Vec<Delivery> {
    let mut deliveries = Vec::new();
    while deliveries.len() < expected {
        match timeout(WAIT, rx.recv()).await.expect("timeout").expect("channel open") {
            ConsumerEvent::Messages(batch) => deliveries.extend(batch),
            other => panic!("unexpected event {other:?}"),
        }
    }
    deliveries
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// Wraps a channel consumer and reports it connected for a fixed number of checks.
#[derive(Debug)]
struct VanishingConsumer {
    inner: Arc<ChannelConsumer>,
    connected_checks: AtomicI64,
}

impl VanishingConsumer {
    fn new(inner: Arc<ChannelConsumer>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            connected_checks: AtomicI64::new(i64::MAX),
        })
    }
}

impl Consumer for VanishingConsumer {
    fn id(&self) -> ConsumerId {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn priority_level(&self) -> i32 {
        self.inner.priority_level()
    }

    fn available_permits(&self) -> i64 {
        self.inner.available_permits()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn is_blocked(&self) -> bool {
        self.inner.is_blocked()
    }

    fn is_connected(&self) -> bool {
        self.connected_checks.fetch_sub(1, Ordering::AcqRel) > 0 && self.inner.is_connected()
    }

    fn unacked_messages(&self) -> u64 {
        self.inner.unacked_messages()
    }

    fn max_unacked_messages(&self) -> u32 {
        self.inner.max_unacked_messages()
    }

    fn avg_messages_per_entry(&self) -> f64 {
        self.inner.avg_messages_per_entry()
    }

    fn send_messages(&self, batch: SendBatch) -> BoxFuture<'static, Result<(), SendError>> {
        self.inner.send_messages(batch)
    }

    fn pending_acks(&self) -> Vec<PendingAck> {
        self.inner.pending_acks()
    }

    fn trim_pending_acks(&self, upto: Position) -> u64 {
        self.inner.trim_pending_acks(upto)
    }

    fn disconnect(&self) {
        self.inner.disconnect();
    }
}

#[tokio::test]
async fn delivers_backlog_up_to_permits() {
    let (ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    let published = publish(&ledger, 5);
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 10);

    let deliveries = receive(&mut rx, 5).await;
    let positions: Vec<Position> = deliveries.iter().map(|d| d.position).collect();
    assert_eq!(positions, published);
    settle().await;
    assert_eq!(consumer.available_permits(), 5);
    assert_eq!(dispatcher.total_available_permits(), 5);
    assert_eq!(dispatcher.total_unacked_messages(), 5);
    // Caught up: the next read parks on the cursor.
    assert!(dispatcher.is_have_pending_read());
}

#[tokio::test]
async fn never_delivers_beyond_permits() {
    let (ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    publish(&ledger, 10);
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 3);

    assert_eq!(receive(&mut rx, 3).await.len(), 3);
    settle().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(consumer.delivered_messages(), 3);
    assert_eq!(consumer.available_permits(), 0);
    assert!(!dispatcher.is_have_pending_read());
}

#[tokio::test]
async fn round_robin_spreads_across_consumers() {
    let config = DispatcherConfig {
        max_round_robin_batch_size: 2,
        ..DispatcherConfig::default()
    };
    let (ledger, _cursor, dispatcher) = setup(config);
    publish(&ledger, 8);
    let (c1, mut rx1) = attach(&dispatcher, 1, ConsumerOptions::default());
    let (c2, mut rx2) = attach(&dispatcher, 2, ConsumerOptions::default());
    c1.add_permits(10);
    c2.add_permits(10);
    dispatcher.consumer_flow(1, 10);
    dispatcher.consumer_flow(2, 10);

    let first = receive(&mut rx1, 4).await;
    let second = receive(&mut rx2, 4).await;
    assert_eq!(first.len(), 4);
    assert_eq!(second.len(), 4);
}

#[tokio::test]
async fn lower_priority_level_is_served_first() {
    let (ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    let low = ConsumerOptions {
        priority_level: 1,
        ..ConsumerOptions::default()
    };
    let (backup, mut backup_rx) = attach(&dispatcher, 1, low);
    let (primary, mut primary_rx) = attach(&dispatcher, 2, ConsumerOptions::default());
    let order: Vec<ConsumerId> = dispatcher.consumers().iter().map(|c| c.id()).collect();
    assert_eq!(order, vec![2, 1]);

    publish(&ledger, 4);
    backup.add_permits(10);
    primary.add_permits(10);
    dispatcher.consumer_flow(1, 10);
    dispatcher.consumer_flow(2, 10);

    assert_eq!(receive(&mut primary_rx, 4).await.len(), 4);
    settle().await;
    assert!(backup_rx.try_recv().is_err());
}

#[tokio::test]
async fn max_consumers_limit_rejects_extra_consumer() {
    let config = DispatcherConfig {
        max_consumers_per_subscription: 1,
        ..DispatcherConfig::default()
    };
    let (_ledger, _cursor, dispatcher) = setup(config);
    let _first = attach(&dispatcher, 1, ConsumerOptions::default());
    let (second, _rx) = ChannelConsumer::new(2, "c2", ConsumerOptions::default());
    let err = dispatcher.add_consumer(second).unwrap_err();
    assert!(matches!(err, DispatchError::ConsumerBusy { limit: 1, .. }));
    assert_eq!(dispatcher.consumer_count(), 1);
    assert!(dispatcher.can_unsubscribe(1));
    assert!(!dispatcher.can_unsubscribe(2));
}

#[tokio::test]
async fn removed_consumer_pending_acks_go_to_remaining_consumer() {
    let (ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    let published = publish(&ledger, 3);
    let (c1, mut rx1) = attach(&dispatcher, 1, ConsumerOptions::default());
    let (c2, mut rx2) = attach(&dispatcher, 2, ConsumerOptions::default());
    grant(&dispatcher, &c1, 3);
    assert_eq!(receive(&mut rx1, 3).await.len(), 3);
    settle().await;

    dispatcher.remove_consumer(c1.as_ref());
    assert_eq!(dispatcher.number_of_messages_in_replay(), 3);
    assert_eq!(dispatcher.total_unacked_messages(), 0);

    grant(&dispatcher, &c2, 10);
    let replayed = receive(&mut rx2, 3).await;
    let positions: Vec<Position> = replayed.iter().map(|d| d.position).collect();
    assert_eq!(positions, published);
    settle().await;
    assert_eq!(dispatcher.number_of_messages_in_replay(), 0);
}

#[tokio::test]
async fn removing_last_consumer_clears_redelivery_and_completes_close() {
    let (ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    publish(&ledger, 3);
    let (c1, mut rx1) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &c1, 3);
    assert_eq!(receive(&mut rx1, 3).await.len(), 3);

    let closing = dispatcher.close(true);
    assert_eq!(
        timeout(WAIT, rx1.recv()).await.expect("timeout"),
        Some(ConsumerEvent::Disconnected)
    );
    dispatcher.remove_consumer(c1.as_ref());
    timeout(WAIT, closing).await.expect("close future");
    assert_eq!(dispatcher.number_of_messages_in_replay(), 0);
    assert_eq!(dispatcher.total_available_permits(), 0);
    assert!(dispatcher.is_closed());
}

#[tokio::test]
async fn closed_dispatcher_disconnects_new_consumers_until_reset() {
    let (_ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    timeout(WAIT, dispatcher.close(true)).await.expect("close with no consumers");
    let (consumer, mut rx) = ChannelConsumer::new(1, "late", ConsumerOptions::default());
    dispatcher.add_consumer(consumer).expect("closed attach still succeeds");
    assert_eq!(rx.recv().await, Some(ConsumerEvent::Disconnected));
    assert_eq!(dispatcher.consumer_count(), 0);

    dispatcher.reset();
    assert!(!dispatcher.is_closed());
    let _attached = attach(&dispatcher, 2, ConsumerOptions::default());
    assert_eq!(dispatcher.consumer_count(), 1);
}

#[tokio::test]
async fn redelivered_messages_carry_redelivery_count() {
    let (ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    publish(&ledger, 2);
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 4);
    let first = receive(&mut rx, 2).await;
    assert!(first.iter().all(|d| d.redelivery_count == 0));
    settle().await;

    dispatcher.redeliver_unacknowledged(consumer.as_ref());
    let again = receive(&mut rx, 2).await;
    assert!(again.iter().all(|d| d.redelivery_count == 1));
    assert_eq!(dispatcher.redelivery_count(first[0].position), 1);
}

#[tokio::test]
async fn acknowledged_redeliveries_are_trimmed_before_reading() {
    let (ledger, cursor, dispatcher) = setup(DispatcherConfig::default());
    let published = publish(&ledger, 5);
    let (consumer, _rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    dispatcher.redeliver_positions(consumer.as_ref(), &published);
    assert_eq!(dispatcher.number_of_messages_in_replay(), 5);

    cursor.acknowledge_up_to(published[2]);
    dispatcher.read_more_entries();
    assert_eq!(dispatcher.messages_to_replay(), published[3..].to_vec());
}

#[tokio::test]
async fn fully_acknowledged_replay_set_is_dropped_without_reading() {
    let (ledger, cursor, dispatcher) = setup(DispatcherConfig::default());
    let published = publish(&ledger, 2);
    let (consumer, _rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    dispatcher.redeliver_positions(consumer.as_ref(), &published);
    // Individually acked but mark-delete has not moved past them for the dispatcher yet.
    cursor.acknowledge(&published);
    {
        let mut state = dispatcher.inner.state.lock();
        state.last_mark_delete = cursor.mark_deleted_position();
    }
    consumer.add_permits(5);
    dispatcher.read_more_entries();
    assert!(!dispatcher.is_have_pending_replay_read());
    assert_eq!(dispatcher.number_of_messages_in_replay(), 0);
    assert_eq!(cursor.replays_issued(), 0);
}

#[tokio::test]
async fn exhausted_rate_limiter_cancels_read_and_reschedules() {
    let ledger = MemoryLedger::new("topic");
    let cursor = ledger.open_cursor("sub");
    cursor.set_active(false);
    let limiter = Arc::new(TokenBucketRateLimiter::new(Some(5), None, Duration::from_secs(3600)));
    limiter.consume(5, 0);
    let dispatcher = Dispatcher::builder("sub", cursor.clone())
        .rate_limiter(limiter)
        .build();
    let (_consumer, _rx) = attach(&dispatcher, 1, ConsumerOptions::default());

    let mut state = dispatcher.inner.state.lock();
    assert_eq!(dispatcher.inner.calculate_to_read(&mut state, 10), None);
    drop(state);
    assert!(dispatcher.inner.reschedule_in_progress.load(Ordering::Acquire));
}

#[tokio::test]
async fn limiter_caps_read_only_when_throttling_applies() {
    let ledger = MemoryLedger::new("topic");
    let cursor = ledger.open_cursor("sub");
    let limiter = Arc::new(TokenBucketRateLimiter::per_second(Some(4), None));
    let dispatcher = Dispatcher::builder("sub", cursor.clone())
        .rate_limiter(limiter)
        .build();
    let _attached = attach(&dispatcher, 1, ConsumerOptions::default());

    let mut state = dispatcher.inner.state.lock();
    // Active cursor, no throttling on non-backlog: the limiter is not consulted.
    let (messages, bytes) = dispatcher.inner.calculate_to_read(&mut state, 50).expect("read");
    assert_eq!(messages, 50);
    assert_eq!(bytes, DispatcherConfig::default().max_read_size_bytes);
    cursor.set_active(false);
    assert_eq!(dispatcher.inner.calculate_to_read(&mut state, 50).map(|r| r.0), Some(4));
}

#[tokio::test]
async fn read_size_follows_permits_batch_and_writability() {
    let (_ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    let (consumer, _rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    let mut state = dispatcher.inner.state.lock();
    assert_eq!(dispatcher.inner.calculate_to_read(&mut state, 7).map(|r| r.0), Some(7));
    assert_eq!(dispatcher.inner.calculate_to_read(&mut state, 500).map(|r| r.0), Some(100));
    state.read_batch_size = 4;
    assert_eq!(dispatcher.inner.calculate_to_read(&mut state, 500).map(|r| r.0), Some(4));

    consumer.set_writable(false);
    assert_eq!(dispatcher.inner.calculate_to_read(&mut state, 500).map(|r| r.0), Some(1));

    state.have_pending_replay_read = true;
    assert_eq!(dispatcher.inner.calculate_to_read(&mut state, 500), None);
}

#[tokio::test]
async fn precise_flow_control_sizes_read_in_entries() {
    let (_ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    let options = ConsumerOptions {
        precise_flow_control: true,
        ..ConsumerOptions::default()
    };
    let _attached = attach(&dispatcher, 1, options);
    let mut state = dispatcher.inner.state.lock();
    // Average starts at one message per entry.
    assert_eq!(dispatcher.inner.calculate_to_read(&mut state, 9).map(|r| r.0), Some(9));
}

#[test]
fn batch_per_consumer_respects_every_bound() {
    // Permits bound.
    assert_eq!(max_entries_in_this_batch(100, 0, 0, 1, 5, 20), 5);
    // Round-robin bound.
    assert_eq!(max_entries_in_this_batch(100, 0, 0, 1, 50, 20), 20);
    // Unacked headroom bound.
    assert_eq!(max_entries_in_this_batch(100, 10, 7, 1, 50, 20), 3);
    // Messages converted to entries by average batch size, rounding up.
    assert_eq!(max_entries_in_this_batch(100, 0, 0, 4, 10, 20), 3);
    // Never below one entry.
    assert_eq!(max_entries_in_this_batch(100, 10, 12, 1, 50, 20), 1);
    assert_eq!(max_entries_in_this_batch(0, 0, 0, 1, 0, 20), 1);
}

#[tokio::test]
async fn failed_read_resets_batch_size_and_success_doubles_it() {
    let config = DispatcherConfig {
        max_read_batch_size: 16,
        read_failure_backoff_initial_ms: 60_000,
        read_failure_backoff_max_ms: 60_000,
        ..DispatcherConfig::default()
    };
    let (ledger, cursor, dispatcher) = setup(config);
    publish(&ledger, 3);
    cursor.fail_next_read(CursorError::Read("disk".into()));
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 1);
    settle().await;
    assert_eq!(dispatcher.read_batch_size(), 1);
    assert!(!dispatcher.is_have_pending_read());

    dispatcher.read_more_entries();
    assert_eq!(receive(&mut rx, 1).await.len(), 1);
    settle().await;
    assert_eq!(dispatcher.read_batch_size(), 2);
}

#[tokio::test]
async fn invalid_replay_position_drops_acknowledged_redeliveries() {
    let (ledger, cursor, dispatcher) = setup(DispatcherConfig::default());
    let published = publish(&ledger, 4);
    let (consumer, _rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    dispatcher.redeliver_positions(consumer.as_ref(), &published);
    cursor.fail_next_replay(CursorError::InvalidReplayPosition(published[0]));
    // Mark-delete moves without the dispatcher noticing before the replay fails.
    {
        let mut state = dispatcher.inner.state.lock();
        cursor.acknowledge_up_to(published[1]);
        state.last_mark_delete = cursor.mark_deleted_position();
        state.redelivery.add(published[0], None);
    }
    consumer.add_permits(10);
    dispatcher.read_more_entries();
    settle().await;
    let remaining = dispatcher.messages_to_replay();
    assert!(remaining.iter().all(|p| *p > published[1]), "{remaining:?}");
}

#[tokio::test]
async fn terminated_topic_notifies_consumers() {
    let (ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    ledger.terminate();
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 5);
    let event = timeout(WAIT, rx.recv()).await.expect("timeout");
    assert_eq!(event, Some(ConsumerEvent::EndOfTopic));
}

#[tokio::test]
async fn past_due_delayed_message_is_delivered_immediately() {
    let (ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    ledger.append(Bytes::from_static(b"late"), EntryMetadata::default().with_deliver_at(1));
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 5);
    assert_eq!(receive(&mut rx, 1).await.len(), 1);
    assert_eq!(dispatcher.number_of_delayed_messages(), 0);
}

#[tokio::test]
async fn future_delayed_message_waits_for_its_time() {
    let clock = ManualClock::new(1_000);
    let ledger = MemoryLedger::new("topic");
    let cursor = ledger.open_cursor("sub");
    let dispatcher = Dispatcher::builder("sub", cursor.clone())
        .delayed_tracker_factory(Arc::new(InMemoryTrackerFactory::with_clock(
            clock.clone(),
            Duration::from_millis(10),
        )))
        .build();
    let scheduled = ledger.append(
        Bytes::from_static(b"later"),
        EntryMetadata::default().with_deliver_at(60_000),
    );
    let now = ledger.append(Bytes::from_static(b"now"), EntryMetadata::default());
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 5);

    let first = receive(&mut rx, 1).await;
    assert_eq!(first[0].position, now);
    assert_eq!(dispatcher.number_of_delayed_messages(), 1);
    assert!(dispatcher.delayed_tracker_memory_usage() > 0);

    clock.set(60_000);
    dispatcher.read_more_entries_async();
    let second = receive(&mut rx, 1).await;
    assert_eq!(second[0].position, scheduled);
    assert_eq!(dispatcher.number_of_delayed_messages(), 0);
}

#[tokio::test]
async fn delayed_delivery_disabled_delivers_right_away() {
    let config = DispatcherConfig {
        delayed_delivery_enabled: false,
        ..DispatcherConfig::default()
    };
    let (ledger, _cursor, dispatcher) = setup(config);
    ledger.append(Bytes::from_static(b"x"), EntryMetadata::default().with_deliver_at(u64::MAX));
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 1);
    assert_eq!(receive(&mut rx, 1).await.len(), 1);
    assert_eq!(dispatcher.number_of_delayed_messages(), 0);
}

#[tokio::test]
async fn chunks_of_a_message_reach_one_consumer() {
    let (ledger, _cursor, dispatcher) = setup(DispatcherConfig {
        max_round_robin_batch_size: 1,
        ..DispatcherConfig::default()
    });
    for chunk_id in 0..3 {
        ledger.append(
            Bytes::from_static(b"chunk"),
            EntryMetadata::default().with_chunk(ChunkInfo::new("msg-1", chunk_id, 3)),
        );
    }
    let (c1, mut rx1) = attach(&dispatcher, 1, ConsumerOptions::default());
    let (c2, mut rx2) = attach(&dispatcher, 2, ConsumerOptions::default());
    c1.add_permits(10);
    c2.add_permits(10);
    dispatcher.consumer_flow(1, 10);
    dispatcher.consumer_flow(2, 10);

    let got = tokio::select! {
        batch = receive(&mut rx1, 3) => batch,
        batch = receive(&mut rx2, 3) => batch,
    };
    assert_eq!(got.len(), 3);
    let total = c1.delivered_messages() + c2.delivered_messages();
    assert_eq!(total, 3);
    assert!(c1.delivered_messages() == 3 || c2.delivered_messages() == 3);
}

#[tokio::test]
async fn unacked_limit_blocks_and_unblocks_at_half() {
    let config = DispatcherConfig {
        max_unacked_messages_per_subscription: 10,
        ..DispatcherConfig::default()
    };
    let (_ledger, _cursor, dispatcher) = setup(config);
    dispatcher.add_unacked_messages(10);
    assert!(dispatcher.is_blocked_on_unacked_messages());
    dispatcher.add_unacked_messages(-4);
    assert!(dispatcher.is_blocked_on_unacked_messages());
    dispatcher.add_unacked_messages(-2);
    assert!(!dispatcher.is_blocked_on_unacked_messages());
    assert_eq!(dispatcher.total_unacked_messages(), 4);
}

#[tokio::test]
async fn blocked_subscription_skips_normal_reads() {
    let config = DispatcherConfig {
        max_unacked_messages_per_subscription: 2,
        ..DispatcherConfig::default()
    };
    let (ledger, _cursor, dispatcher) = setup(config);
    publish(&ledger, 6);
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 10);
    // The whole first read goes out, then the subscription is over its limit.
    assert_eq!(receive(&mut rx, 6).await.len(), 6);
    settle().await;
    assert!(dispatcher.is_blocked_on_unacked_messages());
    assert!(!dispatcher.is_have_pending_read());

    ledger.append(Bytes::from_static(b"more"), EntryMetadata::default());
    dispatcher.read_more_entries();
    assert!(!dispatcher.is_have_pending_read());
}

#[tokio::test]
async fn ack_persistence_pause_blocks_and_resumes_normal_reads() {
    let config = DispatcherConfig {
        pause_on_ack_state_persistence: true,
        ..DispatcherConfig::default()
    };
    let (ledger, cursor, dispatcher) = setup(config);
    cursor.set_data_fully_persistable(false);
    dispatcher.after_ack_messages(None);
    assert!(dispatcher.is_blocked_on_ack_persistence());

    publish(&ledger, 1);
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 1);
    settle().await;
    assert!(!dispatcher.is_have_pending_read());

    cursor.set_data_fully_persistable(true);
    assert!(dispatcher.check_and_resume_if_paused());
    assert!(!dispatcher.is_blocked_on_ack_persistence());
    assert_eq!(receive(&mut rx, 1).await.len(), 1);
}

#[tokio::test]
async fn stuck_probe_kicks_a_read() {
    let (ledger, cursor, dispatcher) = setup(DispatcherConfig::default());
    publish(&ledger, 2);
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    // Permits granted without a flow notification: nothing asks for a read.
    consumer.add_permits(2);
    settle().await;
    assert_eq!(cursor.reads_issued(), 0);

    // First probe only records the read position.
    assert!(!dispatcher.check_and_unblock_if_stuck());
    assert!(dispatcher.check_and_unblock_if_stuck());
    assert_eq!(receive(&mut rx, 2).await.len(), 2);
}

#[tokio::test]
async fn transferring_topic_pauses_reads() {
    let (ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    publish(&ledger, 1);
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    dispatcher.set_transferring(true);
    grant(&dispatcher, &consumer, 1);
    settle().await;
    assert_eq!(dispatcher.read_more_entries_calls(), 0);

    dispatcher.set_transferring(false);
    assert_eq!(receive(&mut rx, 1).await.len(), 1);
}

#[tokio::test]
async fn first_consumer_rewinds_cursor() {
    let (ledger, cursor, dispatcher) = setup(DispatcherConfig::default());
    publish(&ledger, 3);
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 3);
    assert_eq!(receive(&mut rx, 3).await.len(), 3);
    settle().await;
    dispatcher.remove_consumer(consumer.as_ref());
    assert_eq!(cursor.read_position(), Position::new(1, 3));

    let (again, mut again_rx) = attach(&dispatcher, 2, ConsumerOptions::default());
    assert_eq!(cursor.read_position(), Position::EARLIEST);
    grant(&dispatcher, &again, 3);
    assert_eq!(receive(&mut again_rx, 3).await.len(), 3);
}

#[tokio::test]
async fn inline_send_mode_dispatches_without_executor_hop() {
    let config = DispatcherConfig {
        dispatch_in_subscription_thread: false,
        ..DispatcherConfig::default()
    };
    let (ledger, _cursor, dispatcher) = setup(config);
    publish(&ledger, 4);
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 4);
    assert_eq!(receive(&mut rx, 4).await.len(), 4);
    settle().await;
    assert!(!dispatcher.inner.state.lock().send_in_progress);
}

#[tokio::test]
async fn flow_from_unknown_consumer_is_ignored() {
    let (_ledger, _cursor, dispatcher) = setup(DispatcherConfig::default());
    dispatcher.consumer_flow(42, 100);
    assert_eq!(dispatcher.total_available_permits(), 0);
}

#[tokio::test]
async fn acknowledged_pending_acks_release_subscription_unacked_count() {
    let config = DispatcherConfig {
        max_unacked_messages_per_subscription: 2,
        ..DispatcherConfig::default()
    };
    let (ledger, cursor, dispatcher) = setup(config);
    let published = publish(&ledger, 3);
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 10);
    assert_eq!(receive(&mut rx, 3).await.len(), 3);
    settle().await;
    assert_eq!(dispatcher.total_unacked_messages(), 3);
    assert!(dispatcher.is_blocked_on_unacked_messages());

    cursor.acknowledge_up_to(published[2]);
    dispatcher.read_more_entries();
    assert_eq!(dispatcher.total_unacked_messages(), 0);
    assert_eq!(consumer.unacked_messages(), 0);
    assert!(!dispatcher.is_blocked_on_unacked_messages());

    let more = ledger.append(Bytes::from_static(b"more"), EntryMetadata::default());
    assert_eq!(receive(&mut rx, 1).await[0].position, more);
}

#[tokio::test]
async fn full_delayed_buffer_still_delivers_due_messages() {
    let clock = ManualClock::new(1_000);
    let ledger = MemoryLedger::new("topic");
    let cursor = ledger.open_cursor("sub");
    let dispatcher = Dispatcher::builder("sub", cursor.clone())
        .delayed_tracker_factory(Arc::new(
            InMemoryTrackerFactory::with_clock(clock.clone(), Duration::from_millis(10)).memory_limit(32),
        ))
        .build();
    let scheduled = ledger.append(
        Bytes::from_static(b"later"),
        EntryMetadata::default().with_deliver_at(2_000),
    );
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 5);
    settle().await;
    assert_eq!(dispatcher.number_of_delayed_messages(), 1);
    assert!(rx.try_recv().is_err());

    clock.set(5_000);
    dispatcher.read_more_entries();
    let delivered = receive(&mut rx, 1).await;
    assert_eq!(delivered[0].position, scheduled);
    assert_eq!(dispatcher.number_of_delayed_messages(), 0);
}

#[tokio::test]
async fn due_delayed_message_below_mark_delete_is_not_replayed() {
    let clock = ManualClock::new(1_000);
    let ledger = MemoryLedger::new("topic");
    let cursor = ledger.open_cursor("sub");
    let dispatcher = Dispatcher::builder("sub", cursor.clone())
        .delayed_tracker_factory(Arc::new(InMemoryTrackerFactory::with_clock(
            clock.clone(),
            Duration::from_millis(10),
        )))
        .build();
    let scheduled = ledger.append(
        Bytes::from_static(b"later"),
        EntryMetadata::default().with_deliver_at(60_000),
    );
    ledger.append(Bytes::from_static(b"now"), EntryMetadata::default());
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 5);
    assert_eq!(receive(&mut rx, 1).await.len(), 1);
    settle().await;
    assert_eq!(dispatcher.number_of_delayed_messages(), 1);

    cursor.acknowledge_up_to(scheduled);
    clock.set(60_000);
    let mut state = dispatcher.inner.state.lock();
    let replay = dispatcher.inner.messages_to_replay_now(&mut state, 10, u64::MAX);
    assert!(replay.is_empty(), "{replay:?}");
    assert!(state.redelivery.is_empty());
    drop(state);
    assert_eq!(dispatcher.number_of_delayed_messages(), 0);
}

#[tokio::test]
async fn vanished_consumer_rewinds_and_releases_read_entries() {
    let (ledger, cursor, dispatcher) = setup(DispatcherConfig::default());
    publish(&ledger, 3);
    let (inner, _rx) = ChannelConsumer::new(1, "c1", ConsumerOptions::default());
    let consumer = VanishingConsumer::new(inner.clone());
    dispatcher.add_consumer(consumer.clone()).expect("add consumer");
    let entries = cursor
        .read_entries_or_wait(ReadRequest::new(3, u64::MAX))
        .await
        .expect("read");
    assert_eq!(ledger.outstanding_entries(), 3);

    let mut state = dispatcher.inner.state.lock();
    inner.add_permits(3);
    // Available for the permit check, gone by the time a consumer is picked.
    consumer.connected_checks.store(1, Ordering::Release);
    dispatcher
        .inner
        .handle_sending_and_reading_more(&mut state, ReadKind::Normal, entries, true);
    drop(state);

    assert_eq!(ledger.outstanding_entries(), 0);
    assert_eq!(cursor.read_position(), Position::EARLIEST);
    assert_eq!(inner.delivered_messages(), 0);
}

#[tokio::test]
async fn leftover_entries_are_released_into_redelivery() {
    let (ledger, cursor, dispatcher) = setup(DispatcherConfig::default());
    let published = publish(&ledger, 5);
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    let entries = cursor
        .read_entries_or_wait(ReadRequest::new(5, u64::MAX))
        .await
        .expect("read");

    let mut state = dispatcher.inner.state.lock();
    consumer.add_permits(2);
    dispatcher
        .inner
        .handle_sending_and_reading_more(&mut state, ReadKind::Normal, entries, true);
    drop(state);

    assert_eq!(receive(&mut rx, 2).await.len(), 2);
    assert_eq!(dispatcher.messages_to_replay(), published[2..].to_vec());
    assert_eq!(ledger.outstanding_entries(), 0);
}

#[tokio::test]
async fn delayed_entries_are_released_once_tracked() {
    let clock = ManualClock::new(1_000);
    let ledger = MemoryLedger::new("topic");
    let cursor = ledger.open_cursor("sub");
    let dispatcher = Dispatcher::builder("sub", cursor.clone())
        .delayed_tracker_factory(Arc::new(InMemoryTrackerFactory::with_clock(
            clock.clone(),
            Duration::from_millis(10),
        )))
        .build();
    for _ in 0..3 {
        ledger.append(
            Bytes::from_static(b"later"),
            EntryMetadata::default().with_deliver_at(60_000),
        );
    }
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    grant(&dispatcher, &consumer, 5);
    settle().await;

    assert_eq!(dispatcher.number_of_delayed_messages(), 3);
    assert!(rx.try_recv().is_err());
    assert_eq!(ledger.outstanding_entries(), 0);
}

#[tokio::test]
async fn failed_replay_read_holds_no_entries() {
    let config = DispatcherConfig {
        read_failure_backoff_initial_ms: 60_000,
        read_failure_backoff_max_ms: 60_000,
        ..DispatcherConfig::default()
    };
    let (ledger, cursor, dispatcher) = setup(config);
    let published = publish(&ledger, 3);
    let (consumer, mut rx) = attach(&dispatcher, 1, ConsumerOptions::default());
    dispatcher.redeliver_positions(consumer.as_ref(), &published);
    settle().await;
    cursor.fail_next_replay(CursorError::Read("disk".into()));
    consumer.add_permits(5);
    dispatcher.read_more_entries();
    settle().await;

    assert!(!dispatcher.is_have_pending_replay_read());
    assert_eq!(dispatcher.messages_to_replay(), published);
    assert!(rx.try_recv().is_err());
    assert_eq!(ledger.outstanding_entries(), 0);

    // A replay that fails part way drops what it already read.
    let missing = Position::new(1, 99);
    {
        let mut state = dispatcher.inner.state.lock();
        dispatcher
            .inner
            .issue_replay_read(&mut state, vec![published[0], published[1], published[2], missing]);
    }
    settle().await;
    assert!(!dispatcher.is_have_pending_replay_read());
    assert!(rx.try_recv().is_err());
    assert_eq!(ledger.outstanding_entries(), 0);
}
