// Local workload: a producer appending to an in-memory log and a pool of
// acknowledging consumers attached to one dispatcher.
use crate::config::ServiceConfig;
use anyhow::Result;
use bytes::Bytes;
use felix_dispatch::{ChannelConsumer, Consumer, ConsumerEvent, ConsumerOptions, Dispatcher};
use felix_storage::{EntryMetadata, MemoryCursor, MemoryLedger, Position};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// Upper bound on waiting for consumers to drain during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Workload {
    ledger: Arc<MemoryLedger>,
    cursor: Arc<MemoryCursor>,
    dispatcher: Dispatcher,
    consumers: Vec<Arc<ChannelConsumer>>,
    tasks: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl Workload {
    pub fn start(config: &ServiceConfig) -> Result<Self> {
        let ledger = MemoryLedger::new(config.topic.clone());
        let cursor = ledger.open_cursor(config.subscription.clone());
        let dispatcher = Dispatcher::new(
            config.subscription.clone(),
            cursor.clone(),
            config.dispatch.clone(),
        );
        let (stop, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut consumers = Vec::new();

        for index in 0..config.consumers {
            let id = u64::try_from(index)? + 1;
            let (consumer, rx) = ChannelConsumer::new(
                id,
                format!("{}-{id}", config.subscription),
                ConsumerOptions::default(),
            );
            dispatcher.add_consumer(consumer.clone())?;
            tasks.push(tokio::spawn(run_consumer(
                dispatcher.clone(),
                cursor.clone(),
                consumer.clone(),
                rx,
                config.receiver_queue_size,
            )));
            consumers.push(consumer);
        }

        tasks.push(tokio::spawn(run_producer(
            ledger.clone(),
            config.messages_per_entry,
            Duration::from_millis(config.publish_interval_ms),
            stop_rx.clone(),
        )));
        tasks.push(tokio::spawn(run_stuck_probe(
            dispatcher.clone(),
            Duration::from_millis(config.stuck_check_interval_ms),
            stop_rx,
        )));

        tracing::info!(
            topic = %config.topic,
            subscription = %config.subscription,
            consumers = config.consumers,
            "dispatcher workload started"
        );
        Ok(Self {
            ledger,
            cursor,
            dispatcher,
            consumers,
            tasks,
            stop,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    pub fn cursor(&self) -> &Arc<MemoryCursor> {
        &self.cursor
    }

    /// Stops publishing, closes the dispatcher and waits for every consumer to detach.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let closing = self.dispatcher.close(true);
        for consumer in &self.consumers {
            self.dispatcher.remove_consumer(consumer.as_ref());
        }
        if tokio::time::timeout(CLOSE_TIMEOUT, closing).await.is_err() {
            tracing::warn!(
                subscription = self.dispatcher.name(),
                "timed out waiting for dispatcher close"
            );
        }
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
        tracing::info!(
            subscription = self.dispatcher.name(),
            published = self.ledger.len(),
            "dispatcher workload stopped"
        );
    }
}

async fn run_producer(
    ledger: Arc<MemoryLedger>,
    messages_per_entry: u32,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut sequence = 0u64;
    loop {
        if *stop.borrow() {
            return;
        }
        let payload = Bytes::from(format!("event-{sequence}"));
        if ledger.try_append(payload, EntryMetadata::batch(messages_per_entry)).is_none() {
            tracing::info!(topic = ledger.name(), "topic terminated; producer exiting");
            return;
        }
        metrics::counter!("felix_dispatcher_published_total").increment(u64::from(messages_per_entry));
        sequence += 1;
        if interval.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => return,
        }
    }
}

// Plays a client session: acknowledges every batch and returns the permits.
async fn run_consumer(
    dispatcher: Dispatcher,
    cursor: Arc<MemoryCursor>,
    consumer: Arc<ChannelConsumer>,
    mut rx: mpsc::UnboundedReceiver<ConsumerEvent>,
    receiver_queue_size: u32,
) {
    consumer.add_permits(receiver_queue_size);
    dispatcher.consumer_flow(consumer.id(), receiver_queue_size);
    while let Some(event) = rx.recv().await {
        match event {
            ConsumerEvent::Messages(batch) => {
                let positions: Vec<Position> = batch.iter().map(|d| d.position).collect();
                let acked = consumer.acknowledge(&positions);
                cursor.acknowledge(&positions);
                dispatcher.add_unacked_messages(-i64::try_from(acked).unwrap_or(i64::MAX));
                dispatcher.after_ack_messages(None);
                metrics::counter!("felix_dispatcher_acked_total").increment(acked);
                // Permits are counted in messages, not entries.
                let permits = batch.iter().fold(0u32, |sum, d| sum.saturating_add(d.num_messages));
                consumer.add_permits(permits);
                dispatcher.consumer_flow(consumer.id(), permits);
            }
            ConsumerEvent::EndOfTopic => {
                tracing::info!(consumer = consumer.name(), "end of topic reached");
            }
            ConsumerEvent::Disconnected => break,
        }
    }
    tracing::debug!(consumer = consumer.name(), "consumer loop exited");
}

async fn run_stuck_probe(
    dispatcher: Dispatcher,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if dispatcher.check_and_unblock_if_stuck() {
                    tracing::warn!(subscription = dispatcher.name(), "unblocked stuck dispatcher");
                }
                metrics::gauge!("felix_dispatcher_unacked_messages")
                    .set(dispatcher.total_unacked_messages() as f64);
            }
            _ = stop.changed() => return,
        }
    }
}
