// Subscription dispatch engine.
// A dispatcher reads from a managed cursor and spreads entries across the
// competing consumers of one subscription, with redelivery, delayed delivery,
// rate limiting and chunk-aware assignment.
pub mod assignor;
pub mod backoff;
pub mod config;
pub mod consumer;
pub mod delayed;
pub mod dispatcher;
pub mod executor;
pub mod policy;
pub mod rate_limit;
pub mod redelivery;

pub use assignor::{Assignment, ChunkAwareAssignor, ConsumerAssignment};
pub use backoff::Backoff;
pub use config::{ConfigError, DispatcherConfig};
pub use consumer::{
    ChannelConsumer, Consumer, ConsumerEvent, ConsumerId, ConsumerOptions, Delivery, PendingAck,
    SendBatch, SendError,
};
pub use delayed::{
    Clock, DelayedDeliveryTracker, DelayedDeliveryTrackerFactory, InMemoryDelayedDeliveryTracker,
    InMemoryTrackerFactory, ManualClock, SystemClock,
};
pub use dispatcher::{
    DispatchError, Dispatcher, DispatcherBuilder, ReadKind, max_entries_in_this_batch,
};
pub use executor::OrderedExecutor;
pub use policy::{DispatchPolicy, KeyedPolicy, ReplayFilter, SharedPolicy};
pub use rate_limit::{DispatchRateLimiter, TokenBucketRateLimiter};
pub use redelivery::{RedeliveryCounts, RedeliveryMode, RedeliveryTracker};

pub type Result<T> = std::result::Result<T, DispatchError>;
