use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

// Dispatcher tuning sourced from environment variables with optional YAML overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    // Upper bound for the adaptive read batch.
    pub max_read_batch_size: usize,
    // Batch size after a failed read.
    pub min_read_batch_size: usize,
    // Max entries handed to one consumer per round-robin turn.
    pub max_round_robin_batch_size: usize,
    // Byte cap per cursor read.
    pub max_read_size_bytes: u64,
    pub read_failure_backoff_initial_ms: u64,
    pub read_failure_backoff_max_ms: u64,
    // Backoff when a dispatch round handed out nothing.
    pub retry_backoff_initial_ms: u64,
    pub retry_backoff_max_ms: u64,
    // Re-check delay when the rate limiter has no budget.
    pub rate_limit_backoff_ms: u64,
    pub delayed_delivery_enabled: bool,
    pub delayed_delivery_tick_ms: u64,
    // 0 means unlimited.
    pub max_consumers_per_subscription: usize,
    // 0 means unlimited.
    pub max_unacked_messages_per_subscription: u64,
    // Throttle reads even when the cursor is caught up.
    pub dispatch_throttling_on_non_backlog: bool,
    // Stop normal reads while acknowledgement state cannot be persisted.
    pub pause_on_ack_state_persistence: bool,
    // Run the send phase on the subscription executor instead of the read callback.
    pub dispatch_in_subscription_thread: bool,
}

pub const DEFAULT_MAX_READ_BATCH_SIZE: usize = 100;
pub const DEFAULT_MIN_READ_BATCH_SIZE: usize = 1;
pub const DEFAULT_MAX_ROUND_ROBIN_BATCH_SIZE: usize = 20;
pub const DEFAULT_MAX_READ_SIZE_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_READ_FAILURE_BACKOFF_INITIAL_MS: u64 = 15;
pub const DEFAULT_READ_FAILURE_BACKOFF_MAX_MS: u64 = 60_000;
pub const DEFAULT_RETRY_BACKOFF_INITIAL_MS: u64 = 1;
pub const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_DELAYED_DELIVERY_TICK_MS: u64 = 1_000;
pub const DEFAULT_MAX_UNACKED_MESSAGES_PER_SUBSCRIPTION: u64 = 200_000;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("read dispatcher config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse dispatcher config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Default, Deserialize)]
struct DispatcherConfigOverride {
    max_read_batch_size: Option<usize>,
    min_read_batch_size: Option<usize>,
    max_round_robin_batch_size: Option<usize>,
    max_read_size_bytes: Option<u64>,
    read_failure_backoff_initial_ms: Option<u64>,
    read_failure_backoff_max_ms: Option<u64>,
    retry_backoff_initial_ms: Option<u64>,
    retry_backoff_max_ms: Option<u64>,
    rate_limit_backoff_ms: Option<u64>,
    delayed_delivery_enabled: Option<bool>,
    delayed_delivery_tick_ms: Option<u64>,
    max_consumers_per_subscription: Option<usize>,
    max_unacked_messages_per_subscription: Option<u64>,
    dispatch_throttling_on_non_backlog: Option<bool>,
    pause_on_ack_state_persistence: Option<bool>,
    dispatch_in_subscription_thread: Option<bool>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_read_batch_size: DEFAULT_MAX_READ_BATCH_SIZE,
            min_read_batch_size: DEFAULT_MIN_READ_BATCH_SIZE,
            max_round_robin_batch_size: DEFAULT_MAX_ROUND_ROBIN_BATCH_SIZE,
            max_read_size_bytes: DEFAULT_MAX_READ_SIZE_BYTES,
            read_failure_backoff_initial_ms: DEFAULT_READ_FAILURE_BACKOFF_INITIAL_MS,
            read_failure_backoff_max_ms: DEFAULT_READ_FAILURE_BACKOFF_MAX_MS,
            retry_backoff_initial_ms: DEFAULT_RETRY_BACKOFF_INITIAL_MS,
            retry_backoff_max_ms: DEFAULT_RETRY_BACKOFF_MAX_MS,
            rate_limit_backoff_ms: DEFAULT_RATE_LIMIT_BACKOFF_MS,
            delayed_delivery_enabled: true,
            delayed_delivery_tick_ms: DEFAULT_DELAYED_DELIVERY_TICK_MS,
            max_consumers_per_subscription: 0,
            max_unacked_messages_per_subscription: DEFAULT_MAX_UNACKED_MESSAGES_PER_SUBSCRIPTION,
            dispatch_throttling_on_non_backlog: false,
            pause_on_ack_state_persistence: false,
            dispatch_in_subscription_thread: true,
        }
    }
}

fn env_positive<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
}

impl DispatcherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_read_batch_size = env_positive("FELIX_DISPATCH_MAX_READ_BATCH")
            .unwrap_or(defaults.max_read_batch_size);
        let min_read_batch_size = env_positive("FELIX_DISPATCH_MIN_READ_BATCH")
            .unwrap_or(defaults.min_read_batch_size);
        let max_round_robin_batch_size = env_positive("FELIX_DISPATCH_MAX_ROUND_ROBIN_BATCH")
            .unwrap_or(defaults.max_round_robin_batch_size);
        let max_read_size_bytes = env_positive("FELIX_DISPATCH_MAX_READ_BYTES")
            .unwrap_or(defaults.max_read_size_bytes);
        let read_failure_backoff_initial_ms =
            env_positive("FELIX_DISPATCH_READ_FAILURE_BACKOFF_INITIAL_MS")
                .unwrap_or(defaults.read_failure_backoff_initial_ms);
        let read_failure_backoff_max_ms = env_positive("FELIX_DISPATCH_READ_FAILURE_BACKOFF_MAX_MS")
            .unwrap_or(defaults.read_failure_backoff_max_ms);
        let retry_backoff_initial_ms = env_positive("FELIX_DISPATCH_RETRY_BACKOFF_INITIAL_MS")
            .unwrap_or(defaults.retry_backoff_initial_ms);
        let retry_backoff_max_ms = env_positive("FELIX_DISPATCH_RETRY_BACKOFF_MAX_MS")
            .unwrap_or(defaults.retry_backoff_max_ms);
        let rate_limit_backoff_ms = env_positive("FELIX_DISPATCH_RATE_LIMIT_BACKOFF_MS")
            .unwrap_or(defaults.rate_limit_backoff_ms);
        let delayed_delivery_enabled = env_flag("FELIX_DISPATCH_DELAYED_DELIVERY")
            .unwrap_or(defaults.delayed_delivery_enabled);
        let delayed_delivery_tick_ms = env_positive("FELIX_DISPATCH_DELAYED_TICK_MS")
            .unwrap_or(defaults.delayed_delivery_tick_ms);
        // Zero is meaningful for both limits.
        let max_consumers_per_subscription = env_number("FELIX_DISPATCH_MAX_CONSUMERS")
            .unwrap_or(defaults.max_consumers_per_subscription);
        let max_unacked_messages_per_subscription = env_number("FELIX_DISPATCH_MAX_UNACKED")
            .unwrap_or(defaults.max_unacked_messages_per_subscription);
        let dispatch_throttling_on_non_backlog = env_flag("FELIX_DISPATCH_THROTTLE_NON_BACKLOG")
            .unwrap_or(defaults.dispatch_throttling_on_non_backlog);
        let pause_on_ack_state_persistence = env_flag("FELIX_DISPATCH_PAUSE_ON_ACK_PERSIST")
            .unwrap_or(defaults.pause_on_ack_state_persistence);
        let dispatch_in_subscription_thread = env_flag("FELIX_DISPATCH_IN_SUBSCRIPTION_THREAD")
            .unwrap_or(defaults.dispatch_in_subscription_thread);
        Self {
            max_read_batch_size,
            min_read_batch_size,
            max_round_robin_batch_size,
            max_read_size_bytes,
            read_failure_backoff_initial_ms,
            read_failure_backoff_max_ms,
            retry_backoff_initial_ms,
            retry_backoff_max_ms,
            rate_limit_backoff_ms,
            delayed_delivery_enabled,
            delayed_delivery_tick_ms,
            max_consumers_per_subscription,
            max_unacked_messages_per_subscription,
            dispatch_throttling_on_non_backlog,
            pause_on_ack_state_persistence,
            dispatch_in_subscription_thread,
        }
        .normalized()
    }

    pub fn from_env_or_yaml() -> Result<Self, ConfigError> {
        let mut config = Self::from_env();
        if let Ok(path) = std::env::var("FELIX_DISPATCH_CONFIG") {
            let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: PathBuf::from(&path),
                source,
            })?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    /// Applies a YAML document on top of the current values. Absent keys are untouched.
    pub fn apply_yaml(&mut self, contents: &str) -> Result<(), ConfigError> {
        let override_cfg: DispatcherConfigOverride = serde_yaml::from_str(contents)?;
        if let Some(value) = override_cfg.max_read_batch_size.filter(|v| *v > 0) {
            self.max_read_batch_size = value;
        }
        if let Some(value) = override_cfg.min_read_batch_size.filter(|v| *v > 0) {
            self.min_read_batch_size = value;
        }
        if let Some(value) = override_cfg.max_round_robin_batch_size.filter(|v| *v > 0) {
            self.max_round_robin_batch_size = value;
        }
        if let Some(value) = override_cfg.max_read_size_bytes.filter(|v| *v > 0) {
            self.max_read_size_bytes = value;
        }
        if let Some(value) = override_cfg.read_failure_backoff_initial_ms.filter(|v| *v > 0) {
            self.read_failure_backoff_initial_ms = value;
        }
        if let Some(value) = override_cfg.read_failure_backoff_max_ms.filter(|v| *v > 0) {
            self.read_failure_backoff_max_ms = value;
        }
        if let Some(value) = override_cfg.retry_backoff_initial_ms.filter(|v| *v > 0) {
            self.retry_backoff_initial_ms = value;
        }
        if let Some(value) = override_cfg.retry_backoff_max_ms.filter(|v| *v > 0) {
            self.retry_backoff_max_ms = value;
        }
        if let Some(value) = override_cfg.rate_limit_backoff_ms.filter(|v| *v > 0) {
            self.rate_limit_backoff_ms = value;
        }
        if let Some(value) = override_cfg.delayed_delivery_enabled {
            self.delayed_delivery_enabled = value;
        }
        if let Some(value) = override_cfg.delayed_delivery_tick_ms.filter(|v| *v > 0) {
            self.delayed_delivery_tick_ms = value;
        }
        if let Some(value) = override_cfg.max_consumers_per_subscription {
            self.max_consumers_per_subscription = value;
        }
        if let Some(value) = override_cfg.max_unacked_messages_per_subscription {
            self.max_unacked_messages_per_subscription = value;
        }
        if let Some(value) = override_cfg.dispatch_throttling_on_non_backlog {
            self.dispatch_throttling_on_non_backlog = value;
        }
        if let Some(value) = override_cfg.pause_on_ack_state_persistence {
            self.pause_on_ack_state_persistence = value;
        }
        if let Some(value) = override_cfg.dispatch_in_subscription_thread {
            self.dispatch_in_subscription_thread = value;
        }
        *self = self.clone().normalized();
        Ok(())
    }

    // Keeps min <= max for the pairs that feed batch sizing and backoff.
    fn normalized(mut self) -> Self {
        self.min_read_batch_size = self.min_read_batch_size.min(self.max_read_batch_size);
        self.read_failure_backoff_max_ms = self
            .read_failure_backoff_max_ms
            .max(self.read_failure_backoff_initial_ms);
        self.retry_backoff_max_ms = self.retry_backoff_max_ms.max(self.retry_backoff_initial_ms);
        self
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }

    pub fn delayed_delivery_tick(&self) -> Duration {
        Duration::from_millis(self.delayed_delivery_tick_ms)
    }

    pub fn read_failure_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.read_failure_backoff_initial_ms),
            Duration::from_millis(self.read_failure_backoff_max_ms),
        )
    }

    pub fn retry_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.retry_backoff_initial_ms),
            Duration::from_millis(self.retry_backoff_max_ms),
        )
    }
}
