use anyhow::{Context, Result};
use felix_dispatch::DispatcherConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Dispatcher service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Topic the local workload publishes to.
    pub topic: String,
    // Subscription the dispatcher serves.
    pub subscription: String,
    // Competing consumers attached to the subscription.
    pub consumers: usize,
    // Permits each consumer grants at a time.
    pub receiver_queue_size: u32,
    // Delay between published messages; 0 publishes as fast as possible.
    pub publish_interval_ms: u64,
    // Messages per published entry.
    pub messages_per_entry: u32,
    // Interval of the stuck-dispatch probe.
    pub stuck_check_interval_ms: u64,
    pub dispatch: DispatcherConfig,
}

const DEFAULT_CONSUMERS: usize = 2;
const DEFAULT_RECEIVER_QUEUE_SIZE: u32 = 1000;
const DEFAULT_PUBLISH_INTERVAL_MS: u64 = 10;
const DEFAULT_STUCK_CHECK_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Deserialize)]
struct ServiceConfigOverride {
    metrics_bind: Option<String>,
    topic: Option<String>,
    subscription: Option<String>,
    consumers: Option<usize>,
    receiver_queue_size: Option<u32>,
    publish_interval_ms: Option<u64>,
    messages_per_entry: Option<u32>,
    stuck_check_interval_ms: Option<u64>,
    // Same keys as the dispatcher's own YAML file.
    dispatch: Option<serde_yaml::Value>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_bind = std::env::var("FELIX_DISPATCHER_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string())
            .parse()
            .with_context(|| "parse FELIX_DISPATCHER_METRICS_BIND")?;
        let topic = std::env::var("FELIX_DISPATCHER_TOPIC")
            .unwrap_or_else(|_| "persistent://public/default/events".to_string());
        let subscription = std::env::var("FELIX_DISPATCHER_SUBSCRIPTION")
            .unwrap_or_else(|_| "workers".to_string());
        let consumers = std::env::var("FELIX_DISPATCHER_CONSUMERS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_CONSUMERS);
        let receiver_queue_size = std::env::var("FELIX_DISPATCHER_RECEIVER_QUEUE")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_RECEIVER_QUEUE_SIZE);
        let publish_interval_ms = std::env::var("FELIX_DISPATCHER_PUBLISH_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_PUBLISH_INTERVAL_MS);
        let messages_per_entry = std::env::var("FELIX_DISPATCHER_MESSAGES_PER_ENTRY")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(1);
        let stuck_check_interval_ms = std::env::var("FELIX_DISPATCHER_STUCK_CHECK_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STUCK_CHECK_INTERVAL_MS);
        let dispatch =
            DispatcherConfig::from_env_or_yaml().with_context(|| "load dispatcher config")?;
        Ok(Self {
            metrics_bind,
            topic,
            subscription,
            consumers,
            receiver_queue_size,
            publish_interval_ms,
            messages_per_entry,
            stuck_check_interval_ms,
            dispatch,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("FELIX_DISPATCHER_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read FELIX_DISPATCHER_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: ServiceConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse dispatcher service yaml")?;
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.topic {
            self.topic = value;
        }
        if let Some(value) = override_cfg.subscription {
            self.subscription = value;
        }
        if let Some(value) = override_cfg.consumers.filter(|value| *value > 0) {
            self.consumers = value;
        }
        if let Some(value) = override_cfg.receiver_queue_size.filter(|value| *value > 0) {
            self.receiver_queue_size = value;
        }
        if let Some(value) = override_cfg.publish_interval_ms {
            self.publish_interval_ms = value;
        }
        if let Some(value) = override_cfg.messages_per_entry.filter(|value| *value > 0) {
            self.messages_per_entry = value;
        }
        if let Some(value) = override_cfg.stuck_check_interval_ms.filter(|value| *value > 0) {
            self.stuck_check_interval_ms = value;
        }
        if let Some(value) = override_cfg.dispatch {
            let section = serde_yaml::to_string(&value).with_context(|| "render dispatch section")?;
            self.dispatch
                .apply_yaml(&section)
                .with_context(|| "apply dispatch section")?;
        }
        Ok(())
    }
}
