//! Configuration structs.
//!
//! Plain serde structs with defaults; durations are written as whole seconds.
//! Loading them (flags, env, files) is the binary's job.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::keys::DEFAULT_KEY_PREFIX;
use crate::task::DEFAULT_QUEUE;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    pub key_prefix: String,
    /// Attempts made by `RedisBroker::connect_with_retry` before giving up.
    pub connect_attempts: u32,
    #[serde(with = "secs")]
    pub connect_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".into(),
            key_prefix: DEFAULT_KEY_PREFIX.into(),
            connect_attempts: 3,
            connect_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Max tasks processed at once; 0 means the number of CPUs.
    pub concurrency: usize,
    /// Queue name -> priority weight.
    pub queues: BTreeMap<String, u32>,
    /// Always drain higher-weight queues first instead of weighted-random order.
    pub strict_priority: bool,
    #[serde(with = "secs")]
    pub shutdown_timeout: Duration,
    #[serde(with = "secs")]
    pub forwarder_interval: Duration,
    #[serde(with = "secs")]
    pub janitor_interval: Duration,
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "secs")]
    pub heartbeat_ttl: Duration,
    /// Back-off after a dequeue that found nothing.
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Reported in presence records; defaults to `$HOSTNAME`.
    pub host: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            queues: BTreeMap::from([(DEFAULT_QUEUE.to_string(), 1)]),
            strict_priority: false,
            shutdown_timeout: Duration::from_secs(8),
            forwarder_interval: Duration::from_secs(5),
            janitor_interval: Duration::from_secs(8),
            heartbeat_interval: Duration::from_secs(3),
            heartbeat_ttl: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            host: None,
        }
    }
}

impl ServerConfig {
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency > 0 {
            return self.concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn effective_host(&self) -> String {
        self.host
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "secs")]
    pub heartbeat_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_ttl: Duration::from_secs(10),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
