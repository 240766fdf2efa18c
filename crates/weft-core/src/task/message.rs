//! TaskMessage - the canonical job record stored in the `msg` field of a task hash.
//!
//! The encoding is JSON with an explicit `version` field. Processes running different
//! builds share the same keys, so fields are only ever added (with `#[serde(default)]`).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MESSAGE_VERSION: u32 = 1;

/// Used when a message carries neither a timeout nor a deadline.
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(default = "current_version")]
    pub version: u32,

    /// Handler name.
    pub kind: String,

    #[serde(with = "payload_base64", default)]
    pub payload: Vec<u8>,

    pub id: String,

    pub queue: String,

    /// Max retry budget.
    pub retry: u32,

    /// Failed attempts so far.
    #[serde(default)]
    pub retried: u32,

    #[serde(default)]
    pub error_msg: String,

    /// Unix seconds, 0 if never failed.
    #[serde(default)]
    pub last_failed_at: i64,

    /// Seconds, 0 if unset.
    #[serde(default)]
    pub timeout: i64,

    /// Unix seconds, 0 if unset.
    #[serde(default)]
    pub deadline: i64,

    /// Empty unless a uniqueness window was requested.
    #[serde(default)]
    pub unique_key: String,

    /// Seconds a completed record survives, 0 means delete on success.
    #[serde(default)]
    pub retention: i64,

    /// Unix seconds, 0 until completed.
    #[serde(default)]
    pub completed_at: i64,
}

fn current_version() -> u32 {
    MESSAGE_VERSION
}

impl TaskMessage {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>, id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            version: MESSAGE_VERSION,
            kind: kind.into(),
            payload,
            id: id.into(),
            queue: queue.into(),
            retry: 0,
            retried: 0,
            error_msg: String::new(),
            last_failed_at: 0,
            timeout: 0,
            deadline: 0,
            unique_key: String::new(),
            retention: 0,
            completed_at: 0,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let msg: TaskMessage = serde_json::from_slice(data)?;
        if msg.version > MESSAGE_VERSION {
            return Err(Error::Internal(format!(
                "unsupported message version {} (max {})",
                msg.version, MESSAGE_VERSION
            )));
        }
        Ok(msg)
    }

    /// Effective deadline: `min(now + timeout, deadline)`, whichever are set.
    pub fn effective_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let by_timeout = (self.timeout > 0).then(|| now + Duration::seconds(self.timeout));
        let by_deadline = (self.deadline > 0)
            .then(|| DateTime::<Utc>::from_timestamp(self.deadline, 0))
            .flatten();

        match (by_timeout, by_deadline) {
            (Some(t), Some(d)) => t.min(d),
            (Some(t), None) => t,
            (None, Some(d)) => d,
            (None, None) => {
                tracing::error!(task_id = %self.id, "both timeout and deadline are unset");
                now + Duration::from_std(DEFAULT_TIMEOUT).unwrap_or_else(|_| Duration::minutes(30))
            }
        }
    }

    /// TTL for a freshly written pending hash.
    pub(crate) fn hash_ttl_secs(&self, now: DateTime<Utc>) -> i64 {
        let until_deadline = if self.deadline > 0 { self.deadline - now.timestamp() } else { 0 };
        self.timeout.max(until_deadline)
    }

    pub fn has_unique_key(&self) -> bool {
        !self.unique_key.is_empty()
    }
}

mod payload_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
