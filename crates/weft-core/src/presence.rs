//! Presence / audit records: server and worker heartbeats, scheduler entries and
//! scheduler enqueue history. All are JSON-encoded and TTL'd in the broker.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub host: String,
    pub pid: u32,
    pub server_id: String,
    pub concurrency: usize,
    pub queues: BTreeMap<String, u32>,
    pub strict_priority: bool,
    pub status: ServerStatus,
    pub started: DateTime<Utc>,
    pub active_worker_count: usize,
}

/// One in-flight task of a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub host: String,
    pub pid: u32,
    pub server_id: String,
    pub task_id: String,
    pub kind: String,
    pub queue: String,
    pub started: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// What a scheduler believes it should be running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerEntry {
    pub id: String,
    pub spec: String,
    pub kind: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    pub opts: Vec<String>,
    pub next: DateTime<Utc>,
    pub prev: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerEnqueueEvent {
    pub task_id: String,
    pub enqueued_at: DateTime<Utc>,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn server_info_survives_encoding() {
        let info = ServerInfo {
            host: "worker-1".into(),
            pid: 4242,
            server_id: "01HZX".into(),
            concurrency: 8,
            queues: BTreeMap::from([("critical".into(), 6), ("default".into(), 3)]),
            strict_priority: false,
            status: ServerStatus::Active,
            started: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            active_worker_count: 2,
        };
        let back: ServerInfo = decode(encode(&info).unwrap().as_bytes()).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn scheduler_entry_without_prev() {
        let raw = br#"{"id":"e1","spec":"*/5 * * * *","kind":"k","opts":[],"next":"2024-01-01T00:05:00Z","prev":null}"#;
        let entry: SchedulerEntry = decode(raw).unwrap();
        assert_eq!(entry.prev, None);
        assert!(entry.payload.is_empty());
    }
}
