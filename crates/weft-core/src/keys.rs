//! Redis key schema.
//!
//! Per-queue keys look like `{<prefix>}:{<queue>}:<suffix>`. The first brace pair is the
//! cluster hash tag, so every key a script touches lands in the same slot.
//! Presence keys are global: `<prefix>:servers:{host:pid:sid}` and friends, each indexed by
//! a sorted set scored with its expiration time.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

pub const DEFAULT_KEY_PREFIX: &str = "bmw";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn queue_prefix(&self, queue: &str) -> String {
        format!("{{{}}}:{{{}}}:", self.prefix, queue)
    }

    pub fn task_prefix(&self, queue: &str) -> String {
        format!("{}t:", self.queue_prefix(queue))
    }

    pub fn task(&self, queue: &str, id: &str) -> String {
        format!("{}{}", self.task_prefix(queue), id)
    }

    pub fn pending(&self, queue: &str) -> String {
        self.suffixed(queue, "pending")
    }

    pub fn active(&self, queue: &str) -> String {
        self.suffixed(queue, "active")
    }

    pub fn scheduled(&self, queue: &str) -> String {
        self.suffixed(queue, "scheduled")
    }

    pub fn retry(&self, queue: &str) -> String {
        self.suffixed(queue, "retry")
    }

    pub fn archived(&self, queue: &str) -> String {
        self.suffixed(queue, "archived")
    }

    pub fn completed(&self, queue: &str) -> String {
        self.suffixed(queue, "completed")
    }

    pub fn lease(&self, queue: &str) -> String {
        self.suffixed(queue, "lease")
    }

    pub fn paused(&self, queue: &str) -> String {
        self.suffixed(queue, "paused")
    }

    pub fn processed_total(&self, queue: &str) -> String {
        self.suffixed(queue, "processed")
    }

    pub fn failed_total(&self, queue: &str) -> String {
        self.suffixed(queue, "failed")
    }

    /// Daily counter, keyed by the UTC date.
    pub fn processed(&self, queue: &str, at: DateTime<Utc>) -> String {
        format!("{}processed:{}", self.queue_prefix(queue), at.format("%Y-%m-%d"))
    }

    pub fn failed(&self, queue: &str, at: DateTime<Utc>) -> String {
        format!("{}failed:{}", self.queue_prefix(queue), at.format("%Y-%m-%d"))
    }

    /// Uniqueness lock key: queue + kind + md5 of the payload.
    pub fn unique(&self, queue: &str, kind: &str, payload: &[u8]) -> String {
        if payload.is_empty() {
            return format!("{}unique:{}:", self.queue_prefix(queue), kind);
        }
        format!(
            "{}unique:{}:{:x}",
            self.queue_prefix(queue),
            kind,
            md5::compute(payload)
        )
    }

    pub fn all_queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    pub fn all_servers(&self) -> String {
        format!("{}:servers", self.prefix)
    }

    pub fn all_workers(&self) -> String {
        format!("{}:workers", self.prefix)
    }

    pub fn all_schedulers(&self) -> String {
        format!("{}:schedulers", self.prefix)
    }

    pub fn server_info(&self, host: &str, pid: u32, server_id: &str) -> String {
        format!("{}:servers:{{{}:{}:{}}}", self.prefix, host, pid, server_id)
    }

    pub fn workers(&self, host: &str, pid: u32, server_id: &str) -> String {
        format!("{}:workers:{{{}:{}:{}}}", self.prefix, host, pid, server_id)
    }

    pub fn scheduler_entries(&self, scheduler_id: &str) -> String {
        format!("{}:schedulers:{{{}}}", self.prefix, scheduler_id)
    }

    pub fn scheduler_history(&self, entry_id: &str) -> String {
        format!("{}:scheduler_history:{}", self.prefix, entry_id)
    }

    fn suffixed(&self, queue: &str, suffix: &str) -> String {
        format!("{}{}", self.queue_prefix(queue), suffix)
    }
}

pub fn validate_queue_name(queue: &str) -> Result<()> {
    if queue.trim().is_empty() {
        return Err(Error::InvalidOption("queue name must contain one or more characters".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case::pending(KeySpace::pending, "{bmw}:{default}:pending")]
    #[case::active(KeySpace::active, "{bmw}:{default}:active")]
    #[case::scheduled(KeySpace::scheduled, "{bmw}:{default}:scheduled")]
    #[case::retry(KeySpace::retry, "{bmw}:{default}:retry")]
    #[case::archived(KeySpace::archived, "{bmw}:{default}:archived")]
    #[case::completed(KeySpace::completed, "{bmw}:{default}:completed")]
    #[case::lease(KeySpace::lease, "{bmw}:{default}:lease")]
    #[case::paused(KeySpace::paused, "{bmw}:{default}:paused")]
    fn queue_keys(#[case] key: fn(&KeySpace, &str) -> String, #[case] want: &str) {
        assert_eq!(key(&KeySpace::default(), "default"), want);
    }

    #[test]
    fn task_and_stats_keys() {
        let keys = KeySpace::new("app");
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 0).unwrap();

        assert_eq!(keys.task("critical", "abc"), "{app}:{critical}:t:abc");
        assert_eq!(keys.processed("critical", at), "{app}:{critical}:processed:2024-03-09");
        assert_eq!(keys.failed("critical", at), "{app}:{critical}:failed:2024-03-09");
        assert_eq!(keys.processed_total("critical"), "{app}:{critical}:processed");
    }

    #[test]
    fn unique_key_hashes_payload() {
        let keys = KeySpace::default();
        assert_eq!(
            keys.unique("default", "email", b"hello"),
            "{bmw}:{default}:unique:email:5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(keys.unique("default", "email", b""), "{bmw}:{default}:unique:email:");
    }

    #[test]
    fn presence_keys() {
        let keys = KeySpace::default();
        assert_eq!(keys.server_info("host", 42, "sid"), "bmw:servers:{host:42:sid}");
        assert_eq!(keys.workers("host", 42, "sid"), "bmw:workers:{host:42:sid}");
        assert_eq!(keys.scheduler_entries("s1"), "bmw:schedulers:{s1}");
        assert_eq!(keys.scheduler_history("e1"), "bmw:scheduler_history:e1");
    }

    #[rstest]
    #[case::empty("", false)]
    #[case::blank("   ", false)]
    #[case::ok("default", true)]
    fn queue_name_validation(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_queue_name(name).is_ok(), ok);
    }
}
