//! Task options - enqueue 時の設定を合成する
//!
//! `TaskOption` を並べて `ResolvedOptions::resolve` に渡すと、
//! 後ろのものが前のものを上書きする形で 1 つの設定にまとまる。
//! （タスク定義側の option → 呼び出し側の option の順に渡す）
//!
//! # デフォルト
//! - retry = 10
//! - queue = "default"
//! - task ID = UUID v4
//! - process-at = now

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::keys::validate_queue_name;

pub const DEFAULT_MAX_RETRY: u32 = 10;
pub const DEFAULT_QUEUE: &str = "default";

/// 1 つの設定項目
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOption {
    MaxRetry(u32),
    Queue(String),
    Timeout(Duration),
    Deadline(DateTime<Utc>),
    /// Uniqueness window; must be at least one second.
    Unique(Duration),
    TaskId(String),
    ProcessAt(DateTime<Utc>),
    ProcessAfter(Duration),
    Retention(Duration),
}

/// Option の種類（重複判定用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionType {
    MaxRetry,
    Queue,
    Timeout,
    Deadline,
    Unique,
    TaskId,
    ProcessAt,
    ProcessAfter,
    Retention,
}

impl TaskOption {
    pub fn option_type(&self) -> OptionType {
        match self {
            TaskOption::MaxRetry(_) => OptionType::MaxRetry,
            TaskOption::Queue(_) => OptionType::Queue,
            TaskOption::Timeout(_) => OptionType::Timeout,
            TaskOption::Deadline(_) => OptionType::Deadline,
            TaskOption::Unique(_) => OptionType::Unique,
            TaskOption::TaskId(_) => OptionType::TaskId,
            TaskOption::ProcessAt(_) => OptionType::ProcessAt,
            TaskOption::ProcessAfter(_) => OptionType::ProcessAfter,
            TaskOption::Retention(_) => OptionType::Retention,
        }
    }
}

/// scheduler entry に書き出す文字列表現
impl fmt::Display for TaskOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOption::MaxRetry(n) => write!(f, "MaxRetry({n})"),
            TaskOption::Queue(q) => write!(f, "Queue({q:?})"),
            TaskOption::Timeout(d) => write!(f, "Timeout({d:?})"),
            TaskOption::Deadline(t) => write!(f, "Deadline({})", t.to_rfc3339()),
            TaskOption::Unique(d) => write!(f, "Unique({d:?})"),
            TaskOption::TaskId(id) => write!(f, "TaskID({id:?})"),
            TaskOption::ProcessAt(t) => write!(f, "ProcessAt({})", t.to_rfc3339()),
            TaskOption::ProcessAfter(d) => write!(f, "ProcessAfter({d:?})"),
            TaskOption::Retention(d) => write!(f, "Retention({d:?})"),
        }
    }
}

/// 合成済みの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub max_retry: u32,
    pub queue: String,
    pub task_id: String,
    pub timeout: Option<Duration>,
    pub deadline: Option<DateTime<Utc>>,
    pub unique_ttl: Option<Duration>,
    pub process_at: DateTime<Utc>,
    pub retention: Option<Duration>,
}

impl ResolvedOptions {
    /// Fold `opts` over the defaults; later options win.
    pub fn resolve<'a>(
        opts: impl IntoIterator<Item = &'a TaskOption>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut res = Self {
            max_retry: DEFAULT_MAX_RETRY,
            queue: DEFAULT_QUEUE.to_string(),
            task_id: uuid::Uuid::new_v4().to_string(),
            timeout: None,
            deadline: None,
            unique_ttl: None,
            process_at: now,
            retention: None,
        };

        for opt in opts {
            match opt {
                TaskOption::MaxRetry(n) => res.max_retry = *n,
                TaskOption::Queue(q) => {
                    validate_queue_name(q)?;
                    res.queue = q.clone();
                }
                TaskOption::Timeout(d) => res.timeout = Some(*d),
                TaskOption::Deadline(t) => res.deadline = Some(*t),
                TaskOption::Unique(ttl) => {
                    if *ttl < Duration::from_secs(1) {
                        return Err(Error::InvalidOption(
                            "Unique TTL cannot be less than 1s".into(),
                        ));
                    }
                    res.unique_ttl = Some(*ttl);
                }
                TaskOption::TaskId(id) => {
                    if id.trim().is_empty() {
                        return Err(Error::InvalidOption("task ID cannot be empty".into()));
                    }
                    res.task_id = id.clone();
                }
                TaskOption::ProcessAt(t) => res.process_at = *t,
                TaskOption::ProcessAfter(d) => {
                    let d = chrono::Duration::from_std(*d)
                        .map_err(|e| Error::InvalidOption(format!("ProcessAfter: {e}")))?;
                    res.process_at = now + d;
                }
                TaskOption::Retention(d) => res.retention = Some(*d),
            }
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn defaults() {
        let res = ResolvedOptions::resolve(&[], now()).unwrap();
        assert_eq!(res.max_retry, 10);
        assert_eq!(res.queue, "default");
        assert_eq!(res.process_at, now());
        assert!(uuid::Uuid::parse_str(&res.task_id).is_ok());
        assert_eq!(res.timeout, None);
        assert_eq!(res.unique_ttl, None);
    }

    #[test]
    fn later_options_override_earlier_ones() {
        let opts = [
            TaskOption::Queue("low".into()),
            TaskOption::MaxRetry(3),
            TaskOption::Queue("critical".into()),
            TaskOption::ProcessAfter(Duration::from_secs(30)),
        ];
        let res = ResolvedOptions::resolve(&opts, now()).unwrap();
        assert_eq!(res.queue, "critical");
        assert_eq!(res.max_retry, 3);
        assert_eq!(res.process_at, now() + chrono::Duration::seconds(30));
    }

    #[rstest]
    #[case::short_ttl(TaskOption::Unique(Duration::from_millis(999)))]
    #[case::blank_queue(TaskOption::Queue("  ".into()))]
    #[case::blank_id(TaskOption::TaskId(String::new()))]
    fn invalid_options_are_rejected(#[case] opt: TaskOption) {
        let err = ResolvedOptions::resolve(&[opt], now()).unwrap_err();
        assert!(matches!(err, Error::InvalidOption(_)));
    }

    #[test]
    fn one_second_ttl_is_accepted() {
        let res = ResolvedOptions::resolve(&[TaskOption::Unique(Duration::from_secs(1))], now()).unwrap();
        assert_eq!(res.unique_ttl, Some(Duration::from_secs(1)));
    }

    #[rstest]
    #[case::retry(TaskOption::MaxRetry(2), "MaxRetry(2)")]
    #[case::queue(TaskOption::Queue("q".into()), "Queue(\"q\")")]
    #[case::timeout(TaskOption::Timeout(Duration::from_secs(10)), "Timeout(10s)")]
    #[case::id(TaskOption::TaskId("x".into()), "TaskID(\"x\")")]
    fn options_render_for_scheduler_entries(#[case] opt: TaskOption, #[case] want: &str) {
        assert_eq!(opt.to_string(), want);
    }
}
