//! IdGenerator port - ID 生成の抽象化
//!
//! タスク ID は UUID（[`crate::task::TaskOption::TaskId`] で上書き可）。
//! ここで生成するのはプロセス側の識別子: server ID、scheduler ID、scheduler entry ID。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（時刻でソート可能）

use ulid::Ulid;

use crate::ports::Clock;

/// IdGenerator は分散システムで使える ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数スレッドから使える）
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate(&self) -> String {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random()).to_string()
    }
}
