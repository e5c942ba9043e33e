//! ListStore port - 複数ワーカーで共有するリスト型ストア（Redis など）
//!
//! 共有結果バッファはこのポートの上に載ります。ストア側が
//! 「先頭 N 件の読み出し + ちょうどその範囲の trim」を atomic に提供することが前提です。
//!
//! # 実装
//! - **InMemoryListStore**: 開発・テスト用
//! - **RedisListStore**: `redis` feature（Lua の SADD + RPUSH、MULTI LRANGE / LTRIM）

use async_trait::async_trait;

use crate::error::{Classify, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store command failed: {0}")]
    Command(String),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Connection(_) => ErrorKind::Transient,
            StoreError::Command(_) => ErrorKind::Infrastructure,
        }
    }
}

#[async_trait]
pub trait ListStore: Send + Sync {
    /// Add `member` to `set` and, only when it was not there yet, append `value`
    /// to `list`. Both happen in one atomic step.
    ///
    /// `false` when `member` was already in `set`; `list` is then left untouched.
    async fn push_unique(&self, set: &str, member: &str, list: &str, value: String) -> Result<bool, StoreError>;

    /// SREM.
    async fn remove_members(&self, set: &str, members: &[String]) -> Result<(), StoreError>;

    /// RPUSH.
    async fn push_back(&self, list: &str, value: String) -> Result<(), StoreError>;

    /// LLEN.
    async fn len(&self, list: &str) -> Result<usize, StoreError>;

    /// Atomically read the oldest `count` items and trim exactly those off the list.
    ///
    /// Items appended concurrently stay in the list.
    async fn take_front(&self, list: &str, count: usize) -> Result<Vec<String>, StoreError>;
}
