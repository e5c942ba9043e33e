//! Lease - visibility timeout の延長
//!
//! 実行中タスクごとに経過時間を見て、キューの再配送期限を伸ばします。
//!
//! ```text
//! threshold   = EXTENSION_FACTOR * attempt * base_timeout
//! new_timeout = min((attempt + 1) * base_timeout, MAX_VISIBILITY_TIMEOUT)
//! ```

pub mod active;
pub mod controller;

use async_trait::async_trait;

use crate::domain::LeaseHandle;

pub use active::ActiveTasks;
pub use controller::{InFlightTask, TickOutcome, VisibilityController};

/// Upper bound the queue accepts for a visibility timeout (12h - 1s).
pub const MAX_VISIBILITY_TIMEOUT: u32 = 43_199;

/// Share of the current deadline that may elapse before the lease is extended.
pub const EXTENSION_FACTOR: f64 = 0.75;

/// RenewalError は visibility 変更 RPC の失敗分類
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenewalError {
    /// Connection or throttling; the next tick tries again.
    #[error("transient renewal failure: {0}")]
    Transient(String),

    /// The receipt no longer addresses an in-flight message.
    #[error("lease expired: {0}")]
    Expired(String),

    #[error("renewal failed: {0}")]
    Unknown(String),
}

/// LeaseRenewer は lease の延長 RPC を提供する
#[async_trait]
pub trait LeaseRenewer: Send + Sync {
    async fn change_visibility(
        &self,
        lease: &LeaseHandle,
        timeout_secs: u32,
    ) -> Result<(), RenewalError>;
}

/// Visibility timeout requested for extension number `attempt`.
pub fn extended_timeout(attempt: u32, base_timeout: u32) -> u32 {
    attempt
        .saturating_mul(base_timeout)
        .min(MAX_VISIBILITY_TIMEOUT)
}
