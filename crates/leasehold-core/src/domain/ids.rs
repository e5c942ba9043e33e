//! Domain identifiers (strongly-typed IDs).
//!
//! ## Phantom Type パターン
//! `Id<T>` というジェネリック型で共通実装を提供しつつ、
//! `T` は実行時には使わない（PhantomData）マーカー型として、
//! コンパイル時の型安全性を提供します。
//!
//! 値そのものはキュー側・フレームワーク側が発行する不透明な文字列です
//! （SQS の MessageId、ReceiptHandle、タスクの実行 ID）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// ログ出力で使う種別名（例: "job", "message"）
    fn kind() -> &'static str;
}

/// ジェネリック ID 型
///
/// ```ignore
/// let job_id = JobId::new("8c1f...");
/// let message_id = MessageId::new("m-1");
/// // job_id と message_id は異なる型なので、混同できない
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn into_inner(self) -> String {
        self.value
    }

    pub fn kind(&self) -> &'static str {
        T::kind()
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// タスク実行（ジョブ）のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn kind() -> &'static str {
        "job"
    }
}

/// キューメッセージのマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn kind() -> &'static str {
        "message"
    }
}

/// 受信ごとに発行される receipt のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Receipt {}

impl IdMarker for Receipt {
    fn kind() -> &'static str {
        "receipt"
    }
}

/// Identifier of one task execution (the framework's task id).
pub type JobId = Id<Job>;

/// Identifier the queue assigned to a message.
pub type MessageId = Id<Message>;

/// Token addressing one delivery of a message; invalid once the lease expires.
pub type ReceiptHandle = Id<Receipt>;
