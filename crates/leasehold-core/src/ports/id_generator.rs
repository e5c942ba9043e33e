//! IdGenerator port - ID 生成の抽象化
//!
//! FIFO キューに送るメッセージの `MessageDeduplicationId` は送信ごとに新しく
//! 発行します。同じ ID を使うとリトライしたバッチがキュー側で黙って捨てられるためです。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use ulid::Ulid;

use crate::domain::{MessageId, ReceiptHandle};

/// IdGenerator は分散システムで使える ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数スレッドから使える）
pub trait IdGenerator: Send + Sync {
    /// FIFO 送信用の deduplication ID を生成
    fn generate_dedup_id(&self) -> String;

    /// メッセージ ID を生成（in-memory キュー用）
    fn generate_message_id(&self) -> MessageId;

    /// receipt handle を生成（in-memory キュー用）
    fn generate_receipt(&self) -> ReceiptHandle;
}

/// UlidGenerator は ULID ベースの ID 生成器
#[derive(Debug, Clone, Copy, Default)]
pub struct UlidGenerator;

impl UlidGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_dedup_id(&self) -> String {
        Ulid::new().to_string()
    }

    fn generate_message_id(&self) -> MessageId {
        MessageId::new(Ulid::new().to_string())
    }

    fn generate_receipt(&self) -> ReceiptHandle {
        ReceiptHandle::new(format!("rh-{}", Ulid::new()))
    }
}
