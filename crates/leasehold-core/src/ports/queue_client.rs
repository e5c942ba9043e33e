//! QueueClient port - ネイティブキュー（SQS）のクライアント
//!
//! ワイヤープロトコルの呼び出し（receive / send batch / delete / change visibility）
//! だけを表現する狭いインターフェースです。FIFO の `MessageGroupId` と
//! `MessageDeduplicationId` は呼び出し側（channel）が埋めます。
//!
//! # 実装
//! - **InMemoryQueueClient**: 開発・テスト用
//! - **AwsSqsClient**: `aws` feature

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Classify, ErrorKind};

/// Per-call ceiling on received / batched messages.
pub const SQS_MAX_MESSAGES: usize = 10;

/// Longest long-poll wait a receive call may request.
pub const SQS_MAX_WAIT_SECONDS: u64 = 20;

pub const ATTR_RECEIVE_COUNT: &str = "ApproximateReceiveCount";
pub const ATTR_GROUP_ID: &str = "MessageGroupId";

/// A message as the queue returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub max_messages: usize,
    pub wait_time: Duration,
    /// Lease length for the received messages; `None` keeps the queue default.
    pub visibility_timeout: Option<u32>,
    pub attribute_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEntry {
    pub id: String,
    pub body: String,
    pub group_id: Option<String>,
    pub dedup_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEntry {
    pub id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEntry {
    pub id: String,
    pub code: String,
    pub message: Option<String>,
    pub sender_fault: bool,
}

/// Native success/failure partition of one batch send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub successful: Vec<SentEntry>,
    pub failed: Vec<FailedEntry>,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.successful.extend(other.successful);
        self.failed.extend(other.failed);
    }
}

/// ClientError は SQS 呼び出しのエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("service error {code}: {message}")]
    Service { code: String, message: String },
}

impl ClientError {
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The receipt handle no longer addresses an in-flight message.
    pub fn is_receipt_expired(&self) -> bool {
        match self {
            ClientError::Service { code, message } => {
                code == "ReceiptHandleIsInvalid"
                    || code.ends_with("MessageNotInflight")
                    || message.to_ascii_lowercase().contains("receipt handle has expired")
            }
            _ => false,
        }
    }
}

impl Classify for ClientError {
    fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connection(_) | ClientError::Throttled(_) => ErrorKind::Transient,
            ClientError::Service { .. } if self.is_receipt_expired() => ErrorKind::Permanent,
            ClientError::Service { .. } => ErrorKind::Infrastructure,
        }
    }
}

/// QueueClient は SQS のワイヤー呼び出し
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn queue_url(&self, name: &str) -> Result<String, ClientError>;

    /// Long-poll for messages. An empty vec means nothing arrived within the wait.
    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<NativeMessage>, ClientError>;

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendEntry>,
    ) -> Result<BatchOutcome, ClientError>;

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), ClientError>;

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ClientError::service("ReceiptHandleIsInvalid", "bad handle"), true)]
    #[case(
        ClientError::service(
            "InvalidParameterValue",
            "Value rh-1 for parameter ReceiptHandle is invalid. Reason: The receipt handle has expired."
        ),
        true
    )]
    #[case(ClientError::service("AWS.SimpleQueueService.MessageNotInflight", "not in flight"), true)]
    #[case(ClientError::service("InvalidParameterValue", "visibility out of range"), false)]
    #[case(ClientError::Connection("reset".into()), false)]
    fn detects_expired_receipts(#[case] err: ClientError, #[case] expired: bool) {
        assert_eq!(err.is_receipt_expired(), expired);
    }

    #[test]
    fn classifies_errors() {
        assert_eq!(ClientError::Throttled("slow down".into()).kind(), ErrorKind::Transient);
        assert_eq!(ClientError::Connection("reset".into()).kind(), ErrorKind::Transient);
        assert_eq!(
            ClientError::service("ReceiptHandleIsInvalid", "x").kind(),
            ErrorKind::Permanent
        );
        assert_eq!(
            ClientError::service("InternalError", "x").kind(),
            ErrorKind::Infrastructure
        );
    }
}
