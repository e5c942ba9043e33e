//! Buffer - 完了したタスク結果のバッファリングと一括送信
//!
//! # フロー
//! 1. `store_result`: 結果レコードを作ってバッファへ（最初の書き込みが勝つ）
//! 2. バッファが `max_buffer_size` に達したらその場で drain
//! 3. それ以外は DrainScheduler が定期的に drain
//!
//! drain は「取り出してから送る」。送信に失敗したレコードはログを残して捨てます
//! （結果の配送は at-most-once）。

pub mod memory;
pub mod shared;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::channel::ChannelError;
use crate::domain::{JobId, ResultRecord, TaskRequest, TaskStatus};
use crate::ports::list_store::StoreError;
use crate::ports::queue_client::BatchOutcome;

pub use memory::InMemoryBuffer;
pub use shared::SharedListBuffer;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode buffered record: {0}")]
    Codec(#[from] serde_json::Error),
}

/// ResultBuffer は結果レコードの置き場所
///
/// 書き込みは多数、drain する読み手は 1 つを想定。
#[async_trait]
pub trait ResultBuffer: Send + Sync {
    /// Buffer `record` under `key`. `Ok(false)` when the key is already buffered.
    async fn add(&self, key: &JobId, record: ResultRecord) -> Result<bool, BufferError>;

    async fn len(&self) -> Result<usize, BufferError>;

    /// Remove and return up to `max` of the oldest records.
    async fn take(&self, max: usize) -> Result<Vec<ResultRecord>, BufferError>;
}

/// ResultSink は結果レコードをキューへ一括送信する
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn send_results(
        &self,
        queue: &str,
        records: &[ResultRecord],
    ) -> Result<BatchOutcome, ChannelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Buffered,
    /// A result for this job was already buffered; the new one is ignored.
    Duplicate,
    /// Every buffer attempt failed.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreReport {
    pub outcome: StoreOutcome,
    /// Set when the add filled the buffer and triggered a drain.
    pub drained: Option<DrainReport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub taken: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// ResultBackend は結果の保存フックと drain を提供する
pub struct ResultBackend {
    buffer: Arc<dyn ResultBuffer>,
    sink: Arc<dyn ResultSink>,
    queue: String,
    max_buffer_size: usize,
    store_attempts: u32,
}

impl ResultBackend {
    pub fn new(
        buffer: Arc<dyn ResultBuffer>,
        sink: Arc<dyn ResultSink>,
        queue: impl Into<String>,
        max_buffer_size: usize,
        store_attempts: u32,
    ) -> Self {
        Self {
            buffer,
            sink,
            queue: queue.into(),
            max_buffer_size: max_buffer_size.max(1),
            store_attempts: store_attempts.max(1),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Record the outcome of a finished task.
    pub async fn store_result(
        &self,
        job_id: &JobId,
        result: Value,
        status: TaskStatus,
        traceback: Option<String>,
        request: &TaskRequest,
    ) -> StoreReport {
        let record = ResultRecord::from_outcome(job_id, result, status, traceback, request);

        let mut outcome = StoreOutcome::Dropped;
        for attempt in 1..=self.store_attempts {
            match self.buffer.add(job_id, record.clone()).await {
                Ok(true) => {
                    outcome = StoreOutcome::Buffered;
                    break;
                }
                Ok(false) => {
                    tracing::debug!(%job_id, "result already buffered, keeping the first one");
                    outcome = StoreOutcome::Duplicate;
                    break;
                }
                Err(error) => {
                    tracing::warn!(%job_id, attempt, %error, "failed to buffer result");
                }
            }
        }
        if outcome == StoreOutcome::Dropped {
            tracing::error!(
                %job_id,
                attempts = self.store_attempts,
                "giving up on result, dropping it"
            );
        }

        let drained = if self.should_drain().await {
            Some(self.drain().await)
        } else {
            None
        };
        StoreReport { outcome, drained }
    }

    pub async fn should_drain(&self) -> bool {
        match self.buffer.len().await {
            Ok(len) => len >= self.max_buffer_size,
            Err(error) => {
                tracing::warn!(%error, "unable to read result buffer size");
                false
            }
        }
    }

    /// Take up to `max_buffer_size` records and send them in one bulk call.
    pub async fn drain(&self) -> DrainReport {
        let records = match self.buffer.take(self.max_buffer_size).await {
            Ok(records) => records,
            Err(error) => {
                tracing::error!(%error, "failed to take results from buffer");
                return DrainReport::default();
            }
        };
        if records.is_empty() {
            return DrainReport::default();
        }

        let taken = records.len();
        tracing::debug!(count = taken, queue = %self.queue, "draining results");

        match self.sink.send_results(&self.queue, &records).await {
            Ok(outcome) => {
                for failed in &outcome.failed {
                    let job_id = failed
                        .id
                        .parse::<usize>()
                        .ok()
                        .and_then(|idx| records.get(idx))
                        .map(|record| record.job_id.to_string())
                        .unwrap_or_default();
                    tracing::error!(
                        entry = %failed.id,
                        %job_id,
                        code = %failed.code,
                        message = failed.message.as_deref().unwrap_or_default(),
                        sender_fault = failed.sender_fault,
                        "result was not delivered"
                    );
                }
                tracing::info!(
                    delivered = outcome.successful.len(),
                    failed = outcome.failed.len(),
                    queue = %self.queue,
                    "drained results"
                );
                DrainReport {
                    taken,
                    delivered: outcome.successful.len(),
                    failed: outcome.failed.len(),
                }
            }
            Err(error) => {
                tracing::error!(%error, count = taken, queue = %self.queue, "failed to send results, discarding");
                for record in &records {
                    tracing::warn!(job_id = %record.job_id, task = %record.task_id, "discarded result");
                }
                DrainReport {
                    taken,
                    delivered: 0,
                    failed: taken,
                }
            }
        }
    }
}
