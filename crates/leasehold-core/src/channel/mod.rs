//! Channel - キュー RPC のトランスポート
//!
//! # 責務
//! - `bulk_receive`: long-poll で prefetch 枠の範囲だけ受信し、envelope に変換
//! - `bulk_send`: 結果レコードを 10 件ずつのバッチで送信
//! - `ack` / `reject`: delete / visibility 0 への対応付け
//! - `change_visibility`: lease 延長 RPC（[`LeaseRenewer`]）
//!
//! 受信済み・未 ack の receipt を覚えておき、その数を次の receive の上限に使います。
//! 同じ receipt を 2 回 settle しても枠は 1 回しか戻りません。

pub mod adapter;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::buffer::ResultSink;
use crate::config::BrokerConfig;
use crate::domain::{Envelope, LeaseHandle, ResultRecord};
use crate::error::{Classify, ErrorKind};
use crate::lease::{LeaseRenewer, RenewalError};
use crate::ports::id_generator::IdGenerator;
use crate::ports::queue_client::{
    ATTR_GROUP_ID, ATTR_RECEIVE_COUNT, BatchOutcome, ClientError, FailedEntry, QueueClient,
    ReceiveRequest, SQS_MAX_MESSAGES,
};

pub use adapter::{AdapterError, decode_request, is_fifo, to_protocol_v1};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("queue '{0}' must be defined in predefined_queues")]
    UndefinedQueue(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl Classify for ChannelError {
    fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::UndefinedQueue(_) | ChannelError::Adapter(_) => ErrorKind::Permanent,
            ChannelError::Client(error) => error.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub wait_time: Duration,
    /// Lease length requested on receive.
    pub visibility_timeout: Option<u32>,
    /// Most deliveries this channel holds unacknowledged at once.
    pub prefetch: usize,
    /// Queue name -> url. When non-empty, no other queue may be used.
    pub predefined_queues: BTreeMap<String, String>,
}

impl ChannelOptions {
    pub fn from_config(broker: &BrokerConfig) -> Self {
        Self {
            wait_time: broker.wait_time(),
            visibility_timeout: Some(broker.visibility_timeout),
            prefetch: broker.concurrency,
            predefined_queues: broker.predefined_urls(),
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

pub struct Channel {
    client: Arc<dyn QueueClient>,
    ids: Arc<dyn IdGenerator>,
    options: ChannelOptions,
    url_cache: RwLock<HashMap<String, String>>,
    outstanding: Mutex<HashSet<String>>,
}

impl Channel {
    pub fn new(client: Arc<dyn QueueClient>, ids: Arc<dyn IdGenerator>, options: ChannelOptions) -> Self {
        Self {
            client,
            ids,
            options,
            url_cache: RwLock::new(HashMap::new()),
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Deliveries handed out and not yet acked, rejected or abandoned.
    pub fn unacked(&self) -> usize {
        self.outstanding().len()
    }

    /// Queue name (or url) -> url.
    pub async fn resolve_queue(&self, queue: &str) -> Result<String, ChannelError> {
        if queue.contains("://") {
            return Ok(queue.to_string());
        }
        if !self.options.predefined_queues.is_empty() {
            return self
                .options
                .predefined_queues
                .get(queue)
                .cloned()
                .ok_or_else(|| ChannelError::UndefinedQueue(queue.to_string()));
        }
        if let Some(url) = self
            .url_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
        {
            return Ok(url.clone());
        }

        let url = self.client.queue_url(queue).await?;
        self.url_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_string(), url.clone());
        Ok(url)
    }

    /// Receive up to `max` messages, bounded by the remaining prefetch budget.
    ///
    /// `Ok` with an empty vec means no messages arrived during the wait.
    /// Messages that cannot be decoded are logged and skipped; they stay on the
    /// queue and come back once their visibility timeout runs out.
    pub async fn bulk_receive(&self, queue: &str, max: usize) -> Result<Vec<Envelope>, ChannelError> {
        let budget = self.options.prefetch.saturating_sub(self.unacked());
        let limit = max.min(budget).min(SQS_MAX_MESSAGES);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let url = self.resolve_queue(queue).await?;
        let mut attribute_names = vec![ATTR_RECEIVE_COUNT.to_string()];
        if is_fifo(&url) || is_fifo(queue) {
            attribute_names.push(ATTR_GROUP_ID.to_string());
        }
        let request = ReceiveRequest {
            max_messages: limit,
            wait_time: self.options.wait_time,
            visibility_timeout: self.options.visibility_timeout,
            attribute_names,
        };

        let messages = self.client.receive_messages(&url, &request).await?;
        let mut envelopes = Vec::with_capacity(messages.len());
        for message in messages {
            let message_id = message.message_id.clone();
            let decoded = adapter::from_native(message, queue, &url)
                .and_then(|envelope| to_protocol_v1(&envelope))
                .and_then(|envelope| decode_request(&envelope).map(|_| envelope));
            match decoded {
                Ok(envelope) => {
                    self.outstanding()
                        .insert(envelope.lease().receipt().as_str().to_string());
                    envelopes.push(envelope);
                }
                Err(error) => {
                    tracing::error!(%message_id, queue, %error, "received undecodable message");
                }
            }
        }
        Ok(envelopes)
    }

    /// Send `records` to `queue`, ten entries per native call.
    ///
    /// Entries of a chunk whose call failed are reported as failed entries; the
    /// call only errors when no chunk went through. Failed entries are not retried.
    pub async fn bulk_send(&self, queue: &str, records: &[ResultRecord]) -> Result<BatchOutcome, ChannelError> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let url = self.resolve_queue(queue).await?;
        let fifo = is_fifo(&url) || is_fifo(queue);
        let entries = adapter::encode_entries(records, fifo, self.ids.as_ref())?;
        tracing::info!(queue, count = entries.len(), "request to push results");

        let mut outcome = BatchOutcome::default();
        let mut delivered_chunks = 0usize;
        let mut last_error = None;
        for chunk in entries.chunks(SQS_MAX_MESSAGES) {
            match self.client.send_message_batch(&url, chunk.to_vec()).await {
                Ok(result) => {
                    delivered_chunks += 1;
                    outcome.merge(result);
                }
                Err(error) => {
                    tracing::warn!(queue, %error, count = chunk.len(), "batch send failed");
                    outcome.failed.extend(chunk.iter().map(|entry| FailedEntry {
                        id: entry.id.clone(),
                        code: "TransportError".to_string(),
                        message: Some(error.to_string()),
                        sender_fault: false,
                    }));
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) if delivered_chunks == 0 => Err(error.into()),
            _ => Ok(outcome),
        }
    }

    pub async fn change_visibility(&self, lease: &LeaseHandle, timeout_secs: u32) -> Result<(), RenewalError> {
        self.client
            .change_message_visibility(lease.queue_url(), lease.receipt().as_str(), timeout_secs)
            .await
            .map_err(|error| match error.kind() {
                ErrorKind::Permanent => RenewalError::Expired(error.to_string()),
                ErrorKind::Transient => RenewalError::Transient(error.to_string()),
                ErrorKind::Infrastructure => RenewalError::Unknown(error.to_string()),
            })
    }

    /// Delete the message. The prefetch slot is released either way.
    pub async fn ack(&self, lease: &LeaseHandle) -> Result<(), ChannelError> {
        let result = self
            .client
            .delete_message(lease.queue_url(), lease.receipt().as_str())
            .await;
        self.release(lease);
        result?;
        tracing::info!(receipt = %lease.receipt(), "acknowledged message");
        Ok(())
    }

    /// Without requeue the message is deleted like an ack. With requeue it is
    /// made visible again right away.
    pub async fn reject(&self, lease: &LeaseHandle, requeue: bool) -> Result<(), ChannelError> {
        tracing::info!(receipt = %lease.receipt(), requeue, "rejecting message");
        if !requeue {
            return self.ack(lease).await;
        }
        let result = self
            .client
            .change_message_visibility(lease.queue_url(), lease.receipt().as_str(), 0)
            .await;
        self.release(lease);
        Ok(result?)
    }

    /// Forget a delivery whose lease is gone; the queue redelivers it on its own.
    pub fn abandon(&self, lease: &LeaseHandle) {
        tracing::debug!(receipt = %lease.receipt(), "abandoning message");
        self.release(lease);
    }

    fn release(&self, lease: &LeaseHandle) {
        self.outstanding().remove(lease.receipt().as_str());
    }

    fn outstanding(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LeaseRenewer for Channel {
    async fn change_visibility(&self, lease: &LeaseHandle, timeout_secs: u32) -> Result<(), RenewalError> {
        Channel::change_visibility(self, lease, timeout_secs).await
    }
}

#[async_trait]
impl ResultSink for Channel {
    async fn send_results(&self, queue: &str, records: &[ResultRecord]) -> Result<BatchOutcome, ChannelError> {
        self.bulk_send(queue, records).await
    }
}
