//! AwsSqsClient - aws-sdk-sqs による QueueClient
//!
//! SDK のエラーは `ClientError` に写します。
//! - ディスパッチ / タイムアウト / レスポンス → Connection
//! - スロットリング系のコード → Throttled
//! - それ以外のサービスエラー → Service（コードとメッセージを保持）

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{MessageSystemAttributeName, SendMessageBatchRequestEntry};

use crate::config::BrokerConfig;
use crate::ports::queue_client::{
    BatchOutcome, ClientError, FailedEntry, NativeMessage, QueueClient, ReceiveRequest,
    SQS_MAX_WAIT_SECONDS, SendEntry, SentEntry,
};

pub struct AwsSqsClient {
    client: aws_sdk_sqs::Client,
}

impl AwsSqsClient {
    pub fn new(client: aws_sdk_sqs::Client) -> Self {
        Self { client }
    }

    /// Build a client from the default credential chain, honouring the
    /// broker's region and endpoint overrides.
    pub async fn from_config(broker: &BrokerConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &broker.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &broker.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        Self::new(aws_sdk_sqs::Client::new(&sdk_config))
    }
}

fn map_sdk_error<E, R>(err: SdkError<E, R>) -> ClientError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let code = ctx.err().code().unwrap_or("Unknown");
            let message = ctx.err().message().unwrap_or_default();
            if code.contains("Throttl") || code == "RequestThrottled" {
                ClientError::Throttled(format!("{code}: {message}"))
            } else {
                ClientError::service(code, message)
            }
        }
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            ClientError::Connection(err.to_string())
        }
        _ => ClientError::Connection(err.to_string()),
    }
}

fn to_i32(value: u64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl QueueClient for AwsSqsClient {
    async fn queue_url(&self, name: &str) -> Result<String, ClientError> {
        let output = self
            .client
            .get_queue_url()
            .queue_name(name)
            .send()
            .await
            .map_err(map_sdk_error)?;
        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| ClientError::service("QueueDoesNotExist", format!("no url returned for {name}")))
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<NativeMessage>, ClientError> {
        let mut call = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(to_i32(request.max_messages as u64))
            .wait_time_seconds(to_i32(request.wait_time.as_secs().min(SQS_MAX_WAIT_SECONDS)))
            .set_visibility_timeout(request.visibility_timeout.map(|secs| to_i32(secs.into())));
        for name in &request.attribute_names {
            call = call.message_system_attribute_names(MessageSystemAttributeName::from(name.as_str()));
        }
        let output = call.send().await.map_err(map_sdk_error)?;

        let messages = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|message| {
                let attributes: HashMap<String, String> = message
                    .attributes()
                    .map(|attrs| {
                        attrs
                            .iter()
                            .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(NativeMessage {
                    message_id: message.message_id()?.to_string(),
                    receipt_handle: message.receipt_handle()?.to_string(),
                    body: message.body().unwrap_or_default().to_string(),
                    attributes,
                })
            })
            .collect();
        Ok(messages)
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendEntry>,
    ) -> Result<BatchOutcome, ClientError> {
        let mut native = Vec::with_capacity(entries.len());
        for entry in entries {
            let built = SendMessageBatchRequestEntry::builder()
                .id(entry.id)
                .message_body(entry.body)
                .set_message_group_id(entry.group_id)
                .set_message_deduplication_id(entry.dedup_id)
                .build()
                .map_err(|e| ClientError::service("InvalidBatchEntry", e.to_string()))?;
            native.push(built);
        }

        let output = self
            .client
            .send_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(native))
            .send()
            .await
            .map_err(map_sdk_error)?;

        Ok(BatchOutcome {
            successful: output
                .successful()
                .iter()
                .map(|entry| SentEntry {
                    id: entry.id().to_string(),
                    message_id: entry.message_id().to_string(),
                })
                .collect(),
            failed: output
                .failed()
                .iter()
                .map(|entry| FailedEntry {
                    id: entry.id().to_string(),
                    code: entry.code().to_string(),
                    message: entry.message().map(str::to_string),
                    sender_fault: entry.sender_fault(),
                })
                .collect(),
        })
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), ClientError> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout_secs: u32,
    ) -> Result<(), ClientError> {
        self.client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(to_i32(timeout_secs.into()))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_values_saturate() {
        assert_eq!(to_i32(43_199), 43_199);
        assert_eq!(to_i32(u64::MAX), i32::MAX);
    }
}
