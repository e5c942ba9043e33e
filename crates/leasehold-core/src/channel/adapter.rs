//! Envelope adapter - ネイティブメッセージとタスクプロトコルの変換
//!
//! # 受信
//! 1. body が base64 なら復号（kombu 互換）
//! 2. `headers` を持つ JSON オブジェクトなら標準メッセージとして展開
//! 3. それ以外は素の body として扱い、headers は `None`（= protocol upgrade 対象）
//!
//! # 送信
//! 結果レコードを `SendEntry` にする。FIFO キューでは group id = taskId、
//! dedup id は送信ごとに新規発行。

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};

use crate::domain::{
    DEFAULT_CONTENT_ENCODING, DEFAULT_CONTENT_TYPE, DeliveryInfo, Envelope, JobId, LeaseHandle,
    MessageId, ReceiptHandle, ResultRecord, TaskRequest,
};
use crate::ports::id_generator::IdGenerator;
use crate::ports::queue_client::{ATTR_GROUP_ID, ATTR_RECEIVE_COUNT, NativeMessage, SendEntry};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("message {message_id}: body is not valid JSON: {source}")]
    Json {
        message_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("message {message_id}: {reason}")]
    Malformed { message_id: String, reason: String },

    #[error("message {message_id} carries no task protocol headers")]
    MissingHeaders { message_id: String },

    #[error("message {message_id}: unsupported content type {content_type}")]
    UnsupportedContentType {
        message_id: String,
        content_type: String,
    },

    #[error("failed to encode result record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// FIFO キューかどうか（url / 名前に `fifo` を含む）
pub fn is_fifo(queue: &str) -> bool {
    queue.contains("fifo")
}

/// Decode a received native message into an [`Envelope`].
pub fn from_native(
    message: NativeMessage,
    queue_name: &str,
    queue_url: &str,
) -> Result<Envelope, AdapterError> {
    let NativeMessage {
        message_id,
        receipt_handle,
        body,
        attributes,
    } = message;

    let receive_count = attributes
        .get(ATTR_RECEIVE_COUNT)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(1);
    let group_id = attributes.get(ATTR_GROUP_ID).cloned();
    let delivery = DeliveryInfo {
        queue_name: queue_name.to_string(),
        message_id: MessageId::new(message_id.clone()),
        receive_count,
        group_id,
        lease: LeaseHandle::new(queue_url, ReceiptHandle::new(receipt_handle)),
    };

    let text = decode_base64(&body).unwrap_or(body);

    let standard = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(payload)) if payload.contains_key("headers") => Some(payload),
        _ => None,
    };

    let Some(mut payload) = standard else {
        return Ok(Envelope {
            body: text,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            content_encoding: DEFAULT_CONTENT_ENCODING.to_string(),
            headers: None,
            properties: Map::new(),
            delivery,
        });
    };

    let headers = match payload.remove("headers") {
        Some(Value::Object(headers)) => headers,
        Some(Value::Null) | None => Map::new(),
        Some(_) => {
            return Err(AdapterError::Malformed {
                message_id,
                reason: "headers must be a JSON object".into(),
            });
        }
    };
    let properties = match payload.remove("properties") {
        Some(Value::Object(properties)) => properties,
        _ => Map::new(),
    };
    let mut inner = match payload.remove("body") {
        Some(Value::String(body)) => body,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    if properties.get("body_encoding").and_then(Value::as_str) == Some("base64") {
        inner = decode_base64(&inner).ok_or_else(|| AdapterError::Malformed {
            message_id: message_id.clone(),
            reason: "body_encoding is base64 but the body does not decode".into(),
        })?;
    }

    Ok(Envelope {
        body: inner,
        content_type: string_field(&payload, "content-type", DEFAULT_CONTENT_TYPE),
        content_encoding: string_field(&payload, "content-encoding", DEFAULT_CONTENT_ENCODING),
        headers: Some(headers),
        properties,
        delivery,
    })
}

/// Upgrade a header-less FIFO message to protocol v1.
///
/// The queue message group id names the task, the message id becomes the task id,
/// and the original body is the keyword arguments. Envelopes that already carry
/// headers (or have no group id) are returned unchanged.
pub fn to_protocol_v1(envelope: &Envelope) -> Result<Envelope, AdapterError> {
    let Some(task) = envelope.delivery.group_id.as_deref() else {
        return Ok(envelope.clone());
    };
    if envelope.headers.is_some() {
        return Ok(envelope.clone());
    }

    let message_id = envelope.delivery.message_id.as_str();
    let raw = if envelope.body.trim().is_empty() {
        "{}"
    } else {
        envelope.body.as_str()
    };
    let kwargs: Value = serde_json::from_str(raw).map_err(|source| AdapterError::Json {
        message_id: message_id.to_string(),
        source,
    })?;
    if !kwargs.is_object() {
        return Err(AdapterError::Malformed {
            message_id: message_id.to_string(),
            reason: "keyword arguments must be a JSON object".into(),
        });
    }

    let body = json!({
        "task": task,
        "id": message_id,
        "kwargs": kwargs,
    });

    let mut upgraded = envelope.clone();
    upgraded.body = body.to_string();
    if upgraded.content_type.is_empty() {
        upgraded.content_type = DEFAULT_CONTENT_TYPE.to_string();
    }
    if upgraded.content_encoding.is_empty() {
        upgraded.content_encoding = DEFAULT_CONTENT_ENCODING.to_string();
    }
    upgraded.headers = Some(Map::new());
    Ok(upgraded)
}

/// Extract the task invocation from a protocol v1 or v2 envelope.
///
/// - v2: `task` / `id` in the headers, body `[args, kwargs, embed]`
/// - v1: empty headers, body `{"task", "id", "args", "kwargs"}`
pub fn decode_request(envelope: &Envelope) -> Result<TaskRequest, AdapterError> {
    let message_id = envelope.delivery.message_id.as_str();
    let headers = envelope
        .headers
        .as_ref()
        .ok_or_else(|| AdapterError::MissingHeaders {
            message_id: message_id.to_string(),
        })?;
    if !envelope.content_type.contains("json") {
        return Err(AdapterError::UnsupportedContentType {
            message_id: message_id.to_string(),
            content_type: envelope.content_type.clone(),
        });
    }

    let body: Value = serde_json::from_str(&envelope.body).map_err(|source| AdapterError::Json {
        message_id: message_id.to_string(),
        source,
    })?;
    let malformed = |reason: &str| AdapterError::Malformed {
        message_id: message_id.to_string(),
        reason: reason.to_string(),
    };

    if let Some(task) = headers.get("task").and_then(Value::as_str) {
        let id = headers
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("protocol v2 headers need an id"))?;
        let parts = body
            .as_array()
            .ok_or_else(|| malformed("protocol v2 body must be [args, kwargs, embed]"))?;
        return Ok(TaskRequest {
            name: task.to_string(),
            id: JobId::new(id),
            args: parts
                .first()
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            kwargs: parts
                .get(1)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        });
    }

    let body = body
        .as_object()
        .ok_or_else(|| malformed("protocol v1 body must be a JSON object"))?;
    let task = body
        .get("task")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("protocol v1 body needs a task name"))?;
    let id = body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("protocol v1 body needs an id"))?;
    Ok(TaskRequest {
        name: task.to_string(),
        id: JobId::new(id),
        args: body
            .get("args")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        kwargs: body
            .get("kwargs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    })
}

/// One send entry per record; entry id = position in `records`.
pub fn encode_entries(
    records: &[ResultRecord],
    fifo: bool,
    ids: &dyn IdGenerator,
) -> Result<Vec<SendEntry>, AdapterError> {
    records
        .iter()
        .enumerate()
        .map(|(idx, record)| {
            Ok(SendEntry {
                id: idx.to_string(),
                body: serde_json::to_string(record)?,
                group_id: fifo.then(|| record.task_id.clone()),
                dedup_id: fifo.then(|| ids.generate_dedup_id()),
            })
        })
        .collect()
}

fn decode_base64(raw: &str) -> Option<String> {
    let bytes = STANDARD.decode(raw.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

fn string_field(payload: &Map<String, Value>, key: &str, default: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
        .to_string()
}
