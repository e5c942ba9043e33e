//! Envelope - キューメッセージとタスクプロトコルの間の運搬用データ

use serde_json::{Map, Value};

use super::ids::{JobId, MessageId, ReceiptHandle};

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
pub const DEFAULT_CONTENT_ENCODING: &str = "utf-8";

/// Address of one delivery: the queue it came from plus its receipt handle.
///
/// Every visibility change, delete and requeue goes through this handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseHandle {
    queue_url: String,
    receipt: ReceiptHandle,
}

impl LeaseHandle {
    pub fn new(queue_url: impl Into<String>, receipt: ReceiptHandle) -> Self {
        Self {
            queue_url: queue_url.into(),
            receipt,
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    pub fn receipt(&self) -> &ReceiptHandle {
        &self.receipt
    }
}

/// Native delivery metadata carried alongside the protocol payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryInfo {
    pub queue_name: String,
    pub message_id: MessageId,
    pub receive_count: u32,
    /// FIFO `MessageGroupId`, only present for FIFO queues.
    pub group_id: Option<String>,
    pub lease: LeaseHandle,
}

/// Wire-level message.
///
/// `headers == None` means the producer did not speak the task protocol at all
/// (the message needs a protocol upgrade). `Some` with an empty map is a valid
/// protocol v1 message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub body: String,
    pub content_type: String,
    pub content_encoding: String,
    pub headers: Option<Map<String, Value>>,
    pub properties: Map<String, Value>,
    pub delivery: DeliveryInfo,
}

impl Envelope {
    pub fn needs_upgrade(&self) -> bool {
        self.headers.is_none() && self.delivery.group_id.is_some()
    }

    pub fn lease(&self) -> &LeaseHandle {
        &self.delivery.lease
    }
}

/// A decoded task invocation: what to run and with which arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub name: String,
    pub id: JobId,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskRequest {
    /// `name[id]`, used in log lines.
    pub fn label(&self) -> String {
        format!("{}[{}]", self.name, self.id)
    }
}
