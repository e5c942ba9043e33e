//! Result records sent back to the producer through the result queue.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::envelope::TaskRequest;
use super::ids::JobId;

pub const STATUS_SUCCESS: u16 = 200;
pub const STATUS_FAILURE: u16 = 400;
pub const STATUS_NOT_REGISTERED: u16 = 404;

/// Final state reported by the task layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failure,
}

impl TaskStatus {
    /// Numeric status for the record.
    ///
    /// Failures look at the `exc_type` of the failure payload; known subtypes
    /// (`NotRegistered`) get their own code, everything else is a plain 400.
    pub fn code(self, result: &Value) -> u16 {
        match self {
            TaskStatus::Success => STATUS_SUCCESS,
            TaskStatus::Failure => match result.get("exc_type").and_then(Value::as_str) {
                Some("NotRegistered") => STATUS_NOT_REGISTERED,
                _ => STATUS_FAILURE,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub status: u16,
    pub error: Option<Value>,
}

/// One completed task awaiting delivery.
///
/// Wire shape:
/// `{"taskId": <task name>, "jobId": <execution id>, "data": ..., "metadata": {"status": .., "error": ..}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub task_id: String,
    pub job_id: JobId,
    pub data: Value,
    pub metadata: ResultMetadata,
}

impl ResultRecord {
    /// Build the record for a finished execution.
    ///
    /// - `data` is the result on success, `{}` otherwise
    /// - `error` is the traceback when there is one, else the failure payload
    pub fn from_outcome(
        job_id: &JobId,
        result: Value,
        status: TaskStatus,
        traceback: Option<String>,
        request: &TaskRequest,
    ) -> Self {
        let code = status.code(&result);
        let (data, error) = match status {
            TaskStatus::Success => (result, traceback.map(Value::String)),
            TaskStatus::Failure => (
                Value::Object(Map::new()),
                Some(traceback.map(Value::String).unwrap_or(result)),
            ),
        };
        Self {
            task_id: request.name.clone(),
            job_id: job_id.clone(),
            data,
            metadata: ResultMetadata {
                status: code,
                error,
            },
        }
    }

    pub fn status(&self) -> u16 {
        self.metadata.status
    }
}
