//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const NAME`)
//! - Associated Types (`type Output`)
//! - Trait bounds の組み合わせ (DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

/// Task はタスク名と引数の型を対応付ける
///
/// 引数はメッセージの kwargs（または位置引数の配列）からデシリアライズされます。
///
/// # 使用例
/// ```ignore
/// #[derive(Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// struct CalipsoFunction {
///     no_of_days: u32,
/// }
///
/// impl Task for CalipsoFunction {
///     const NAME: &'static str = "calipso.function";
///     type Output = String;
/// }
/// ```
pub trait Task: DeserializeOwned + Send + Sync + 'static {
    /// Name producers put in the message group id (or the protocol `task` field).
    const NAME: &'static str;

    /// Value reported as the result `data` on success.
    type Output: Serialize + Send + 'static;
}

/// TaskError はタスク実行の失敗
///
/// 結果レコードには `{"exc_type", "exc_message"}` の形で載ります。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{exc_type}: {message}")]
pub struct TaskError {
    pub exc_type: String,
    pub message: String,
    pub traceback: Option<String>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_type("Exception", message)
    }

    pub fn with_type(exc_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exc_type: exc_type.into(),
            message: message.into(),
            traceback: None,
        }
    }

    /// No handler is registered for `name`. Maps to status 404.
    pub fn not_registered(name: &str) -> Self {
        Self::with_type("NotRegistered", name)
    }

    pub fn invalid_arguments(reason: impl std::fmt::Display) -> Self {
        Self::with_type("TypeError", reason.to_string())
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Failure payload stored as the task result.
    pub fn to_result_value(&self) -> Value {
        json!({
            "exc_type": self.exc_type,
            "exc_message": self.message,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CountDays {
        pub no_of_days: u32,
    }

    impl Task for CountDays {
        const NAME: &'static str = "calipso.function";
        type Output = Value;
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct Add {
        pub a: i64,
        pub b: i64,
    }

    impl Task for Add {
        const NAME: &'static str = "math.add";
        type Output = i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_payload_shape() {
        let err = TaskError::not_registered("calipso.unknown");
        assert_eq!(
            err.to_result_value(),
            json!({"exc_type": "NotRegistered", "exc_message": "calipso.unknown"})
        );
        assert_eq!(err.to_string(), "NotRegistered: calipso.unknown");
        assert_eq!(TaskError::new("boom").exc_type, "Exception");
    }
}
