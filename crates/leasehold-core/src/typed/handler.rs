//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::task::{Task, TaskError};
use crate::domain::TaskRequest;

/// Handler は Task を実行して結果を返す
///
/// # 使用例
/// ```ignore
/// struct CalipsoHandler;
///
/// #[async_trait]
/// impl Handler<CalipsoFunction> for CalipsoHandler {
///     async fn handle(&self, task: CalipsoFunction) -> Result<String, TaskError> {
///         Ok(format!("{} days", task.no_of_days))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<T::Output, TaskError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// `HashMap<String, Arc<dyn DynHandler>>` に格納できるよう、
/// 入出力を `TaskRequest` / `serde_json::Value` に揃えます。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, request: &TaskRequest) -> Result<Value, TaskError>;
    fn task_name(&self) -> &'static str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

/// Arguments come from kwargs; positional args are used when no kwargs were sent.
fn decode_arguments<T: Task>(request: &TaskRequest) -> Result<T, TaskError> {
    let raw = if request.kwargs.is_empty() && !request.args.is_empty() {
        Value::Array(request.args.clone())
    } else {
        Value::Object(request.kwargs.clone())
    };
    serde_json::from_value(raw).map_err(|e| TaskError::invalid_arguments(format!("{}: {e}", T::NAME)))
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, request: &TaskRequest) -> Result<Value, TaskError> {
        let task: T = decode_arguments(request)?;
        let output = self.handler.handle(task).await?;
        serde_json::to_value(output).map_err(|e| TaskError::with_type("EncodeError", e.to_string()))
    }

    fn task_name(&self) -> &'static str {
        T::NAME
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::typed::task::fixtures::{Add, CountDays};
    use serde_json::json;

    pub struct CountDaysHandler;

    #[async_trait]
    impl Handler<CountDays> for CountDaysHandler {
        async fn handle(&self, task: CountDays) -> Result<Value, TaskError> {
            if task.no_of_days == 0 {
                return Err(TaskError::new("noOfDays must be positive"));
            }
            Ok(json!({"days": task.no_of_days}))
        }
    }

    pub struct AddHandler;

    #[async_trait]
    impl Handler<Add> for AddHandler {
        async fn handle(&self, task: Add) -> Result<i64, TaskError> {
            Ok(task.a + task.b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{AddHandler, CountDaysHandler};
    use super::*;
    use crate::domain::JobId;
    use crate::typed::task::fixtures::{Add, CountDays};
    use serde_json::{Map, json};

    fn request(name: &str, args: Vec<Value>, kwargs: Value) -> TaskRequest {
        TaskRequest {
            name: name.into(),
            id: JobId::new("job-1"),
            args,
            kwargs: kwargs.as_object().cloned().unwrap_or_else(Map::new),
        }
    }

    #[tokio::test]
    async fn decodes_kwargs() {
        let handler = TypedHandler::<CountDays, _>::new(CountDaysHandler);
        let out = handler
            .handle_dyn(&request("calipso.function", vec![], json!({"noOfDays": 3})))
            .await
            .unwrap();
        assert_eq!(out, json!({"days": 3}));
        assert_eq!(handler.task_name(), "calipso.function");
    }

    #[tokio::test]
    async fn falls_back_to_positional_args() {
        let handler = TypedHandler::<Add, _>::new(AddHandler);
        let out = handler
            .handle_dyn(&request("math.add", vec![json!(2), json!(5)], json!({})))
            .await
            .unwrap();
        assert_eq!(out, json!(7));
    }

    #[tokio::test]
    async fn bad_arguments_are_type_errors() {
        let handler = TypedHandler::<CountDays, _>::new(CountDaysHandler);
        let err = handler
            .handle_dyn(&request("calipso.function", vec![], json!({"noOfDays": "many"})))
            .await
            .unwrap_err();
        assert_eq!(err.exc_type, "TypeError");
    }

    #[tokio::test]
    async fn handler_failures_pass_through() {
        let handler = TypedHandler::<CountDays, _>::new(CountDaysHandler);
        let err = handler
            .handle_dyn(&request("calipso.function", vec![], json!({"noOfDays": 0})))
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::new("noOfDays must be positive"));
    }
}
