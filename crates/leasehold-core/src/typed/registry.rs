//! TypedRegistry - Handler の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;

/// TypedRegistry は型付き Handler を登録・管理
///
/// ```ignore
/// let mut registry = TypedRegistry::new();
/// registry.register::<CalipsoFunction, _>(CalipsoHandler)?;
/// let handler = registry.get("calipso.function");
/// ```
///
/// 初期化時にだけ変更し、実行中は `Arc` で共有して読み取り専用で使います。
#[derive(Default)]
pub struct TypedRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

/// RegistryError は TypedRegistry の操作エラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for task '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl TypedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(&mut self, handler: H) -> Result<(), RegistryError> {
        let name = T::NAME.to_string();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.handlers
            .insert(name, Arc::new(TypedHandler::<T, H>::new(handler)));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::fixtures::{AddHandler, CountDaysHandler};
    use crate::typed::task::fixtures::{Add, CountDays};

    #[test]
    fn register_and_get() {
        let mut registry = TypedRegistry::new();
        registry.register::<CountDays, _>(CountDaysHandler).unwrap();

        let handler = registry.get(CountDays::NAME).unwrap();
        assert_eq!(handler.task_name(), "calipso.function");
        assert!(registry.get("calipso.unknown").is_none());
    }

    #[test]
    fn double_registration_fails() {
        let mut registry = TypedRegistry::new();
        registry.register::<CountDays, _>(CountDaysHandler).unwrap();
        let result = registry.register::<CountDays, _>(CountDaysHandler);
        assert_eq!(
            result,
            Err(RegistryError::AlreadyRegistered("calipso.function".into()))
        );
    }

    #[test]
    fn lists_names_sorted() {
        let mut registry = TypedRegistry::new();
        registry.register::<CountDays, _>(CountDaysHandler).unwrap();
        registry.register::<Add, _>(AddHandler).unwrap();

        assert_eq!(registry.registered_names(), vec!["calipso.function", "math.add"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("math.add"));
    }
}
