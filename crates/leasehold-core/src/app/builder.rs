//! WorkerBuilder - ワーカーの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - ports の注入（QueueClient / ListStore / Clock / IdGenerator）

use std::sync::Arc;

use crate::buffer::{InMemoryBuffer, ResultBackend, ResultBuffer, SharedListBuffer};
use crate::channel::{Channel, ChannelOptions};
use crate::config::{BufferStrategy, ConfigError, LeaseholdConfig};
use crate::lease::{ActiveTasks, VisibilityController};
use crate::ports::clock::{Clock, SystemClock};
use crate::ports::id_generator::{IdGenerator, UlidGenerator};
use crate::ports::list_store::ListStore;
use crate::ports::queue_client::QueueClient;
use crate::scheduler::{DrainScheduler, PingScheduler};
use crate::typed::{Handler, RegistryError, Task, TypedRegistry};

use super::worker::{Worker, WorkerCore};

/// WorkerBuilder はワーカーを構築
///
/// # 使用例
/// ```ignore
/// let worker = WorkerBuilder::new(config)
///     .queue_client(client)
///     .register::<CalipsoFunction, _>(CalipsoHandler)?
///     .expect_tasks(&["calipso.function"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - build() 時に設定を検証
/// - expect_tasks() で指定したタスクが全て登録されているかチェック
/// - shared バッファなのに ListStore が無ければエラー
pub struct WorkerBuilder {
    config: LeaseholdConfig,
    client: Option<Arc<dyn QueueClient>>,
    list_store: Option<Arc<dyn ListStore>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    registry: TypedRegistry,
    expected_tasks: Option<Vec<String>>,
}

/// BuildError はワーカー構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no queue client was provided")]
    MissingClient,

    #[error("results.buffer uses the shared strategy but no list store was provided")]
    MissingListStore,

    #[error("missing tasks: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl WorkerBuilder {
    pub fn new(config: LeaseholdConfig) -> Self {
        Self {
            config,
            client: None,
            list_store: None,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new()),
            registry: TypedRegistry::new(),
            expected_tasks: None,
        }
    }

    pub fn queue_client(mut self, client: Arc<dyn QueueClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Store backing the shared result buffer.
    pub fn list_store(mut self, store: Arc<dyn ListStore>) -> Self {
        self.list_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(mut self, handler: H) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待されるタスク名のリストを設定
    pub fn expect_tasks(mut self, names: &[&str]) -> Self {
        self.expected_tasks = Some(names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Worker, BuildError> {
        self.config.validate()?;
        let client = self.client.ok_or(BuildError::MissingClient)?;

        if let Some(expected) = &self.expected_tasks {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }

        let buffer: Arc<dyn ResultBuffer> = match &self.config.results.buffer {
            BufferStrategy::Memory => Arc::new(InMemoryBuffer::new()),
            BufferStrategy::Shared { key, .. } => {
                let store = self.list_store.ok_or(BuildError::MissingListStore)?;
                Arc::new(SharedListBuffer::new(store, key.clone()))
            }
        };

        let channel = Arc::new(Channel::new(
            client,
            self.ids,
            ChannelOptions::from_config(&self.config.broker),
        ));
        let active = Arc::new(ActiveTasks::new());
        let controller = Arc::new(VisibilityController::new(
            channel.clone(),
            active.clone(),
            self.clock.clone(),
        ));

        let results = &self.config.results;
        // full urls are used as-is, bare names go through queue resolution
        let result_queue = if results.as_uri().contains("://") {
            results.as_uri().to_string()
        } else {
            results.result_queue().to_string()
        };
        let backend = Arc::new(ResultBackend::new(
            buffer,
            channel.clone(),
            result_queue,
            results.buffer_size,
            results.store_attempts,
        ));

        let ping = PingScheduler::new(self.config.lease.ping_interval(), active.clone(), controller);
        let drain = DrainScheduler::new(results.drain_interval(), backend.clone());

        let core = WorkerCore {
            channel,
            registry: Arc::new(self.registry),
            active,
            backend,
            clock: self.clock,
            visibility_timeout: self.config.broker.visibility_timeout,
        };
        Ok(Worker::new(self.config, core, ping, drain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryListStore, InMemoryQueueClient};
    use crate::typed::handler::fixtures::{AddHandler, CountDaysHandler};
    use crate::typed::task::fixtures::{Add, CountDays};

    fn client() -> Arc<dyn QueueClient> {
        Arc::new(InMemoryQueueClient::new())
    }

    #[test]
    fn build_success() {
        let worker = WorkerBuilder::new(LeaseholdConfig::default())
            .queue_client(client())
            .register::<CountDays, _>(CountDaysHandler)
            .unwrap()
            .expect_tasks(&[CountDays::NAME])
            .build();
        assert!(worker.is_ok());
    }

    #[test]
    fn build_missing_task_types() {
        let worker = WorkerBuilder::new(LeaseholdConfig::default())
            .queue_client(client())
            .register::<CountDays, _>(CountDaysHandler)
            .unwrap()
            .expect_tasks(&[CountDays::NAME, Add::NAME])
            .build();
        assert!(matches!(
            worker,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec![Add::NAME.to_string()]
        ));
    }

    #[test]
    fn duplicate_registration_is_reported() {
        let result = WorkerBuilder::new(LeaseholdConfig::default())
            .register::<Add, _>(AddHandler)
            .unwrap()
            .register::<Add, _>(AddHandler);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn build_requires_client() {
        let worker = WorkerBuilder::new(LeaseholdConfig::default()).build();
        assert!(matches!(worker, Err(BuildError::MissingClient)));
    }

    #[test]
    fn invalid_config_fails_fast() {
        let mut config = LeaseholdConfig::default();
        config.broker.visibility_timeout = 0;
        let worker = WorkerBuilder::new(config).queue_client(client()).build();
        assert!(matches!(worker, Err(BuildError::Config(ConfigError::Invalid(_)))));
    }

    #[test]
    fn shared_buffer_needs_a_store() {
        let mut config = LeaseholdConfig::default();
        config.results.buffer = BufferStrategy::Shared {
            url: "redis://localhost:6379/1".into(),
            key: "leasehold:results".into(),
        };

        let missing = WorkerBuilder::new(config.clone()).queue_client(client()).build();
        assert!(matches!(missing, Err(BuildError::MissingListStore)));

        let built = WorkerBuilder::new(config)
            .queue_client(client())
            .list_store(Arc::new(InMemoryListStore::new()))
            .build();
        assert!(built.is_ok());
    }

    #[test]
    fn result_queue_comes_from_backend_url() {
        let mut config = LeaseholdConfig::default();
        config.results.backend_url = "sqs://http://localhost:9324/queue/fifo_res".into();
        let worker = WorkerBuilder::new(config).queue_client(client()).build().unwrap();
        assert_eq!(worker.backend().queue(), "http://localhost:9324/queue/fifo_res");

        let worker = WorkerBuilder::new(LeaseholdConfig::default())
            .queue_client(client())
            .build()
            .unwrap();
        assert_eq!(worker.backend().queue(), "fifo_res");
    }
}
