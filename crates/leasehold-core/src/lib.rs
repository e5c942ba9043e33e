//! leasehold-core
//!
//! FIFO queue (SQS) transport extension for a task-queue worker.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, result）
//! - **ports**: 抽象化レイヤー（QueueClient, ListStore, Clock, IdGenerator, TaskCanceller）
//! - **channel**: キュー RPC と envelope 変換（receive / send / ack / reject / change visibility）
//! - **lease**: visibility timeout の延長（VisibilityController, ActiveTasks）
//! - **buffer**: 結果のバッファリングと一括送信（ResultBackend）
//! - **scheduler**: 繰り返しタイマー（PingScheduler, DrainScheduler）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry）
//! - **app**: ワイヤリングとワーカー実行（WorkerBuilder, Worker）
//! - **impls**: ports の実装（InMemoryQueueClient, InMemoryListStore, aws / redis は feature）

pub mod app;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod lease;
pub mod ports;
pub mod scheduler;
pub mod typed;

pub use app::{BuildError, Worker, WorkerBuilder};
pub use config::{BufferStrategy, ConfigError, LeaseholdConfig};
pub use error::{Classify, ErrorKind};
