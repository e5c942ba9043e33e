//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 外部システム（SQS, Redis などの共有ストア, ワーカープロセス）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - キューのクライアントは継承ではなく `Arc<dyn QueueClient>` として注入する
//! - エラーは例外の型階層ではなく、明示的な enum で分類する

pub mod canceller;
pub mod clock;
pub mod id_generator;
pub mod list_store;
pub mod queue_client;

// 主要な trait を再エクスポート
pub use self::canceller::TaskCanceller;
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::list_store::{ListStore, StoreError};
pub use self::queue_client::{
    BatchOutcome, ClientError, FailedEntry, NativeMessage, QueueClient, ReceiveRequest, SendEntry,
    SentEntry,
};
