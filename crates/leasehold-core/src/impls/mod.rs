//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryQueueClient**: 開発・テスト用の SQS（FIFO グループ、重複排除、visibility timeout を再現）
//! - **InMemoryListStore**: 開発・テスト用のリスト型ストア
//!
//! # 本番用実装（feature）
//! - `aws`: AwsSqsClient
//! - `redis`: RedisListStore

pub mod inmem_list;
pub mod inmem_sqs;

#[cfg(feature = "aws")]
pub mod aws_sqs;
#[cfg(feature = "redis")]
pub mod redis_list;

pub use self::inmem_list::InMemoryListStore;
pub use self::inmem_sqs::InMemoryQueueClient;

#[cfg(feature = "aws")]
pub use self::aws_sqs::AwsSqsClient;
#[cfg(feature = "redis")]
pub use self::redis_list::RedisListStore;
