//! App - アプリケーション層
//!
//! ports と channel / lease / buffer / scheduler を組み合わせてワーカーを構成します。
//!
//! # 主要コンポーネント
//! - **WorkerBuilder**: ワーカーの構築とワイヤリング
//! - **Worker**: 受信→実行→結果保存→ack/reject のループ

pub mod builder;
pub mod worker;

pub use self::builder::{BuildError, WorkerBuilder};
pub use self::worker::{ShutdownHandle, Worker, WorkerError};
