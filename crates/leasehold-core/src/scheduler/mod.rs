//! Scheduler - ワーカーが持つ繰り返しタイマー
//!
//! - **PingScheduler**: 実行中タスクの lease 延長チェック（既定 2 秒）
//! - **DrainScheduler**: 結果バッファの定期 drain（既定 60 秒）

pub mod drain;
pub mod ping;
pub mod timer;

pub use drain::DrainScheduler;
pub use ping::{PingScheduler, ping_active_tasks};
pub use timer::RepeatingTimer;
