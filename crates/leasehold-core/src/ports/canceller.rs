//! TaskCanceller port - 実行中タスクの中断

use crate::domain::JobId;

/// TaskCanceller はワーカープロセスに実行中タスクの中断を依頼する
///
/// lease を失ったタスクはキューが別のワーカーへ再配送するので、
/// 手元の実行は捨てる必要があります。
pub trait TaskCanceller: Send + Sync {
    /// Returns `false` when the task is no longer running.
    fn cancel(&self, job_id: &JobId) -> bool;
}
