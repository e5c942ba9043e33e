//! VisibilityController - 実行中タスクの lease を延長する
//!
//! # 状態
//! - `attempt`: 発行済みの延長回数 + 1（1 から始まり、減らない）
//! - `lost`: lease を失った（以後は延長しない）
//!
//! # ロック
//! タスクごとの `tokio::sync::Mutex` を `try_lock` でだけ取ります。
//! 取れなければその tick は何もしません（キューに積まない）。

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use super::{EXTENSION_FACTOR, LeaseRenewer, RenewalError, extended_timeout};
use crate::domain::{JobId, LeaseHandle};
use crate::ports::canceller::TaskCanceller;
use crate::ports::clock::Clock;

#[derive(Debug)]
struct LeaseState {
    attempt: u32,
    lost: bool,
}

/// One executing task and its lease.
#[derive(Debug)]
pub struct InFlightTask {
    job_id: JobId,
    label: String,
    started_at: Instant,
    base_timeout: u32,
    lease: LeaseHandle,
    state: Mutex<LeaseState>,
    abort: OnceLock<AbortHandle>,
}

impl InFlightTask {
    pub fn new(
        job_id: JobId,
        label: impl Into<String>,
        started_at: Instant,
        base_timeout: u32,
        lease: LeaseHandle,
    ) -> Self {
        Self {
            job_id,
            label: label.into(),
            started_at,
            base_timeout,
            lease,
            state: Mutex::new(LeaseState {
                attempt: 1,
                lost: false,
            }),
            abort: OnceLock::new(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn lease(&self) -> &LeaseHandle {
        &self.lease
    }

    pub fn base_timeout(&self) -> u32 {
        self.base_timeout
    }

    /// Bind the execution this task can be aborted through. Only the first call wins.
    pub fn attach_abort(&self, handle: AbortHandle) -> bool {
        self.abort.set(handle).is_ok()
    }

    /// Abort the execution; `false` if nothing was attached.
    pub fn abort(&self) -> bool {
        match self.abort.get() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn attempt(&self) -> u32 {
        self.state.lock().await.attempt
    }

    pub async fn is_lost(&self) -> bool {
        self.state.lock().await.lost
    }
}

/// Result of one `on_tick` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick holds the task lock.
    Busy,
    /// The lease was lost earlier; nothing more to do.
    Lost,
    NotDue,
    Extended { attempt: u32, timeout_secs: u32 },
    /// The RPC failed without losing the lease; the next tick tries again.
    Deferred { attempt: u32, error: RenewalError },
    /// The lease expired and the task was handed to the canceller.
    Abandoned { cancelled: bool },
}

pub struct VisibilityController {
    renewer: Arc<dyn LeaseRenewer>,
    canceller: Arc<dyn TaskCanceller>,
    clock: Arc<dyn Clock>,
}

impl VisibilityController {
    pub fn new(
        renewer: Arc<dyn LeaseRenewer>,
        canceller: Arc<dyn TaskCanceller>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            renewer,
            canceller,
            clock,
        }
    }

    /// Extend the task's lease if it has used up its share of the current deadline.
    ///
    /// Never blocks on a busy task and never fails: RPC errors are logged and
    /// reported in the outcome.
    pub async fn on_tick(&self, task: &InFlightTask) -> TickOutcome {
        let Ok(mut state) = task.state.try_lock() else {
            tracing::debug!(task = %task.label, "lease check already running, skipping tick");
            return TickOutcome::Busy;
        };
        if state.lost {
            return TickOutcome::Lost;
        }

        let elapsed = self
            .clock
            .now()
            .saturating_duration_since(task.started_at)
            .as_secs_f64();
        let threshold = EXTENSION_FACTOR * f64::from(state.attempt) * f64::from(task.base_timeout);
        tracing::debug!(task = %task.label, elapsed, threshold, "ping");
        if elapsed < threshold {
            return TickOutcome::NotDue;
        }

        let next = state.attempt.saturating_add(1);
        let timeout_secs = extended_timeout(next, task.base_timeout);
        tracing::info!(
            task = %task.label,
            attempt = state.attempt,
            "task still pending, increasing visibility timeout"
        );

        match self.renewer.change_visibility(&task.lease, timeout_secs).await {
            Ok(()) => {
                state.attempt = next;
                tracing::info!(task = %task.label, timeout_secs, "changed visibility timeout");
                TickOutcome::Extended {
                    attempt: next,
                    timeout_secs,
                }
            }
            Err(RenewalError::Expired(reason)) => {
                state.lost = true;
                tracing::warn!(
                    task = %task.label,
                    %reason,
                    "lease expired, abandoning task"
                );
                let cancelled = self.canceller.cancel(&task.job_id);
                TickOutcome::Abandoned { cancelled }
            }
            Err(error) => {
                tracing::warn!(
                    task = %task.label,
                    %error,
                    "unable to change visibility timeout"
                );
                TickOutcome::Deferred {
                    attempt: state.attempt,
                    error,
                }
            }
        }
    }
}
