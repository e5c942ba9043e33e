//! Worker - 受信・実行・結果保存のループ
//!
//! # フロー
//! 1. Channel::bulk_receive() で空きスロットぶんのメッセージを受信
//! 2. InFlightTask を ActiveTasks に登録し、Handler を別タスクで実行
//! 3. 成功なら結果を保存して ack、失敗なら結果を保存して reject
//! 4. lease を失ったタスクは中断され、メッセージは再配信に任せる
//!
//! 並行して PingScheduler が visibility timeout を延長し、
//! DrainScheduler が結果バッファを定期的に送信します。

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::buffer::{DrainReport, ResultBackend};
use crate::channel::{Channel, ChannelError, adapter::decode_request};
use crate::config::LeaseholdConfig;
use crate::domain::{Envelope, LeaseHandle, TaskRequest, TaskStatus};
use crate::lease::{ActiveTasks, InFlightTask};
use crate::ports::clock::Clock;
use crate::scheduler::{DrainScheduler, PingScheduler};
use crate::typed::{TaskError, TypedRegistry};

/// Pause between polls when the queue is empty and long polling is disabled.
const IDLE_POLL: Duration = Duration::from_millis(200);

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_MAX_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Shared state handed to every running task.
pub(crate) struct WorkerCore {
    pub(crate) channel: Arc<Channel>,
    pub(crate) registry: Arc<TypedRegistry>,
    pub(crate) active: Arc<ActiveTasks>,
    pub(crate) backend: Arc<ResultBackend>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) visibility_timeout: u32,
}

/// ShutdownHandle はワーカーの停止を要求する
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Worker は WorkerBuilder が組み立てる実行単位
pub struct Worker {
    config: LeaseholdConfig,
    core: Arc<WorkerCore>,
    ping: PingScheduler,
    drain: DrainScheduler,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Worker {
    pub(crate) fn new(config: LeaseholdConfig, core: WorkerCore, ping: PingScheduler, drain: DrainScheduler) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            core: Arc::new(core),
            ping,
            drain,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn config(&self) -> &LeaseholdConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.core.channel
    }

    pub fn active(&self) -> &Arc<ActiveTasks> {
        &self.core.active
    }

    pub fn backend(&self) -> &Arc<ResultBackend> {
        &self.core.backend
    }

    pub fn registry(&self) -> &TypedRegistry {
        &self.core.registry
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Consume the configured queue until shutdown is requested.
    ///
    /// On shutdown the worker stops receiving, waits for running tasks, stops
    /// the ping timer, drains the result buffer one last time and stops the
    /// drain timer.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let queue = self.config.broker.queue.clone();
        let url = self.core.channel.resolve_queue(&queue).await?;
        let concurrency = self.config.broker.concurrency;

        self.ping.start();
        self.drain.start();
        info!(
            queue = %queue,
            url = %url,
            concurrency,
            tasks = ?self.core.registry.registered_names(),
            "worker started"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut running = JoinSet::new();
        let mut failures: u32 = 0;

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            while let Some(joined) = running.try_join_next() {
                log_supervisor_exit(joined);
            }

            let available = permits.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    joined = running.join_next() => {
                        if let Some(joined) = joined {
                            log_supervisor_exit(joined);
                        }
                    }
                }
                continue;
            }

            // a receive is never cancelled; its messages would stay invisible until they time out
            match self.core.channel.bulk_receive(&queue, available).await {
                Ok(envelopes) => {
                    failures = 0;
                    if envelopes.is_empty() {
                        if self.core.channel.options().wait_time.is_zero() {
                            idle(&mut shutdown_rx, IDLE_POLL).await;
                        }
                        continue;
                    }
                    debug!(count = envelopes.len(), "received messages");
                    for envelope in envelopes {
                        let Ok(permit) = permits.clone().acquire_owned().await else {
                            break;
                        };
                        running.spawn(process(self.core.clone(), envelope, permit));
                    }
                }
                Err(error) => {
                    failures = failures.saturating_add(1);
                    let delay = backoff_delay(failures);
                    warn!(
                        %error,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "receive failed, backing off"
                    );
                    idle(&mut shutdown_rx, delay).await;
                }
            }
        }

        info!(running = running.len(), "shutdown requested, waiting for running tasks");
        while let Some(joined) = running.join_next().await {
            log_supervisor_exit(joined);
        }
        self.ping.stop().await;
        let report = self.core.backend.drain().await;
        self.drain.stop().await;
        info!(
            taken = report.taken,
            delivered = report.delivered,
            failed = report.failed,
            "worker stopped"
        );
        Ok(())
    }

    /// Drain the result buffer now.
    pub async fn flush_results(&self) -> DrainReport {
        self.core.backend.drain().await
    }
}

async fn idle(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) {
    tokio::select! {
        _ = shutdown_rx.changed() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << exponent).min(BACKOFF_MAX_MS);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(base.saturating_add(jitter))
}

fn log_supervisor_exit(joined: Result<(), JoinError>) {
    if let Err(error) = joined {
        error!(%error, "task supervisor exited abnormally");
    }
}

/// Run one delivery to completion and settle it on the queue.
async fn process(core: Arc<WorkerCore>, envelope: Envelope, _permit: OwnedSemaphorePermit) {
    let lease = envelope.lease().clone();
    let request = match decode_request(&envelope) {
        Ok(request) => request,
        Err(error) => {
            error!(message_id = %envelope.delivery.message_id, %error, "cannot decode task request");
            core.channel.abandon(&lease);
            return;
        }
    };
    let label = request.label();
    let job_id = request.id.clone();

    let Some(handler) = core.registry.get(&request.name) else {
        warn!(task = %label, "received unregistered task");
        let error = TaskError::not_registered(&request.name);
        settle_failure(&core, &request, &lease, error).await;
        return;
    };

    let task = Arc::new(InFlightTask::new(
        job_id.clone(),
        label.clone(),
        core.clock.now(),
        core.visibility_timeout,
        lease.clone(),
    ));
    if !core.active.insert(task.clone()) {
        warn!(task = %label, "task is already running here, skipping the duplicate delivery");
        core.channel.abandon(&lease);
        return;
    }

    info!(task = %label, receive_count = envelope.delivery.receive_count, "task received");
    let execution = tokio::spawn({
        let request = request.clone();
        async move { handler.handle_dyn(&request).await }
    });
    task.attach_abort(execution.abort_handle());
    // the lease may have been lost before the abort handle was attached
    if task.is_lost().await {
        task.abort();
    }
    let joined = execution.await;
    core.active.remove(&job_id);

    match joined {
        Ok(Ok(value)) => {
            info!(task = %label, "task succeeded");
            core.backend
                .store_result(&job_id, value, TaskStatus::Success, None, &request)
                .await;
            if let Err(error) = core.channel.ack(&lease).await {
                warn!(task = %label, %error, "failed to delete message");
            }
        }
        Ok(Err(error)) => {
            info!(task = %label, %error, "task failed");
            settle_failure(&core, &request, &lease, error).await;
        }
        Err(join) if join.is_cancelled() => {
            warn!(task = %label, "task abandoned after its lease was lost");
            core.channel.abandon(&lease);
        }
        Err(join) => {
            let message = panic_message(join.into_panic());
            error!(task = %label, %message, "task panicked");
            settle_failure(&core, &request, &lease, TaskError::with_type("Panic", message)).await;
        }
    }
}

/// Failures are final: the result is stored and the message is removed.
async fn settle_failure(core: &WorkerCore, request: &TaskRequest, lease: &LeaseHandle, error: TaskError) {
    let result: Value = error.to_result_value();
    core.backend
        .store_result(&request.id, result, TaskStatus::Failure, error.traceback, request)
        .await;
    if let Err(error) = core.channel.reject(lease, false).await {
        warn!(task = %request.label(), %error, "failed to remove failed message");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}
