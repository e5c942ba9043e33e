//! leasehold デモ
//!
//! in-memory の SQS に FIFO メッセージを投入し、ワーカーで処理して結果キューの中身を表示します。
//! `aws` feature を有効にして broker.endpoint_url / broker.region を設定すると、
//! 実際の SQS を Ctrl+C まで consume します。
//!
//! ```text
//! RUST_LOG=leasehold_core=debug cargo run -p leasehold-cli -- leasehold.toml
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasehold_core::impls::InMemoryQueueClient;
use leasehold_core::ports::list_store::ListStore;
use leasehold_core::ports::queue_client::QueueClient;
use leasehold_core::typed::{Handler, Task, TaskError};
use leasehold_core::{BufferStrategy, LeaseholdConfig, WorkerBuilder};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalipsoFunction {
    no_of_days: u32,
}

impl Task for CalipsoFunction {
    const NAME: &'static str = "calipso.function";
    type Output = String;
}

struct CalipsoHandler;

#[async_trait]
impl Handler<CalipsoFunction> for CalipsoHandler {
    async fn handle(&self, task: CalipsoFunction) -> Result<String, TaskError> {
        if task.no_of_days == 0 {
            return Err(TaskError::with_type("ValueError", "noOfDays must be positive"));
        }
        Ok(format!("{} days from now", task.no_of_days))
    }
}

/// 長く走るタスク（visibility timeout の延長をログで確認する用）
#[derive(Debug, Deserialize)]
struct Sleepy {
    seconds: u64,
}

impl Task for Sleepy {
    const NAME: &'static str = "demo.sleepy";
    type Output = Value;
}

struct SleepyHandler;

#[async_trait]
impl Handler<Sleepy> for SleepyHandler {
    async fn handle(&self, task: Sleepy) -> Result<Value, TaskError> {
        tokio::time::sleep(Duration::from_secs(task.seconds)).await;
        Ok(json!({ "slept": task.seconds }))
    }
}

fn load_config() -> anyhow::Result<LeaseholdConfig> {
    match std::env::args().nth(1) {
        Some(path) => LeaseholdConfig::from_file(&path).with_context(|| format!("loading config from {path}")),
        None => {
            let mut config = LeaseholdConfig::default();
            config.broker.queue = "fifo_req".into();
            config.broker.visibility_timeout = 4;
            config.lease.ping_interval_secs = 1;
            Ok(config)
        }
    }
}

#[cfg(feature = "aws")]
async fn remote_client(config: &LeaseholdConfig) -> Option<Arc<dyn QueueClient>> {
    let broker = &config.broker;
    if broker.endpoint_url.is_none() && broker.region.is_none() {
        return None;
    }
    let client = leasehold_core::impls::AwsSqsClient::from_config(broker).await;
    Some(Arc::new(client))
}

#[cfg(not(feature = "aws"))]
async fn remote_client(_config: &LeaseholdConfig) -> Option<Arc<dyn QueueClient>> {
    None
}

#[cfg(feature = "redis")]
async fn shared_store(url: &str) -> anyhow::Result<Arc<dyn ListStore>> {
    let store = leasehold_core::impls::RedisListStore::connect(url)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn shared_store(url: &str) -> anyhow::Result<Arc<dyn ListStore>> {
    tracing::warn!(url, "built without the redis feature, using a process-local list store");
    Ok(Arc::new(leasehold_core::impls::InMemoryListStore::new()))
}

/// 投入するサンプルメッセージ（本文, MessageGroupId）
fn demo_messages() -> Vec<(Value, &'static str)> {
    vec![
        (json!({ "noOfDays": 3 }), CalipsoFunction::NAME),
        (json!({ "noOfDays": 0 }), CalipsoFunction::NAME),
        (json!({ "seconds": 6 }), Sleepy::NAME),
        (json!({}), "calipso.unknown"),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;

    // (A) キュークライアント（未指定なら in-memory でデモ）
    let memory = Arc::new(InMemoryQueueClient::new());
    let remote = remote_client(&config).await;
    let demo = remote.is_none();
    let client: Arc<dyn QueueClient> = match remote {
        Some(client) => client,
        None => memory.clone(),
    };

    // (B) ワーカーを構築
    let mut builder = WorkerBuilder::new(config.clone())
        .queue_client(client)
        .register::<CalipsoFunction, _>(CalipsoHandler)?
        .register::<Sleepy, _>(SleepyHandler)?
        .expect_tasks(&[CalipsoFunction::NAME, Sleepy::NAME]);
    if let BufferStrategy::Shared { url, .. } = &config.results.buffer {
        builder = builder.list_store(shared_store(url).await?);
    }
    let worker = Arc::new(builder.build()?);

    // (C) デモならキューを作ってメッセージを投入
    // predefined_queues やフル url の backend_url でも、チャネルが解決する url に作る
    let predefined = &worker.channel().options().predefined_queues;
    let request_url = memory.provision_queue(&config.broker.queue, predefined);
    let result_url = memory.provision_queue(worker.backend().queue(), predefined);
    if demo {
        for (body, group) in demo_messages() {
            let message_id = memory.push_message(&request_url, body.to_string(), Some(group))?;
            info!(%message_id, group, "seeded message");
        }
    }

    // (D) ワーカーを起動し、キューが空になるか Ctrl+C で停止
    let run = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            info!("ctrl-c received");
        }
        _ = wait_until_empty(&memory, &request_url), if demo => {
            info!("request queue is empty");
        }
    }
    worker.shutdown();
    run.await??;

    // (E) 結果キューの中身を表示
    if demo {
        for body in memory.bodies(&result_url) {
            let record: Value = serde_json::from_str(&body)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }
    Ok(())
}

async fn wait_until_empty(client: &InMemoryQueueClient, url: &str) {
    while client.message_count(url) > 0 {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
