//! DrainScheduler - 結果バッファを定期的に drain する
//!
//! drain はタイマーのタスク上で直接実行します。drain が詰まると次の tick は
//! スキップされます（まとめて追いかけない）。

use std::sync::Arc;
use std::time::Duration;

use super::timer::RepeatingTimer;
use crate::buffer::ResultBackend;

pub struct DrainScheduler {
    timer: RepeatingTimer,
    backend: Arc<ResultBackend>,
}

impl DrainScheduler {
    pub fn new(interval: Duration, backend: Arc<ResultBackend>) -> Self {
        Self {
            timer: RepeatingTimer::new("drain", interval),
            backend,
        }
    }

    pub fn start(&self) -> bool {
        let backend = self.backend.clone();
        self.timer.start(move || {
            let backend = backend.clone();
            async move {
                let report = backend.drain().await;
                if report.taken > 0 {
                    tracing::debug!(?report, "periodic drain");
                }
            }
        })
    }

    pub async fn stop(&self) {
        self.timer.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }
}
