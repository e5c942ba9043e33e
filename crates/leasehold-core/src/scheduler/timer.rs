//! RepeatingTimer - 一定間隔でコールバックを呼ぶタイマー
//!
//! - `start()` で spawn、`stop()` で shutdown を送って終了を待つ
//! - `stop()` が返った後にコールバックが呼ばれることはない
//! - 遅れた tick はまとめて呼ばずにスキップする

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

struct Running {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct RepeatingTimer {
    name: String,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl RepeatingTimer {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Call `tick` every interval, first one interval from now.
    ///
    /// Returns `false` (and does nothing) when the timer is already running.
    pub fn start<F, Fut>(&self, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            tracing::warn!(timer = %self.name, "timer already running");
            return false;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.interval;
        let name = self.name.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    // 送信側が drop された場合も止める
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            tracing::debug!(timer = %name, "timer stopped");
        });

        tracing::debug!(timer = %self.name, interval_ms = interval.as_millis() as u64, "timer started");
        *running = Some(Running { shutdown_tx, join });
        true
    }

    /// Stop the timer and wait for a callback in progress to finish.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { shutdown_tx, join }) = running else {
            return;
        };
        // ignore send error: the loop may already be gone
        let _ = shutdown_tx.send(true);
        if let Err(error) = join.await
            && error.is_panic()
        {
            tracing::error!(timer = %self.name, %error, "timer callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(timer: &RepeatingTimer) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        timer.start(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        count
    }

    #[tokio::test(start_paused = true)]
    async fn fires_every_interval() {
        let timer = RepeatingTimer::new("test", Duration::from_secs(2));
        let count = counting(&timer);

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(4_200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        timer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_tick_after_stop() {
        let timer = RepeatingTimer::new("test", Duration::from_secs(1));
        let count = counting(&timer);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        timer.stop().await;
        let seen = count.load(Ordering::SeqCst);
        assert!(!timer.is_running());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_refused() {
        let timer = RepeatingTimer::new("test", Duration::from_secs(1));
        assert!(timer.start(|| async {}));
        assert!(!timer.start(|| async {}));
        timer.stop().await;
        assert!(timer.start(|| async {}));
        timer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_callback_skips_missed_ticks() {
        let timer = RepeatingTimer::new("slow", Duration::from_secs(1));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        timer.start(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(3_500)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        // one tick at 1s, one as soon as that callback returns; the rest were skipped
        assert_eq!(count.load(Ordering::SeqCst), 2);
        timer.stop().await;
    }
}
