//! PingScheduler - 実行中タスクの lease を定期的に確認する
//!
//! tick ごとに `on_tick` を別タスクで走らせ、`stop()` はそれらの完了まで待ちます。

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;

use super::timer::RepeatingTimer;
use crate::lease::{ActiveTasks, TickOutcome, VisibilityController};

type Ticks = Arc<Mutex<JoinSet<TickOutcome>>>;

pub struct PingScheduler {
    timer: RepeatingTimer,
    active: Arc<ActiveTasks>,
    controller: Arc<VisibilityController>,
    ticks: Ticks,
}

impl PingScheduler {
    pub fn new(
        interval: Duration,
        active: Arc<ActiveTasks>,
        controller: Arc<VisibilityController>,
    ) -> Self {
        Self {
            timer: RepeatingTimer::new("ping", interval),
            active,
            controller,
            ticks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub fn start(&self) -> bool {
        let active = self.active.clone();
        let controller = self.controller.clone();
        let ticks = self.ticks.clone();
        self.timer.start(move || {
            let mut running = ticks.lock().unwrap_or_else(PoisonError::into_inner);
            while running.try_join_next().is_some() {}
            let spawned = ping_active_tasks(&active, &controller, &mut running);
            async move {
                tracing::trace!(tasks = spawned, "pinged active tasks");
            }
        })
    }

    /// Stop the timer and wait for the `on_tick` calls it started.
    pub async fn stop(&self) {
        self.timer.stop().await;
        let mut running = std::mem::take(&mut *self.ticks.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(joined) = running.join_next().await {
            if let Err(error) = joined
                && error.is_panic()
            {
                tracing::error!(%error, "visibility check panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }
}

/// Run `on_tick` for every active task, each on its own tokio task in `running`.
///
/// Works on a snapshot, so tasks finishing meanwhile do not disturb the
/// iteration and a slow RPC never holds up the timer.
pub fn ping_active_tasks(
    active: &ActiveTasks,
    controller: &Arc<VisibilityController>,
    running: &mut JoinSet<TickOutcome>,
) -> usize {
    let snapshot = active.snapshot();
    let count = snapshot.len();
    for task in snapshot {
        let controller = controller.clone();
        running.spawn(async move { controller.on_tick(&task).await });
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, LeaseHandle, ReceiptHandle};
    use crate::lease::{InFlightTask, LeaseRenewer, RenewalError};
    use crate::ports::clock::{Clock, ManualClock};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingRenewer {
        calls: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl LeaseRenewer for RecordingRenewer {
        async fn change_visibility(&self, lease: &LeaseHandle, timeout_secs: u32) -> Result<(), RenewalError> {
            self.calls
                .lock()
                .unwrap()
                .push((lease.receipt().to_string(), timeout_secs));
            Ok(())
        }
    }

    /// Blocks every renewal until released.
    #[derive(Default)]
    struct GatedRenewer {
        entered: Notify,
        release: Notify,
        done: AtomicUsize,
    }

    #[async_trait]
    impl LeaseRenewer for GatedRenewer {
        async fn change_visibility(&self, _lease: &LeaseHandle, _timeout_secs: u32) -> Result<(), RenewalError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn add_task(active: &ActiveTasks, clock: &ManualClock, job: &str, base: u32) {
        active.insert(Arc::new(InFlightTask::new(
            JobId::new(job),
            job,
            clock.now(),
            base,
            LeaseHandle::new("q", ReceiptHandle::new(format!("rh-{job}"))),
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn extends_only_due_tasks() {
        let clock = Arc::new(ManualClock::new());
        let renewer = Arc::new(RecordingRenewer::default());
        let active = Arc::new(ActiveTasks::new());
        let controller = Arc::new(VisibilityController::new(
            renewer.clone(),
            active.clone(),
            clock.clone(),
        ));
        add_task(&active, &clock, "short", 4);
        add_task(&active, &clock, "long", 100);

        let scheduler = PingScheduler::new(Duration::from_secs(2), active.clone(), controller);
        assert!(scheduler.start());

        clock.advance(Duration::from_secs(3));
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        scheduler.stop().await;

        assert_eq!(
            *renewer.calls.lock().unwrap(),
            vec![("rh-short".to_string(), 8)]
        );
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn snapshot_survives_removal() {
        let clock = Arc::new(ManualClock::new());
        let renewer = Arc::new(RecordingRenewer::default());
        let active = Arc::new(ActiveTasks::new());
        let controller = Arc::new(VisibilityController::new(
            renewer.clone(),
            active.clone(),
            clock.clone(),
        ));
        add_task(&active, &clock, "a", 4);
        add_task(&active, &clock, "b", 4);
        clock.advance(Duration::from_secs(3));

        let mut running = JoinSet::new();
        assert_eq!(ping_active_tasks(&active, &controller, &mut running), 2);
        active.remove(&JobId::new("a"));

        while let Some(outcome) = running.join_next().await {
            assert!(matches!(outcome.unwrap(), TickOutcome::Extended { attempt: 2, .. }));
        }
        assert_eq!(renewer.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_running_checks() {
        let clock = Arc::new(ManualClock::new());
        let renewer = Arc::new(GatedRenewer::default());
        let active = Arc::new(ActiveTasks::new());
        let controller = Arc::new(VisibilityController::new(
            renewer.clone(),
            active.clone(),
            clock.clone(),
        ));
        add_task(&active, &clock, "slow", 4);
        clock.advance(Duration::from_secs(3));

        let scheduler = Arc::new(PingScheduler::new(Duration::from_secs(1), active, controller));
        assert!(scheduler.start());
        renewer.entered.notified().await;

        let stopping = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());
        assert_eq!(renewer.done.load(Ordering::SeqCst), 0);

        renewer.release.notify_one();
        stopping.await.unwrap();
        assert_eq!(renewer.done.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running());
    }
}
