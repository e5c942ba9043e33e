//! ActiveTasks - 実行中タスクの集合

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::controller::InFlightTask;
use crate::domain::JobId;
use crate::ports::canceller::TaskCanceller;

/// Tasks currently executing on this worker, keyed by job id.
///
/// Timers iterate over a [`snapshot`](Self::snapshot) so they never hold the
/// lock while talking to the queue.
#[derive(Debug, Default)]
pub struct ActiveTasks {
    tasks: RwLock<HashMap<JobId, Arc<InFlightTask>>>,
}

impl ActiveTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a task with the same job id is already active.
    pub fn insert(&self, task: Arc<InFlightTask>) -> bool {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if tasks.contains_key(task.job_id()) {
            return false;
        }
        tasks.insert(task.job_id().clone(), task);
        true
    }

    pub fn remove(&self, job_id: &JobId) -> Option<Arc<InFlightTask>> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id)
    }

    pub fn get(&self, job_id: &JobId) -> Option<Arc<InFlightTask>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<InFlightTask>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskCanceller for ActiveTasks {
    fn cancel(&self, job_id: &JobId) -> bool {
        match self.get(job_id) {
            Some(task) => task.abort(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LeaseHandle, ReceiptHandle};
    use std::time::Instant;

    fn in_flight(job: &str) -> Arc<InFlightTask> {
        Arc::new(InFlightTask::new(
            JobId::new(job),
            job,
            Instant::now(),
            30,
            LeaseHandle::new("q", ReceiptHandle::new(format!("rh-{job}"))),
        ))
    }

    #[test]
    fn insert_remove_and_snapshot() {
        let active = ActiveTasks::new();
        assert!(active.insert(in_flight("a")));
        assert!(active.insert(in_flight("b")));
        assert!(!active.insert(in_flight("a")));
        assert_eq!(active.len(), 2);

        let snapshot = active.snapshot();
        active.remove(&JobId::new("a"));

        // snapshot is unaffected by later removal
        assert_eq!(snapshot.len(), 2);
        assert_eq!(active.len(), 1);
        assert!(active.get(&JobId::new("a")).is_none());
    }

    #[tokio::test]
    async fn cancel_aborts_running_task() {
        let active = ActiveTasks::new();
        let task = in_flight("a");
        active.insert(task.clone());

        assert!(!active.cancel(&JobId::new("a")));

        let running = tokio::spawn(std::future::pending::<()>());
        task.attach_abort(running.abort_handle());
        assert!(active.cancel(&JobId::new("a")));
        assert!(running.await.unwrap_err().is_cancelled());

        assert!(!active.cancel(&JobId::new("missing")));
    }
}
