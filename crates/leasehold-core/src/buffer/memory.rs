//! InMemoryBuffer - プロセス内の結果バッファ

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{BufferError, ResultBuffer};
use crate::domain::{JobId, ResultRecord};

#[derive(Debug, Default)]
struct State {
    order: VecDeque<JobId>,
    records: HashMap<JobId, ResultRecord>,
}

/// Insertion-ordered map of job id -> record.
#[derive(Debug, Default)]
pub struct InMemoryBuffer {
    state: Mutex<State>,
}

impl InMemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultBuffer for InMemoryBuffer {
    async fn add(&self, key: &JobId, record: ResultRecord) -> Result<bool, BufferError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.records.contains_key(key) {
            return Ok(false);
        }
        state.order.push_back(key.clone());
        state.records.insert(key.clone(), record);
        Ok(true)
    }

    async fn len(&self) -> Result<usize, BufferError> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .len())
    }

    async fn take(&self, max: usize) -> Result<Vec<ResultRecord>, BufferError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let count = max.min(state.order.len());
        let keys: Vec<JobId> = state.order.drain(..count).collect();
        Ok(keys
            .iter()
            .filter_map(|key| state.records.remove(key))
            .collect())
    }
}
