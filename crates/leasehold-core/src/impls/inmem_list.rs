//! InMemoryListStore - 開発用のリスト型ストア
//!
//! Redis の SET / LIST 操作のうち、共有結果バッファが使うものだけを持ちます。
//! 1 つの Mutex の下で操作するので take_front は自然に atomic です。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::ports::list_store::{ListStore, StoreError};

#[derive(Default)]
struct State {
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
}

/// InMemoryListStore は開発・テスト用の ListStore
///
/// 複数の SharedListBuffer から同じインスタンスを `Arc` で共有すると、
/// 複数ワーカーが 1 つのストアを使う構成を再現できます。
#[derive(Default)]
pub struct InMemoryListStore {
    state: Mutex<State>,
}

impl InMemoryListStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

#[async_trait]
impl ListStore for InMemoryListStore {
    async fn push_unique(&self, set: &str, member: &str, list: &str, value: String) -> Result<bool, StoreError> {
        Ok(self.with_state(|state| {
            let added = state
                .sets
                .entry(set.to_string())
                .or_default()
                .insert(member.to_string());
            if added {
                state.lists.entry(list.to_string()).or_default().push_back(value);
            }
            added
        }))
    }

    async fn remove_members(&self, set: &str, members: &[String]) -> Result<(), StoreError> {
        self.with_state(|state| {
            if let Some(existing) = state.sets.get_mut(set) {
                for member in members {
                    existing.remove(member);
                }
                if existing.is_empty() {
                    state.sets.remove(set);
                }
            }
        });
        Ok(())
    }

    async fn push_back(&self, list: &str, value: String) -> Result<(), StoreError> {
        self.with_state(|state| state.lists.entry(list.to_string()).or_default().push_back(value));
        Ok(())
    }

    async fn len(&self, list: &str) -> Result<usize, StoreError> {
        Ok(self.with_state(|state| state.lists.get(list).map_or(0, VecDeque::len)))
    }

    async fn take_front(&self, list: &str, count: usize) -> Result<Vec<String>, StoreError> {
        Ok(self.with_state(|state| match state.lists.get_mut(list) {
            Some(items) => {
                let n = count.min(items.len());
                items.drain(..n).collect()
            }
            None => Vec::new(),
        }))
    }
}
