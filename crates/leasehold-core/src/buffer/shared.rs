//! SharedListBuffer - 複数ワーカーで共有する結果バッファ
//!
//! `ListStore` 上の append-only リストです。
//!
//! - `{key}`: レコードのリスト（古い順）
//! - `{key}:ids`: バッファ中の job id の集合（first-write-wins 用）
//!
//! 追加は集合への登録とリストへの append を 1 回の atomic 操作で行います。
//! drain は先頭 N 件の読み出しとその範囲の trim を 1 回の atomic 操作で行うので、
//! 並行して追加されたレコードは失われません。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{BufferError, ResultBuffer};
use crate::domain::{JobId, ResultRecord};
use crate::ports::list_store::ListStore;

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    key: JobId,
    record: ResultRecord,
}

pub struct SharedListBuffer {
    store: Arc<dyn ListStore>,
    list_key: String,
    index_key: String,
}

impl SharedListBuffer {
    pub fn new(store: Arc<dyn ListStore>, key: impl Into<String>) -> Self {
        let list_key = key.into();
        let index_key = format!("{list_key}:ids");
        Self {
            store,
            list_key,
            index_key,
        }
    }

    pub fn key(&self) -> &str {
        &self.list_key
    }
}

#[async_trait]
impl ResultBuffer for SharedListBuffer {
    async fn add(&self, key: &JobId, record: ResultRecord) -> Result<bool, BufferError> {
        let item = serde_json::to_string(&StoredRecord {
            key: key.clone(),
            record,
        })?;
        Ok(self
            .store
            .push_unique(&self.index_key, key.as_str(), &self.list_key, item)
            .await?)
    }

    async fn len(&self) -> Result<usize, BufferError> {
        Ok(self.store.len(&self.list_key).await?)
    }

    async fn take(&self, max: usize) -> Result<Vec<ResultRecord>, BufferError> {
        let items = self.store.take_front(&self.list_key, max).await?;
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::with_capacity(items.len());
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_str::<StoredRecord>(&item) {
                Ok(stored) => {
                    keys.push(stored.key.into_inner());
                    records.push(stored.record);
                }
                Err(error) => {
                    tracing::warn!(%error, list = %self.list_key, "skipping undecodable buffered result");
                }
            }
        }

        if !keys.is_empty()
            && let Err(error) = self.store.remove_members(&self.index_key, &keys).await
        {
            // these job ids now read as duplicates until removed from the index by hand
            tracing::error!(
                %error,
                list = %self.list_key,
                index = %self.index_key,
                job_ids = ?keys,
                "failed to clear buffer index"
            );
        }
        Ok(records)
    }
}
