//! InMemoryQueueClient - 開発・テスト用の SQS
//!
//! # 再現している挙動
//! - receive ごとの receipt handle と visibility timeout（期限切れで再配送）
//! - `ApproximateReceiveCount`
//! - FIFO: 同じ group の先行メッセージが in-flight の間は後続を配らない
//! - FIFO: `MessageDeduplicationId` による重複排除（5 分間）
//! - 期限切れ receipt への visibility 変更はエラー
//! - 削除済みメッセージの receipt での再削除は成功扱い
//!
//! long-poll は Mutex + Condvar を `spawn_blocking` の中で待ちます。
//! visibility・long-poll の待ち時間・重複排除の期限はすべて [`Clock`] で測るので、
//! テストでは `ManualClock` を進めるだけで lease の期限切れや long-poll の終了を起こせます。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::channel::adapter::is_fifo;
use crate::lease::MAX_VISIBILITY_TIMEOUT;
use crate::ports::clock::{Clock, SystemClock};
use crate::ports::id_generator::{IdGenerator, UlidGenerator};
use crate::ports::queue_client::{
    ATTR_GROUP_ID, ATTR_RECEIVE_COUNT, BatchOutcome, ClientError, FailedEntry, NativeMessage,
    QueueClient, ReceiveRequest, SQS_MAX_MESSAGES, SendEntry, SentEntry,
};

/// Visibility timeout used when a receive does not ask for one.
pub const DEFAULT_QUEUE_VISIBILITY: u32 = 30;

/// How long a deduplication id suppresses repeated sends.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// Longest real-time wait between clock checks during a long poll.
const POLL_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct StoredMessage {
    message_id: String,
    body: String,
    group_id: Option<String>,
    receive_count: u32,
    receipt: Option<String>,
    invisible_until: Option<Instant>,
}

impl StoredMessage {
    fn in_flight(&self, now: Instant) -> bool {
        self.invisible_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    fifo: bool,
    messages: VecDeque<StoredMessage>,
    /// dedup id -> (message id, first sent at)
    dedup: HashMap<String, (String, Instant)>,
    /// receipt -> deleted at
    deleted: HashMap<String, Instant>,
}

impl QueueState {
    fn forget_expired(&mut self, now: Instant) {
        self.dedup
            .retain(|_, (_, sent_at)| now.saturating_duration_since(*sent_at) < DEDUP_WINDOW);
        self.deleted
            .retain(|_, deleted_at| now.saturating_duration_since(*deleted_at) < DEDUP_WINDOW);
    }
}

#[derive(Debug, Default)]
struct Queues {
    urls: HashMap<String, String>,
    by_url: HashMap<String, QueueState>,
}

pub struct InMemoryQueueClient {
    queues: Arc<Mutex<Queues>>,
    condvar: Arc<Condvar>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    base_url: String,
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: Arc::new(Mutex::new(Queues::default())),
            condvar: Arc::new(Condvar::new()),
            clock,
            ids: Arc::new(UlidGenerator::new()),
            base_url: "memory://leasehold".to_string(),
        }
    }

    /// Create `name` (idempotent) and return its url.
    pub fn create_queue(&self, name: &str) -> String {
        let url = format!("{}/{}", self.base_url, name);
        self.create_queue_at(name, &url)
    }

    /// Create `name` under an explicit url, e.g. one listed in `predefined_queues`.
    pub fn create_queue_at(&self, name: &str, url: &str) -> String {
        let mut queues = self.lock();
        queues.urls.insert(name.to_string(), url.to_string());
        queues
            .by_url
            .entry(url.to_string())
            .or_insert_with(|| QueueState {
                fifo: is_fifo(name) || is_fifo(url),
                ..QueueState::default()
            });
        url.to_string()
    }

    /// Create the queue a [`Channel`](crate::channel::Channel) will address for `queue`.
    ///
    /// `queue` may be a full url or a name; a name listed in `predefined_queues`
    /// gets its predefined url.
    pub fn provision_queue(&self, queue: &str, predefined_queues: &BTreeMap<String, String>) -> String {
        if queue.contains("://") {
            let name = queue.trim_end_matches('/').rsplit('/').next().unwrap_or(queue);
            return self.create_queue_at(name, queue);
        }
        match predefined_queues.get(queue) {
            Some(url) => self.create_queue_at(queue, url),
            None => self.create_queue(queue),
        }
    }

    /// Append a message the way a producer would.
    pub fn push_message(
        &self,
        queue_url: &str,
        body: impl Into<String>,
        group_id: Option<&str>,
    ) -> Result<String, ClientError> {
        let message_id = self.ids.generate_message_id().into_inner();
        let mut queues = self.lock();
        let queue = queues
            .by_url
            .get_mut(queue_url)
            .ok_or_else(|| non_existent(queue_url))?;
        queue.messages.push_back(StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            group_id: group_id.map(str::to_string),
            receive_count: 0,
            receipt: None,
            invisible_until: None,
        });
        self.condvar.notify_all();
        Ok(message_id)
    }

    /// Messages in the queue, in flight or not.
    pub fn message_count(&self, queue_url: &str) -> usize {
        self.lock()
            .by_url
            .get(queue_url)
            .map_or(0, |queue| queue.messages.len())
    }

    /// Bodies of every stored message, oldest first.
    pub fn bodies(&self, queue_url: &str) -> Vec<String> {
        self.lock()
            .by_url
            .get(queue_url)
            .map(|queue| queue.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryQueueClient {
    fn default() -> Self {
        Self::new()
    }
}

fn non_existent(queue: &str) -> ClientError {
    ClientError::service(
        "AWS.SimpleQueueService.NonExistentQueue",
        format!("The specified queue {queue} does not exist."),
    )
}

fn expired_receipt(receipt: &str) -> ClientError {
    ClientError::service(
        "InvalidParameterValue",
        format!(
            "Value {receipt} for parameter ReceiptHandle is invalid. Reason: The receipt handle has expired."
        ),
    )
}

/// Pick up to `max` deliverable messages, marking them in flight.
fn take_visible(
    queue: &mut QueueState,
    request: &ReceiveRequest,
    now: Instant,
    ids: &dyn IdGenerator,
) -> Vec<NativeMessage> {
    let visibility = request.visibility_timeout.unwrap_or(DEFAULT_QUEUE_VISIBILITY);
    let max = request.max_messages.clamp(1, SQS_MAX_MESSAGES);
    let want_count = request.attribute_names.iter().any(|a| a == ATTR_RECEIVE_COUNT);
    let want_group = request.attribute_names.iter().any(|a| a == ATTR_GROUP_ID);

    let mut blocked_groups: Vec<String> = Vec::new();
    let mut picked = Vec::new();
    for message in queue.messages.iter_mut() {
        if picked.len() >= max {
            break;
        }
        if message.in_flight(now) {
            if queue.fifo
                && let Some(group) = &message.group_id
            {
                blocked_groups.push(group.clone());
            }
            continue;
        }
        if let Some(group) = &message.group_id
            && blocked_groups.contains(group)
        {
            continue;
        }

        let receipt = ids.generate_receipt().into_inner();
        message.receive_count += 1;
        message.receipt = Some(receipt.clone());
        message.invisible_until = Some(now + Duration::from_secs(u64::from(visibility)));

        let mut attributes = HashMap::new();
        if want_count {
            attributes.insert(ATTR_RECEIVE_COUNT.to_string(), message.receive_count.to_string());
        }
        if want_group && let Some(group) = &message.group_id {
            attributes.insert(ATTR_GROUP_ID.to_string(), group.clone());
        }
        picked.push(NativeMessage {
            message_id: message.message_id.clone(),
            receipt_handle: receipt,
            body: message.body.clone(),
            attributes,
        });
    }
    picked
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn queue_url(&self, name: &str) -> Result<String, ClientError> {
        self.lock()
            .urls
            .get(name)
            .cloned()
            .ok_or_else(|| non_existent(name))
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<NativeMessage>, ClientError> {
        let queues = self.queues.clone();
        let condvar = self.condvar.clone();
        let clock = self.clock.clone();
        let ids = self.ids.clone();
        let queue_url = queue_url.to_string();
        let request = request.clone();

        // long-poll は同期の Condvar 待ちなので spawn_blocking で実行
        tokio::task::spawn_blocking(move || {
            let deadline = clock.now() + request.wait_time;
            let mut guard = queues.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                let now = clock.now();
                let queue = guard
                    .by_url
                    .get_mut(&queue_url)
                    .ok_or_else(|| non_existent(&queue_url))?;
                let picked = take_visible(queue, &request, now, ids.as_ref());
                if !picked.is_empty() {
                    return Ok(picked);
                }
                if now >= deadline {
                    return Ok(Vec::new());
                }

                // a clock moved by hand does not signal the condvar
                let remaining = deadline.saturating_duration_since(now).min(POLL_SLICE);
                let (next, _) = condvar
                    .wait_timeout(guard, remaining)
                    .unwrap_or_else(PoisonError::into_inner);
                guard = next;
            }
        })
        .await
        .map_err(|e| ClientError::Connection(format!("receive failed: {e}")))?
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendEntry>,
    ) -> Result<BatchOutcome, ClientError> {
        if entries.is_empty() {
            return Err(ClientError::service(
                "AWS.SimpleQueueService.EmptyBatchRequest",
                "There should be at least one SendMessageBatchRequestEntry in the request.",
            ));
        }
        if entries.len() > SQS_MAX_MESSAGES {
            return Err(ClientError::service(
                "AWS.SimpleQueueService.TooManyEntriesInBatchRequest",
                format!("Maximum number of entries per request are {SQS_MAX_MESSAGES}."),
            ));
        }

        let now = self.clock.now();
        let mut queues = self.lock();
        let queue = queues
            .by_url
            .get_mut(queue_url)
            .ok_or_else(|| non_existent(queue_url))?;
        queue.forget_expired(now);

        let mut outcome = BatchOutcome::default();
        for entry in entries {
            if queue.fifo && entry.group_id.is_none() {
                outcome.failed.push(FailedEntry {
                    id: entry.id,
                    code: "MissingParameter".into(),
                    message: Some("The request must contain the parameter MessageGroupId.".into()),
                    sender_fault: true,
                });
                continue;
            }
            if let Some(dedup_id) = &entry.dedup_id
                && let Some((existing, _)) = queue.dedup.get(dedup_id)
            {
                outcome.successful.push(SentEntry {
                    id: entry.id,
                    message_id: existing.clone(),
                });
                continue;
            }

            let message_id = self.ids.generate_message_id().into_inner();
            if let Some(dedup_id) = entry.dedup_id {
                queue.dedup.insert(dedup_id, (message_id.clone(), now));
            }
            queue.messages.push_back(StoredMessage {
                message_id: message_id.clone(),
                body: entry.body,
                group_id: entry.group_id,
                receive_count: 0,
                receipt: None,
                invisible_until: None,
            });
            outcome.successful.push(SentEntry {
                id: entry.id,
                message_id,
            });
        }
        self.condvar.notify_all();
        Ok(outcome)
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), ClientError> {
        let now = self.clock.now();
        let mut queues = self.lock();
        let queue = queues
            .by_url
            .get_mut(queue_url)
            .ok_or_else(|| non_existent(queue_url))?;
        queue.forget_expired(now);
        if queue.deleted.contains_key(receipt_handle) {
            return Ok(());
        }
        let position = queue
            .messages
            .iter()
            .position(|m| m.receipt.as_deref() == Some(receipt_handle))
            .ok_or_else(|| {
                ClientError::service(
                    "ReceiptHandleIsInvalid",
                    format!("The input receipt handle \"{receipt_handle}\" is not a valid receipt handle."),
                )
            })?;
        queue.messages.remove(position);
        queue.deleted.insert(receipt_handle.to_string(), now);
        self.condvar.notify_all();
        Ok(())
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> Result<(), ClientError> {
        if visibility_timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(ClientError::service(
                "InvalidParameterValue",
                format!(
                    "Value {visibility_timeout} for parameter VisibilityTimeout is invalid. Reason: Must be between 0 and {MAX_VISIBILITY_TIMEOUT}."
                ),
            ));
        }

        let now = self.clock.now();
        let mut queues = self.lock();
        let queue = queues
            .by_url
            .get_mut(queue_url)
            .ok_or_else(|| non_existent(queue_url))?;
        let message = queue
            .messages
            .iter_mut()
            .find(|m| m.receipt.as_deref() == Some(receipt_handle))
            .ok_or_else(|| expired_receipt(receipt_handle))?;
        if !message.in_flight(now) {
            return Err(ClientError::service(
                "AWS.SimpleQueueService.MessageNotInflight",
                "The message referred to is not in flight.",
            ));
        }

        if visibility_timeout == 0 {
            message.invisible_until = None;
            self.condvar.notify_all();
        } else {
            message.invisible_until = Some(now + Duration::from_secs(u64::from(visibility_timeout)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::clock::ManualClock;

    fn receive_request(max: usize, visibility: u32) -> ReceiveRequest {
        ReceiveRequest {
            max_messages: max,
            wait_time: Duration::ZERO,
            visibility_timeout: Some(visibility),
            attribute_names: vec![ATTR_RECEIVE_COUNT.into(), ATTR_GROUP_ID.into()],
        }
    }

    fn manual() -> (Arc<ManualClock>, InMemoryQueueClient) {
        let clock = Arc::new(ManualClock::new());
        let client = InMemoryQueueClient::with_clock(clock.clone());
        (clock, client)
    }

    #[tokio::test]
    async fn redelivers_after_visibility_expires() {
        let (clock, client) = manual();
        let url = client.create_queue("tasks");
        client.push_message(&url, "hello", None).unwrap();

        let first = client.receive_messages(&url, &receive_request(10, 30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attributes[ATTR_RECEIVE_COUNT], "1");
        assert!(client.receive_messages(&url, &receive_request(10, 30)).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(31));
        let second = client.receive_messages(&url, &receive_request(10, 30)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attributes[ATTR_RECEIVE_COUNT], "2");
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);

        // the first receipt no longer addresses the message
        let err = client
            .change_message_visibility(&url, &first[0].receipt_handle, 60)
            .await
            .unwrap_err();
        assert!(err.is_receipt_expired());
    }

    #[tokio::test]
    async fn extending_visibility_keeps_message_hidden() {
        let (clock, client) = manual();
        let url = client.create_queue("tasks");
        client.push_message(&url, "hello", None).unwrap();
        let received = client.receive_messages(&url, &receive_request(1, 10)).await.unwrap();

        clock.advance(Duration::from_secs(8));
        client
            .change_message_visibility(&url, &received[0].receipt_handle, 20)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(5));
        assert!(client.receive_messages(&url, &receive_request(1, 10)).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(20));
        let err = client
            .change_message_visibility(&url, &received[0].receipt_handle, 20)
            .await
            .unwrap_err();
        assert!(err.is_receipt_expired());
    }

    #[tokio::test]
    async fn fifo_group_waits_for_in_flight_message() {
        let (_clock, client) = manual();
        let url = client.create_queue("tasks.fifo");
        client.push_message(&url, "a1", Some("a")).unwrap();
        client.push_message(&url, "b1", Some("b")).unwrap();

        let first = client.receive_messages(&url, &receive_request(1, 30)).await.unwrap();
        assert_eq!(first[0].body, "a1");
        assert_eq!(first[0].attributes[ATTR_GROUP_ID], "a");

        client.push_message(&url, "a2", Some("a")).unwrap();
        let next = client.receive_messages(&url, &receive_request(10, 30)).await.unwrap();
        assert_eq!(next.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(), vec!["b1"]);

        client.delete_message(&url, &first[0].receipt_handle).await.unwrap();
        let after = client.receive_messages(&url, &receive_request(10, 30)).await.unwrap();
        assert_eq!(after[0].body, "a2");
    }

    #[tokio::test]
    async fn fifo_send_deduplicates_and_requires_group() {
        let client = InMemoryQueueClient::new();
        let url = client.create_queue("results.fifo");
        let entry = |id: &str, group: Option<&str>, dedup: &str| SendEntry {
            id: id.into(),
            body: format!("body-{id}"),
            group_id: group.map(str::to_string),
            dedup_id: Some(dedup.into()),
        };

        let outcome = client
            .send_message_batch(
                &url,
                vec![entry("0", Some("g"), "d-1"), entry("1", Some("g"), "d-1"), entry("2", None, "d-2")],
            )
            .await
            .unwrap();

        assert_eq!(outcome.successful.len(), 2);
        assert_eq!(outcome.successful[0].message_id, outcome.successful[1].message_id);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].id, "2");
        assert_eq!(client.message_count(&url), 1);
    }

    #[tokio::test]
    async fn dedup_ids_expire_after_five_minutes() {
        let (clock, client) = manual();
        let url = client.create_queue("results.fifo");
        let entry = |id: &str| SendEntry {
            id: id.into(),
            body: format!("body-{id}"),
            group_id: Some("g".into()),
            dedup_id: Some("d-1".into()),
        };

        let first = client.send_message_batch(&url, vec![entry("0")]).await.unwrap();
        clock.advance(Duration::from_secs(299));
        let repeat = client.send_message_batch(&url, vec![entry("1")]).await.unwrap();
        assert_eq!(repeat.successful[0].message_id, first.successful[0].message_id);
        assert_eq!(client.message_count(&url), 1);

        clock.advance(Duration::from_secs(2));
        let later = client.send_message_batch(&url, vec![entry("2")]).await.unwrap();
        assert_ne!(later.successful[0].message_id, first.successful[0].message_id);
        assert_eq!(client.message_count(&url), 2);
        assert_eq!(client.lock().by_url[&url].dedup.len(), 1);
    }

    #[tokio::test]
    async fn deleting_twice_succeeds() {
        let (_clock, client) = manual();
        let url = client.create_queue("tasks");
        client.push_message(&url, "hello", None).unwrap();
        let received = client.receive_messages(&url, &receive_request(1, 30)).await.unwrap();

        client.delete_message(&url, &received[0].receipt_handle).await.unwrap();
        client.delete_message(&url, &received[0].receipt_handle).await.unwrap();
        assert_eq!(client.message_count(&url), 0);
        assert!(client.delete_message(&url, "never-issued").await.is_err());
    }

    #[tokio::test]
    async fn rejects_oversized_batches() {
        let client = InMemoryQueueClient::new();
        let url = client.create_queue("results");
        let entries = (0..11)
            .map(|i| SendEntry {
                id: i.to_string(),
                body: "x".into(),
                group_id: None,
                dedup_id: None,
            })
            .collect();
        assert!(client.send_message_batch(&url, entries).await.is_err());
    }

    #[tokio::test]
    async fn long_poll_wakes_on_push() {
        let client = Arc::new(InMemoryQueueClient::new());
        let url = client.create_queue("tasks");

        let waiter = tokio::spawn({
            let client = client.clone();
            let url = url.clone();
            async move {
                let request = ReceiveRequest {
                    wait_time: Duration::from_secs(5),
                    ..receive_request(1, 30)
                };
                client.receive_messages(&url, &request).await.unwrap()
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        client.push_message(&url, "late", None).unwrap();

        let received = waiter.await.unwrap();
        assert_eq!(received[0].body, "late");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn long_poll_follows_the_injected_clock() {
        let (clock, client) = manual();
        let client = Arc::new(client);
        let url = client.create_queue("tasks");
        client.push_message(&url, "hello", None).unwrap();
        let first = client.receive_messages(&url, &receive_request(1, 30)).await.unwrap();
        assert_eq!(first.len(), 1);

        let request = ReceiveRequest {
            wait_time: Duration::from_secs(20),
            ..receive_request(1, 30)
        };
        let waiter = tokio::spawn({
            let client = client.clone();
            let url = url.clone();
            let request = request.clone();
            async move { client.receive_messages(&url, &request).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        // the in-flight message becomes visible again while the poll is waiting
        clock.advance(Duration::from_secs(31));
        let redelivered = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered[0].attributes[ATTR_RECEIVE_COUNT], "2");

        // an empty poll ends once the clock passes the wait time
        let empty = tokio::spawn({
            let client = client.clone();
            let url = url.clone();
            async move { client.receive_messages(&url, &request).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        clock.advance(Duration::from_secs(21));
        let received = tokio::time::timeout(Duration::from_secs(5), empty)
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn queue_at_explicit_url() {
        let client = InMemoryQueueClient::new();
        let url = client.create_queue_at("fifo_req", "http://localhost:9324/queue/fifo_req");
        assert_eq!(url, "http://localhost:9324/queue/fifo_req");
        assert_eq!(client.queue_url("fifo_req").await.unwrap(), url);
        client.push_message(&url, "{}", Some("g")).unwrap();
        assert_eq!(client.message_count(&url), 1);
    }

    #[tokio::test]
    async fn provisioned_queues_match_what_the_channel_resolves() {
        let client = InMemoryQueueClient::new();
        let predefined = BTreeMap::from([(
            "fifo_req".to_string(),
            "http://localhost:9324/queue/fifo_req".to_string(),
        )]);

        assert_eq!(
            client.provision_queue("fifo_req", &predefined),
            "http://localhost:9324/queue/fifo_req"
        );
        assert_eq!(
            client.provision_queue("http://localhost:9324/queue/fifo_res", &predefined),
            "http://localhost:9324/queue/fifo_res"
        );
        assert_eq!(
            client.queue_url("fifo_res").await.unwrap(),
            "http://localhost:9324/queue/fifo_res"
        );
        assert_eq!(client.provision_queue("other", &predefined), "memory://leasehold/other");
    }

    #[tokio::test]
    async fn unknown_queue_is_an_error() {
        let client = InMemoryQueueClient::new();
        assert!(client.queue_url("missing").await.is_err());
        client.create_queue("present");
        assert_eq!(
            client.queue_url("present").await.unwrap(),
            "memory://leasehold/present"
        );
    }
}
