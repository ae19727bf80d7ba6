use crate::error::queue::QueueError;
use crate::queue::{Completion, Message, QueueStore};
use crate::worker::config::CompletedAction;
use crate::worker::job::{Job, JobState};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// A [`QueueStore`] that keeps jobs in the memory of the current process.
///
/// Useful for tests, local development, and single-process apps that can tolerate losing jobs
/// when the process exits. Unlike a real store, the current state of each message is exposed
/// via [`MemoryQueueStore::messages`] and [`MemoryQueueStore::archived`].
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    queues: BTreeMap<String, MemoryQueue>,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    messages: BTreeMap<i64, StoredMessage>,
    archive: Vec<StoredMessage>,
}

/// A snapshot of a message held by a [`MemoryQueueStore`].
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct StoredMessage {
    pub id: i64,
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub state: JobState,
    pub payload: serde_json::Value,
}

impl StoredMessage {
    /// Deserialize the payload of the message.
    pub fn job(&self) -> Result<Job, QueueError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    fn periodic_hash(&self) -> Option<u64> {
        self.payload
            .get("metadata")
            .and_then(|metadata| metadata.get("periodic"))
            .and_then(|periodic| periodic.get("hash"))
            .and_then(|hash| hash.as_u64())
    }
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The messages currently in the queue, in the order they were pushed.
    pub async fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        let inner = self.inner.lock().await;
        inner
            .queues
            .get(queue)
            .map(|queue| queue.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The messages that were completed with [`CompletedAction::Archive`], in the order they
    /// were archived.
    pub async fn archived(&self, queue: &str) -> Vec<StoredMessage> {
        let inner = self.inner.lock().await;
        inner
            .queues
            .get(queue)
            .map(|queue| queue.archive.clone())
            .unwrap_or_default()
    }
}

impl Inner {
    fn queue_mut(&mut self, queue: &str) -> Result<&mut MemoryQueue, QueueError> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_owned()))
    }

    fn message_mut(&mut self, queue: &str, id: i64) -> Result<&mut StoredMessage, QueueError> {
        self.queue_mut(queue)?
            .messages
            .get_mut(&id)
            .ok_or_else(|| QueueError::UnknownMessage(queue.to_owned(), id))
    }

    fn insert(
        &mut self,
        queue: &str,
        payload: serde_json::Value,
        visible_at: DateTime<Utc>,
    ) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        self.queues
            .entry(queue.to_owned())
            .or_default()
            .messages
            .insert(
                id,
                StoredMessage {
                    id,
                    read_count: 0,
                    enqueued_at: Utc::now(),
                    visible_at,
                    state: JobState::Pending,
                    payload,
                },
            );
        id
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn create_queue(&self, queue: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.queues.entry(queue.to_owned()).or_default();
        Ok(())
    }

    async fn create_periodic_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.create_queue(queue).await
    }

    /// Pushing to a queue that doesn't exist yet creates it.
    async fn push(
        &self,
        queue: &str,
        jobs: &[Job],
        visible_at: DateTime<Utc>,
    ) -> Result<Vec<i64>, QueueError> {
        // Serialize everything first so a bad job doesn't leave a partial batch behind.
        let payloads = jobs
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        let mut inner = self.inner.lock().await;
        let ids = payloads
            .into_iter()
            .map(|payload| inner.insert(queue, payload, visible_at))
            .collect();
        Ok(ids)
    }

    async fn push_unique(
        &self,
        queue: &str,
        job: &Job,
        hash: u64,
        visible_at: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let payload = serde_json::to_value(job)?;
        let mut inner = self.inner.lock().await;
        let duplicate = inner
            .queues
            .get(queue)
            .map(|queue| {
                queue
                    .messages
                    .values()
                    .any(|message| message.periodic_hash() == Some(hash))
            })
            .unwrap_or_default();
        if duplicate {
            return Ok(false);
        }
        inner.insert(queue, payload, visible_at);
        Ok(true)
    }

    async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let message = inner
            .queue_mut(queue)?
            .messages
            .values_mut()
            .find(|message| message.visible_at <= now);

        let Some(message) = message else {
            return Ok(None);
        };

        message.read_count += 1;
        message.state = JobState::InProgress;
        message.visible_at = TimeDelta::from_std(visibility_timeout)
            .ok()
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Ok(Some(Message {
            id: message.id,
            read_count: message.read_count,
            enqueued_at: message.enqueued_at,
            payload: message.payload.clone(),
        }))
    }

    async fn extend_visibility(
        &self,
        queue: &str,
        id: i64,
        until: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.message_mut(queue, id)?.visible_at = until;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        queue: &str,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let message = inner.message_mut(queue, id)?;
        message.visible_at = at;
        message.state = JobState::Pending;
        Ok(())
    }

    async fn reschedule(&self, queue: &str, id: i64, at: DateTime<Utc>) -> Result<(), QueueError> {
        self.schedule_retry(queue, id, at).await
    }

    async fn complete(
        &self,
        queue: &str,
        id: i64,
        action: &CompletedAction,
        completion: Completion,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let queue_name = queue;
        let queue = inner.queue_mut(queue_name)?;
        let mut message = queue
            .messages
            .remove(&id)
            .ok_or_else(|| QueueError::UnknownMessage(queue_name.to_owned(), id))?;

        message.state = match completion {
            Completion::Succeeded => JobState::Succeeded,
            Completion::Failed => JobState::Failed,
        };

        if let CompletedAction::Archive = action {
            queue.archive.push(message);
        }
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock().await;
        let queue = inner.queue_mut(queue)?;
        let count = queue.messages.len();
        queue.messages.clear();
        Ok(count as u64)
    }

    async fn retain_periodic(&self, queue: &str, hashes: &[u64]) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock().await;
        let queue = inner.queue_mut(queue)?;
        let before = queue.messages.len();
        queue.messages.retain(|_, message| {
            message
                .periodic_hash()
                .is_some_and(|hash| hashes.contains(&hash))
        });
        Ok((before - queue.messages.len()) as u64)
    }
}
