//! Durable storage for the app's jobs.
//!
//! The [`QueueStore`] is injected into the [`crate::app::context::AppContext`] and shared by the
//! code that enqueues jobs and the [`crate::worker::processor::Processor`] that handles them.
//! Multiple processes may share one store; no ordering between jobs is guaranteed.

use crate::error::queue::QueueError;
use crate::worker::config::CompletedAction;
use crate::worker::job::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

pub mod memory;
#[cfg(feature = "queue-pg")]
pub mod pg;

/// A job as it's handed back by [`QueueStore::read`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Message {
    pub id: i64,
    /// The number of times the message has been read, including the current read. This is `1`
    /// the first time a job is handled.
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
    /// The serialized [`Job`]. This is not deserialized by the store so a malformed job can
    /// still be retried or removed using its message id.
    pub payload: serde_json::Value,
}

/// How a job finished. Passed to [`QueueStore::complete`] along with the [`CompletedAction`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum Completion {
    Succeeded,
    Failed,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Ensure the queue exists. Does nothing if it already exists.
    async fn create_queue(&self, queue: &str) -> Result<(), QueueError>;

    /// Ensure the queue used for periodic jobs exists. Periodic jobs are unique by their hash
    /// (see [`QueueStore::push_unique`]).
    async fn create_periodic_queue(&self, queue: &str) -> Result<(), QueueError>;

    /// Add all of the `jobs` to the queue in a single round trip. The jobs will not be visible
    /// to [`QueueStore::read`] until `visible_at`. Returns the ids of the new messages.
    async fn push(
        &self,
        queue: &str,
        jobs: &[Job],
        visible_at: DateTime<Utc>,
    ) -> Result<Vec<i64>, QueueError>;

    /// Add the periodic `job` to the queue unless a job with the same periodic `hash` is already
    /// in the queue. Returns `false` if the job was a duplicate.
    async fn push_unique(
        &self,
        queue: &str,
        job: &Job,
        hash: u64,
        visible_at: DateTime<Utc>,
    ) -> Result<bool, QueueError>;

    /// Claim the oldest visible message in the queue. The message is hidden from other readers
    /// for `visibility_timeout`; if it's not completed or rescheduled in that time, it becomes
    /// visible again and the next read counts as a new attempt.
    async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError>;

    /// Keep an in-progress message hidden until `until`.
    async fn extend_visibility(
        &self,
        queue: &str,
        id: i64,
        until: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Make a failed message visible again at `at`.
    async fn schedule_retry(&self, queue: &str, id: i64, at: DateTime<Utc>)
    -> Result<(), QueueError>;

    /// Move the next run of a periodic message to `at`.
    async fn reschedule(&self, queue: &str, id: i64, at: DateTime<Utc>) -> Result<(), QueueError>;

    /// Remove a finished message from the queue, either by deleting or archiving it.
    async fn complete(
        &self,
        queue: &str,
        id: i64,
        action: &CompletedAction,
        completion: Completion,
    ) -> Result<(), QueueError>;

    /// Delete all messages in the queue. Returns the number of messages deleted.
    async fn purge(&self, queue: &str) -> Result<u64, QueueError>;

    /// Delete the periodic messages whose hash is not in `hashes`. Returns the number of
    /// messages deleted.
    async fn retain_periodic(&self, queue: &str, hashes: &[u64]) -> Result<u64, QueueError>;
}
