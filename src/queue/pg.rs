//! [`QueueStore`] backed by Postgres using [pgmq](https://docs.rs/pgmq).

use crate::error::queue::QueueError;
use crate::queue::{Completion, Message, QueueStore};
use crate::worker::config::CompletedAction;
use crate::worker::job::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgmq::{PGMQueue, PgmqError};
use sqlx::error::ErrorKind;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub struct PgQueueStore {
    pgmq: PGMQueue,
}

impl PgQueueStore {
    pub async fn new(uri: &Url) -> Result<Self, QueueError> {
        let pgmq = PGMQueue::new(uri.to_string()).await?;
        Ok(Self { pgmq })
    }

    pub async fn with_pool(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            pgmq: PGMQueue::new_with_pool(pool).await,
        }
    }

    pub fn pgmq(&self) -> &PGMQueue {
        &self.pgmq
    }
}

/// pgmq only supports delays with a granularity of seconds. Round up so a job is never
/// visible earlier than requested.
fn delay_secs(visible_at: DateTime<Utc>) -> u64 {
    let millis = (visible_at - Utc::now()).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        u64::try_from(millis).unwrap_or(u64::MAX).div_ceil(1000)
    }
}

/// Round up for the same reason as [`delay_secs`]: a sub-second timeout must not make an
/// in-progress message visible immediately.
fn visibility_timeout_secs(timeout: Duration) -> i32 {
    let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    i32::try_from(millis.div_ceil(1000)).unwrap_or(i32::MAX)
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn create_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.pgmq.create(queue).await?;
        Ok(())
    }

    async fn create_periodic_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.pgmq.create(queue).await?;
        // A unique index on the periodic job hash ensures we don't enqueue duplicate
        // periodic jobs.
        sqlx::query(&format!(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS errand_{queue}_hash_idx ON pgmq.q_{queue} USING btree ((message->'metadata'->'periodic'->'hash'))"#
        ))
        .execute(&self.pgmq.connection)
        .await?;
        Ok(())
    }

    async fn push(
        &self,
        queue: &str,
        jobs: &[Job],
        visible_at: DateTime<Utc>,
    ) -> Result<Vec<i64>, QueueError> {
        let delay = delay_secs(visible_at);
        let ids = if delay == 0 {
            self.pgmq.send_batch(queue, jobs).await?
        } else {
            self.pgmq.send_batch_delay(queue, jobs, delay).await?
        };
        debug!(queue, count = ids.len(), delay, "Sent batch to pgmq");
        Ok(ids)
    }

    async fn push_unique(
        &self,
        queue: &str,
        job: &Job,
        _hash: u64,
        visible_at: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let result = self
            .pgmq
            .send_delay(queue, job, delay_secs(visible_at))
            .await;

        match result {
            Ok(_) => Ok(true),
            // The unique index created by `create_periodic_queue` rejects duplicates, so we
            // ignore `UniqueViolation` errors, but allow all other errors to be returned.
            Err(PgmqError::DatabaseError(sqlx::Error::Database(err)))
                if matches!(err.kind(), ErrorKind::UniqueViolation) =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError> {
        /*
        Deserialize to `serde_json::Value` instead of `Job`. pgmq does not return the message id
        if an error occurs when deserializing a custom type, so a malformed job would stay at the
        front of the queue indefinitely. The processor deserializes the payload itself.
         */
        let message = self
            .pgmq
            .read::<serde_json::Value>(queue, Some(visibility_timeout_secs(visibility_timeout)))
            .await?;

        Ok(message.map(|message| Message {
            id: message.msg_id,
            read_count: message.read_ct,
            enqueued_at: message.enqueued_at,
            payload: message.message,
        }))
    }

    async fn extend_visibility(
        &self,
        queue: &str,
        id: i64,
        until: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.pgmq
            .set_vt::<serde_json::Value>(queue, id, until)
            .await?;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        queue: &str,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.extend_visibility(queue, id, at).await
    }

    async fn reschedule(&self, queue: &str, id: i64, at: DateTime<Utc>) -> Result<(), QueueError> {
        self.extend_visibility(queue, id, at).await
    }

    async fn complete(
        &self,
        queue: &str,
        id: i64,
        action: &CompletedAction,
        _completion: Completion,
    ) -> Result<(), QueueError> {
        match action {
            CompletedAction::Archive => self.pgmq.archive(queue, id).await?,
            CompletedAction::Delete => self.pgmq.delete(queue, id).await?,
        };
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        Ok(self.pgmq.purge(queue).await?)
    }

    async fn retain_periodic(&self, queue: &str, hashes: &[u64]) -> Result<u64, QueueError> {
        let hashes = hashes
            .iter()
            .map(|hash| serde_json::Value::Number(serde_json::Number::from(*hash)))
            .collect::<Vec<_>>();
        let result = sqlx::query(&format!(
            r#"DELETE FROM pgmq.q_{queue} where message->'metadata'->'periodic'->'hash' != ALL($1)"#
        ))
        .bind(hashes)
        .execute(&self.pgmq.connection)
        .await?;
        Ok(result.rows_affected())
    }
}
