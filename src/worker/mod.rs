use crate::app::context::AppContext;
use crate::error::ErrandResult;
use crate::util::types;
use crate::worker::config::{EnqueueConfig, WorkerConfig};
use crate::worker::job::RunAt;
use async_trait::async_trait;
use axum_core::extract::FromRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::time::Duration;
use tracing::instrument;

pub mod config;
pub mod enqueue;
pub mod fan_out;
pub mod job;
pub mod processor;

/// A background job handler. Jobs are enqueued with the `enqueue*` methods, persisted in the
/// app's [`crate::queue::QueueStore`], and handled by a [`processor::Processor`] that has the
/// worker registered.
///
/// Jobs may be handled more than once (e.g., if the process is killed while a job is running,
/// or if it fails and is retried), so [`Worker::handle`] should be idempotent.
#[async_trait]
pub trait Worker<S, Args>: Send + Sync
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
    Args: Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    type Error: std::error::Error + Send + Sync;

    /// The name of the worker. This will be encoded in the job data when it's enqueued in the
    /// queue store, and used to identify which type should handle a job when it's fetched from
    /// the queue. Therefore, it should be unique across the app, and care should be taken when
    /// refactoring.
    ///
    /// By default, [`Self::name`] returns the name of the type that implements the [`Worker`]
    /// trait. See [`types::simple_type_name`].
    ///
    /// This is not included in the [`EnqueueConfig`] because [`EnqueueConfig`] is included in
    /// the [`crate::config::AppConfig`] to allow defining defaults for the config values, but
    /// the name needs to be specified separately for each [`Worker`].
    fn name() -> String
    where
        Self: Sized,
    {
        types::simple_type_name::<Self>()
    }

    /// Get worker-specific configuration options to use when enqueuing a job. Any value not
    /// provided in the returned [`EnqueueConfig`] will fall back to the value from the
    /// [`crate::config::AppConfig`].
    fn enqueue_config(_state: &S) -> EnqueueConfig
    where
        Self: Sized,
    {
        EnqueueConfig::default()
    }

    /// Get worker-specific configuration options to use when handling a job. Any value not provided
    /// in the returned [`WorkerConfig`] will fall back to the value from the
    /// [`crate::config::AppConfig`].
    ///
    /// Called once for each worker when it is registered; the config is stored by the
    /// [`processor::Processor`] and used every time the worker handles a job.
    fn worker_config(&self, _state: &S) -> WorkerConfig {
        WorkerConfig::default()
    }

    #[instrument(skip_all)]
    async fn enqueue<T>(state: &S, args: T) -> ErrandResult<()>
    where
        Self: 'static + Sized,
        T: Send + Sync + Borrow<Args> + Serialize,
    {
        enqueue::enqueue::<Self, _, _, _>(state, args, RunAt::Now).await
    }

    #[instrument(skip_all)]
    async fn enqueue_delayed<T>(state: &S, args: T, delay: Duration) -> ErrandResult<()>
    where
        Self: 'static + Sized,
        T: Send + Sync + Borrow<Args> + Serialize,
    {
        enqueue::enqueue::<Self, _, _, _>(state, args, RunAt::After(delay)).await
    }

    /// Enqueue a job to run at the given time. A time in the past is treated as "now".
    #[instrument(skip_all)]
    async fn enqueue_at<T>(state: &S, args: T, at: DateTime<Utc>) -> ErrandResult<()>
    where
        Self: 'static + Sized,
        T: Send + Sync + Borrow<Args> + Serialize,
    {
        enqueue::enqueue::<Self, _, _, _>(state, args, RunAt::At(at)).await
    }

    /// Enqueue a job for each of the `args`. The jobs are sent to the queue store in chunks of
    /// at most `enqueue-config.batch-size` jobs.
    #[instrument(skip_all)]
    async fn enqueue_batch(state: &S, args: &[Args]) -> ErrandResult<()>
    where
        Self: 'static + Sized,
    {
        enqueue::enqueue_batch::<Self, _, _, _>(state, args, RunAt::Now).await
    }

    #[instrument(skip_all)]
    async fn enqueue_batch_delayed(state: &S, args: &[Args], delay: Duration) -> ErrandResult<()>
    where
        Self: 'static + Sized,
    {
        enqueue::enqueue_batch::<Self, _, _, _>(state, args, RunAt::After(delay)).await
    }

    async fn handle(&self, state: &S, args: Args) -> Result<(), Self::Error>;
}
