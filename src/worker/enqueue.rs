use crate::app::context::AppContext;
use crate::error::ErrandResult;
use crate::error::worker::EnqueueError;
use crate::worker::Worker;
use crate::worker::config::EnqueueConfig;
use crate::worker::job::{Job, JobMetadata, RunAt};
use axum_core::extract::FromRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use tracing::{debug, error};

/// The worker's [`EnqueueConfig`], with any missing values filled in from the app's config.
pub(crate) fn enqueue_config<W, S, Args>(state: &S) -> EnqueueConfig
where
    W: 'static + Worker<S, Args>,
    S: 'static + Send + Sync + Clone,
    AppContext: FromRef<S>,
    Args: Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    let context = AppContext::from_ref(state);
    W::enqueue_config(state).or(&context.config().worker.enqueue_config)
}

pub(crate) fn queue_from_config(
    worker_name: &str,
    enqueue_config: &EnqueueConfig,
) -> Result<String, EnqueueError> {
    if let Some(queue) = enqueue_config.queue.as_ref() {
        Ok(queue.to_owned())
    } else {
        error!(
            worker.name = worker_name,
            "Unable to enqueue job, no queue configured"
        );
        Err(EnqueueError::NoQueue(worker_name.to_owned()))
    }
}

fn new_job(
    worker_name: &str,
    args: serde_json::Value,
    scheduled_at: Option<DateTime<Utc>>,
) -> Job {
    Job::builder()
        .metadata(
            JobMetadata::builder()
                .worker_name(worker_name)
                .maybe_scheduled_at(scheduled_at)
                .build(),
        )
        .args(args)
        .build()
}

/// Serialize the `args` into a [`Job`] for the worker and push it to the worker's queue.
pub(crate) async fn enqueue<W, S, Args, ArgsRef>(
    state: &S,
    args: ArgsRef,
    run_at: RunAt,
) -> ErrandResult<()>
where
    W: 'static + Worker<S, Args>,
    S: 'static + Send + Sync + Clone,
    AppContext: FromRef<S>,
    Args: Send + Sync + Serialize + for<'de> Deserialize<'de>,
    ArgsRef: Send + Sync + Borrow<Args> + Serialize,
{
    let worker_name = W::name();
    let queue = queue_from_config(&worker_name, &enqueue_config::<W, S, Args>(state))?;

    let args = serde_json::to_value(&args).map_err(EnqueueError::Serde)?;
    let now = Utc::now();
    let job = new_job(&worker_name, args, run_at.scheduled_at(now));

    let context = AppContext::from_ref(state);
    let ids = context
        .queue()
        .push(&queue, &[job], run_at.visible_at(now))
        .await?;
    debug!(
        worker.name = worker_name,
        queue,
        job.msg_id = ids.first(),
        ?run_at,
        "Job enqueued"
    );

    Ok(())
}

/// Serialize each of the `args` into a [`Job`] for the worker and push them to the worker's
/// queue in chunks of at most `batch-size` jobs. If a chunk can't be pushed, the error is
/// returned and the remaining chunks are not pushed.
pub(crate) async fn enqueue_batch<W, S, Args, ArgsRef>(
    state: &S,
    args: &[ArgsRef],
    run_at: RunAt,
) -> ErrandResult<()>
where
    W: 'static + Worker<S, Args>,
    S: 'static + Send + Sync + Clone,
    AppContext: FromRef<S>,
    Args: Send + Sync + Serialize + for<'de> Deserialize<'de>,
    ArgsRef: Send + Sync + Borrow<Args> + Serialize,
{
    if args.is_empty() {
        return Ok(());
    }

    let worker_name = W::name();
    let enqueue_config = enqueue_config::<W, S, Args>(state);
    let queue = queue_from_config(&worker_name, &enqueue_config)?;
    let batch_size = enqueue_config.batch_size();

    let now = Utc::now();
    let scheduled_at = run_at.scheduled_at(now);
    let jobs = args
        .iter()
        .map(|arg| {
            serde_json::to_value(arg)
                .map(|arg| new_job(&worker_name, arg, scheduled_at))
                .map_err(EnqueueError::Serde)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let context = AppContext::from_ref(state);
    let visible_at = run_at.visible_at(now);
    for (chunk_num, chunk) in jobs.chunks(batch_size).enumerate() {
        let ids = context.queue().push(&queue, chunk, visible_at).await?;
        debug!(
            worker.name = worker_name,
            queue,
            chunk = chunk_num,
            count = ids.len(),
            ?run_at,
            "Jobs enqueued"
        );
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::app::context::AppContext;
    use crate::cache::memory::NoopCache;
    use crate::config::AppConfig;
    use crate::error::Error;
    use crate::error::queue::QueueError;
    use crate::queue::MockQueueStore;
    use async_trait::async_trait;
    use mockall::predicate::{always, eq};
    use rstest::rstest;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) struct Echo;

    #[async_trait]
    impl Worker<AppContext, u32> for Echo {
        type Error = Infallible;

        fn enqueue_config(_state: &AppContext) -> EnqueueConfig {
            EnqueueConfig::builder().batch_size(2).build()
        }

        #[cfg_attr(coverage_nightly, coverage(off))]
        async fn handle(&self, _state: &AppContext, _args: u32) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    fn context(store: MockQueueStore) -> AppContext {
        AppContext::from_parts(
            AppConfig::test(None).unwrap(),
            Arc::new(store),
            Arc::new(NoopCache),
        )
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(2, 1)]
    #[case(3, 2)]
    #[case(5, 3)]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn enqueue_batch_chunks(#[case] count: u32, #[case] pushes: usize) {
        let mut store = MockQueueStore::new();
        store
            .expect_push()
            .with(eq("default"), always(), always())
            .times(pushes)
            .returning(|_, jobs, _| {
                assert!(jobs.len() <= 2);
                Ok((0..jobs.len() as i64).collect())
            });
        let context = context(store);

        let args = (0..count).collect::<Vec<_>>();
        Echo::enqueue_batch(&context, &args).await.unwrap();
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn enqueue_batch_stops_on_first_failure() {
        let mut store = MockQueueStore::new();
        store
            .expect_push()
            .times(1)
            .returning(|_, _, _| Err(QueueError::Unavailable("connection refused".to_owned())));
        let context = context(store);

        let result = Echo::enqueue_batch(&context, &[1, 2, 3, 4]).await;

        assert!(matches!(
            result,
            Err(Error::Queue(QueueError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn enqueue_delayed() {
        let mut store = MockQueueStore::new();
        store.expect_push().times(1).returning(|_, jobs, visible_at| {
            let job = &jobs[0];
            assert_eq!(job.metadata.worker_name, "Echo");
            assert_eq!(job.args, serde_json::json!(7));
            assert_eq!(job.metadata.scheduled_at, Some(visible_at));
            assert!(visible_at > Utc::now() + chrono::TimeDelta::seconds(50));
            Ok(vec![1])
        });
        let context = context(store);

        Echo::enqueue_delayed(&context, 7u32, Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn enqueue_no_queue() {
        let store = MockQueueStore::new();
        let config = AppConfig::test(Some(
            r#"
            environment = "test"

            [app]
            name = "Test"
            "#,
        ))
        .unwrap();
        let context = AppContext::from_parts(config, Arc::new(store), Arc::new(NoopCache));

        let result = Echo::enqueue(&context, 7u32).await;

        assert!(matches!(
            result,
            Err(Error::Worker(crate::error::worker::WorkerError::Enqueue(
                EnqueueError::NoQueue(_)
            )))
        ));
    }
}
