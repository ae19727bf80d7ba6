//! Workers that find pending work and then handle each item in a separate job.
//!
//! A [`FanOutWorker`] has two modes. In "enqueue" mode it discovers the items that need work
//! (e.g., orders that haven't been notified yet) and enqueues one job per item. In "process" mode
//! it handles a single item. Running the enqueue mode on a schedule and letting the processor
//! handle the individual items keeps each job small and independently retryable.

use crate::app::context::AppContext;
use crate::error::worker::WorkerError;
use crate::util::types;
use crate::worker::Worker;
use crate::worker::config::{EnqueueConfig, WorkerConfig};
use async_trait::async_trait;
use axum_core::extract::FromRef;
use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

/// The args of a [`FanOut`] job. Serialized as `null` for [`WorkRequest::Enqueue`], or as the
/// serialized id for [`WorkRequest::Process`]. The id type must therefore not serialize
/// as `null`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WorkRequest<Id> {
    /// Find all pending items and enqueue a [`WorkRequest::Process`] job for each of them.
    Enqueue,
    /// Handle the item with the given id.
    Process(Id),
}

impl<Id: Serialize> Serialize for WorkRequest<Id> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WorkRequest::Enqueue => serializer.serialize_none(),
            WorkRequest::Process(id) => serializer.serialize_some(id),
        }
    }
}

impl<'de, Id: Deserialize<'de>> Deserialize<'de> for WorkRequest<Id> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let id = Option::<Id>::deserialize(deserializer)?;
        Ok(id.map_or(WorkRequest::Enqueue, WorkRequest::Process))
    }
}

/// A worker that discovers its own work. Register it with the processor by wrapping it in a
/// [`FanOut`].
///
/// [`FanOutWorker::process`] may be called more than once for the same id (a job can be retried,
/// or the enqueue mode can run again before a previous job for the same id was handled), so it
/// must be idempotent.
#[async_trait]
pub trait FanOutWorker<S>: Send + Sync
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    type Id: Send + Sync + Serialize + for<'de> Deserialize<'de>;
    type Error: std::error::Error + Send + Sync + 'static;

    /// See [`Worker::name`].
    fn name() -> String
    where
        Self: Sized,
    {
        types::simple_type_name::<Self>()
    }

    /// See [`Worker::enqueue_config`].
    fn enqueue_config(_state: &S) -> EnqueueConfig
    where
        Self: Sized,
    {
        EnqueueConfig::default()
    }

    /// See [`Worker::worker_config`].
    fn worker_config(&self, _state: &S) -> WorkerConfig {
        WorkerConfig::default()
    }

    /// The ids of the items that currently need work.
    async fn pending(&self, state: &S) -> Result<Vec<Self::Id>, Self::Error>;

    /// Do the work for a single item.
    async fn process(&self, state: &S, id: Self::Id) -> Result<(), Self::Error>;
}

/// Adapts a [`FanOutWorker`] into a [`Worker`] that handles [`WorkRequest`]s.
pub struct FanOut<W> {
    inner: W,
}

impl<W> FanOut<W> {
    pub fn new(worker: W) -> Self {
        Self { inner: worker }
    }

    pub fn inner(&self) -> &W {
        &self.inner
    }

    /// Enqueue a job that runs the worker's enqueue mode.
    pub async fn trigger<S>(state: &S) -> crate::error::ErrandResult<()>
    where
        W: 'static + FanOutWorker<S>,
        S: Clone + Send + Sync + 'static,
        AppContext: FromRef<S>,
    {
        <Self as Worker<S, WorkRequest<W::Id>>>::enqueue(state, WorkRequest::Enqueue).await
    }
}

#[async_trait]
impl<W, S> Worker<S, WorkRequest<<W as FanOutWorker<S>>::Id>> for FanOut<W>
where
    W: 'static + FanOutWorker<S>,
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    type Error = crate::error::Error;

    fn name() -> String {
        W::name()
    }

    fn enqueue_config(state: &S) -> EnqueueConfig {
        W::enqueue_config(state)
    }

    fn worker_config(&self, state: &S) -> WorkerConfig {
        self.inner.worker_config(state)
    }

    async fn handle(
        &self,
        state: &S,
        args: WorkRequest<<W as FanOutWorker<S>>::Id>,
    ) -> Result<(), Self::Error> {
        match args {
            WorkRequest::Enqueue => {
                let ids = self
                    .inner
                    .pending(state)
                    .await
                    .map_err(|err| WorkerError::Handle(W::name(), Box::new(err)))?;
                debug!(
                    worker.name = W::name(),
                    count = ids.len(),
                    "Enqueueing pending work"
                );
                let requests = ids.into_iter().map(WorkRequest::Process).collect_vec();
                <Self as Worker<S, WorkRequest<W::Id>>>::enqueue_batch(state, &requests).await
            }
            WorkRequest::Process(id) => {
                self.inner
                    .process(state, id)
                    .await
                    .map_err(|err| WorkerError::Handle(W::name(), Box::new(err)))?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::NoopCache;
    use crate::config::AppConfig;
    use crate::queue::MockQueueStore;
    use crate::queue::memory::MemoryQueueStore;
    use crate::worker::job::Job;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, thiserror::Error)]
    #[error("order {0} could not be notified")]
    struct NotifyError(u64);

    #[derive(Default)]
    struct NotifyOrders {
        pending: Vec<u64>,
        processed: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl FanOutWorker<AppContext> for NotifyOrders {
        type Id = u64;
        type Error = NotifyError;

        async fn pending(&self, _state: &AppContext) -> Result<Vec<u64>, Self::Error> {
            Ok(self.pending.clone())
        }

        async fn process(&self, _state: &AppContext, id: u64) -> Result<(), Self::Error> {
            if id == 0 {
                return Err(NotifyError(id));
            }
            self.processed.lock().unwrap().push(id);
            Ok(())
        }
    }

    #[rstest]
    #[case(WorkRequest::Enqueue, "null")]
    #[case(WorkRequest::Process(7), "7")]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn work_request_serde(#[case] request: WorkRequest<u64>, #[case] expected: &str) {
        let ser = serde_json::to_string(&request).unwrap();
        assert_eq!(ser, expected);
        let deser: WorkRequest<u64> = serde_json::from_str(&ser).unwrap();
        assert_eq!(deser, request);
    }

    #[test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn name() {
        assert_eq!(
            <FanOut<NotifyOrders> as Worker<AppContext, WorkRequest<u64>>>::name(),
            "NotifyOrders"
        );
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn enqueue_mode_pushes_one_job_per_item() {
        let store = Arc::new(MemoryQueueStore::new());
        let context = AppContext::from_parts(
            AppConfig::test(None).unwrap(),
            store.clone(),
            Arc::new(NoopCache),
        );
        let worker = FanOut::new(NotifyOrders {
            pending: vec![7, 8, 9],
            ..Default::default()
        });

        worker.handle(&context, WorkRequest::Enqueue).await.unwrap();

        let args = store
            .messages("default")
            .await
            .iter()
            .map(|message| message.job().unwrap())
            .map(|job: Job| job.args)
            .collect_vec();
        assert_eq!(
            args,
            vec![
                serde_json::json!(7),
                serde_json::json!(8),
                serde_json::json!(9)
            ]
        );
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn enqueue_mode_with_nothing_pending() {
        let mut store = MockQueueStore::new();
        store.expect_push().never();
        let context = AppContext::from_parts(
            AppConfig::test(None).unwrap(),
            Arc::new(store),
            Arc::new(NoopCache),
        );
        let worker = FanOut::new(NotifyOrders::default());

        worker.handle(&context, WorkRequest::Enqueue).await.unwrap();
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn process_mode() {
        let context = AppContext::test(None).unwrap();
        let worker = FanOut::new(NotifyOrders::default());

        worker
            .handle(&context, WorkRequest::Process(7))
            .await
            .unwrap();
        let err = worker
            .handle(&context, WorkRequest::Process(0))
            .await
            .unwrap_err();

        assert_eq!(*worker.inner().processed.lock().unwrap(), vec![7]);
        assert!(matches!(
            &err,
            crate::error::Error::Worker(WorkerError::Handle(name, _)) if name == "NotifyOrders"
        ));
        insta::assert_snapshot!(err, @"An error occurred while handling a job in worker `NotifyOrders`: order 0 could not be notified");
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn enqueue_and_process_errors_name_the_worker() {
        struct Unreachable;

        #[async_trait]
        impl FanOutWorker<AppContext> for Unreachable {
            type Id = u64;
            type Error = NotifyError;

            async fn pending(&self, _state: &AppContext) -> Result<Vec<u64>, Self::Error> {
                Err(NotifyError(1))
            }

            async fn process(&self, _state: &AppContext, id: u64) -> Result<(), Self::Error> {
                Err(NotifyError(id))
            }
        }

        let context = AppContext::test(None).unwrap();
        let worker = FanOut::new(Unreachable);

        for request in [WorkRequest::Enqueue, WorkRequest::Process(2)] {
            let err = worker.handle(&context, request).await.unwrap_err();
            assert!(matches!(
                err,
                crate::error::Error::Worker(WorkerError::Handle(name, _)) if name == "Unreachable"
            ));
        }
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn trigger() {
        let store = Arc::new(MemoryQueueStore::new());
        let context = AppContext::from_parts(
            AppConfig::test(None).unwrap(),
            store.clone(),
            Arc::new(NoopCache),
        );

        FanOut::<NotifyOrders>::trigger(&context).await.unwrap();

        let messages = store.messages("default").await;
        assert_eq!(messages.len(), 1);
        let job = messages[0].job().unwrap();
        assert_eq!(job.metadata.worker_name, "NotifyOrders");
        assert_eq!(job.args, serde_json::Value::Null);
    }
}
