use crate::app::context::AppContext;
use crate::error::ErrandResult;
use crate::worker::Worker;
use crate::worker::processor::{Processor, ProcessorError, ProcessorInner, WorkerWrapper};
use axum_core::extract::FromRef;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{error, info};

#[non_exhaustive]
pub struct ProcessorBuilder<S>
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    inner: ProcessorInner<S>,
}

/// The args to enqueue a periodic job with, and the cron schedule to enqueue it on.
#[derive(bon::Builder)]
#[non_exhaustive]
pub struct PeriodicArgs<Args>
where
    Args: Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    pub args: Args,
    pub schedule: Schedule,
}

#[derive(Clone, bon::Builder, Eq, PartialEq)]
#[non_exhaustive]
pub(crate) struct PeriodicArgsJson {
    pub(crate) args: serde_json::Value,
    #[builder(into)]
    pub(crate) worker_name: String,
    pub(crate) schedule: Schedule,
}

impl Ord for PeriodicArgsJson {
    fn cmp(&self, other: &Self) -> Ordering {
        self.worker_name
            .cmp(&other.worker_name)
            .then(self.schedule.to_string().cmp(&other.schedule.to_string()))
            .then(
                serde_json::to_string(&self.args)
                    .unwrap_or_default()
                    .cmp(&serde_json::to_string(&other.args).unwrap_or_default()),
            )
    }
}

impl PartialOrd for PeriodicArgsJson {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> ProcessorBuilder<S>
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    pub(crate) fn new(state: &S) -> Self {
        Self {
            inner: ProcessorInner {
                state: state.clone(),
                queues: Default::default(),
                workers: Default::default(),
                periodic_workers: Default::default(),
            },
        }
    }

    pub fn build(self) -> Processor<S> {
        Processor::new(self.inner)
    }

    pub fn register<W, Args, E>(mut self, worker: W) -> ErrandResult<Self>
    where
        W: 'static + Worker<S, Args, Error = E>,
        Args: Send + Sync + Serialize + for<'de> Deserialize<'de>,
        E: 'static + std::error::Error + Send + Sync,
    {
        let name = W::name();
        info!(worker.name = name, "Registering worker");

        self.register_internal(worker, name, false)?;

        Ok(self)
    }

    /// Register a worker that will be enqueued on the given schedule. The same worker can be
    /// registered with multiple schedules or args, but each combination can only be registered
    /// once.
    pub fn register_periodic<W, Args, E>(
        mut self,
        worker: W,
        periodic_args: PeriodicArgs<Args>,
    ) -> ErrandResult<Self>
    where
        W: 'static + Worker<S, Args, Error = E>,
        Args: Send + Sync + Serialize + for<'de> Deserialize<'de>,
        E: 'static + std::error::Error + Send + Sync,
    {
        let name = W::name();
        info!(worker.name = name, schedule = %periodic_args.schedule, "Registering periodic worker");

        self.register_internal(worker, name.clone(), true)?;

        let periodic_args = PeriodicArgsJson::builder()
            .args(serde_json::to_value(periodic_args.args)?)
            .worker_name(name)
            .schedule(periodic_args.schedule)
            .build();

        if let Some(replaced) = self.inner.periodic_workers.replace(periodic_args) {
            return Err(ProcessorError::AlreadyRegisteredPeriodic(
                replaced.worker_name,
                replaced.schedule,
                replaced.args,
            )
            .into());
        }

        Ok(self)
    }

    fn register_internal<W, Args, E>(
        &mut self,
        worker: W,
        name: String,
        skip_duplicate: bool,
    ) -> ErrandResult<()>
    where
        W: 'static + Worker<S, Args, Error = E>,
        Args: Send + Sync + Serialize + for<'de> Deserialize<'de>,
        E: 'static + std::error::Error + Send + Sync,
    {
        let context = AppContext::from_ref(&self.inner.state);
        let enqueue_config = &context.config().worker.enqueue_config;
        let worker_enqueue_config = W::enqueue_config(&self.inner.state);

        let queue = worker_enqueue_config
            .queue
            .as_ref()
            .or(enqueue_config.queue.as_ref());
        let Some(queue) = queue else {
            error!(
                worker.name = name,
                "Unable to register worker, no queue configured"
            );
            return Err(ProcessorError::NoQueue(name).into());
        };
        self.inner.queues.insert(queue.to_owned());

        if self
            .inner
            .workers
            .insert(
                name.clone(),
                WorkerWrapper::new(&self.inner.state, worker, queue.to_owned()),
            )
            .is_some()
            && !skip_duplicate
        {
            return Err(ProcessorError::AlreadyRegistered(name).into());
        }

        Ok(())
    }
}
