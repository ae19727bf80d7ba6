use crate::app::context::AppContext;
use crate::config::worker::StaleCleanUpBehavior;
use crate::error::ErrandResult;
use crate::error::worker::{DequeueError, EnqueueError, WorkerError};
use crate::queue::Completion;
use crate::worker::Worker;
use crate::worker::config::{CompletedAction, WorkerConfig, retry_delay};
use crate::worker::job::{Job, JobMetadata, RunAt};
use axum_core::extract::FromRef;
use builder::PeriodicArgsJson;
use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, max};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub mod builder;

pub use builder::{PeriodicArgs, ProcessorBuilder};

pub const PERIODIC_QUEUE_NAME: &str = "periodic";

/// Used as the visibility timeout of a job when reading it from the queue if no `max-duration`
/// is configured.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Used if `queue-fetch-config.visibility-margin` is not configured.
const DEFAULT_VISIBILITY_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessorError {
    /// The provided [`Worker`] was already registered. Contains the [`Worker::name`]
    /// of the provided worker.
    #[error("The provided `Worker` was already registered: `{0}`")]
    AlreadyRegistered(String),

    /// The provided periodic job was already registered. Contains the [`Worker::name`],
    /// schedule and args of the job.
    #[error(
        "The provided periodic worker job was already registered. Worker: `{0}`, schedule: `{1}`, args: `{2}`"
    )]
    AlreadyRegisteredPeriodic(String, Schedule, serde_json::Value),

    #[error("No queue configured for worker `{0}`.")]
    NoQueue(String),

    #[error("No worker registered with name `{0}`.")]
    UnknownWorker(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// The result of a single [`Processor::process_next`] cycle.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum JobOutcome {
    /// There were no visible jobs in the queue.
    Empty,
    /// The job was handled successfully and the success action was performed.
    Succeeded,
    /// The job failed on its `attempt`th try and will be visible again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// The job failed and has no retries left; the failure action was performed.
    Failed { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum PeriodicOutcome {
    Empty,
    /// A copy of the periodic job was enqueued on the worker's queue.
    Enqueued,
    /// The periodic job was malformed or its worker is no longer registered, so it was deleted.
    Removed,
}

/// Fetches jobs from the app's [`crate::queue::QueueStore`] and hands them to the registered
/// [`Worker`]s.
#[derive(Clone)]
#[non_exhaustive]
pub struct Processor<S>
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    inner: Arc<ProcessorInner<S>>,
}

#[non_exhaustive]
pub(crate) struct ProcessorInner<S>
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    state: S,
    queues: BTreeSet<String>,
    workers: BTreeMap<String, WorkerWrapper<S>>,
    periodic_workers: BTreeSet<PeriodicArgsJson>,
}

impl<S> Processor<S>
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    pub(crate) fn new(inner: ProcessorInner<S>) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn builder(state: &S) -> ProcessorBuilder<S> {
        ProcessorBuilder::new(state)
    }

    /// Create the queues of all the registered workers and enqueue the periodic jobs. Should be
    /// called once before [`Processor::run`].
    pub async fn before_run(&self) -> ErrandResult<()> {
        self.initialize_queues().await?;
        self.initialize_periodic().await?;
        Ok(())
    }

    async fn initialize_queues(&self) -> ErrandResult<()> {
        let context = AppContext::from_ref(&self.inner.state);
        for queue in self.inner.queues.iter() {
            context.queue().create_queue(queue).await?;
        }
        Ok(())
    }

    /// Initialize the periodic queue and enqueue the periodic jobs in the queue.
    async fn initialize_periodic(&self) -> ErrandResult<()> {
        let context = AppContext::from_ref(&self.inner.state);
        let store = context.queue();

        store.create_periodic_queue(PERIODIC_QUEUE_NAME).await?;

        let periodic_jobs = self
            .inner
            .periodic_workers
            .iter()
            .map(|periodic| {
                Job::periodic(
                    &periodic.worker_name,
                    &periodic.schedule,
                    periodic.args.clone(),
                )
            })
            .collect_vec();

        match context.config().worker.periodic.stale_cleanup {
            StaleCleanUpBehavior::Manual => {}
            StaleCleanUpBehavior::AutoCleanAll => {
                let count = store.purge(PERIODIC_QUEUE_NAME).await?;
                info!(count, "Deleted all previously registered periodic jobs");
            }
            StaleCleanUpBehavior::AutoCleanStale => {
                let current_job_hashes = periodic_jobs
                    .iter()
                    .filter_map(|job| job.metadata.periodic.as_ref().map(|periodic| periodic.hash))
                    .collect_vec();
                let count = store
                    .retain_periodic(PERIODIC_QUEUE_NAME, &current_job_hashes)
                    .await?;
                info!(count, "Deleted stale periodic jobs");
            }
        }

        for job in periodic_jobs.iter() {
            let periodic = job.metadata.periodic.as_ref().ok_or_else(|| {
                EnqueueError::PeriodicJobMissingSchedule(
                    job.metadata.worker_name.clone(),
                    job.args.clone(),
                )
            })?;
            let delay = periodic_next_run_delay(&periodic.schedule, None);
            let enqueued = store
                .push_unique(PERIODIC_QUEUE_NAME, job, periodic.hash, after(Utc::now(), delay))
                .await?;
            debug!(
                worker.name = job.metadata.worker_name,
                schedule = %periodic.schedule,
                enqueued,
                "Initialized periodic job"
            );
        }

        Ok(())
    }

    /// The names of the queues used by the registered workers.
    pub fn queues(&self) -> &BTreeSet<String> {
        &self.inner.queues
    }

    /// The names of the registered workers, along with the queue each one uses.
    pub fn workers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner
            .workers
            .values()
            .map(|worker| (worker.name.as_str(), worker.queue.as_str()))
    }

    /// Enqueue a job for a registered worker using its name and already-serialized args. Useful
    /// when the worker's type is not known, e.g. when enqueuing a job from the CLI.
    #[instrument(skip_all)]
    pub async fn enqueue_json(
        &self,
        worker_name: &str,
        args: serde_json::Value,
        run_at: RunAt,
    ) -> ErrandResult<()> {
        let worker = self
            .inner
            .workers
            .get(worker_name)
            .ok_or_else(|| ProcessorError::UnknownWorker(worker_name.to_owned()))?;

        let now = Utc::now();
        let job = Job::builder()
            .args(args)
            .metadata(
                JobMetadata::builder()
                    .worker_name(worker_name)
                    .maybe_scheduled_at(run_at.scheduled_at(now))
                    .build(),
            )
            .build();

        let context = AppContext::from_ref(&self.inner.state);
        let ids = context
            .queue()
            .push(&worker.queue, &[job], run_at.visible_at(now))
            .await?;
        debug!(
            worker.name = worker_name,
            queue = worker.queue,
            job.msg_id = ids.first(),
            "Job enqueued"
        );
        Ok(())
    }

    /// Process jobs until the `cancellation_token` is cancelled. The shared queues are processed
    /// by `worker.num-workers` tasks, each queue in `worker.queue-config` by its own dedicated
    /// tasks, and the periodic queue by a single task. If one of the tasks panics, the token is
    /// cancelled if `app.shutdown-on-error` is enabled.
    pub async fn run(self, cancellation_token: CancellationToken) {
        let mut join_set = JoinSet::new();

        let context = AppContext::from_ref(&self.inner.state);
        let worker_config = &context.config().worker;
        let dedicated_queues = &worker_config.queue_config;
        let shared_queues = self.shared_queues(&context);

        if !shared_queues.is_empty() {
            let total_worker_tasks = worker_config.num_workers;
            for worker_num in 0..total_worker_tasks {
                join_set.spawn(self.clone().process_queues(
                    cancellation_token.clone(),
                    worker_num + 1,
                    total_worker_tasks,
                    shared_queues.clone(),
                ));
            }
        }

        for (queue, config) in dedicated_queues {
            let total_worker_tasks = config.num_workers.unwrap_or_default();
            for worker_num in 0..total_worker_tasks {
                join_set.spawn(self.clone().process_queues(
                    cancellation_token.clone(),
                    worker_num + 1,
                    total_worker_tasks,
                    vec![queue.to_owned()],
                ));
            }
        }

        if worker_config.periodic.enable && !self.inner.periodic_workers.is_empty() {
            join_set.spawn(self.clone().process_periodic(cancellation_token.clone()));
        }

        let shutdown_on_error = context.config().app.shutdown_on_error;
        while let Some(result) = join_set.join_next().await {
            match result {
                // Tasks only exit normally once the token is cancelled, but make sure the others
                // stop as well.
                Ok(()) => cancellation_token.cancel(),
                Err(join_err) => {
                    error!(
                        "An error occurred when trying to join on one of the processor's workers. Error: {join_err}"
                    );
                    if shutdown_on_error {
                        cancellation_token.cancel();
                    }
                }
            }
        }
    }

    fn shared_queues(&self, context: &AppContext) -> Vec<String> {
        let worker_config = &context.config().worker;
        worker_config
            .queues
            .as_ref()
            .unwrap_or(&self.inner.queues)
            .iter()
            .filter(|queue| !worker_config.queue_config.contains_key(*queue))
            .map(|queue| queue.to_owned())
            .collect_vec()
    }

    async fn process_queues(
        self,
        cancellation_token: CancellationToken,
        worker_task_num: u32,
        total_worker_tasks: u32,
        queues: Vec<String>,
    ) {
        let num_queues = queues.len();
        let queue_name = if num_queues == 1 {
            queues.first().cloned()
        } else {
            None
        };

        let mut queues: BinaryHeap<QueueItem> = queues
            .into_iter()
            .map(|name| QueueItem {
                name,
                next_fetch: Utc::now(),
            })
            .collect();

        let context = AppContext::from_ref(&self.inner.state);
        let fetch_config = &context.config().worker.queue_fetch_config;
        let empty_delay = fetch_config.empty_delay.unwrap_or_default();
        let error_delay = fetch_config.error_delay.unwrap_or_default();

        loop {
            let Some(mut queue) = queues.peek_mut() else {
                return;
            };

            {
                let diff = max(TimeDelta::zero(), queue.next_fetch - Utc::now());
                let duration = diff.to_std().unwrap_or_else(|_| Duration::from_secs(0));
                tokio::select! {
                    // `biased` ensures that the cancellation token is polled first
                    biased;

                    _ = cancellation_token.cancelled() => {
                        info!(
                            worker_task_num,
                            total_worker_tasks,
                            num_queues,
                            queue = queue_name,
                            "Exiting processor worker loop"
                        );
                        return;
                    },
                    _ = sleep(duration) => (),
                }
            }

            queue.next_fetch = match self.process_next(&queue.name).await {
                Ok(JobOutcome::Empty) => after(Utc::now(), empty_delay),
                Ok(_) => Utc::now(),
                Err(err) => {
                    error!(
                        queue = queue.name,
                        "An error occurred while reading from the queue: {err}"
                    );
                    after(Utc::now(), error_delay)
                }
            };
        }
    }

    /// Read the next visible job from the queue and handle it. Returns an error only if the job
    /// could not be read from the queue store. Failures that happen after the job was read are
    /// handled by retrying (or permanently failing) the job, and are reported in the returned
    /// [`JobOutcome`].
    #[instrument(skip_all, fields(queue = queue))]
    pub async fn process_next(&self, queue: &str) -> ErrandResult<JobOutcome> {
        let context = AppContext::from_ref(&self.inner.state);
        let store = context.queue();
        let default_max_duration = context.config().worker.worker_config.max_duration;

        let msg = match store
            .read(queue, visibility_timeout(&context, default_max_duration))
            .await?
        {
            Some(msg) => msg,
            None => return Ok(JobOutcome::Empty),
        };

        let job: Job = match serde_json::from_value(msg.payload) {
            Ok(job) => job,
            Err(err) => {
                error!(
                    msg_id = msg.id,
                    read_count = msg.read_count,
                    queue,
                    "An error occurred while deserializing a job: {err}"
                );
                return Ok(self
                    .retry(&context, queue, None, msg.id, msg.read_count, None)
                    .await);
            }
        };

        let Some(worker) = self.inner.workers.get(&job.metadata.worker_name) else {
            error!(
                msg_id = msg.id,
                read_count = msg.read_count,
                queue,
                worker.name = job.metadata.worker_name,
                "Unable to handle job, worker not registered"
            );
            return Ok(self
                .retry(
                    &context,
                    queue,
                    Some(&job.metadata),
                    msg.id,
                    msg.read_count,
                    None,
                )
                .await);
        };

        // Update the view timeout to match the max duration of the worker, if it's
        // different from the default.
        if let Some(max_duration) = worker
            .worker_config
            .max_duration
            .filter(|max_duration| Some(*max_duration) != default_max_duration)
        {
            let until = after(Utc::now(), visibility_timeout(&context, Some(max_duration)));
            if let Err(err) = store.extend_visibility(queue, msg.id, until).await {
                warn!(
                    msg_id = msg.id,
                    queue,
                    worker.name = worker.name,
                    "An error occurred while updating job's view timeout: {err}"
                );
            }
        }

        let result = worker.handle(&self.inner.state, job.args).await;

        if let Err(err) = result {
            error!(
                msg_id = msg.id,
                read_count = msg.read_count,
                queue,
                worker.name = worker.name,
                "An error occurred while handling a job: {err}"
            );
            Ok(self
                .retry(
                    &context,
                    queue,
                    Some(&job.metadata),
                    msg.id,
                    msg.read_count,
                    Some(worker),
                )
                .await)
        } else {
            self.job_completed(
                &context,
                queue,
                Some(&job.metadata),
                msg.id,
                msg.read_count,
                &worker.worker_config.success_action(),
                Completion::Succeeded,
            )
            .await;
            Ok(JobOutcome::Succeeded)
        }
    }

    async fn process_periodic(self, cancellation_token: CancellationToken) {
        let context = AppContext::from_ref(&self.inner.state);
        let fetch_config = &context.config().worker.queue_fetch_config;
        let empty_delay = fetch_config.empty_delay.unwrap_or_default();
        let error_delay = fetch_config.error_delay.unwrap_or_default();

        let mut next_fetch = Utc::now();

        loop {
            {
                let diff = max(TimeDelta::zero(), next_fetch - Utc::now());
                let duration = diff.to_std().unwrap_or_else(|_| Duration::from_secs(0));
                tokio::select! {
                    // `biased` ensures that the cancellation token is polled first
                    biased;

                    _ = cancellation_token.cancelled() => {
                        info!("Exiting processor periodic worker loop");
                        return;
                    },
                    _ = sleep(duration) => (),
                }
            }

            next_fetch = match self.process_next_periodic().await {
                Ok(PeriodicOutcome::Empty) => after(Utc::now(), empty_delay),
                Ok(_) => Utc::now(),
                Err(err) => {
                    error!(
                        queue = PERIODIC_QUEUE_NAME,
                        "An error occurred while processing periodic jobs: {err}"
                    );
                    after(Utc::now(), error_delay)
                }
            };
        }
    }

    /// Read the next due periodic job, enqueue a copy of it on its worker's queue, and move the
    /// periodic job to its next scheduled run.
    pub(crate) async fn process_next_periodic(&self) -> ErrandResult<PeriodicOutcome> {
        let context = AppContext::from_ref(&self.inner.state);
        let store = context.queue();
        let visibility_timeout = visibility_timeout(
            &context,
            context.config().worker.worker_config.max_duration,
        );

        let Some(msg) = store.read(PERIODIC_QUEUE_NAME, visibility_timeout).await? else {
            return Ok(PeriodicOutcome::Empty);
        };

        let job = serde_json::from_value::<Job>(msg.payload);
        let job = match job {
            Ok(job) => job,
            Err(err) => {
                error!(
                    msg_id = msg.id,
                    read_count = msg.read_count,
                    queue = PERIODIC_QUEUE_NAME,
                    "An error occurred while deserializing periodic job: {err}"
                );
                // For periodic jobs, we simply delete the failing msg. It will
                // be re-enqueued the next time the app starts
                store
                    .complete(
                        PERIODIC_QUEUE_NAME,
                        msg.id,
                        &CompletedAction::Delete,
                        Completion::Failed,
                    )
                    .await?;
                return Ok(PeriodicOutcome::Removed);
            }
        };

        let worker = self.inner.workers.get(&job.metadata.worker_name);
        let periodic = job.metadata.periodic.as_ref();

        let Some((worker, periodic)) = worker.zip(periodic) else {
            error!(
                msg_id = msg.id,
                read_count = msg.read_count,
                worker.name = job.metadata.worker_name,
                ?periodic,
                "Unable to enqueue job; worker not registered or no periodic metadata configured"
            );
            // For periodic jobs, we simply delete the failing msg. It will
            // be re-enqueued the next time the app starts
            store
                .complete(
                    PERIODIC_QUEUE_NAME,
                    msg.id,
                    &CompletedAction::Delete,
                    Completion::Failed,
                )
                .await?;
            return Ok(PeriodicOutcome::Removed);
        };

        let job_to_enqueue = Job::builder()
            .args(job.args.clone())
            .metadata(
                JobMetadata::builder()
                    .worker_name(job.metadata.worker_name.clone())
                    .build(),
            )
            .build();
        // Move the periodic job to its next run before enqueueing the copy, so a store error
        // can't enqueue the same run twice.
        let delay = periodic_next_run_delay(&periodic.schedule, None);
        store
            .reschedule(PERIODIC_QUEUE_NAME, msg.id, after(Utc::now(), delay))
            .await?;
        store
            .push(&worker.queue, &[job_to_enqueue], Utc::now())
            .await?;
        debug!(
            msg_id = msg.id,
            worker.name = worker.name,
            queue = worker.queue,
            ?delay,
            "Enqueued periodic job"
        );

        Ok(PeriodicOutcome::Enqueued)
    }

    async fn retry(
        &self,
        context: &AppContext,
        queue: &str,
        job_metadata: Option<&JobMetadata>,
        msg_id: i64,
        read_count: i32,
        worker: Option<&WorkerWrapper<S>>,
    ) -> JobOutcome {
        let worker_config = worker
            .map(|worker| &worker.worker_config)
            .unwrap_or(&context.config().worker.worker_config);
        let attempt = u32::try_from(read_count).unwrap_or_default().max(1);

        if let Some(delay) = retry_delay(&worker_config.retry_config, attempt) {
            // If the job can retry, make it visible again after the calculated delay.
            if let Err(err) = context
                .queue()
                .schedule_retry(queue, msg_id, after(Utc::now(), delay))
                .await
            {
                error!(
                    msg_id,
                    read_count,
                    queue,
                    worker.name = job_metadata.map(|metadata| &metadata.worker_name),
                    "An error occurred while scheduling a job retry: {err}"
                );
            }
            JobOutcome::Retrying { attempt, delay }
        } else {
            // Otherwise, perform the failure action for the worker.
            error!(
                msg_id,
                queue,
                worker.name = job_metadata.map(|metadata| &metadata.worker_name),
                attempts = attempt,
                "Job failed permanently"
            );
            self.job_completed(
                context,
                queue,
                job_metadata,
                msg_id,
                read_count,
                &worker_config.failure_action(),
                Completion::Failed,
            )
            .await;
            JobOutcome::Failed { attempts: attempt }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn job_completed(
        &self,
        context: &AppContext,
        queue: &str,
        job_metadata: Option<&JobMetadata>,
        msg_id: i64,
        read_count: i32,
        action: &CompletedAction,
        completion: Completion,
    ) {
        debug!(
            msg_id,
            read_count,
            queue,
            worker.name = job_metadata.map(|metadata| &metadata.worker_name),
            ?action,
            ?completion,
            "Performing completed action for a job"
        );

        if let Err(err) = context
            .queue()
            .complete(queue, msg_id, action, completion)
            .await
        {
            error!(
                msg_id,
                read_count,
                queue,
                worker.name = job_metadata.map(|metadata| &metadata.worker_name),
                ?action,
                "An error occurred while performing completed action for a job: {err}"
            );
        }
    }
}

struct QueueItem {
    name: String,
    next_fetch: DateTime<Utc>,
}

impl Eq for QueueItem {}

impl PartialEq<Self> for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.next_fetch == other.next_fetch
    }
}

impl PartialOrd<Self> for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // This is intentionally reversed so that `QueueItem` forms a min heap when used in
        // a binary heap.
        other.next_fetch.cmp(&self.next_fetch)
    }
}

/// How long a job read from a queue stays hidden from other readers: the handler's budget plus
/// the configured margin.
fn visibility_timeout(context: &AppContext, max_duration: Option<Duration>) -> Duration {
    let margin = context
        .config()
        .worker
        .queue_fetch_config
        .visibility_margin
        .unwrap_or(DEFAULT_VISIBILITY_MARGIN);
    max_duration
        .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT)
        .saturating_add(margin)
}

/// `now + delay`, saturating instead of overflowing.
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn periodic_next_run_delay(schedule: &Schedule, now: Option<DateTime<Utc>>) -> Duration {
    let now = now.unwrap_or_else(Utc::now);
    let next_run = schedule.after(&now).next().unwrap_or(now);
    let diff = max(TimeDelta::zero(), next_run - now);
    diff.to_std().unwrap_or_else(|_| Duration::from_secs(0))
}

type WorkerFn<S> = Box<
    dyn Send
        + Sync
        + for<'a> Fn(
            &'a S,
            serde_json::Value,
        ) -> Pin<Box<dyn 'a + Send + Future<Output = ErrandResult<()>>>>,
>;

pub(crate) struct WorkerWrapper<S>
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    name: String,
    queue: String,
    /// The worker's config, with any missing values filled in from the app's config.
    worker_config: WorkerConfig,
    worker_fn: WorkerFn<S>,
}

impl<S> WorkerWrapper<S>
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    fn new<W, Args, E>(state: &S, worker: W, queue: String) -> Self
    where
        W: 'static + Worker<S, Args, Error = E>,
        Args: Send + Sync + Serialize + for<'de> Deserialize<'de>,
        E: 'static + std::error::Error + Send + Sync,
    {
        let context = AppContext::from_ref(state);
        let worker_config = worker
            .worker_config(state)
            .or(&context.config().worker.worker_config);
        let worker = Arc::new(worker);

        Self {
            name: W::name(),
            queue,
            worker_config,
            worker_fn: Box::new(move |state: &S, args: serde_json::Value| {
                let worker = worker.clone();
                Box::pin(async move {
                    let args: Args = serde_json::from_value(args).map_err(DequeueError::Serde)?;

                    match worker.handle(state, args).await {
                        Ok(_) => Ok(()),
                        Err(err) => Err(WorkerError::Handle(W::name(), Box::new(err)).into()),
                    }
                })
            }),
        }
    }

    #[instrument(skip_all, fields(worker.name = self.name))]
    async fn handle(&self, state: &S, args: serde_json::Value) -> ErrandResult<()> {
        let inner = (self.worker_fn)(state, args);

        if let Some(max_duration) = self.worker_config.budget() {
            tokio::time::timeout(max_duration, inner)
                .await
                .map_err(|err| {
                    error!(
                        worker.name = self.name,
                        max_duration_ms = max_duration.as_millis(),
                        %err,
                        "Worker timed out"
                    );
                    WorkerError::Timeout(self.name.clone(), max_duration, Box::new(err))
                })?
        } else {
            inner.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::NoopCache;
    use crate::config::AppConfig;
    use crate::error::queue::QueueError;
    use crate::queue::MockQueueStore;
    use crate::queue::QueueStore;
    use crate::queue::memory::MemoryQueueStore;
    use crate::worker::config::RetryConfig;
    use crate::worker::job::JobState;
    use async_trait::async_trait;
    use rstest::{fixture, rstest};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    /// Fails when the args are negative, sleeps for `args` milliseconds otherwise.
    #[derive(Default)]
    struct Sleepy {
        max_retries: Option<u32>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker<AppContext, i64> for Sleepy {
        type Error = Boom;

        fn worker_config(&self, _state: &AppContext) -> WorkerConfig {
            WorkerConfig::builder()
                .max_duration(Duration::from_millis(50))
                .retry_config(
                    RetryConfig::builder()
                        .maybe_max_retries(self.max_retries)
                        .delay(Duration::ZERO)
                        .build(),
                )
                .build()
        }

        async fn handle(&self, _state: &AppContext, args: i64) -> Result<(), Self::Error> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if args < 0 {
                return Err(Boom);
            }
            sleep(Duration::from_millis(args.unsigned_abs())).await;
            Ok(())
        }
    }

    struct Setup {
        store: Arc<MemoryQueueStore>,
        context: AppContext,
        processor: Processor<AppContext>,
        calls: Arc<AtomicUsize>,
    }

    #[fixture]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn setup() -> Setup {
        setup_with_retries(Some(1))
    }

    fn setup_with_retries(max_retries: Option<u32>) -> Setup {
        let store = Arc::new(MemoryQueueStore::new());
        let context = AppContext::from_parts(
            AppConfig::test(None).unwrap(),
            store.clone(),
            Arc::new(NoopCache),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let processor = Processor::builder(&context)
            .register(Sleepy {
                max_retries,
                calls: calls.clone(),
            })
            .unwrap()
            .build();
        Setup {
            store,
            context,
            processor,
            calls,
        }
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn process_next_empty(setup: Setup) {
        setup.processor.before_run().await.unwrap();
        let outcome = setup.processor.process_next("default").await.unwrap();
        assert_eq!(outcome, JobOutcome::Empty);
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn process_next_success(setup: Setup) {
        Sleepy::enqueue(&setup.context, 0i64).await.unwrap();

        let outcome = setup.processor.process_next("default").await.unwrap();

        assert_eq!(outcome, JobOutcome::Succeeded);
        assert_eq!(setup.calls.load(AtomicOrdering::SeqCst), 1);
        assert!(setup.store.messages("default").await.is_empty());
        assert!(setup.store.archived("default").await.is_empty());
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn process_next_retries_then_fails(setup: Setup) {
        Sleepy::enqueue(&setup.context, -1i64).await.unwrap();

        let first = setup.processor.process_next("default").await.unwrap();
        let second = setup.processor.process_next("default").await.unwrap();
        let third = setup.processor.process_next("default").await.unwrap();

        assert_eq!(
            first,
            JobOutcome::Retrying {
                attempt: 1,
                delay: Duration::ZERO
            }
        );
        assert_eq!(second, JobOutcome::Failed { attempts: 2 });
        assert_eq!(third, JobOutcome::Empty);

        let archived = setup.store.archived("default").await;
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].state, JobState::Failed);
        assert_eq!(archived[0].read_count, 2);
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn process_next_timeout_is_a_failure() {
        let setup = setup_with_retries(Some(0));
        Sleepy::enqueue(&setup.context, 1_000i64).await.unwrap();

        let outcome = setup.processor.process_next("default").await.unwrap();

        assert_eq!(outcome, JobOutcome::Failed { attempts: 1 });
    }

    /// Runs past its budget, then tries to read its own job from the queue.
    struct Peek {
        visible: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Worker<AppContext, ()> for Peek {
        type Error = QueueError;

        fn worker_config(&self, _state: &AppContext) -> WorkerConfig {
            WorkerConfig::builder()
                .timeout(false)
                .max_duration(Duration::from_millis(50))
                .build()
        }

        async fn handle(&self, state: &AppContext, _args: ()) -> Result<(), Self::Error> {
            sleep(Duration::from_millis(100)).await;
            let msg = state.queue().read("default", Duration::from_secs(1)).await?;
            self.visible.store(msg.is_some(), AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn job_stays_hidden_past_its_budget() {
        let context = AppContext::test(None).unwrap();
        let visible = Arc::new(AtomicBool::new(true));
        let processor = Processor::builder(&context)
            .register(Peek {
                visible: visible.clone(),
            })
            .unwrap()
            .build();
        Peek::enqueue(&context, ()).await.unwrap();

        let outcome = processor.process_next("default").await.unwrap();

        assert_eq!(outcome, JobOutcome::Succeeded);
        assert!(!visible.load(AtomicOrdering::SeqCst));
    }

    /// Hangs until its timeout fires. Retried after 10 seconds.
    struct Hang;

    #[async_trait]
    impl Worker<AppContext, ()> for Hang {
        type Error = Boom;

        fn worker_config(&self, _state: &AppContext) -> WorkerConfig {
            WorkerConfig::builder()
                .max_duration(Duration::from_millis(50))
                .retry_config(
                    RetryConfig::builder()
                        .max_retries(1)
                        .delay(Duration::from_secs(10))
                        .delay_offset(Duration::ZERO)
                        .build(),
                )
                .build()
        }

        async fn handle(&self, _state: &AppContext, _args: ()) -> Result<(), Self::Error> {
            sleep(Duration::from_secs(10)).await;
            Ok(())
        }
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn timed_out_job_is_delivered_once() {
        let context = AppContext::test(None).unwrap();
        let processor = Processor::builder(&context)
            .register(Hang)
            .unwrap()
            .build();
        Hang::enqueue(&context, ()).await.unwrap();

        let done = AtomicBool::new(false);
        let first = async {
            let outcome = processor.process_next("default").await.unwrap();
            done.store(true, AtomicOrdering::SeqCst);
            outcome
        };
        let others = async {
            // Let the first reader claim the job.
            sleep(Duration::from_millis(5)).await;
            let mut outcomes = Vec::new();
            while !done.load(AtomicOrdering::SeqCst) {
                outcomes.push(processor.process_next("default").await.unwrap());
                sleep(Duration::from_micros(200)).await;
            }
            outcomes
        };
        let (first, others) = tokio::join!(first, others);

        assert!(matches!(first, JobOutcome::Retrying { attempt: 1, .. }));
        assert!(!others.is_empty());
        assert!(others.iter().all(|outcome| *outcome == JobOutcome::Empty));
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn process_next_falls_back_to_app_retry_config() {
        let setup = setup_with_retries(None);
        Sleepy::enqueue(&setup.context, -1i64).await.unwrap();

        // The app config provides `max-retries`, so the job is retried.
        let outcome = setup.processor.process_next("default").await.unwrap();

        assert!(matches!(
            outcome,
            JobOutcome::Retrying { attempt: 1, .. }
        ));
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn process_next_unknown_worker(setup: Setup) {
        let job = Job::builder()
            .args(serde_json::json!(1))
            .metadata(JobMetadata::builder().worker_name("Unknown").build())
            .build();
        setup
            .store
            .push("default", &[job], Utc::now())
            .await
            .unwrap();

        let outcome = setup.processor.process_next("default").await.unwrap();

        assert!(matches!(
            outcome,
            JobOutcome::Retrying { attempt: 1, .. }
        ));
        assert_eq!(setup.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn process_next_invalid_args(setup: Setup) {
        let job = Job::builder()
            .args(serde_json::json!("not a number"))
            .metadata(JobMetadata::builder().worker_name("Sleepy").build())
            .build();
        setup
            .store
            .push("default", &[job], Utc::now())
            .await
            .unwrap();

        let outcome = setup.processor.process_next("default").await.unwrap();

        assert_eq!(
            outcome,
            JobOutcome::Retrying {
                attempt: 1,
                delay: Duration::ZERO
            }
        );
        assert_eq!(setup.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn process_next_read_error() {
        let mut store = MockQueueStore::new();
        store
            .expect_read()
            .returning(|_, _| Err(QueueError::Unavailable("connection refused".to_owned())));
        let context = AppContext::from_parts(
            AppConfig::test(None).unwrap(),
            Arc::new(store),
            Arc::new(NoopCache),
        );
        let processor = Processor::builder(&context).build();

        let result = processor.process_next("default").await;

        assert!(result.is_err());
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn periodic_jobs_are_enqueued_once() {
        let store = Arc::new(MemoryQueueStore::new());
        let context = AppContext::from_parts(
            AppConfig::test(None).unwrap(),
            store.clone(),
            Arc::new(NoopCache),
        );
        let periodic_args = || {
            PeriodicArgs::builder()
                .args(5i64)
                .schedule(Schedule::from_str("0 0 0 1 1 *").unwrap())
                .build()
        };
        let processor = Processor::builder(&context)
            .register_periodic(Sleepy::default(), periodic_args())
            .unwrap()
            .build();

        processor.before_run().await.unwrap();
        processor.before_run().await.unwrap();
        assert_eq!(store.messages(PERIODIC_QUEUE_NAME).await.len(), 1);

        // Make the periodic job visible now instead of on the next tick of the schedule.
        let id = store.messages(PERIODIC_QUEUE_NAME).await[0].id;
        store
            .reschedule(PERIODIC_QUEUE_NAME, id, Utc::now())
            .await
            .unwrap();

        let outcome = processor.process_next_periodic().await.unwrap();

        assert_eq!(outcome, PeriodicOutcome::Enqueued);
        let enqueued = store.messages("default").await;
        assert_eq!(enqueued.len(), 1);
        let job = enqueued[0].job().unwrap();
        assert_eq!(job.args, serde_json::json!(5));
        assert!(job.metadata.periodic.is_none());

        let periodic = store.messages(PERIODIC_QUEUE_NAME).await;
        assert_eq!(periodic.len(), 1);
        assert_eq!(periodic[0].state, JobState::Pending);
        assert!(periodic[0].visible_at > Utc::now());
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn periodic_job_is_not_enqueued_if_reschedule_fails() {
        let schedule = Schedule::from_str("0 0 0 1 1 *").unwrap();
        let job = Job::periodic("Sleepy", &schedule, serde_json::json!(5));
        let payload = serde_json::to_value(&job).unwrap();

        let mut store = MockQueueStore::new();
        store
            .expect_read()
            .withf(|queue, _| queue == PERIODIC_QUEUE_NAME)
            .times(1)
            .returning(move |_, _| {
                Ok(Some(crate::queue::Message {
                    id: 1,
                    read_count: 1,
                    enqueued_at: Utc::now(),
                    payload: payload.clone(),
                }))
            });
        store
            .expect_reschedule()
            .times(1)
            .returning(|_, _, _| Err(QueueError::Unavailable("connection refused".to_owned())));
        store.expect_push().never();
        let context = AppContext::from_parts(
            AppConfig::test(None).unwrap(),
            Arc::new(store),
            Arc::new(NoopCache),
        );
        let processor = Processor::builder(&context)
            .register(Sleepy::default())
            .unwrap()
            .build();

        let result = processor.process_next_periodic().await;

        assert!(result.is_err());
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn orphaned_periodic_jobs_are_removed() {
        let store = Arc::new(MemoryQueueStore::new());
        let context = AppContext::from_parts(
            AppConfig::test(None).unwrap(),
            store.clone(),
            Arc::new(NoopCache),
        );
        let schedule = Schedule::from_str("* * * * * *").unwrap();
        let job = Job::periodic("Removed", &schedule, serde_json::Value::Null);
        store
            .push(PERIODIC_QUEUE_NAME, &[job], Utc::now())
            .await
            .unwrap();
        let processor = Processor::builder(&context).build();

        let outcome = processor.process_next_periodic().await.unwrap();

        assert_eq!(outcome, PeriodicOutcome::Removed);
        assert!(store.messages(PERIODIC_QUEUE_NAME).await.is_empty());
    }

    #[rstest]
    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn enqueue_json(setup: Setup) {
        setup
            .processor
            .enqueue_json("Sleepy", serde_json::json!(3), RunAt::Now)
            .await
            .unwrap();
        let result = setup
            .processor
            .enqueue_json("Unknown", serde_json::json!(3), RunAt::Now)
            .await;

        assert_eq!(setup.store.messages("default").await.len(), 1);
        assert!(result.is_err());
    }

    #[tokio::test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn run_exits_when_cancelled() {
        let setup = setup_with_retries(Some(0));
        setup.processor.before_run().await.unwrap();
        let cancellation_token = CancellationToken::new();
        cancellation_token.cancel();

        tokio::time::timeout(
            Duration::from_secs(5),
            setup.processor.run(cancellation_token),
        )
        .await
        .unwrap();
    }

    #[rstest]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn queue_item_min_heap() {
        let now = Utc::now();
        let mut heap: BinaryHeap<QueueItem> = [
            QueueItem {
                name: "later".to_owned(),
                next_fetch: now + TimeDelta::seconds(10),
            },
            QueueItem {
                name: "now".to_owned(),
                next_fetch: now,
            },
        ]
        .into_iter()
        .collect();

        assert_eq!(heap.pop().unwrap().name, "now");
        assert_eq!(heap.pop().unwrap().name, "later");
    }

    #[rstest]
    #[case("* * * * * *", 1)]
    #[case("0 * * * * *", 60)]
    #[case("0 0 * * * *", 3600)]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn periodic_next_run_delay(#[case] schedule: &str, #[case] expected_secs: u64) {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let schedule = Schedule::from_str(schedule).unwrap();
        let delay = super::periodic_next_run_delay(&schedule, Some(now));
        assert_eq!(delay, Duration::from_secs(expected_secs));
    }

    #[test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn after_saturates() {
        let now = Utc::now();
        assert_eq!(after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(after(now, Duration::from_secs(1)), now + TimeDelta::seconds(1));
    }
}
