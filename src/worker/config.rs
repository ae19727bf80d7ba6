use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};
use std::time::Duration;
use validator::Validate;

/// Default upper bound on the number of jobs sent to the queue store in one round trip.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Worker configuration options to use when enqueuing a job. Default values for these options can
/// be set via the app's configuration files. The options can also be overridden on a per-worker
/// basis by implementing the [`crate::worker::Worker::enqueue_config`] method.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Default, Clone, Eq, PartialEq, Validate, Serialize, Deserialize, bon::Builder)]
#[serde(default, rename_all = "kebab-case")]
#[non_exhaustive]
pub struct EnqueueConfig {
    /// The name of the queue used to enqueue jobs. Multiple workers can enqueue jobs on the same
    /// queue, which is particularly useful for workers that may not have many jobs. However,
    /// workers can also be configured to use a dedicated queue.
    ///
    /// Note: when used with the Postgres store, this will be used in table names. Postgres
    /// generally has a length limit for table names, so care should be taken to ensure this
    /// queue name is not too long.
    #[serde(default)]
    #[builder(into)]
    pub queue: Option<String>,

    /// The maximum number of jobs to send to the queue store in a single round trip when
    /// enqueuing a batch. Larger batches are split into chunks of at most this size.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub batch_size: Option<usize>,
}

impl EnqueueConfig {
    /// Fill any option not set on `self` with the value from `fallback`.
    pub fn or(&self, fallback: &EnqueueConfig) -> EnqueueConfig {
        EnqueueConfig {
            queue: self.queue.clone().or_else(|| fallback.queue.clone()),
            batch_size: self.batch_size.or(fallback.batch_size),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE)
    }
}

/// Worker configuration options to use when handling a job. Default values for these options can
/// be set via the app's configuration files. The options can also be overridden on a per-worker
/// basis by implementing the [`crate::worker::Worker::worker_config`] method.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Default, Clone, Validate, Serialize, Deserialize, bon::Builder)]
#[serde(default, rename_all = "kebab-case")]
#[non_exhaustive]
pub struct WorkerConfig {
    /// True if the processor should enforce a timeout on the app's workers. The default duration
    /// of the timeout can be configured with the `max-duration` option.
    #[serde(default)]
    pub timeout: Option<bool>,

    /// The maximum duration workers should run for. The timeout is only enforced if `timeout`
    /// is `true`. Plus the `queue-fetch-config.visibility-margin`, this is also used as the
    /// visibility timeout of a job when it's read from the queue, so a job whose worker process
    /// dies becomes visible again once it elapses.
    #[serde(default)]
    #[serde_as(as = "Option<serde_with::DurationMilliSeconds>")]
    pub max_duration: Option<Duration>,

    /// The worker retry configuration. If no `max-retries` is provided, either in the app's config
    /// or for the [`crate::worker::Worker`], the worker will not retry.
    #[serde(flatten, default)]
    #[builder(default)]
    pub retry_config: RetryConfig,

    /// The action to take when a job completes successfully.
    #[serde(default)]
    pub success_action: Option<CompletedAction>,

    /// The action to take when a job fails and has no more retry attempts.
    #[serde(default)]
    pub failure_action: Option<CompletedAction>,
}

impl WorkerConfig {
    /// Fill any option not set on `self` with the value from `fallback`.
    pub fn or(&self, fallback: &WorkerConfig) -> WorkerConfig {
        WorkerConfig {
            timeout: self.timeout.or(fallback.timeout),
            max_duration: self.max_duration.or(fallback.max_duration),
            retry_config: self.retry_config.or(&fallback.retry_config),
            success_action: self
                .success_action
                .clone()
                .or_else(|| fallback.success_action.clone()),
            failure_action: self
                .failure_action
                .clone()
                .or_else(|| fallback.failure_action.clone()),
        }
    }

    /// The wall-clock budget for a single job, or `None` if timeouts are disabled.
    pub fn budget(&self) -> Option<Duration> {
        if self.timeout.unwrap_or_default() {
            self.max_duration
        } else {
            None
        }
    }

    pub fn success_action(&self) -> CompletedAction {
        self.success_action.clone().unwrap_or(CompletedAction::Delete)
    }

    pub fn failure_action(&self) -> CompletedAction {
        self.failure_action
            .clone()
            .unwrap_or(CompletedAction::Archive)
    }
}

#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Default, Clone, Validate, Serialize, Deserialize, bon::Builder)]
#[serde(default, rename_all = "kebab-case")]
#[non_exhaustive]
pub struct RetryConfig {
    /// The maximum number of times a job should be retried on failure. A job is attempted at
    /// most `max-retries + 1` times.
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// The delay between retries. If a [`BackoffStrategy`] is provided, this will be used as the
    /// base delay of the backoff calculation.
    #[serde(default)]
    #[serde_as(as = "Option<serde_with::DurationMilliSeconds>")]
    pub delay: Option<Duration>,

    /// An offset to add to the base `delay` to add jitter to the delay to avoid a "thundering herd"
    /// problem. A random value between 0 and the provided [`Duration`] will be added to the
    /// `base` delay before performing any provided [`BackoffStrategy`].
    #[serde(default)]
    #[serde_as(as = "Option<serde_with::DurationMilliSeconds>")]
    pub delay_offset: Option<Duration>,

    /// The maximum duration to delay the retry.
    #[serde(default)]
    #[serde_as(as = "Option<serde_with::DurationMilliSeconds>")]
    pub max_delay: Option<Duration>,

    /// The retry delay backoff algorithm to use.
    #[serde(default)]
    pub backoff_strategy: Option<BackoffStrategy>,
}

impl RetryConfig {
    /// Fill any option not set on `self` with the value from `fallback`.
    pub fn or(&self, fallback: &RetryConfig) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries.or(fallback.max_retries),
            delay: self.delay.or(fallback.delay),
            delay_offset: self.delay_offset.or(fallback.delay_offset),
            max_delay: self.max_delay.or(fallback.max_delay),
            backoff_strategy: self
                .backoff_strategy
                .clone()
                .or_else(|| fallback.backoff_strategy.clone()),
        }
    }
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    None,
}

/// Action to take when a job completes processing, either by being processed successfully, or by
/// running out of retry attempts.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum CompletedAction {
    /// Move the message to the queue's archive.
    Archive,
    /// Delete the message.
    Delete,
}

/// Get the delay before the next attempt of a job that failed on its `attempt`th delivery
/// (1-based), or `None` if the job has no retries left.
pub(crate) fn retry_delay(config: &RetryConfig, attempt: u32) -> Option<Duration> {
    let max_retries = config.max_retries.unwrap_or_default();
    if attempt > max_retries {
        return None;
    }

    let offset = config
        .delay_offset
        .filter(|offset| !offset.is_zero())
        .map(|offset| {
            let millis = u64::try_from(offset.as_millis()).unwrap_or(u64::MAX);
            Duration::from_millis(rand::rng().random_range(0..=millis))
        })
        .unwrap_or_default();

    Some(backoff_delay(config, attempt, offset))
}

/// The deterministic part of [`retry_delay`].
pub(crate) fn backoff_delay(config: &RetryConfig, attempt: u32, offset: Duration) -> Duration {
    let base = config.delay.unwrap_or_default().saturating_add(offset);
    let attempt = attempt.max(1);

    let delay = match config.backoff_strategy.clone().unwrap_or_default() {
        BackoffStrategy::Exponential => {
            base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        }
        BackoffStrategy::Linear => base.saturating_mul(attempt),
        BackoffStrategy::None => base,
    };

    if let Some(max_delay) = config.max_delay {
        delay.min(max_delay)
    } else {
        delay
    }
}
