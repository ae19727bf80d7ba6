use crate::util::serde::{deserialize_from_str, serialize_to_str};
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;
use uuid::Uuid;

/// A unit of work as it's stored in a [`crate::queue::QueueStore`]. The `args` are the serialized
/// arguments of the [`crate::worker::Worker`] named by `metadata.worker_name`.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder, Eq, PartialEq)]
#[non_exhaustive]
pub struct Job {
    pub metadata: JobMetadata,
    pub args: serde_json::Value,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder, Eq, PartialEq)]
#[non_exhaustive]
pub struct JobMetadata {
    #[builder(default = Uuid::now_v7().to_string(), into)]
    pub id: String,
    #[builder(into)]
    pub worker_name: String,
    /// When the job was requested to run, if it was enqueued with a delay.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub periodic: Option<PeriodicConfig>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder, Eq, PartialEq)]
#[non_exhaustive]
pub struct PeriodicConfig {
    pub hash: u64,
    #[serde(
        deserialize_with = "deserialize_from_str",
        serialize_with = "serialize_to_str"
    )]
    pub schedule: cron::Schedule,
}

impl Job {
    pub(crate) fn periodic(
        worker_name: &str,
        schedule: &cron::Schedule,
        args: serde_json::Value,
    ) -> Self {
        let hash = periodic_hash(worker_name, schedule, &args);
        Job::builder()
            .args(args)
            .metadata(
                JobMetadata::builder()
                    .worker_name(worker_name)
                    .periodic(
                        PeriodicConfig::builder()
                            .hash(hash)
                            .schedule(schedule.clone())
                            .build(),
                    )
                    .build(),
            )
            .build()
    }
}

/// Identifies a periodic job by its worker, schedule and args. Used to avoid enqueuing the same
/// periodic job more than once, e.g. when several instances of the app start at the same time.
pub(crate) fn periodic_hash(
    worker_name: &str,
    schedule: &cron::Schedule,
    args: &serde_json::Value,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    worker_name.hash(&mut hasher);
    schedule.to_string().hash(&mut hasher);
    args.hash(&mut hasher);
    hasher.finish()
}

/// The lifecycle of a job in a [`crate::queue::QueueStore`].
///
/// `Pending -> InProgress -> Succeeded | Pending (retry scheduled) | Failed`
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum JobState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

/// When a submitted job should become visible to the processor.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum RunAt {
    Now,
    After(Duration),
    At(DateTime<Utc>),
}

impl RunAt {
    /// The time the job becomes visible, relative to `now`. A time in the past is treated
    /// as `now`.
    pub fn visible_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            RunAt::Now => now,
            RunAt::After(delay) => chrono::TimeDelta::from_std(*delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            RunAt::At(at) => (*at).max(now),
        }
    }

    pub(crate) fn scheduled_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RunAt::Now => None,
            _ => Some(self.visible_at(now)),
        }
    }
}
