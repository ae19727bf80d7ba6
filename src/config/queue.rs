use serde_derive::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use strum_macros::{EnumString, IntoStaticStr};
use url::Url;
use validator::{Validate, ValidationError};

/// Configuration for the durable store that holds the app's jobs.
#[skip_serializing_none]
#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[validate(schema(function = "validate_queue_store_config"))]
#[non_exhaustive]
pub struct QueueStoreConfig {
    #[serde(default)]
    pub backend: QueueBackend,

    /// The URI of the Postgres DB to use when `backend = "postgres"`. The `pgmq` extension
    /// must be installed in the DB.
    #[serde(default)]
    pub uri: Option<Url>,
}

#[derive(
    Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
#[non_exhaustive]
pub enum QueueBackend {
    /// Keep jobs in the memory of the current process. Jobs are lost when the process exits, so
    /// this is only suitable for tests, local development, and single-process deployments that
    /// can tolerate losing work.
    #[default]
    Memory,
    /// Keep jobs in Postgres using [pgmq](https://github.com/tembo-io/pgmq). Requires the
    /// `queue-pg` feature.
    Postgres,
}

fn validate_queue_store_config(config: &QueueStoreConfig) -> Result<(), ValidationError> {
    if config.backend == QueueBackend::Postgres && config.uri.is_none() {
        return Err(ValidationError::new("queue.uri is required for the postgres backend"));
    }
    Ok(())
}
