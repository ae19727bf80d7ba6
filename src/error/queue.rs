use crate::error::Error;

/// Errors returned by a [`crate::queue::QueueStore`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    #[error("The queue store is unavailable: {0}")]
    Unavailable(String),

    #[error("Queue `{0}` does not exist.")]
    UnknownQueue(String),

    #[error("Message `{1}` not found in queue `{0}`.")]
    UnknownMessage(String, i64),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[cfg(feature = "queue-pg")]
    #[error(transparent)]
    Pgmq(#[from] pgmq::PgmqError),

    #[cfg(feature = "queue-pg")]
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(feature = "queue-pg")]
impl From<pgmq::PgmqError> for Error {
    fn from(value: pgmq::PgmqError) -> Self {
        Self::Queue(QueueError::from(value))
    }
}

#[cfg(feature = "queue-pg")]
impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self::Queue(QueueError::from(value))
    }
}
