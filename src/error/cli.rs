use crate::error::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CliError {
    #[error("No worker named `{0}` is registered.")]
    UnknownWorker(String),

    #[error("Invalid job args `{0}`: {1}")]
    InvalidArgs(String, serde_json::Error),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}
