use crate::error::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Env var `{0}` not defined.")]
    MissingEnvironment(String),

    #[error("Unable to parse `{0}` env var with value `{1}`: {2}")]
    InvalidEnvironment(String, String, String),

    #[error("The `{0}` backend requires the `{1}` feature to be enabled.")]
    UnsupportedBackend(String, String),

    #[error("Missing `{0}` config value.")]
    MissingValue(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Other(#[from] Box<dyn Send + Sync + std::error::Error>),
}

impl From<config::ConfigError> for Error {
    fn from(value: config::ConfigError) -> Self {
        Self::Config(ConfigError::from(value))
    }
}
