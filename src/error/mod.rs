#[cfg(feature = "cli")]
pub mod cli;
pub mod cache;
pub mod config;
pub mod other;
pub mod queue;
pub mod serde;
pub mod worker;

use crate::error::cache::CacheError;
#[cfg(feature = "cli")]
use crate::error::cli::CliError;
use crate::error::config::ConfigError;
use crate::error::other::OtherError;
use crate::error::queue::QueueError;
use crate::error::serde::SerdeError;
use crate::error::worker::WorkerError;
use std::convert::Infallible;
use thiserror::Error;

pub type ErrandResult<T> = Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Serde(#[from] SerdeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] validator::ValidationErrors),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "cli")]
    #[error(transparent)]
    Clap(#[from] clap::error::Error),

    #[cfg(feature = "cli")]
    #[error(transparent)]
    Cli(#[from] CliError),

    #[error(transparent)]
    Infallible(#[from] Infallible),

    #[error(transparent)]
    Other(#[from] OtherError),
}
