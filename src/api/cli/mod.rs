use crate::api::cli::enqueue::EnqueueArgs;
use crate::api::cli::list_workers::ListWorkersArgs;
use crate::api::cli::print_config::PrintConfigArgs;
use crate::app::context::AppContext;
use crate::config::environment::Environment;
use crate::error::ErrandResult;
use crate::worker::processor::Processor;
use async_trait::async_trait;
use axum_core::extract::FromRef;
use clap::{Parser, Subcommand};
use serde_derive::Serialize;
use std::path::PathBuf;

pub mod enqueue;
pub mod list_workers;
pub mod print_config;

/// Implemented by each of the CLI's commands.
#[async_trait]
pub(crate) trait RunCommand<S>
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    /// Run the command.
    ///
    /// # Returns
    /// * `Ok(true)` - If the command was handled and the app should end execution after the
    ///   command is complete.
    /// * `Ok(false)` - If there was no command to handle and the app should continue by running
    ///   the processor.
    /// * `Err(...)` - If an error occurred while handling the command. The app should end
    ///   execution after the command is complete.
    async fn run(&self, processor: &Processor<S>, state: &S) -> ErrandResult<bool>;
}

/// Errand: utilities for inspecting the app's config and workers and enqueuing jobs by hand. If
/// no subcommand is provided, the app runs its job processor.
#[derive(Debug, Parser, Serialize)]
#[command(version, about)]
#[non_exhaustive]
pub struct ErrandCli {
    /// Specify the environment to use to run the application. This overrides the corresponding
    /// environment variable if it's set.
    #[clap(short, long)]
    pub environment: Option<Environment>,

    /// The location of the config directory (where the app's config files are located). If
    /// not provided, will default to `./config/`.
    #[clap(long, value_name = "CONFIG_DIRECTORY", value_hint = clap::ValueHint::DirPath)]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<ErrandCommand>,
}

#[derive(Debug, Subcommand, Serialize)]
#[serde(tag = "type")]
#[non_exhaustive]
pub enum ErrandCommand {
    /// Print the app's config.
    PrintConfig(PrintConfigArgs),

    /// List the registered workers and the queue each one uses.
    ListWorkers(ListWorkersArgs),

    /// Enqueue a job for one of the registered workers.
    Enqueue(EnqueueArgs),
}

#[async_trait]
impl<S> RunCommand<S> for ErrandCommand
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    async fn run(&self, processor: &Processor<S>, state: &S) -> ErrandResult<bool> {
        match self {
            ErrandCommand::PrintConfig(args) => args.run(processor, state).await,
            ErrandCommand::ListWorkers(args) => args.run(processor, state).await,
            ErrandCommand::Enqueue(args) => args.run(processor, state).await,
        }
    }
}

/// Run the command from the CLI args, if any. Returns `true` if a command was handled, in which
/// case the app should exit instead of running the processor.
pub async fn handle_cli<S>(cli: &ErrandCli, processor: &Processor<S>, state: &S) -> ErrandResult<bool>
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    match cli.command.as_ref() {
        Some(command) => command.run(processor, state).await,
        None => Ok(false),
    }
}
