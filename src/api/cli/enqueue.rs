use crate::api::cli::RunCommand;
use crate::app::context::AppContext;
use crate::error::ErrandResult;
use crate::error::cli::CliError;
use crate::worker::job::RunAt;
use crate::worker::processor::Processor;
use async_trait::async_trait;
use axum_core::extract::FromRef;
use clap::Parser;
use serde_derive::Serialize;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser, Serialize)]
#[non_exhaustive]
pub struct EnqueueArgs {
    /// The name of the worker to enqueue the job for. See the `list-workers` command.
    pub worker: String,

    /// The job's args as JSON. If not provided, `null` is used, which asks a fan-out worker to
    /// find its pending items and enqueue a job for each of them.
    #[clap(short, long)]
    pub args: Option<String>,

    /// Delay the job by the given number of seconds.
    #[clap(short, long)]
    pub delay_secs: Option<u64>,
}

#[async_trait]
impl<S> RunCommand<S> for EnqueueArgs
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    async fn run(&self, processor: &Processor<S>, _state: &S) -> ErrandResult<bool> {
        if !processor.workers().any(|(name, _)| name == self.worker) {
            return Err(CliError::UnknownWorker(self.worker.clone()).into());
        }

        let args = match self.args.as_ref() {
            Some(args) => serde_json::from_str(args)
                .map_err(|err| CliError::InvalidArgs(args.clone(), err))?,
            None => serde_json::Value::Null,
        };

        let run_at = match self.delay_secs {
            Some(secs) => RunAt::After(Duration::from_secs(secs)),
            None => RunAt::Now,
        };

        processor.enqueue_json(&self.worker, args, run_at).await?;
        info!(worker.name = self.worker, delay_secs = self.delay_secs, "Enqueued job");

        Ok(true)
    }
}
