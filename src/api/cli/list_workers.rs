use crate::api::cli::RunCommand;
use crate::app::context::AppContext;
use crate::error::ErrandResult;
use crate::worker::processor::Processor;
use async_trait::async_trait;
use axum_core::extract::FromRef;
use clap::Parser;
use itertools::Itertools;
use serde_derive::Serialize;
use tracing::info;

#[derive(Debug, Parser, Serialize)]
#[non_exhaustive]
pub struct ListWorkersArgs {}

#[async_trait]
impl<S> RunCommand<S> for ListWorkersArgs
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    async fn run(&self, processor: &Processor<S>, _state: &S) -> ErrandResult<bool> {
        info!("\n{}", list_workers(processor));
        Ok(true)
    }
}

fn list_workers<S>(processor: &Processor<S>) -> String
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    processor
        .workers()
        .map(|(name, queue)| format!("{name} (queue: {queue})"))
        .join("\n")
}
