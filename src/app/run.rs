use crate::app::context::AppContext;
use crate::error::ErrandResult;
use crate::worker::processor::Processor;
use axum_core::extract::FromRef;
use std::future;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Prepare the [`Processor`] and run it until the app receives a shutdown signal (ctrl-c or
/// SIGTERM), or until the processor stops on its own.
pub async fn run<S>(processor: Processor<S>, state: &S) -> ErrandResult<()>
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
{
    let cancellation_token = CancellationToken::new();
    run_with_shutdown_signal(processor, state, cancellation_token, graceful_shutdown_signal()).await
}

/// Same as [`run`], but stops when `shutdown_signal` resolves instead of on ctrl-c/SIGTERM.
pub(crate) async fn run_with_shutdown_signal<S, F>(
    processor: Processor<S>,
    state: &S,
    cancellation_token: CancellationToken,
    shutdown_signal: F,
) -> ErrandResult<()>
where
    S: Clone + Send + Sync + 'static,
    AppContext: FromRef<S>,
    F: Future<Output = ()> + Send + 'static,
{
    let context = AppContext::from_ref(state);
    info!(app.name = context.config().app.name, "Starting app");

    if processor.workers().next().is_none() {
        warn!("No workers were registered.");
    }

    processor.before_run().await?;

    let signal_task = tokio::spawn(cancel_token_on_signal_received(
        shutdown_signal,
        cancellation_token.clone(),
    ));

    processor.run(cancellation_token.clone()).await;

    // Stop the signal listener if the processor stopped on its own.
    cancellation_token.cancel();
    if let Err(err) = signal_task.await {
        error!("An error occurred while waiting for the shutdown signal task: {err}");
    }

    info!("Shutdown complete");

    Ok(())
}

async fn cancel_token_on_signal_received<F>(shutdown_signal: F, cancellation_token: CancellationToken)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::select! {
        _ = shutdown_signal => {
            info!("Received shutdown signal. Shutting down gracefully.");
            cancellation_token.cancel();
        },
        _ = cancellation_token.cancelled() => {
            info!("Shutting down due to cancellation token cancelled");
        },
    }
}

async fn graceful_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {err}");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {err}");
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutting down due to ctrl-c signal received");
        },
        _ = sigterm => {
            info!("Shutting down due to sigterm signal received");
        },
    }
}
