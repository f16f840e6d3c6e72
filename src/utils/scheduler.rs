use crate::core::ports::runner::Runner;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Schedules a periodic maintenance task.
///
/// This function spawns an asynchronous task that repeatedly executes the provided `runner`'s `run()` method
/// at the specified interval. It logs any errors encountered during execution and keeps going. The loop
/// breaks as soon as the provided cancellation token is triggered, including while waiting for the next
/// pass, at which point a stop message is logged.
///
/// # Arguments
///
/// * `interval` - The duration to wait between consecutive runs of the runner.
/// * `runner` - An instance implementing the `Runner` trait whose `run()` method will be called periodically.
/// * `name` - A static string identifier used for logging purposes.
/// * `cancel_token` - A `CancellationToken` to allow graceful cancellation of the loop.
///
/// # Returns
///
/// Returns a `JoinHandle<()>` representing the spawned task.
pub fn schedule_polling(
    interval: Duration,
    mut runner: impl Runner + 'static,
    name: &'static str,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = runner.run().await {
                error!("{name} encountered an error: {e}");
            }

            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("{name} stopped");
    })
}
