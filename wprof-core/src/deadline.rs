use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Child;

#[derive(Debug, Error)]
#[error("deadline of {0:?} exceeded")]
pub struct DeadlineExceeded(pub Duration);

/// Run `fut` to completion or give up after `limit`.
///
/// The future is dropped on expiry; any subprocess it holds must be spawned
/// with `kill_on_drop` so nothing outlives the deadline.
pub async fn run_with_deadline<F, T>(
    limit: Duration,
    fut: F,
) -> std::result::Result<T, DeadlineExceeded>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| DeadlineExceeded(limit))
}

/// Wait up to `grace` for a child to exit on its own, then kill it.
///
/// Returns the exit status when the child stopped in time, `None` when it had
/// to be killed. The second wait after `kill` reaps the zombie.
pub async fn wait_or_kill(
    child: &mut Child,
    grace: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.map(Some),
        Err(_) => {
            child.kill().await?;
            child.wait().await?;
            Ok(None)
        }
    }
}
