use std::time::Duration;

use anyhow::{bail, Result};
use log::warn;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::adapters::{AnalysisPoll, RemoteAnalysis};
use crate::store::PostData;
use crate::taxonomy::ClassificationResult;

pub(crate) const MAX_POLL_ATTEMPTS: u32 = 20;
pub(crate) const MAX_POLL_WALL_SECS: u64 = 600;
const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Drive the remote analysis poll protocol to a terminal outcome. The service
/// directs its own backoff via `retry_after_secs`; the loop caps both attempt
/// count and total wall time so an abandoned post cannot poll forever.
pub(crate) async fn poll_remote(
    remote: &dyn RemoteAnalysis,
    post: &PostData,
    cancel: &CancellationToken,
) -> Result<ClassificationResult> {
    let started = tokio::time::Instant::now();

    for attempt in 1..=MAX_POLL_ATTEMPTS {
        if started.elapsed() >= Duration::from_secs(MAX_POLL_WALL_SECS) {
            bail!(
                "analysis for post {} still processing after {}s",
                post.id,
                started.elapsed().as_secs()
            );
        }

        match remote.poll(post).await? {
            AnalysisPoll::Completed { classification } => return Ok(classification),
            AnalysisPoll::Error { message } => {
                bail!("remote analysis failed for post {}: {message}", post.id)
            }
            AnalysisPoll::Processing { retry_after_secs } => {
                let delay_secs = retry_after_secs.clamp(1, MAX_RETRY_DELAY_SECS);
                let jitter_ms = rand::thread_rng().gen_range(0..250);
                let delay = Duration::from_secs(delay_secs) + Duration::from_millis(jitter_ms);
                warn!(
                    "analysis for post {} still processing (attempt {attempt}), retrying in {delay_secs}s",
                    post.id
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => bail!("engine shut down while polling analysis"),
                }
            }
        }
    }

    bail!(
        "analysis for post {} still processing after {MAX_POLL_ATTEMPTS} attempts",
        post.id
    )
}
