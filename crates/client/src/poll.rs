//! Completion polling for export jobs and layer processing.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{ClientError, ClientResult, FeltApi, FeltLayer, JobState};

/// Timeout and interval shared by both polling loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_millis(60_000), interval: Duration::from_millis(2_000) }
    }
}

impl PollOptions {
    /// Defaults overridden by `TOMBOLA_POLL_TIMEOUT_MS` / `TOMBOLA_POLL_INTERVAL_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let timeout = std::env::var("TOMBOLA_POLL_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.timeout);
        let interval = std::env::var("TOMBOLA_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.interval);
        Self { timeout, interval }
    }
}

/// Outcome of one status check.
#[derive(Debug)]
pub(crate) enum Check<T> {
    Ready(T),
    Failed,
    Pending,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Job<'a> {
    Export(&'a str),
    Layer(&'a str),
}

impl Job<'_> {
    fn kind(&self) -> &'static str {
        match self { Job::Export(_) => "export", Job::Layer(_) => "layer" }
    }

    fn id(&self) -> &str {
        match self { Job::Export(id) | Job::Layer(id) => id }
    }

    fn failed(&self) -> ClientError {
        match self {
            Job::Export(id) => ClientError::ExportFailed { export_id: id.to_string() },
            Job::Layer(id) => ClientError::LayerProcessingFailed { layer_id: id.to_string() },
        }
    }

    fn timed_out(&self, elapsed: Duration) -> ClientError {
        let elapsed_ms = elapsed.as_millis();
        match self {
            Job::Export(id) => ClientError::ExportTimeout { export_id: id.to_string(), elapsed_ms },
            Job::Layer(id) => ClientError::LayerProcessingTimeout { layer_id: id.to_string(), elapsed_ms },
        }
    }
}

/// Check until ready, failed, or `opts.timeout` has elapsed, sleeping `opts.interval`
/// between checks. Errors from `check` end the loop immediately.
pub(crate) async fn poll_until<T, F, Fut>(job: Job<'_>, opts: PollOptions, mut check: F) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<Check<T>>>,
{
    let started = Instant::now();
    let mut checks = 0u32;
    while started.elapsed() < opts.timeout {
        checks += 1;
        counter!("felt_poll_checks_total", 1u64);
        match check().await? {
            Check::Ready(v) => {
                info!(job = job.kind(), id = %job.id(), checks, took_ms = %started.elapsed().as_millis(), "poll: completed");
                return Ok(v);
            }
            Check::Failed => {
                warn!(job = job.kind(), id = %job.id(), checks, "poll: job failed");
                return Err(job.failed());
            }
            Check::Pending => debug!(job = job.kind(), id = %job.id(), checks, "poll: pending"),
        }
        tokio::time::sleep(opts.interval).await;
    }
    counter!("felt_poll_timeouts_total", 1u64);
    warn!(job = job.kind(), id = %job.id(), checks, "poll: timed out");
    Err(job.timed_out(started.elapsed()))
}

/// Wait for a custom export to complete and return its download URL.
/// A `completed` status without a download URL keeps polling.
pub async fn wait_for_export<A: FeltApi + ?Sized>(
    api: &A,
    map_id: &str,
    layer_id: &str,
    export_id: &str,
    opts: PollOptions,
) -> ClientResult<String> {
    poll_until(Job::Export(export_id), opts, || async move {
        let st = api.custom_export_status(map_id, layer_id, export_id).await?;
        Ok::<_, ClientError>(match (st.status, st.download_url) {
            (JobState::Completed, Some(url)) if !url.is_empty() => Check::Ready(url),
            (JobState::Failed, _) => Check::Failed,
            _ => Check::Pending,
        })
    })
    .await
}

/// Wait for an uploaded layer to finish processing.
pub async fn wait_for_layer<A: FeltApi + ?Sized>(
    api: &A,
    map_id: &str,
    layer_id: &str,
    opts: PollOptions,
) -> ClientResult<FeltLayer> {
    poll_until(Job::Layer(layer_id), opts, || async move {
        let layer = api.get_layer(map_id, layer_id).await?;
        Ok::<_, ClientError>(match layer.status {
            JobState::Completed => Check::Ready(layer),
            JobState::Failed => Check::Failed,
            _ => Check::Pending,
        })
    })
    .await
}
