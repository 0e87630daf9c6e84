//! Per-job background task polling the backend for remote cancellation.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::JobStatus;
use crate::backend::Backend;
use crate::container::Container;

const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct MonitorHandle {
    observed: Arc<Mutex<Option<JobStatus>>>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// The terminal remote status seen so far, if any.
    pub(crate) fn observed(&self) -> Option<JobStatus> {
        *self.observed.lock()
    }

    /// Signal the monitor to stop and wait for it, bounded so a stuck
    /// status fetch never blocks job cleanup.
    pub(crate) async fn shutdown(self) -> Option<JobStatus> {
        let MonitorHandle { observed, stop, task } = self;
        stop.cancel();
        if tokio::time::timeout(JOIN_TIMEOUT, task).await.is_err() {
            tracing::debug!("status monitor did not stop within 1s");
        }
        *observed.lock()
    }
}

/// Start the cancellation monitor for `job_id`. Every `interval`, the
/// backend's view of the job is fetched; on `stopped` or `canceled` the
/// container is stopped (best effort) and the monitor exits.
pub(crate) fn spawn_monitor(
    backend: Arc<dyn Backend>,
    container: Arc<dyn Container>,
    job_id: String,
    interval: Duration,
) -> MonitorHandle {
    let observed = Arc::new(Mutex::new(None));
    let stop = CancellationToken::new();
    let task = tokio::spawn(monitor_loop(
        backend,
        container,
        job_id,
        interval,
        observed.clone(),
        stop.clone(),
    ));
    MonitorHandle { observed, stop, task }
}

async fn monitor_loop(
    backend: Arc<dyn Backend>,
    container: Arc<dyn Container>,
    job_id: String,
    interval: Duration,
    observed: Arc<Mutex<Option<JobStatus>>>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(status) = backend.fetch_status(&job_id).await else {
            continue;
        };
        let Some(status) = JobStatus::from_remote_terminal(&status) else {
            continue;
        };
        tracing::info!(job_id = %job_id, status = %status, "remote cancellation observed");
        *observed.lock() = Some(status);
        if let Err(err) = container.stop().await {
            tracing::debug!(job_id = %job_id, error = %err, "container stop failed");
        }
        return;
    }
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
