use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::api::AgentConfig;
use crate::backend::Backend;
use crate::container::ContainerRuntime;

/// Factory for the lazily instantiated container runtime, so the `docker`
/// client is only built when the first job arrives and tests can inject a
/// fake.
pub type RuntimeFactory =
    dyn Fn() -> anyhow::Result<Arc<dyn ContainerRuntime>> + Send + Sync + 'static;

pub(crate) struct AgentInner {
    pub(crate) cfg: AgentConfig,
    pub(crate) backend: Arc<dyn Backend>,
    runtime_factory: Box<RuntimeFactory>,
    runtime: OnceCell<Arc<dyn ContainerRuntime>>,
    stop: CancellationToken,
    exit_after_job: AtomicBool,
    pub(crate) active_job: Mutex<Option<String>>,
    last_heartbeat: Mutex<Option<Instant>>,
}

/// The worker agent: an outer poll/heartbeat loop executing at most one
/// containerized job at a time.
///
/// Cheap to clone; clones share state, so signal handlers can hold one
/// while the main task runs [`run_forever`](Agent::run_forever).
#[derive(Clone)]
pub struct Agent {
    pub(crate) inner: Arc<AgentInner>,
}

impl Agent {
    /// Build an agent over the given backend and container-runtime factory.
    pub fn new<F>(cfg: AgentConfig, backend: Arc<dyn Backend>, runtime_factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn ContainerRuntime>> + Send + Sync + 'static,
    {
        let exit_after_job = cfg.exit_after_job;
        Self {
            inner: Arc::new(AgentInner {
                cfg,
                backend,
                runtime_factory: Box::new(runtime_factory),
                runtime: OnceCell::new(),
                stop: CancellationToken::new(),
                exit_after_job: AtomicBool::new(exit_after_job),
                active_job: Mutex::new(None),
                last_heartbeat: Mutex::new(None),
            }),
        }
    }

    /// The agent's configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.inner.cfg
    }

    /// Request a stop; the loop exits at the next boundary and in-flight
    /// idle sleeps are interrupted.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    /// Whether a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Stop once the current job completes; stops immediately when idle.
    /// Safe to call repeatedly from signal handlers.
    pub fn request_exit_after_current_job(&self) {
        self.inner.exit_after_job.store(true, Ordering::SeqCst);
        if self.inner.active_job.lock().is_none() {
            tracing::info!("exit-after-job requested while idle; stopping worker immediately");
            self.stop();
        }
    }

    /// Poll/heartbeat loop. Returns once a stop is requested, closing the
    /// container runtime if one was instantiated.
    pub async fn run_forever(&self) {
        let cfg = &self.inner.cfg;
        tracing::info!(worker_id = %cfg.worker_id, server = %cfg.server_url, "starting worker");
        while !self.inner.stop.is_cancelled() {
            let handled = self.poll_once().await;
            if !handled {
                tokio::select! {
                    _ = self.inner.stop.cancelled() => {}
                    _ = tokio::time::sleep(cfg.poll_interval) => {}
                }
            }
        }
        if let Some(runtime) = self.inner.runtime.get() {
            runtime.close().await;
        }
        tracing::info!(worker_id = %cfg.worker_id, "worker stopped");
    }

    /// One loop iteration: heartbeat, ask for work, run it. Returns whether
    /// a job was handled (callers skip the idle sleep when it was).
    pub async fn poll_once(&self) -> bool {
        self.send_heartbeat(false).await;
        let job = match self.inner.backend.next_job().await {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(error = %err, "next-job request failed");
                return false;
            }
        };
        tracing::info!(job_id = %job.job_id, "received job");
        crate::runner::run_job(self, job).await;
        if self.inner.exit_after_job.load(Ordering::SeqCst) {
            tracing::info!("exit-after-job set; stopping worker");
            self.stop();
        }
        true
    }

    /// Send a heartbeat, rate-limited unless forced. An interval of zero
    /// disables the limit. `last_heartbeat` only advances when the backend
    /// answered.
    pub(crate) async fn send_heartbeat(&self, force: bool) {
        if !force {
            let interval = self.inner.cfg.heartbeat_interval;
            if !interval.is_zero() {
                let last = *self.inner.last_heartbeat.lock();
                if let Some(last) = last {
                    if last.elapsed() < interval {
                        return;
                    }
                }
            }
        }
        if self.inner.backend.heartbeat().await {
            *self.inner.last_heartbeat.lock() = Some(Instant::now());
        }
    }

    pub(crate) async fn runtime(&self) -> anyhow::Result<Arc<dyn ContainerRuntime>> {
        self.inner
            .runtime
            .get_or_try_init(|| async { (self.inner.runtime_factory)() })
            .await
            .map(Arc::clone)
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
