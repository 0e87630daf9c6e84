use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::api::{Job, JobStatus, StatusExtra};

const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const NEXT_JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced from the next-job request. Transport failures are
/// handled internally (logged, session reset) and never reach callers.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// next-job answered with an HTTP error status.
    #[error("next-job returned http {0}")]
    Status(reqwest::StatusCode),
    /// next-job answered 200 with a body that does not decode as a job.
    #[error("next-job payload invalid: {0}")]
    Payload(String),
}

/// Transport-level view of the dispatch backend.
///
/// The production implementation is [`HttpBackend`]; tests substitute an
/// in-memory fake. Failure policy lives behind this trait: heartbeat,
/// status posts, and status fetches never propagate transport errors.
#[async_trait]
pub trait Backend: Send + Sync {
    /// POST the worker's heartbeat. Returns whether the backend answered.
    async fn heartbeat(&self) -> bool;

    /// Ask for the next job. `Ok(None)` means no work (204, or a transport
    /// failure that was logged and absorbed).
    async fn next_job(&self) -> Result<Option<Job>, BackendError>;

    /// Report a job lifecycle transition. Fire-and-forget.
    async fn post_status(&self, job_id: &str, status: JobStatus, extra: StatusExtra);

    /// Fetch the backend's current status string for a job. `None` for
    /// unknown jobs and transport failures.
    async fn fetch_status(&self, job_id: &str) -> Option<String>;
}

#[derive(Serialize)]
struct WorkerIdBody<'a> {
    worker_id: &'a str,
}

#[derive(Serialize)]
struct JobStatusBody<'a> {
    worker_id: &'a str,
    job_id: &'a str,
    status: JobStatus,
    #[serde(flatten)]
    extra: StatusExtra,
}

/// [`Backend`] over HTTP via a shared `reqwest` session.
///
/// The session is replaced after any transport failure so a wedged
/// connection pool cannot poison subsequent requests. Failure logging is
/// de-duplicated on the failing operation so a sustained outage produces
/// one warning, not one per poll.
pub struct HttpBackend {
    base_url: String,
    worker_id: String,
    http: Mutex<reqwest::Client>,
    external: bool,
    last_failure: Mutex<Option<String>>,
}

impl HttpBackend {
    /// Build a backend client for `server_url`, identifying as `worker_id`.
    pub fn new(server_url: &str, worker_id: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self::with_session(server_url, worker_id, http, false))
    }

    /// Build a backend client around an externally provided session.
    ///
    /// With an external session, [`reset`](Self::reset) is a no-op so the
    /// caller keeps observing every request on the client it supplied.
    pub fn with_client(server_url: &str, worker_id: &str, http: reqwest::Client) -> Self {
        Self::with_session(server_url, worker_id, http, true)
    }

    fn with_session(
        server_url: &str,
        worker_id: &str,
        http: reqwest::Client,
        external: bool,
    ) -> Self {
        Self {
            base_url: server_url.trim_end_matches('/').to_string(),
            worker_id: worker_id.to_string(),
            http: Mutex::new(http),
            external,
            last_failure: Mutex::new(None),
        }
    }

    fn client(&self) -> reqwest::Client {
        self.http.lock().clone()
    }

    /// Close and replace the underlying session, unless it was externally
    /// provided.
    pub fn reset(&self) {
        if self.external {
            return;
        }
        match reqwest::Client::builder().build() {
            Ok(client) => *self.http.lock() = client,
            Err(err) => tracing::warn!(error = %err, "failed to rebuild http session"),
        }
    }

    fn note_success(&self) {
        *self.last_failure.lock() = None;
    }

    fn note_failure(&self, context: &str, err: &dyn std::fmt::Display, warning: bool) {
        let repeat = {
            let mut last = self.last_failure.lock();
            let repeat = last.as_deref() == Some(context);
            *last = Some(context.to_string());
            repeat
        };
        if repeat {
            tracing::debug!(context, error = %err, "request failed (repeat)");
        } else if warning {
            tracing::warn!(context, error = %err, "request failed");
        } else {
            tracing::error!(context, error = %err, "request failed");
        }
        self.reset();
        tracing::debug!(context, "http session reset after failure");
    }

    #[cfg(test)]
    pub(crate) fn last_failure(&self) -> Option<String> {
        self.last_failure.lock().clone()
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn heartbeat(&self) -> bool {
        let url = format!("{}/api/agent/heartbeat", self.base_url);
        let body = WorkerIdBody { worker_id: &self.worker_id };
        match self.client().post(&url).timeout(STATUS_TIMEOUT).json(&body).send().await {
            Ok(_) => {
                self.note_success();
                true
            }
            Err(err) => {
                self.note_failure("heartbeat", &err, true);
                false
            }
        }
    }

    async fn next_job(&self) -> Result<Option<Job>, BackendError> {
        let url = format!("{}/api/agent/next-job", self.base_url);
        let body = WorkerIdBody { worker_id: &self.worker_id };
        let res = match self.client().post(&url).timeout(NEXT_JOB_TIMEOUT).json(&body).send().await
        {
            Ok(res) => res,
            Err(err) => {
                self.note_failure("next-job", &err, true);
                return Ok(None);
            }
        };
        self.note_success();

        if res.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if res.status().as_u16() >= 400 {
            return Err(BackendError::Status(res.status()));
        }
        match res.json::<Job>().await {
            Ok(job) => Ok(Some(job)),
            Err(err) => Err(BackendError::Payload(err.to_string())),
        }
    }

    async fn post_status(&self, job_id: &str, status: JobStatus, extra: StatusExtra) {
        let url = format!("{}/api/agent/job-status", self.base_url);
        let body = JobStatusBody { worker_id: &self.worker_id, job_id, status, extra };
        match self.client().post(&url).timeout(STATUS_TIMEOUT).json(&body).send().await {
            Ok(_) => self.note_success(),
            Err(err) => self.note_failure(&format!("job-status({job_id})"), &err, true),
        }
    }

    async fn fetch_status(&self, job_id: &str) -> Option<String> {
        let url = format!("{}/status/{job_id}", self.base_url);
        let res = match self.client().get(&url).timeout(STATUS_TIMEOUT).send().await {
            Ok(res) => res,
            Err(err) => {
                self.note_failure(&format!("status({job_id})"), &err, true);
                return None;
            }
        };
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return None;
        }
        if res.status().as_u16() >= 400 {
            self.note_failure(&format!("status({job_id})"), &res.status(), true);
            return None;
        }
        let body = match res.json::<serde_json::Value>().await {
            Ok(body) => body,
            Err(err) => {
                tracing::debug!(job_id, error = %err, "undecodable status body");
                return None;
            }
        };
        self.note_success();
        body.get("status").and_then(|v| v.as_str()).map(str::to_string)
    }
}

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;
