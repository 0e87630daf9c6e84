//! Public API types for the in-process `opeva-agent` engine.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a worker agent instance.
///
/// Constructed once at startup and immutable thereafter.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Backend base URL (e.g. `http://127.0.0.1:8000`). Trailing slashes
    /// are tolerated and stripped by the backend client.
    pub server_url: String,

    /// Worker identity advertised to the backend.
    pub worker_id: String,

    /// Host path shared with job containers, mounted at `/data`.
    pub shared_dir: PathBuf,

    /// Container image jobs run in.
    pub image: String,

    /// How long to sleep between next-job polls when no work was handled.
    pub poll_interval: Duration,

    /// Minimum spacing between heartbeats. Zero disables the rate limit so
    /// every poll sends one.
    pub heartbeat_interval: Duration,

    /// How often the per-job monitor polls the backend for remote
    /// cancellation. Zero disables the monitor.
    pub status_poll_interval: Duration,

    /// Stop the agent after the next job completes.
    pub exit_after_job: bool,

    /// Request GPU access for job containers, falling back to a plain
    /// launch on hosts without GPU support.
    pub gpu: bool,
}

impl AgentConfig {
    /// Default idle poll interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

    /// Default heartbeat spacing.
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

    /// Default remote-status poll interval.
    pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(10);
}

/// A job payload handed out by the backend's next-job endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    /// Backend job identifier (authoritative).
    pub job_id: String,
    /// Config file path, relative to the shared volume mount.
    pub config_path: String,
    /// Human-readable name, used for container naming.
    #[serde(default)]
    pub job_name: Option<String>,
}

impl Job {
    /// The job's display name, defaulting to its id.
    pub fn display_name(&self) -> &str {
        self.job_name.as_deref().unwrap_or(&self.job_id)
    }
}

/// Lifecycle status posted to (or observed from) the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Container created, logs being streamed.
    Running,
    /// Container exited with code 0.
    Finished,
    /// Container exited non-zero, or the job errored before running.
    Failed,
    /// Backend canceled the job while it ran.
    Canceled,
    /// Backend stopped the job while it ran.
    Stopped,
}

impl JobStatus {
    /// The lowercase wire form of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Stopped => "stopped",
        }
    }

    /// Parse a backend-reported status, keeping only the two values that
    /// terminate a job remotely. Anything else is non-terminal.
    pub fn from_remote_terminal(status: &str) -> Option<JobStatus> {
        match status {
            "canceled" => Some(JobStatus::Canceled),
            "stopped" => Some(JobStatus::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional fields attached to a job-status post. `None` fields are left
/// off the wire entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusExtra {
    /// Container exit code, when one was observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Container id, reported with the `running` transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Container name, reported with the `running` transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Failure description, reported with launch-time `failed` posts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
#[path = "api_tests.rs"]
mod tests;
