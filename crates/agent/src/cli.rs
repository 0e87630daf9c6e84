use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Parse an interval given as (possibly fractional) seconds.
fn parse_seconds(input: &str) -> Result<Duration, String> {
    let value: f64 =
        input.trim().parse().map_err(|_| format!("invalid seconds value: {input:?}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("seconds value must be finite and >= 0: {input:?}"));
    }
    Ok(Duration::from_secs_f64(value))
}

/// Truthy forms accepted for boolean flags bound to environment variables.
fn parse_bool_flag(input: &str) -> Result<bool, String> {
    Ok(matches!(input.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "opeva-agent", version, about = "OPEVA worker agent: runs backend-dispatched jobs in containers")]
pub struct Cli {
    /// Backend base URL.
    #[arg(long, env = "OPEVA_SERVER", default_value = "http://localhost:8000")]
    pub server: String,

    /// Worker identity advertised to the backend (defaults to the host name).
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// Directory shared with job containers (mounted at /data).
    #[arg(long, env = "OPEVA_SHARED_DIR", default_value = "/opt/opeva_shared_data")]
    pub shared_dir: PathBuf,

    /// Container image jobs run in.
    #[arg(long, env = "WORKER_IMAGE", default_value = "calof/opeva_simulator:latest")]
    pub image: String,

    /// Seconds between next-job polls when idle.
    #[arg(long, env = "POLL_INTERVAL", default_value = "5", value_parser = parse_seconds)]
    pub poll_interval: Duration,

    /// Minimum seconds between heartbeats (0 sends one on every poll).
    #[arg(long, env = "WORKER_HEARTBEAT_INTERVAL", default_value = "30", value_parser = parse_seconds)]
    pub heartbeat_interval: Duration,

    /// Seconds between remote-status polls while a job runs (0 disables).
    #[arg(long, env = "STATUS_POLL_INTERVAL", default_value = "10", value_parser = parse_seconds)]
    pub status_poll_interval: Duration,

    /// Stop the worker after completing the next job.
    #[arg(
        long,
        env = "WORKER_EXIT_AFTER_JOB",
        value_parser = parse_bool_flag,
        num_args = 0..=1,
        default_missing_value = "true",
        default_value = "false"
    )]
    pub exit_after_job: bool,

    /// Log filter (e.g. `info`, `debug`, or a tracing directive).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
