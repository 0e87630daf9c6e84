//! Per-job state machine: launch, report, stream, classify, clean up.

use std::sync::Arc;

use crate::agent::Agent;
use crate::api::{Job, JobStatus, StatusExtra};
use crate::container::{Container, GpuRequest, LaunchSpec, VolumeMount, launch_with_fallback};
use crate::logsink::JobLogSink;
use crate::monitor::{MonitorHandle, spawn_monitor};

/// Resources acquired while a job executes, tracked outside `execute` so
/// cleanup runs on every exit path.
#[derive(Default)]
struct JobRun {
    container: Option<Arc<dyn Container>>,
    monitor: Option<MonitorHandle>,
}

/// Run one job end to end. Every accepted job produces exactly one
/// terminal status post, even when launch or streaming fails.
pub(crate) async fn run_job(agent: &Agent, job: Job) {
    *agent.inner.active_job.lock() = Some(job.job_id.clone());

    let mut run = JobRun::default();
    if let Err(err) = execute(agent, &job, &mut run).await {
        tracing::error!(job_id = %job.job_id, error = %err, "job failed");
        let extra = StatusExtra { error: Some(format!("{err:#}")), ..Default::default() };
        agent.inner.backend.post_status(&job.job_id, JobStatus::Failed, extra).await;
    }

    if let Some(monitor) = run.monitor.take() {
        monitor.shutdown().await;
    }
    if let Some(container) = run.container.take() {
        if let Err(err) = container.remove(true).await {
            tracing::debug!(job_id = %job.job_id, error = %err, "container remove failed");
        }
    }
    agent.send_heartbeat(true).await;
    *agent.inner.active_job.lock() = None;
}

/// The happy path. Posts the terminal status itself when it completes; an
/// early error means no terminal status was posted yet and the caller
/// posts `failed`.
async fn execute(agent: &Agent, job: &Job, run: &mut JobRun) -> anyhow::Result<()> {
    let cfg = &agent.inner.cfg;
    let spec = LaunchSpec {
        image: cfg.image.clone(),
        command: job_command(job),
        name: container_name(&cfg.worker_id, job),
        volumes: vec![VolumeMount {
            host: cfg.shared_dir.clone(),
            container: "/data".to_string(),
            read_only: false,
        }],
        labels: vec![
            ("opeva.worker_id".to_string(), cfg.worker_id.clone()),
            ("opeva.job_id".to_string(), job.job_id.clone()),
        ],
        gpus: cfg.gpu.then(GpuRequest::all),
    };

    tracing::info!(job_id = %job.job_id, container = %spec.name, "starting container");
    let runtime = agent.runtime().await?;
    let container = launch_with_fallback(runtime.as_ref(), spec).await?;
    run.container = Some(container.clone());

    let extra = StatusExtra {
        container_id: Some(container.id().to_string()),
        container_name: Some(container.name().to_string()),
        ..Default::default()
    };
    agent.inner.backend.post_status(&job.job_id, JobStatus::Running, extra).await;

    if !cfg.status_poll_interval.is_zero() {
        run.monitor = Some(spawn_monitor(
            agent.inner.backend.clone(),
            container.clone(),
            job.job_id.clone(),
            cfg.status_poll_interval,
        ));
    }

    let mut sink = JobLogSink::open(&cfg.shared_dir, &job.job_id).await?;
    tracing::info!(job_id = %job.job_id, path = %sink.path().display(), "streaming container logs");
    while let Some(chunk) = container.next_log_chunk().await {
        sink.write_chunk(&chunk).await?;
    }

    // The stream ending implies container exit, so this returns promptly.
    let exit_code = container.wait().await?;

    // A terminal status observed by the monitor overrides the exit-code
    // classification, even when the container managed to exit 0 first.
    let observed = run.monitor.as_ref().and_then(|m| m.observed());
    let status = match observed {
        Some(status) => status,
        None if exit_code == 0 => JobStatus::Finished,
        None => JobStatus::Failed,
    };
    tracing::info!(job_id = %job.job_id, status = %status, exit_code, "job completed");
    let extra = StatusExtra { exit_code: Some(exit_code), ..Default::default() };
    agent.inner.backend.post_status(&job.job_id, status, extra).await;
    Ok(())
}

fn container_name(worker_id: &str, job: &Job) -> String {
    let safe_name = job.display_name().replace(' ', "_");
    let short_id: String = job.job_id.chars().take(8).collect();
    format!("job_{worker_id}_{safe_name}_{short_id}")
}

fn job_command(job: &Job) -> Vec<String> {
    vec![
        "--config".to_string(),
        format!("/data/{}", job.config_path),
        "--job_id".to_string(),
        job.job_id.clone(),
    ]
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
