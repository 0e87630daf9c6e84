mod cli;
mod shutdown;

use std::sync::Arc;

use clap::Parser;

use opeva_agent_engine::{Agent, AgentConfig, ContainerRuntime, DockerCli, HttpBackend};

use crate::cli::Cli;
use crate::shutdown::{ShutdownController, spawn_ctrl_c_handler, spawn_exit_after_job_handler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let worker_id = match cli.worker_id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => gethostname::gethostname().to_string_lossy().into_owned(),
    };

    let backend = Arc::new(HttpBackend::new(&cli.server, &worker_id)?);
    let cfg = AgentConfig {
        server_url: cli.server,
        worker_id,
        shared_dir: cli.shared_dir,
        image: cli.image,
        poll_interval: cli.poll_interval,
        heartbeat_interval: cli.heartbeat_interval,
        status_poll_interval: cli.status_poll_interval,
        exit_after_job: cli.exit_after_job,
        gpu: true,
    };
    let agent = Agent::new(cfg, backend, || {
        Ok(Arc::new(DockerCli::new()) as Arc<dyn ContainerRuntime>)
    });

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker_id = %agent.config().worker_id,
        server = %agent.config().server_url,
        "opeva-agent starting"
    );

    let shutdown = Arc::new(ShutdownController::new());
    spawn_ctrl_c_handler(shutdown, agent.clone());
    spawn_exit_after_job_handler(agent.clone());

    agent.run_forever().await;
    Ok(())
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
