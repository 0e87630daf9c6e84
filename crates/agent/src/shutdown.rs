use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use opeva_agent_engine::Agent;

/// Tracks repeated interrupt requests so a second ctrl-c escalates from a
/// graceful stop to an immediate exit.
#[derive(Debug, Default)]
pub struct ShutdownController {
    forced: AtomicU8,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump_forced(&self) -> u8 {
        self.forced.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub fn spawn_ctrl_c_handler(shutdown: Arc<ShutdownController>, agent: Agent) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let n = shutdown.bump_forced();
            if n == 1 {
                tracing::info!(
                    "interrupt received; finishing current job before exit (press ctrl-c again to exit immediately)"
                );
                agent.stop();
            } else {
                tracing::warn!("second interrupt; exiting immediately");
                std::process::exit(130);
            }
        }
    });
}

/// SIGUSR1 asks the agent to exit once the current (or next, if idle) job
/// completes.
#[cfg(unix)]
pub fn spawn_exit_after_job_handler(agent: Agent) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGUSR1 handler");
                return;
            }
        };
        while usr1.recv().await.is_some() {
            tracing::info!("SIGUSR1 received; worker will exit after the current job");
            agent.request_exit_after_current_job();
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_exit_after_job_handler(_agent: Agent) {
    tracing::debug!("exit-after-job signal not supported on this platform");
}
