use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

const LOG_READ_BUF: usize = 8192;

/// Errors from the container runtime.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The `docker` binary could not be executed.
    #[error("failed to exec docker: {0}")]
    Spawn(#[from] std::io::Error),
    /// A docker command exited non-zero.
    #[error("docker {command} failed: {stderr}")]
    Command {
        /// The docker subcommand that failed.
        command: String,
        /// Trimmed stderr from the failed invocation.
        stderr: String,
    },
    /// Docker produced output the runtime could not interpret.
    #[error("unexpected docker output: {0}")]
    Output(String),
}

/// A GPU device request attached to a container launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuRequest {
    /// Number of devices, `-1` for all available.
    pub count: i64,
}

impl GpuRequest {
    /// Request every available GPU.
    pub fn all() -> Self {
        Self { count: -1 }
    }
}

/// A host path bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// Host-side path.
    pub host: PathBuf,
    /// Mount point inside the container.
    pub container: String,
    /// Mount read-only instead of read-write.
    pub read_only: bool,
}

/// Everything needed to launch one detached job container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Image reference.
    pub image: String,
    /// Arguments passed to the image entrypoint.
    pub command: Vec<String>,
    /// Container name.
    pub name: String,
    /// Bind mounts.
    pub volumes: Vec<VolumeMount>,
    /// Container labels.
    pub labels: Vec<(String, String)>,
    /// Optional GPU request; dropped by the fallback retry.
    pub gpus: Option<GpuRequest>,
}

/// A launched container, shared between the job runner (log streaming,
/// wait, removal) and the cancellation monitor (stop).
#[async_trait]
pub trait Container: Send + Sync + std::fmt::Debug {
    /// Runtime-assigned container id.
    fn id(&self) -> &str;
    /// Container name.
    fn name(&self) -> &str;
    /// Next chunk of combined stdout/stderr output, `None` once the
    /// stream ends (the container exited).
    async fn next_log_chunk(&self) -> Option<Vec<u8>>;
    /// Block until the container exits and return its exit code.
    async fn wait(&self) -> Result<i64, ContainerError>;
    /// Request graceful termination.
    async fn stop(&self) -> Result<(), ContainerError>;
    /// Release the container's resources.
    async fn remove(&self, force: bool) -> Result<(), ContainerError>;
}

/// Launches containers. Tests substitute an in-memory fake; production
/// uses [`DockerCli`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch a detached container and return a handle to it.
    async fn run(&self, spec: &LaunchSpec) -> Result<Arc<dyn Container>, ContainerError>;

    /// Release any resources held by the runtime client.
    async fn close(&self) {}
}

/// Launch with the GPU fallback policy: when a GPU request is present and
/// the launch fails for any reason, retry once without it so hosts without
/// GPU support still execute jobs. Without a GPU request, or when the
/// retry also fails, the error propagates.
pub(crate) async fn launch_with_fallback(
    runtime: &dyn ContainerRuntime,
    spec: LaunchSpec,
) -> Result<Arc<dyn Container>, ContainerError> {
    if spec.gpus.is_some() {
        match runtime.run(&spec).await {
            Ok(container) => return Ok(container),
            Err(err) => {
                tracing::info!(name = %spec.name, error = %err, "gpu launch failed; retrying without gpu");
                let spec = LaunchSpec { gpus: None, ..spec };
                return runtime.run(&spec).await;
            }
        }
    }
    runtime.run(&spec).await
}

/// Container runtime backed by the `docker` CLI.
#[derive(Debug, Default)]
pub struct DockerCli;

impl DockerCli {
    /// New CLI-backed runtime. The `docker` binary is resolved from `PATH`
    /// on first use.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run(&self, spec: &LaunchSpec) -> Result<Arc<dyn Container>, ContainerError> {
        let args = docker_run_args(spec);
        let stdout = run_docker(&args).await?;
        // `docker run -d` prints the container id as the last line; pull
        // warnings may precede it.
        let id = stdout
            .lines()
            .last()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ContainerError::Output(format!("docker run returned {stdout:?}")))?;
        Ok(Arc::new(DockerContainer {
            id: id.to_string(),
            name: spec.name.clone(),
            logs: tokio::sync::Mutex::new(LogStream::NotStarted),
        }))
    }
}

fn docker_run_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args: Vec<String> =
        vec!["run".into(), "-d".into(), "--name".into(), spec.name.clone()];
    for mount in &spec.volumes {
        let mode = if mount.read_only { "ro" } else { "rw" };
        args.push("-v".into());
        args.push(format!("{}:{}:{}", mount.host.display(), mount.container, mode));
    }
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }
    if let Some(gpus) = &spec.gpus {
        args.push("--gpus".into());
        args.push(if gpus.count < 0 { "all".into() } else { gpus.count.to_string() });
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Run a docker CLI command and return trimmed stdout on success.
async fn run_docker<S: AsRef<OsStr>>(args: &[S]) -> Result<String, ContainerError> {
    let output = Command::new("docker").args(args).stdin(Stdio::null()).output().await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(ContainerError::Command {
            command: args
                .first()
                .map(|a| a.as_ref().to_string_lossy().into_owned())
                .unwrap_or_default(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[derive(Debug)]
enum LogStream {
    NotStarted,
    Streaming(mpsc::Receiver<Vec<u8>>),
    Done,
}

#[derive(Debug)]
struct DockerContainer {
    id: String,
    name: String,
    logs: tokio::sync::Mutex<LogStream>,
}

impl DockerContainer {
    fn start_log_stream(&self) -> Result<mpsc::Receiver<Vec<u8>>, ContainerError> {
        let mut child = Command::new("docker")
            .args(["logs", "--follow", &self.id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let (tx, rx) = mpsc::channel(16);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_chunks(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_chunks(stderr, tx));
        }
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(rx)
    }
}

async fn pump_chunks<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; LOG_READ_BUF];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Container for DockerContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn next_log_chunk(&self) -> Option<Vec<u8>> {
        let mut state = self.logs.lock().await;
        loop {
            match &mut *state {
                LogStream::NotStarted => match self.start_log_stream() {
                    Ok(rx) => *state = LogStream::Streaming(rx),
                    Err(err) => {
                        tracing::debug!(container = %self.id, error = %err, "failed to stream logs");
                        *state = LogStream::Done;
                        return None;
                    }
                },
                LogStream::Streaming(rx) => match rx.recv().await {
                    Some(chunk) => return Some(chunk),
                    None => {
                        *state = LogStream::Done;
                        return None;
                    }
                },
                LogStream::Done => return None,
            }
        }
    }

    async fn wait(&self) -> Result<i64, ContainerError> {
        let stdout = run_docker(&["wait", &self.id]).await?;
        stdout
            .trim()
            .parse::<i64>()
            .map_err(|_| ContainerError::Output(format!("docker wait returned {stdout:?}")))
    }

    async fn stop(&self) -> Result<(), ContainerError> {
        run_docker(&["stop", &self.id]).await.map(drop)
    }

    async fn remove(&self, force: bool) -> Result<(), ContainerError> {
        if force {
            run_docker(&["rm", "-f", &self.id]).await.map(drop)
        } else {
            run_docker(&["rm", &self.id]).await.map(drop)
        }
    }
}

#[cfg(test)]
#[path = "container_tests.rs"]
mod tests;
