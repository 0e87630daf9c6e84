//! Shared fakes for engine tests: a scripted backend, a scripted container
//! runtime, and a minimal HTTP stub for exercising the real transport.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::api::{Job, JobStatus, StatusExtra};
use crate::backend::{Backend, BackendError};
use crate::container::{Container, ContainerError, ContainerRuntime, LaunchSpec, VolumeMount};

pub(crate) fn job(job_id: &str, config_path: &str, job_name: &str) -> Job {
    Job {
        job_id: job_id.to_string(),
        config_path: config_path.to_string(),
        job_name: Some(job_name.to_string()),
    }
}

/// Poll `cond` until it holds or five seconds elapse.
pub(crate) async fn wait_until(cond: impl Fn() -> bool) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

// ---------------------------------------------------------------------------
// Scripted backend

pub(crate) enum ScriptedNextJob {
    Job(Job),
    Http(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatusPost {
    pub(crate) job_id: String,
    pub(crate) status: JobStatus,
    pub(crate) extra: StatusExtra,
}

pub(crate) struct FakeBackend {
    next_jobs: Mutex<VecDeque<ScriptedNextJob>>,
    pub(crate) heartbeats: Mutex<Vec<()>>,
    pub(crate) status_posts: Mutex<Vec<StatusPost>>,
    remote_scripts: Mutex<HashMap<String, VecDeque<String>>>,
    last_remote: Mutex<HashMap<String, String>>,
    pub(crate) heartbeat_ok: AtomicBool,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self {
            next_jobs: Mutex::new(VecDeque::new()),
            heartbeats: Mutex::new(Vec::new()),
            status_posts: Mutex::new(Vec::new()),
            remote_scripts: Mutex::new(HashMap::new()),
            last_remote: Mutex::new(HashMap::new()),
            heartbeat_ok: AtomicBool::new(true),
        }
    }

    pub(crate) fn queue_job(&self, job: Job) {
        self.next_jobs.lock().push_back(ScriptedNextJob::Job(job));
    }

    pub(crate) fn queue_http_error(&self, status: u16) {
        self.next_jobs.lock().push_back(ScriptedNextJob::Http(status));
    }

    /// Script the remote-status sequence for a job; once drained, the last
    /// value repeats (defaulting to `running`).
    pub(crate) fn script_remote_statuses(&self, job_id: &str, statuses: &[&str]) {
        self.remote_scripts
            .lock()
            .insert(job_id.to_string(), statuses.iter().map(|s| s.to_string()).collect());
    }

    pub(crate) fn posts_for(&self, job_id: &str) -> Vec<StatusPost> {
        self.status_posts.lock().iter().filter(|p| p.job_id == job_id).cloned().collect()
    }

    pub(crate) fn terminal_post_count(&self) -> usize {
        self.status_posts.lock().iter().filter(|p| p.status != JobStatus::Running).count()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn heartbeat(&self) -> bool {
        self.heartbeats.lock().push(());
        self.heartbeat_ok.load(Ordering::SeqCst)
    }

    async fn next_job(&self) -> Result<Option<Job>, BackendError> {
        match self.next_jobs.lock().pop_front() {
            Some(ScriptedNextJob::Job(job)) => Ok(Some(job)),
            Some(ScriptedNextJob::Http(status)) => Err(BackendError::Status(
                reqwest::StatusCode::from_u16(status).unwrap_or(reqwest::StatusCode::BAD_REQUEST),
            )),
            None => Ok(None),
        }
    }

    async fn post_status(&self, job_id: &str, status: JobStatus, extra: StatusExtra) {
        self.status_posts.lock().push(StatusPost { job_id: job_id.to_string(), status, extra });
    }

    async fn fetch_status(&self, job_id: &str) -> Option<String> {
        let status = {
            let mut scripts = self.remote_scripts.lock();
            let queue = scripts.get_mut(job_id)?;
            queue.pop_front()
        };
        let status = status.unwrap_or_else(|| {
            self.last_remote.lock().get(job_id).cloned().unwrap_or_else(|| "running".to_string())
        });
        self.last_remote.lock().insert(job_id.to_string(), status.clone());
        Some(status)
    }
}

// ---------------------------------------------------------------------------
// Scripted container runtime

#[derive(Debug)]
pub(crate) struct FakeContainer {
    id: String,
    name: OnceLock<String>,
    logs: Mutex<VecDeque<Vec<u8>>>,
    exit_code: i64,
    block_wait_until_stop: bool,
    stopped: AtomicBool,
    stop_notify: Notify,
    pub(crate) removed: AtomicBool,
}

impl FakeContainer {
    fn build(job_id: &str, exit_code: i64, logs: &[&[u8]], block_wait_until_stop: bool) -> Arc<Self> {
        Arc::new(Self {
            id: format!("cid-{job_id}"),
            name: OnceLock::new(),
            logs: Mutex::new(logs.iter().map(|c| c.to_vec()).collect()),
            exit_code,
            block_wait_until_stop,
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            removed: AtomicBool::new(false),
        })
    }

    pub(crate) fn new(job_id: &str, exit_code: i64, logs: &[&[u8]]) -> Arc<Self> {
        Self::build(job_id, exit_code, logs, false)
    }

    /// A container whose `wait` blocks (up to half a second) until `stop`
    /// is called, mimicking a long-running process that only exits when
    /// terminated.
    pub(crate) fn blocking_until_stop(job_id: &str, exit_code: i64, logs: &[&[u8]]) -> Arc<Self> {
        Self::build(job_id, exit_code, logs, true)
    }

    pub(crate) fn stop_called(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn was_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        self.name.get().map(String::as_str).unwrap_or("unnamed")
    }

    async fn next_log_chunk(&self) -> Option<Vec<u8>> {
        self.logs.lock().pop_front()
    }

    async fn wait(&self) -> Result<i64, ContainerError> {
        if self.block_wait_until_stop && !self.stopped.load(Ordering::SeqCst) {
            let _ =
                tokio::time::timeout(Duration::from_millis(500), self.stop_notify.notified()).await;
        }
        Ok(self.exit_code)
    }

    async fn stop(&self) -> Result<(), ContainerError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
        Ok(())
    }

    async fn remove(&self, _force: bool) -> Result<(), ContainerError> {
        self.removed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RunCall {
    pub(crate) job_id: String,
    pub(crate) image: String,
    pub(crate) name: String,
    pub(crate) command: Vec<String>,
    pub(crate) volumes: Vec<VolumeMount>,
    pub(crate) labels: Vec<(String, String)>,
    pub(crate) gpus: bool,
}

pub(crate) struct FakeRuntime {
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
    pub(crate) run_calls: Mutex<Vec<RunCall>>,
    pub(crate) fail_on_gpu: AtomicBool,
    pub(crate) fail_always: AtomicBool,
    pub(crate) closed: AtomicBool,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            run_calls: Mutex::new(Vec::new()),
            fail_on_gpu: AtomicBool::new(false),
            fail_always: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn add_container(&self, job_id: &str, container: Arc<FakeContainer>) {
        self.containers.lock().insert(job_id.to_string(), container);
    }

    pub(crate) fn run_calls(&self) -> Vec<RunCall> {
        self.run_calls.lock().clone()
    }

    fn job_id_from_command(command: &[String]) -> Option<String> {
        command
            .iter()
            .position(|arg| arg == "--job_id")
            .and_then(|idx| command.get(idx + 1))
            .cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(&self, spec: &LaunchSpec) -> Result<Arc<dyn Container>, ContainerError> {
        let job_id = Self::job_id_from_command(&spec.command)
            .ok_or_else(|| ContainerError::Output(format!("no job id in {:?}", spec.command)))?;
        self.run_calls.lock().push(RunCall {
            job_id: job_id.clone(),
            image: spec.image.clone(),
            name: spec.name.clone(),
            command: spec.command.clone(),
            volumes: spec.volumes.clone(),
            labels: spec.labels.clone(),
            gpus: spec.gpus.is_some(),
        });
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(ContainerError::Command {
                command: "run".to_string(),
                stderr: "scripted launch failure".to_string(),
            });
        }
        if self.fail_on_gpu.load(Ordering::SeqCst) && spec.gpus.is_some() {
            return Err(ContainerError::Command {
                command: "run".to_string(),
                stderr: "device requests not supported".to_string(),
            });
        }
        let container = self
            .containers
            .lock()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| ContainerError::Output(format!("no scripted container for {job_id}")))?;
        let _ = container.name.set(spec.name.clone());
        Ok(container)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Scripted HTTP stub for transport-level backend tests

pub(crate) struct StubResponse {
    pub(crate) status: u16,
    pub(crate) body: String,
}

impl StubResponse {
    pub(crate) fn json(status: u16, body: &str) -> Self {
        Self { status, body: body.to_string() }
    }

    /// Close the connection without answering, so the client sees a
    /// transport failure.
    pub(crate) fn drop_connection() -> Self {
        Self { status: 0, body: String::new() }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StubRequest {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) body: String,
}

pub(crate) struct StubServer {
    pub(crate) addr: SocketAddr,
    requests: Arc<Mutex<Vec<StubRequest>>>,
}

impl StubServer {
    pub(crate) fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub(crate) fn requests(&self) -> Vec<StubRequest> {
        self.requests.lock().clone()
    }
}

/// Serve the scripted responses in order, one per connection; once
/// exhausted, answer `200 {}`. Records every request.
pub(crate) async fn start_stub(responses: Vec<StubResponse>) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();
    tokio::spawn(async move {
        let mut responses: VecDeque<StubResponse> = responses.into();
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            let response =
                responses.pop_front().unwrap_or_else(|| StubResponse::json(200, "{}"));
            if let Some(request) = read_request(&mut socket).await {
                recorded.lock().push(request);
            }
            if response.status != 0 {
                let reply = render_response(&response);
                let _ = socket.write_all(reply.as_bytes()).await;
            }
            let _ = socket.shutdown().await;
        }
    });
    StubServer { addr, requests }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<StubRequest> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_header_end(&raw) {
            break pos;
        }
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let content_length = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>())
        })
        .next()
        .and_then(Result::ok)
        .unwrap_or(0);

    let body_start = header_end + 4;
    while raw.len() < body_start + content_length {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
        }
    }
    let body = String::from_utf8_lossy(&raw[body_start..raw.len().min(body_start + content_length)])
        .to_string();
    Some(StubRequest { method, path, body })
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

fn render_response(response: &StubResponse) -> String {
    let reason = match response.status {
        200 => "OK",
        204 => "No Content",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Status",
    };
    if response.status == 204 {
        format!("HTTP/1.1 204 {reason}\r\nconnection: close\r\n\r\n")
    } else {
        format!(
            "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            response.status,
            reason,
            response.body.len(),
            response.body
        )
    }
}
