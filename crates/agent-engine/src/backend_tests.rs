use super::*;
use crate::test_support::{StubResponse, start_stub};

fn backend_for(url: &str) -> HttpBackend {
    HttpBackend::new(url, "worker-a").unwrap()
}

/// Bind and immediately drop a listener so the port refuses connections.
async fn dead_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

#[tokio::test]
async fn heartbeat_posts_worker_id() {
    let stub = start_stub(vec![StubResponse::json(200, "{}")]).await;
    // Trailing slashes are stripped so the path does not double up.
    let backend = backend_for(&format!("{}//", stub.base_url()));

    assert!(backend.heartbeat().await);

    let requests = stub.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/api/agent/heartbeat");
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body, serde_json::json!({"worker_id": "worker-a"}));
}

#[tokio::test]
async fn next_job_returns_none_on_204() {
    let stub = start_stub(vec![StubResponse::json(204, "")]).await;
    let backend = backend_for(&stub.base_url());

    let job = backend.next_job().await.unwrap();
    assert!(job.is_none());
    assert_eq!(stub.requests()[0].path, "/api/agent/next-job");
}

#[tokio::test]
async fn next_job_parses_payload() {
    let stub = start_stub(vec![StubResponse::json(
        200,
        r#"{"job_id":"job1","config_path":"configs/demo.yaml","job_name":"Demo"}"#,
    )])
    .await;
    let backend = backend_for(&stub.base_url());

    let job = backend.next_job().await.unwrap().unwrap();
    assert_eq!(job.job_id, "job1");
    assert_eq!(job.config_path, "configs/demo.yaml");
    assert_eq!(job.job_name.as_deref(), Some("Demo"));
}

#[tokio::test]
async fn next_job_surfaces_http_errors() {
    let stub = start_stub(vec![StubResponse::json(500, "{}")]).await;
    let backend = backend_for(&stub.base_url());

    match backend.next_job().await {
        Err(BackendError::Status(status)) => assert_eq!(status.as_u16(), 500),
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn next_job_rejects_undecodable_payload() {
    let stub = start_stub(vec![StubResponse::json(200, r#"{"unexpected":true}"#)]).await;
    let backend = backend_for(&stub.base_url());

    assert!(matches!(backend.next_job().await, Err(BackendError::Payload(_))));
}

#[tokio::test]
async fn post_status_skips_absent_extras() {
    let stub = start_stub(vec![StubResponse::json(200, "{}")]).await;
    let backend = backend_for(&stub.base_url());

    let extra = StatusExtra { exit_code: Some(0), ..Default::default() };
    backend.post_status("job1", JobStatus::Finished, extra).await;

    let requests = stub.requests();
    assert_eq!(requests[0].path, "/api/agent/job-status");
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(
        body,
        serde_json::json!({
            "worker_id": "worker-a",
            "job_id": "job1",
            "status": "finished",
            "exit_code": 0,
        })
    );
}

#[tokio::test]
async fn fetch_status_reads_status_field() {
    let stub = start_stub(vec![StubResponse::json(200, r#"{"status":"canceled"}"#)]).await;
    let backend = backend_for(&stub.base_url());

    assert_eq!(backend.fetch_status("job1").await.as_deref(), Some("canceled"));
    assert_eq!(stub.requests()[0].path, "/status/job1");
    assert_eq!(stub.requests()[0].method, "GET");
}

#[tokio::test]
async fn fetch_status_treats_404_as_unknown() {
    let stub = start_stub(vec![StubResponse::json(404, "{}")]).await;
    let backend = backend_for(&stub.base_url());

    assert_eq!(backend.fetch_status("missing").await, None);
}

#[tokio::test]
async fn transport_failures_are_absorbed() {
    let backend = backend_for(&dead_port_url().await);

    assert!(!backend.heartbeat().await);
    assert_eq!(backend.last_failure().as_deref(), Some("heartbeat"));

    // next-job transport failure reads as "no work", not an error.
    assert!(backend.next_job().await.unwrap().is_none());
    assert_eq!(backend.last_failure().as_deref(), Some("next-job"));

    assert_eq!(backend.fetch_status("job1").await, None);
    backend.post_status("job1", JobStatus::Failed, StatusExtra::default()).await;
    assert_eq!(backend.last_failure().as_deref(), Some("job-status(job1)"));
}

#[tokio::test]
async fn success_clears_failure_context() {
    let stub = start_stub(vec![StubResponse::drop_connection(), StubResponse::json(200, "{}")])
        .await;
    let backend = backend_for(&stub.base_url());

    assert!(!backend.heartbeat().await, "a dropped connection is a transport failure");
    assert_eq!(backend.last_failure().as_deref(), Some("heartbeat"));

    assert!(backend.heartbeat().await);
    assert_eq!(backend.last_failure(), None);
}

#[tokio::test]
async fn external_session_survives_reset() {
    let stub = start_stub(vec![StubResponse::json(200, "{}"), StubResponse::json(200, "{}")]).await;
    let client = reqwest::Client::builder().build().unwrap();
    let backend = HttpBackend::with_client(&stub.base_url(), "worker-a", client);

    assert!(backend.heartbeat().await);
    backend.reset();
    assert!(backend.heartbeat().await);
    assert_eq!(stub.requests().len(), 2);
}
