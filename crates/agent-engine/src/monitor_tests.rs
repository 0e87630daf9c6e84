use super::*;
use crate::test_support::{FakeBackend, FakeContainer, wait_until};
use std::time::Instant;

#[tokio::test]
async fn terminal_status_stops_container() {
    let backend = Arc::new(FakeBackend::new());
    backend.script_remote_statuses("job1", &["running", "canceled"]);
    let container = FakeContainer::new("job1", 0, &[]);

    let monitor = spawn_monitor(
        backend,
        container.clone(),
        "job1".to_string(),
        Duration::from_millis(10),
    );

    assert!(wait_until(|| container.stop_called()).await, "monitor should stop the container");
    let observed = monitor.shutdown().await;
    assert_eq!(observed, Some(JobStatus::Canceled));
}

#[tokio::test]
async fn stopped_is_terminal_too() {
    let backend = Arc::new(FakeBackend::new());
    backend.script_remote_statuses("job1", &["stopped"]);
    let container = FakeContainer::new("job1", 0, &[]);

    let monitor = spawn_monitor(
        backend,
        container.clone(),
        "job1".to_string(),
        Duration::from_millis(10),
    );

    assert!(wait_until(|| container.stop_called()).await);
    assert_eq!(monitor.shutdown().await, Some(JobStatus::Stopped));
}

#[tokio::test]
async fn non_terminal_statuses_are_ignored() {
    let backend = Arc::new(FakeBackend::new());
    backend.script_remote_statuses("job1", &["running", "queued", "running"]);
    let container = FakeContainer::new("job1", 0, &[]);

    let monitor = spawn_monitor(
        backend,
        container.clone(),
        "job1".to_string(),
        Duration::from_millis(5),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!container.stop_called());
    assert_eq!(monitor.shutdown().await, None);
}

#[tokio::test]
async fn unknown_job_keeps_polling() {
    let backend = Arc::new(FakeBackend::new());
    // No scripted statuses: every fetch answers None (unknown job).
    let container = FakeContainer::new("job1", 0, &[]);

    let monitor = spawn_monitor(
        backend,
        container.clone(),
        "job1".to_string(),
        Duration::from_millis(5),
    );
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(!container.stop_called());
    assert_eq!(monitor.shutdown().await, None);
}

#[tokio::test]
async fn shutdown_interrupts_a_long_sleep() {
    let backend = Arc::new(FakeBackend::new());
    let container = FakeContainer::new("job1", 0, &[]);

    let monitor =
        spawn_monitor(backend, container, "job1".to_string(), Duration::from_secs(3600));

    let started = Instant::now();
    monitor.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1), "stop must cancel the in-flight sleep");
}
