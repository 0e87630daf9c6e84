use super::*;
use crate::test_support::{FakeContainer, FakeRuntime};

fn spec(gpus: Option<GpuRequest>) -> LaunchSpec {
    LaunchSpec {
        image: "my-image:latest".to_string(),
        command: vec![
            "--config".to_string(),
            "/data/configs/demo.yaml".to_string(),
            "--job_id".to_string(),
            "job1".to_string(),
        ],
        name: "job_worker-a_Demo_job1".to_string(),
        volumes: vec![VolumeMount {
            host: PathBuf::from("/srv/shared"),
            container: "/data".to_string(),
            read_only: false,
        }],
        labels: vec![
            ("opeva.worker_id".to_string(), "worker-a".to_string()),
            ("opeva.job_id".to_string(), "job1".to_string()),
        ],
        gpus,
    }
}

#[test]
fn run_args_cover_mounts_labels_and_command() {
    let args = docker_run_args(&spec(None));
    assert_eq!(args[..4], ["run", "-d", "--name", "job_worker-a_Demo_job1"]);

    let volume_idx = args.iter().position(|a| a == "-v").unwrap();
    assert_eq!(args[volume_idx + 1], "/srv/shared:/data:rw");

    let label_positions: Vec<_> =
        args.iter().enumerate().filter(|(_, a)| *a == "--label").map(|(i, _)| i).collect();
    assert_eq!(args[label_positions[0] + 1], "opeva.worker_id=worker-a");
    assert_eq!(args[label_positions[1] + 1], "opeva.job_id=job1");

    // The image comes after every option, followed by the job command.
    let image_idx = args.iter().position(|a| a == "my-image:latest").unwrap();
    assert_eq!(
        args[image_idx + 1..],
        ["--config", "/data/configs/demo.yaml", "--job_id", "job1"]
    );
    assert!(!args.contains(&"--gpus".to_string()));
}

#[test]
fn run_args_request_all_gpus() {
    let args = docker_run_args(&spec(Some(GpuRequest::all())));
    let gpu_idx = args.iter().position(|a| a == "--gpus").unwrap();
    assert_eq!(args[gpu_idx + 1], "all");
    let image_idx = args.iter().position(|a| a == "my-image:latest").unwrap();
    assert!(gpu_idx < image_idx);
}

#[test]
fn run_args_request_gpu_count() {
    let args = docker_run_args(&spec(Some(GpuRequest { count: 2 })));
    let gpu_idx = args.iter().position(|a| a == "--gpus").unwrap();
    assert_eq!(args[gpu_idx + 1], "2");
}

#[tokio::test]
async fn fallback_retries_without_gpu() {
    let runtime = FakeRuntime::new();
    runtime.fail_on_gpu.store(true, std::sync::atomic::Ordering::SeqCst);
    runtime.add_container("job1", FakeContainer::new("job1", 0, &[]));

    let container = launch_with_fallback(&runtime, spec(Some(GpuRequest::all()))).await.unwrap();
    assert_eq!(container.id(), "cid-job1");

    let calls = runtime.run_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].gpus, "first attempt should request the gpu");
    assert!(!calls[1].gpus, "fallback should omit the gpu request");
}

#[tokio::test]
async fn fallback_propagates_when_retry_fails() {
    let runtime = FakeRuntime::new();
    runtime.fail_always.store(true, std::sync::atomic::Ordering::SeqCst);

    let err = launch_with_fallback(&runtime, spec(Some(GpuRequest::all()))).await.unwrap_err();
    assert!(matches!(err, ContainerError::Command { .. }));
    assert_eq!(runtime.run_calls().len(), 2);
}

#[tokio::test]
async fn launch_without_gpu_fails_once() {
    let runtime = FakeRuntime::new();
    runtime.fail_always.store(true, std::sync::atomic::Ordering::SeqCst);

    let err = launch_with_fallback(&runtime, spec(None)).await.unwrap_err();
    assert!(matches!(err, ContainerError::Command { .. }));
    assert_eq!(runtime.run_calls().len(), 1);
}
