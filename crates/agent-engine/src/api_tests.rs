use super::*;

#[test]
fn job_display_name_defaults_to_id() {
    let named: Job =
        serde_json::from_str(r#"{"job_id":"j1","config_path":"cfg.yaml","job_name":"Demo"}"#)
            .unwrap();
    assert_eq!(named.display_name(), "Demo");

    let unnamed: Job = serde_json::from_str(r#"{"job_id":"j1","config_path":"cfg.yaml"}"#).unwrap();
    assert_eq!(unnamed.display_name(), "j1");
}

#[test]
fn status_serializes_lowercase() {
    assert_eq!(serde_json::to_string(&JobStatus::Running).unwrap(), r#""running""#);
    assert_eq!(serde_json::to_string(&JobStatus::Canceled).unwrap(), r#""canceled""#);
    assert_eq!(JobStatus::Stopped.to_string(), "stopped");
}

#[test]
fn remote_terminal_parsing() {
    assert_eq!(JobStatus::from_remote_terminal("canceled"), Some(JobStatus::Canceled));
    assert_eq!(JobStatus::from_remote_terminal("stopped"), Some(JobStatus::Stopped));
    assert_eq!(JobStatus::from_remote_terminal("running"), None);
    assert_eq!(JobStatus::from_remote_terminal("queued"), None);
}

#[test]
fn status_extra_skips_absent_fields() {
    let extra = StatusExtra { exit_code: Some(5), ..Default::default() };
    let json = serde_json::to_value(&extra).unwrap();
    assert_eq!(json, serde_json::json!({"exit_code": 5}));

    let empty = serde_json::to_value(StatusExtra::default()).unwrap();
    assert_eq!(empty, serde_json::json!({}));
}
