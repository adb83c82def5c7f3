//! Integration tests against real worker subprocesses
//!
//! The workers are small `sh` scripts that speak the line protocol, so these
//! run without any inference library installed.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use inference_bridge::config::Timeouts;
use inference_bridge::workers::{Launch, LaunchRequest};
use inference_bridge::{
    DetectOptions, InferenceError, InferenceService, ProcessSupervisor, ServiceConfig,
    ServiceEvent, ServiceState, StartupError, SupervisorConfig,
};

const HANDSHAKE: &str = r#"echo '{"success":true,"message":"worker ready"}'"#;

/// Worker that answers load/detect, exits on `exit` and crashes on classify
const WELL_BEHAVED: &str = r#"
echo "worker starting" >&2
while IFS= read -r line; do
  case "$line" in
    *'"command":"exit"'*) exit 0 ;;
    *'"command":"load_model"'*) echo '{"success":true,"message":"Model loaded","data":{"num_classes":2,"class_names":["cat","dog"]}}' ;;
    *'"command":"detect"'*) echo '{"success":true,"message":"","data":{"detections":[{"x":0,"y":0,"width":50,"height":50,"confidence":0.8,"class_id":3,"label":"cat"}]}}' ;;
    *'"command":"classify"'*) exit 3 ;;
    *) echo '{"success":false,"message":"unknown command"}' ;;
  esac
done
"#;

fn write_worker(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("worker.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("Failed to write worker script");
    path
}

fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        system_interpreter: "sh".to_string(),
        manager: "no-such-environment-manager-1893".to_string(),
        env_dirs: Vec::new(),
        timeouts: Timeouts {
            version_probe: Duration::from_millis(500),
            handshake: Duration::from_secs(2),
            read: Duration::from_secs(2),
            exit_grace: Duration::from_millis(500),
            kill_wait: Duration::from_secs(1),
            ..Timeouts::default()
        },
        ..SupervisorConfig::default()
    }
}

fn request(script: PathBuf) -> LaunchRequest {
    LaunchRequest {
        interpreter: Some("sh".to_string()),
        stored: None,
        script,
    }
}

#[tokio::test]
async fn test_handshake_and_graceful_stop() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_worker(dir.path(), &format!("{HANDSHAKE}\n{WELL_BEHAVED}"));

    let mut supervisor = ProcessSupervisor::new(supervisor_config());
    supervisor.start(&request(script.clone())).await.unwrap();
    assert!(supervisor.is_running());
    assert!(supervisor.pid().is_some());

    // second start is a no-op on the same process
    let pid = supervisor.pid();
    supervisor.start(&request(script)).await.unwrap();
    assert_eq!(supervisor.pid(), pid);

    let started = Instant::now();
    supervisor.stop().await;
    assert!(!supervisor.is_running());
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_handshake_timeout_kills_worker() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_worker(dir.path(), "exec sleep 30");

    let mut config = supervisor_config();
    config.timeouts.handshake = Duration::from_millis(300);
    let mut supervisor = ProcessSupervisor::new(config);

    let err = supervisor.start(&request(script)).await.unwrap_err();
    assert!(matches!(err, StartupError::HandshakeTimeout(_)));
    assert!(!supervisor.is_running());
    assert!(supervisor.pid().is_none());
}

#[tokio::test]
async fn test_handshake_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_worker(
        dir.path(),
        r#"echo '{"success":false,"message":"ultralytics is not installed"}'"#,
    );

    let mut supervisor = ProcessSupervisor::new(supervisor_config());
    let err = supervisor.start(&request(script)).await.unwrap_err();
    match err {
        StartupError::HandshakeRejected(message) => assert!(message.contains("ultralytics")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn test_handshake_must_be_an_object() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_worker(dir.path(), "echo '[true]'\nexec sleep 30");

    let mut supervisor = ProcessSupervisor::new(supervisor_config());
    let err = supervisor.start(&request(script)).await.unwrap_err();
    assert!(matches!(err, StartupError::HandshakeProtocol(_)));
    assert!(!supervisor.is_running());
    assert!(supervisor.pid().is_none());
}

#[tokio::test]
async fn test_failed_manager_run_falls_back_to_system_interpreter() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_worker(dir.path(), &format!("{HANDSHAKE}\n{WELL_BEHAVED}"));

    // answers `--version`, fails every `run`
    let manager = dir.path().join("conda");
    std::fs::write(
        &manager,
        "#!/bin/sh\ncase \"$1\" in\n  --version) echo 'conda 24.1.2' ;;\n  *) echo 'EnvironmentLocationNotFound' >&2; exit 1 ;;\nesac\n",
    )
    .unwrap();
    std::fs::set_permissions(&manager, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut supervisor = ProcessSupervisor::new(SupervisorConfig {
        manager: manager.to_string_lossy().into_owned(),
        ..supervisor_config()
    });
    let request = LaunchRequest {
        interpreter: None,
        stored: None,
        script,
    };

    assert!(supervisor.resolve_launch(&request).await.is_manager_run());
    supervisor.start(&request).await.unwrap();
    assert!(supervisor.is_running());
    assert_eq!(
        supervisor.launch(),
        Some(&Launch::Direct {
            interpreter: "sh".to_string()
        })
    );

    supervisor.stop().await;
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn test_idle_exit_observed_by_service() {
    let dir = tempfile::tempdir().unwrap();
    // answers load_model, then exits without being asked
    let script = write_worker(
        dir.path(),
        &format!(
            "{HANDSHAKE}\nIFS= read -r line\necho '{{\"success\":true,\"message\":\"Model loaded\"}}'\nexit 0"
        ),
    );

    let mut service = InferenceService::new(ServiceConfig {
        settings: None,
        script_path: Some(script),
        supervisor: supervisor_config(),
    });
    service.start(Some("sh"), None).await.unwrap();
    service.load_model("yolo.pt", None).await.unwrap();
    let mut events = service.subscribe();

    let deadline = Instant::now() + Duration::from_secs(2);
    while service.is_running() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!service.is_running());
    assert_eq!(service.state(), ServiceState::Stopped);
    assert!(!service.is_model_loaded());
    assert_eq!(
        events.try_recv().unwrap(),
        ServiceEvent::StateChanged { running: false }
    );
}

#[tokio::test]
async fn test_worker_ignoring_exit_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_worker(dir.path(), &format!("{HANDSHAKE}\nexec sleep 30"));

    let mut supervisor = ProcessSupervisor::new(supervisor_config());
    supervisor.start(&request(script)).await.unwrap();
    assert!(supervisor.is_running());

    let started = Instant::now();
    supervisor.stop().await;
    assert!(!supervisor.is_running());
    // exit grace plus kill wait
    assert!(started.elapsed() < Duration::from_millis(1500) + Duration::from_millis(500));
}

#[tokio::test]
async fn test_service_round_trip_over_process() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_worker(dir.path(), &format!("{HANDSHAKE}\n{WELL_BEHAVED}"));

    let mut service = InferenceService::new(ServiceConfig {
        settings: None,
        script_path: Some(script),
        supervisor: supervisor_config(),
    });
    let mut events = service.subscribe();

    service.start(Some("sh"), None).await.unwrap();
    assert_eq!(service.state(), ServiceState::Ready);

    let info = service.load_model("yolo.pt", None).await.unwrap();
    assert_eq!(info.num_classes, 2);
    assert_eq!(info.class_names, vec!["cat", "dog"]);

    let result = service
        .detect("cat.jpg", &DetectOptions::default())
        .await
        .unwrap();
    assert_eq!(result.detections.len(), 1);
    assert_eq!(result.detections[0].label, "cat");
    assert_eq!(result.detections[0].bbox.width, 50);

    service.stop().await;
    assert_eq!(service.state(), ServiceState::Stopped);
    assert!(!service.is_model_loaded());

    let mut saw_detection = false;
    while let Ok(event) = events.try_recv() {
        if event == (ServiceEvent::DetectionCompleted { count: 1 }) {
            saw_detection = true;
        }
    }
    assert!(saw_detection);
}

#[tokio::test]
async fn test_crash_mid_call_returns_to_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_worker(dir.path(), &format!("{HANDSHAKE}\n{WELL_BEHAVED}"));

    let mut service = InferenceService::new(ServiceConfig {
        settings: None,
        script_path: Some(script),
        supervisor: supervisor_config(),
    });
    service.start(Some("sh"), None).await.unwrap();
    service.load_model("yolo.pt", None).await.unwrap();

    let err = service.classify("cat.jpg", 5).await.unwrap_err();
    assert!(matches!(err, InferenceError::Channel(ref e) if e.is_disconnect()));
    assert_eq!(service.state(), ServiceState::Stopped);
    assert!(!service.is_model_loaded());
    assert!(!service.is_running());

    let err = service
        .detect("cat.jpg", &DetectOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, InferenceError::ServiceNotRunning));
}
