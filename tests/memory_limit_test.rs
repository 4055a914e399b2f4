use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use vigil::config::{ProcessSpec, SpecRegistry};
use vigil::daemon::{Supervisor, SupervisorOptions};
use vigil::process::LifecycleStatus;

#[tokio::test]
async fn test_memory_breach_restarts_without_counting_failures() {
    let temp_dir = TempDir::new().unwrap();

    // 1-byte threshold: any live process breaches it on the first sample
    let spec = ProcessSpec {
        name: "hog".to_string(),
        script: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), "sleep 30".to_string()],
        cwd: None,
        interpreter: None,
        env: HashMap::new(),
        autorestart: true,
        max_restarts: Some(0),
        min_uptime_ms: 10_000,
        restart_delay_ms: 10,
        backoff_factor: None,
        max_memory_restart: Some(1),
        cron_restart: None,
        kill_timeout_ms: 500,
        stop_signal: "SIGTERM".to_string(),
        out_file: None,
        err_file: None,
        merge_logs: false,
        log_date_format: None,
    };

    let options = SupervisorOptions {
        log_dir: temp_dir.path().to_path_buf(),
        memory_poll_interval: Duration::from_millis(100),
        ..SupervisorOptions::default()
    };

    let registry = SpecRegistry::new(vec![spec]).unwrap();
    let supervisor = Supervisor::launch(registry, options).unwrap();
    let app = supervisor.app("hog").unwrap();

    app.wait_for_status(LifecycleStatus::Running, Duration::from_secs(5))
        .await
        .unwrap();

    // The monitor forces a relaunch; with max_restarts = 0 any counted
    // failure would instead be terminal
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = app.snapshot();
        if snapshot.launches >= 2 {
            assert_eq!(snapshot.rapid_failures, 0);
            assert_ne!(snapshot.status, LifecycleStatus::PermanentlyFailed);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "memory restart never happened"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    supervisor.shutdown().await.unwrap();
}
