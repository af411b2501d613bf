//! Helper service registry with a recording launcher

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use swarmfix_core::services::{CommandLine, ProcessHandle, ProcessLauncher};
use swarmfix_core::test_fixtures::create_temp_work_dir;
use swarmfix_core::{FixtureConfig, FixtureError, ServiceError, ServiceKind, TestRun, WebServerOptions};

/// Launcher that records command lines instead of starting processes.
#[derive(Default)]
struct RecordingLauncher {
    spawned: Mutex<Vec<CommandLine>>,
    killed: Mutex<Vec<Option<u32>>>,
    next_pid: AtomicU32,
    fail: AtomicBool,
}

impl ProcessLauncher for RecordingLauncher {
    fn spawn(&self, command: &CommandLine) -> Result<ProcessHandle, ServiceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::SpawnFailed {
                command: command.to_string(),
                reason: "recording launcher told to fail".to_string(),
            });
        }
        self.spawned.lock().push(command.clone());
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessHandle::new(Some(pid)))
    }

    fn kill(&self, process: &mut ProcessHandle) {
        self.killed.lock().push(process.pid());
    }
}

fn recording_run() -> (tempfile::TempDir, Arc<RecordingLauncher>, TestRun) {
    let (temp_dir, work_dir) = create_temp_work_dir();
    let launcher = Arc::new(RecordingLauncher::default());
    let run = TestRun::with_launcher(
        FixtureConfig::fast(work_dir),
        Arc::clone(&launcher) as Arc<dyn ProcessLauncher>,
    );
    (temp_dir, launcher, run)
}

#[tokio::test]
async fn test_service_started_once_per_kind() {
    let (_temp_dir, launcher, run) = recording_run();

    let first = run.ensure_service(ServiceKind::Socks5).await.unwrap();
    let again = run.ensure_service(ServiceKind::Socks5).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(launcher.spawned.lock().len(), 1);

    let http = run.ensure_service(ServiceKind::Http).await.unwrap();
    assert_ne!(first, http);
    assert_eq!(launcher.spawned.lock().len(), 2);

    assert_eq!(run.teardown().await, 2);
}

#[tokio::test]
async fn test_web_server_options_are_distinct_services() {
    let (_temp_dir, launcher, run) = recording_run();

    let plain = ServiceKind::WebServer(WebServerOptions::default());
    let chunked = ServiceKind::WebServer(WebServerOptions {
        chunked_encoding: true,
        ..WebServerOptions::default()
    });

    let plain_port = run.ensure_service(plain).await.unwrap();
    let chunked_port = run.ensure_service(chunked).await.unwrap();
    assert_ne!(plain_port, chunked_port);

    let spawned = launcher.spawned.lock().clone();
    assert_eq!(
        spawned[1].args[1..],
        [chunked_port.to_string(), "1".into(), "0".into(), "0".into(), "0".into()]
    );

    run.teardown().await;
}

#[tokio::test]
async fn test_password_proxy_gets_credentials() {
    let (_temp_dir, launcher, run) = recording_run();
    let port = run.ensure_service(ServiceKind::Socks5Password).await.unwrap();

    let command = launcher.spawned.lock()[0].clone();
    let services = &run.config().services;
    assert_eq!(command.program, services.interpreter);
    assert!(command.args[0].ends_with("socks.py"));
    assert_eq!(
        command.args[1..],
        [
            "--port".to_string(),
            port.to_string(),
            "--username".to_string(),
            services.proxy_username.clone(),
            "--password".to_string(),
            services.proxy_password.clone(),
        ]
    );

    run.teardown().await;
}

#[tokio::test]
async fn test_teardown_kills_and_releases_everything() {
    let (_temp_dir, launcher, run) = recording_run();

    let ports = [
        run.ensure_service(ServiceKind::Socks4).await.unwrap(),
        run.ensure_service(ServiceKind::HttpPassword).await.unwrap(),
    ];
    for port in ports {
        assert!(run.ports().is_leased(port));
    }

    assert_eq!(run.teardown().await, 2);
    assert_eq!(launcher.killed.lock().len(), 2);
    assert!(run.services().running().await.is_empty());
    for port in ports {
        assert!(!run.ports().is_leased(port));
    }

    // A later scenario starts a fresh instance
    run.ensure_service(ServiceKind::Socks4).await.unwrap();
    assert_eq!(launcher.spawned.lock().len(), 3);
    run.teardown().await;
}

#[tokio::test]
async fn test_release_keeps_service_running() {
    let (_temp_dir, _launcher, run) = recording_run();
    let port = run.ensure_service(ServiceKind::Http).await.unwrap();

    run.services().release_service(port);
    assert_eq!(run.services().port_of(ServiceKind::Http).await, Some(port));
    run.teardown().await;
}

#[tokio::test]
async fn test_spawn_failure_is_fatal_and_frees_port() {
    let (_temp_dir, launcher, run) = recording_run();
    launcher.fail.store(true, Ordering::SeqCst);

    let error = run.ensure_service(ServiceKind::Socks5).await.unwrap_err();
    assert!(matches!(
        error,
        FixtureError::Service(ServiceError::SpawnFailed { .. })
    ));
    assert!(error.is_fatal());
    assert!(run.ports().active_leases().is_empty());
    assert!(run.services().running().await.is_empty());
}
