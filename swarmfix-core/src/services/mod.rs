//! Auxiliary helper services (proxies and web servers)
//!
//! Some scenarios need a SOCKS or HTTP proxy, or a plain web server, next to
//! the nodes. Helpers are external scripts started on demand, one instance
//! per kind for the whole run, and killed together when the run ends.
//! Individual scenarios never stop the helpers they used.

pub mod launcher;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

pub use launcher::{CommandLine, ProcessHandle, ProcessLauncher, SystemLauncher};

use crate::config::ServiceConfig;
use crate::network::{LeaseOwner, PortAllocator};

/// Behaviour switches of the helper web server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WebServerOptions {
    pub tls: bool,
    pub chunked_encoding: bool,
    pub keep_alive: bool,
    /// Minimum announce interval handed out when acting as a tracker
    pub min_interval: u32,
}

/// Kind of helper service.
///
/// Web servers with different options are distinct kinds, so each option
/// set gets its own instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Socks4,
    Socks5,
    Socks5Password,
    Http,
    HttpPassword,
    WebServer(WebServerOptions),
}

impl ServiceKind {
    /// Builds the helper command line for a service listening on `port`.
    pub fn command_line(&self, port: u16, config: &ServiceConfig) -> CommandLine {
        let script = |name: &str| config.scripts_dir.join(name).display().to_string();
        let with_credentials = |command: CommandLine| {
            command
                .arg("--username")
                .arg(config.proxy_username.clone())
                .arg("--password")
                .arg(config.proxy_password.clone())
        };
        let base = CommandLine::new(config.interpreter.clone());

        match self {
            ServiceKind::Socks4 => base
                .arg(script("socks.py"))
                .arg("--port")
                .arg(port.to_string())
                .arg("--allow-v4"),
            ServiceKind::Socks5 => base
                .arg(script("socks.py"))
                .arg("--port")
                .arg(port.to_string()),
            ServiceKind::Socks5Password => with_credentials(
                base.arg(script("socks.py"))
                    .arg("--port")
                    .arg(port.to_string()),
            ),
            ServiceKind::Http => base
                .arg(script("http.py"))
                .arg("--port")
                .arg(port.to_string()),
            ServiceKind::HttpPassword => with_credentials(
                base.arg(script("http.py"))
                    .arg("--port")
                    .arg(port.to_string()),
            ),
            ServiceKind::WebServer(options) => base
                .arg(script("web_server.py"))
                .arg(port.to_string())
                .arg(flag(options.chunked_encoding))
                .arg(flag(options.tls))
                .arg(flag(options.keep_alive))
                .arg(options.min_interval.to_string()),
        }
    }
}

fn flag(enabled: bool) -> &'static str {
    if enabled { "1" } else { "0" }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Socks4 => write!(f, "socks4"),
            ServiceKind::Socks5 => write!(f, "socks5"),
            ServiceKind::Socks5Password => write!(f, "socks5 (password)"),
            ServiceKind::Http => write!(f, "http"),
            ServiceKind::HttpPassword => write!(f, "http (password)"),
            ServiceKind::WebServer(options) => write!(
                f,
                "web server (tls={}, chunked={}, keepalive={}, min_interval={})",
                options.tls, options.chunked_encoding, options.keep_alive, options.min_interval
            ),
        }
    }
}

/// Errors that can occur while providing helper services.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("No free port found after {attempts} probes")]
    PortsExhausted { attempts: u32 },

    #[error("Failed to spawn `{command}`: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct RunningService {
    kind: ServiceKind,
    process: ProcessHandle,
}

/// Registry of running helper services, keyed by port.
pub struct ServiceManager {
    config: ServiceConfig,
    launcher: Arc<dyn ProcessLauncher>,
    ports: Arc<PortAllocator>,
    running: Mutex<BTreeMap<u16, RunningService>>,
}

impl ServiceManager {
    pub fn new(
        config: ServiceConfig,
        ports: Arc<PortAllocator>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            config,
            launcher,
            ports,
            running: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the port of the running service of `kind`, starting it first
    /// if needed.
    ///
    /// A fresh helper gets the configured grace period to bind its socket
    /// before the port is returned.
    ///
    /// # Errors
    ///
    /// - `ServiceError::PortsExhausted` - No free port for a new helper
    /// - `ServiceError::SpawnFailed` - Helper program could not be started
    pub async fn ensure_service(&self, kind: ServiceKind) -> Result<u16, ServiceError> {
        let mut running = self.running.lock().await;

        if let Some((port, _)) = running.iter().find(|(_, service)| service.kind == kind) {
            tracing::debug!("Reusing {} on port {}", kind, port);
            return Ok(*port);
        }

        let lease = self.ports.allocate(LeaseOwner::Service(kind))?;
        let command = kind.command_line(lease.port, &self.config);
        tracing::info!("Starting {} on port {}: {}", kind, lease.port, command);

        let process = match self.launcher.spawn(&command) {
            Ok(process) => process,
            Err(e) => {
                self.ports.release(lease.port);
                tracing::error!("Failed to launch {}: {}", kind, e);
                return Err(e);
            }
        };

        running.insert(lease.port, RunningService { kind, process });
        tokio::time::sleep(self.config.startup_grace).await;
        tracing::info!("Launched {} on port {}", kind, lease.port);

        Ok(lease.port)
    }

    /// Marks the service on `port` as no longer needed by a scenario.
    ///
    /// Helpers stay up until [`ServiceManager::teardown_all`] so later
    /// scenarios can reuse them.
    pub fn release_service(&self, port: u16) {
        tracing::info!("Service on port {} released, kept running until teardown", port);
    }

    /// Force-terminates every tracked helper and clears the registry.
    ///
    /// Does not wait for the processes to exit. Returns the number of
    /// helpers terminated.
    pub async fn teardown_all(&self) -> usize {
        let mut running = self.running.lock().await;
        let count = running.len();

        for (port, mut service) in std::mem::take(&mut *running) {
            tracing::info!("Stopping {} on port {}", service.kind, port);
            self.launcher.kill(&mut service.process);
            self.ports.release(port);
        }

        count
    }

    /// Snapshot of running services as `(port, kind)`.
    pub async fn running(&self) -> Vec<(u16, ServiceKind)> {
        self.running
            .lock()
            .await
            .iter()
            .map(|(port, service)| (*port, service.kind))
            .collect()
    }

    /// Port of the running service of `kind`, if any.
    pub async fn port_of(&self, kind: ServiceKind) -> Option<u16> {
        self.running
            .lock()
            .await
            .iter()
            .find(|(_, service)| service.kind == kind)
            .map(|(port, _)| *port)
    }
}

impl fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        let running = self.running.get_mut();
        if !running.is_empty() {
            tracing::warn!(
                "{} helper processes still running without teardown: ports {:?}",
                running.len(),
                running.keys().collect::<Vec<_>>()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::PortConfig;

    #[derive(Default)]
    struct CountingLauncher {
        spawned: AtomicU32,
        killed: AtomicU32,
        fail: bool,
    }

    impl ProcessLauncher for CountingLauncher {
        fn spawn(&self, command: &CommandLine) -> Result<ProcessHandle, ServiceError> {
            if self.fail {
                return Err(ServiceError::SpawnFailed {
                    command: command.to_string(),
                    reason: "not found".to_string(),
                });
            }
            let pid = self.spawned.fetch_add(1, Ordering::SeqCst) + 100;
            Ok(ProcessHandle::new(Some(pid)))
        }

        fn kill(&self, _handle: &mut ProcessHandle) {
            self.killed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> ServiceConfig {
        ServiceConfig {
            startup_grace: Duration::from_millis(1),
            ..ServiceConfig::default()
        }
    }

    fn manager(launcher: Arc<CountingLauncher>) -> (ServiceManager, Arc<PortAllocator>) {
        let ports = Arc::new(PortAllocator::new(PortConfig::default()));
        (
            ServiceManager::new(config(), Arc::clone(&ports), launcher),
            ports,
        )
    }

    #[test]
    fn test_proxy_command_lines() {
        let config = ServiceConfig {
            scripts_dir: PathBuf::from("helpers"),
            ..ServiceConfig::default()
        };

        assert_eq!(
            ServiceKind::Socks4.command_line(2001, &config).to_string(),
            "python helpers/socks.py --port 2001 --allow-v4"
        );
        assert_eq!(
            ServiceKind::Socks5Password.command_line(2002, &config).to_string(),
            "python helpers/socks.py --port 2002 --username testuser --password testpass"
        );
        assert_eq!(
            ServiceKind::Http.command_line(2003, &config).to_string(),
            "python helpers/http.py --port 2003"
        );
        assert_eq!(
            ServiceKind::HttpPassword.command_line(2004, &config).to_string(),
            "python helpers/http.py --port 2004 --username testuser --password testpass"
        );
    }

    #[test]
    fn test_web_server_command_line() {
        let config = ServiceConfig {
            scripts_dir: PathBuf::from("helpers"),
            ..ServiceConfig::default()
        };
        let kind = ServiceKind::WebServer(WebServerOptions {
            tls: true,
            chunked_encoding: false,
            keep_alive: true,
            min_interval: 30,
        });
        assert_eq!(
            kind.command_line(2005, &config).to_string(),
            "python helpers/web_server.py 2005 0 1 1 30"
        );
    }

    #[tokio::test]
    async fn test_same_kind_reuses_single_instance() {
        let launcher = Arc::new(CountingLauncher::default());
        let (services, ports) = manager(Arc::clone(&launcher));

        let first = services.ensure_service(ServiceKind::Http).await.unwrap();
        let second = services.ensure_service(ServiceKind::Http).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);
        assert!(ports.is_leased(first));

        let socks = services.ensure_service(ServiceKind::Socks5).await.unwrap();
        assert_ne!(socks, first);
        assert_eq!(services.port_of(ServiceKind::Socks5).await, Some(socks));

        services.release_service(first);
        assert_eq!(services.running().await.len(), 2);

        assert_eq!(services.teardown_all().await, 2);
        assert_eq!(launcher.killed.load(Ordering::SeqCst), 2);
        assert!(services.running().await.is_empty());
        assert!(ports.active_leases().is_empty());
    }

    #[tokio::test]
    async fn test_web_server_options_are_distinct_kinds() {
        let launcher = Arc::new(CountingLauncher::default());
        let (services, _ports) = manager(Arc::clone(&launcher));

        let plain = ServiceKind::WebServer(WebServerOptions::default());
        let tls = ServiceKind::WebServer(WebServerOptions {
            tls: true,
            ..WebServerOptions::default()
        });
        let a = services.ensure_service(plain).await.unwrap();
        let b = services.ensure_service(tls).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 2);
        services.teardown_all().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_port() {
        let launcher = Arc::new(CountingLauncher {
            fail: true,
            ..CountingLauncher::default()
        });
        let (services, ports) = manager(launcher);

        let result = services.ensure_service(ServiceKind::Socks4).await;
        assert!(matches!(result, Err(ServiceError::SpawnFailed { .. })));
        assert!(ports.active_leases().is_empty());
        assert!(services.running().await.is_empty());
    }
}
