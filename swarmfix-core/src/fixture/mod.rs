//! Test run context and multi-node fixture builder
//!
//! A [`TestRun`] owns everything that lives for the whole run: the port
//! allocator, the helper service registry and the per-node replay buffers.
//! Fixture operations borrow it instead of reaching for process-wide state,
//! and [`TestRun::teardown`] ends the run explicitly.

pub mod identity;
pub mod transfer;

use std::path::PathBuf;
use std::sync::Arc;

pub use identity::{assign_identities, assign_identities_with};
pub use transfer::{DEFAULT_CONTENT_NAME, Fixture, Role, TransferHandles, TransferOptions, setup_transfer};

use crate::config::FixtureConfig;
use crate::engine::{Event, EventKind, Node};
use crate::network::{LeaseOwner, PortAllocator};
use crate::replay::{ConsumePolicy, ReplayRegistry};
use crate::services::{ProcessLauncher, ServiceKind, ServiceManager, SystemLauncher};

/// Shared state of one test run.
#[derive(Debug)]
pub struct TestRun {
    config: FixtureConfig,
    ports: Arc<PortAllocator>,
    services: ServiceManager,
    events: ReplayRegistry,
}

impl TestRun {
    /// Creates a run that launches real helper processes.
    pub fn new(config: FixtureConfig) -> Self {
        Self::with_launcher(config, Arc::new(SystemLauncher))
    }

    /// Creates a run with a custom process launcher.
    pub fn with_launcher(config: FixtureConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let ports = Arc::new(PortAllocator::new(config.ports.clone()));
        let services = ServiceManager::new(config.services.clone(), Arc::clone(&ports), launcher);
        let events = ReplayRegistry::new(config.events.event_timeout);

        Self {
            config,
            ports,
            services,
            events,
        }
    }

    /// Creates a run configured from environment variables.
    pub fn from_env() -> Self {
        Self::new(FixtureConfig::from_env())
    }

    pub fn config(&self) -> &FixtureConfig {
        &self.config
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    pub fn events(&self) -> &ReplayRegistry {
        &self.events
    }

    /// Waits for the first event of `kind` on `node`.
    ///
    /// See [`ReplayRegistry::wait_for_event`].
    pub async fn wait_for_event(
        &self,
        node: &dyn Node,
        kind: EventKind,
        label: &str,
        policy: ConsumePolicy,
    ) -> Option<Event> {
        self.events.wait_for_event(node, kind, label, policy).await
    }

    /// Returns the port of a running helper of `kind`, starting it if needed.
    ///
    /// # Errors
    ///
    /// - `FixtureError::Service` - No free port or the helper failed to spawn
    pub async fn ensure_service(&self, kind: ServiceKind) -> crate::Result<u16> {
        Ok(self.services.ensure_service(kind).await?)
    }

    /// Leases a free loopback port for direct use.
    ///
    /// # Errors
    ///
    /// - `FixtureError::Service` - Port range exhausted
    pub fn allocate_port(&self) -> crate::Result<u16> {
        Ok(self.ports.allocate(LeaseOwner::Direct)?.port)
    }

    /// Returns a directly leased port.
    pub fn release_port(&self, port: u16) -> bool {
        self.ports.release(port)
    }

    /// Working directory of node `index` (1-based) for a scenario suffix.
    pub fn node_dir(&self, index: usize, suffix: &str) -> PathBuf {
        self.config.work_dir.join(format!("tmp{index}{suffix}"))
    }

    /// Ends the run, killing every helper service.
    ///
    /// Returns the number of helpers terminated.
    pub async fn teardown(&self) -> usize {
        let stopped = self.services.teardown_all().await;
        tracing::info!("Test run torn down, {} helper services stopped", stopped);
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::create_temp_work_dir;

    #[test]
    fn test_node_dirs_follow_suffix() {
        let (_temp_dir, work_dir) = create_temp_work_dir();
        let run = TestRun::new(FixtureConfig::fast(&work_dir));

        assert_eq!(run.node_dir(1, ""), work_dir.join("tmp1"));
        assert_eq!(run.node_dir(2, "_metadata"), work_dir.join("tmp2_metadata"));
    }

    #[tokio::test]
    async fn test_direct_port_leases() {
        let (_temp_dir, work_dir) = create_temp_work_dir();
        let run = TestRun::new(FixtureConfig::fast(&work_dir));

        let port = run.allocate_port().unwrap();
        assert!(run.ports().is_leased(port));
        assert!(run.release_port(port));
        assert_eq!(run.teardown().await, 0);
    }
}
