//! Centralized configuration for swarmfix.
//!
//! The waits and grace periods used by fixtures are defined here as named
//! constants so slower test environments can override them without touching
//! fixture code.

use std::path::PathBuf;
use std::time::Duration;

/// Absolute deadline for a single replay-buffer wait.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on waiting for a leech to report it is downloading.
pub const DEFAULT_DOWNLOADING_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for a listen event.
pub const DEFAULT_LISTEN_POLL: Duration = Duration::from_millis(500);

/// Time given to a freshly spawned helper to bind its listening socket.
pub const DEFAULT_SERVICE_GRACE: Duration = Duration::from_millis(500);

/// First port of the ephemeral range probed by the port allocator.
pub const DEFAULT_PORT_BASE: u16 = 2000;

/// Width of the random offset added to [`DEFAULT_PORT_BASE`].
pub const DEFAULT_PORT_SPAN: u16 = 6000;

/// Bind probes attempted before the allocator gives up.
pub const DEFAULT_MAX_PORT_PROBES: u32 = 4096;

/// Central configuration for a test run.
///
/// Groups related settings into logical sections and supports environment
/// variable overrides through [`FixtureConfig::from_env`].
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    pub events: EventConfig,
    pub services: ServiceConfig,
    pub ports: PortConfig,
    /// Directory under which per-node `tmp<N><suffix>` directories are created
    pub work_dir: PathBuf,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            events: EventConfig::default(),
            services: ServiceConfig::default(),
            ports: PortConfig::default(),
            work_dir: PathBuf::from("."),
        }
    }
}

/// Event observation timing.
#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Deadline for one `wait_for_event` call
    pub event_timeout: Duration,
    /// Cap on waiting for a downloading state change before connecting peers
    pub downloading_timeout: Duration,
    /// Poll interval used by `wait_for_listen`
    pub listen_poll: Duration,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            event_timeout: DEFAULT_EVENT_TIMEOUT,
            downloading_timeout: DEFAULT_DOWNLOADING_TIMEOUT,
            listen_poll: DEFAULT_LISTEN_POLL,
        }
    }
}

/// Auxiliary helper process configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Interpreter used to run helper scripts
    pub interpreter: String,
    /// Directory containing `socks.py`, `http.py` and `web_server.py`
    pub scripts_dir: PathBuf,
    /// Sleep after spawning a helper before handing out its port
    pub startup_grace: Duration,
    /// Username passed to password-protected proxies
    pub proxy_username: String,
    /// Password passed to password-protected proxies
    pub proxy_password: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            interpreter: "python".to_string(),
            scripts_dir: PathBuf::from(".."),
            startup_grace: DEFAULT_SERVICE_GRACE,
            proxy_username: "testuser".to_string(),
            proxy_password: "testpass".to_string(),
        }
    }
}

/// Ephemeral port range used by the port allocator.
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub base: u16,
    pub span: u16,
    pub max_probes: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_PORT_BASE,
            span: DEFAULT_PORT_SPAN,
            max_probes: DEFAULT_MAX_PORT_PROBES,
        }
    }
}

impl FixtureConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("SWARMFIX_EVENT_TIMEOUT_MS")
            && let Ok(millis) = value.parse::<u64>()
        {
            config.events.event_timeout = Duration::from_millis(millis);
            config.events.downloading_timeout = Duration::from_millis(millis);
        }

        if let Ok(value) = std::env::var("SWARMFIX_SERVICE_GRACE_MS")
            && let Ok(millis) = value.parse::<u64>()
        {
            config.services.startup_grace = Duration::from_millis(millis);
        }

        if let Ok(interpreter) = std::env::var("SWARMFIX_HELPER_INTERPRETER")
            && !interpreter.is_empty()
        {
            config.services.interpreter = interpreter;
        }

        if let Ok(dir) = std::env::var("SWARMFIX_HELPER_DIR")
            && !dir.is_empty()
        {
            config.services.scripts_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("SWARMFIX_WORK_DIR")
            && !dir.is_empty()
        {
            config.work_dir = PathBuf::from(dir);
        }

        if let Ok(value) = std::env::var("SWARMFIX_PORT_BASE")
            && let Ok(base) = value.parse::<u16>()
        {
            config.ports.base = base;
        }

        config
    }

    /// Creates a configuration rooted at `work_dir` with short waits.
    ///
    /// Intended for tests driving in-process nodes where engine latency is
    /// negligible.
    pub fn fast(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            events: EventConfig {
                event_timeout: Duration::from_secs(2),
                downloading_timeout: Duration::from_secs(2),
                listen_poll: Duration::from_millis(50),
            },
            services: ServiceConfig {
                startup_grace: Duration::from_millis(10),
                ..ServiceConfig::default()
            },
            ports: PortConfig::default(),
            work_dir: work_dir.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_named_constants() {
        let config = FixtureConfig::default();
        assert_eq!(config.events.event_timeout, Duration::from_secs(10));
        assert_eq!(config.events.downloading_timeout, Duration::from_secs(10));
        assert_eq!(config.services.startup_grace, Duration::from_millis(500));
        assert_eq!(config.ports.base, 2000);
        assert_eq!(config.ports.span, 6000);
        assert_eq!(config.services.proxy_username, "testuser");
    }

    #[test]
    fn test_fast_config_keeps_port_range() {
        let config = FixtureConfig::fast("/tmp/run");
        assert_eq!(config.work_dir, PathBuf::from("/tmp/run"));
        assert!(config.events.event_timeout < DEFAULT_EVENT_TIMEOUT);
        assert_eq!(config.ports.max_probes, DEFAULT_MAX_PORT_PROBES);
    }
}
