//! Spawning and killing helper processes

use std::fmt;
use std::process::Stdio;

use tokio::process::{Child, Command};

use super::ServiceError;

/// Program and arguments of a helper process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Handle to a spawned helper.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    child: Option<Child>,
}

impl ProcessHandle {
    /// Handle without an owned child, used by launchers that only record.
    pub fn new(pid: Option<u32>) -> Self {
        Self { pid, child: None }
    }

    pub fn from_child(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }
}

/// Spawns helper processes and terminates them.
///
/// Termination is best effort: implementations must not wait for the
/// process to exit.
pub trait ProcessLauncher: Send + Sync {
    /// Starts a detached process.
    ///
    /// # Errors
    ///
    /// - `ServiceError::SpawnFailed` - Program missing or exec failed
    fn spawn(&self, command: &CommandLine) -> Result<ProcessHandle, ServiceError>;

    /// Force-terminates a process without confirming its exit.
    fn kill(&self, handle: &mut ProcessHandle);
}

/// Launcher running real operating system processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn spawn(&self, command: &CommandLine) -> Result<ProcessHandle, ServiceError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);

        let child = cmd.spawn().map_err(|e| ServiceError::SpawnFailed {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!("Spawned pid {:?}: {}", child.id(), command);
        Ok(ProcessHandle::from_child(child))
    }

    fn kill(&self, handle: &mut ProcessHandle) {
        let pid = handle.pid();
        match handle.child_mut() {
            Some(child) => {
                tracing::info!("Killing pid {:?}", pid);
                if let Err(e) = child.start_kill() {
                    tracing::warn!("Failed to kill pid {:?}: {}", pid, e);
                }
            }
            None => tracing::debug!("No child process to kill for pid {:?}", pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_display() {
        let command = CommandLine::new("python")
            .arg("../socks.py")
            .arg("--port")
            .arg("2001");
        assert_eq!(command.to_string(), "python ../socks.py --port 2001");
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let command = CommandLine::new("swarmfix-definitely-missing-helper");
        let result = SystemLauncher.spawn(&command);
        assert!(matches!(result, Err(ServiceError::SpawnFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_kill_real_process() {
        let command = CommandLine::new("sleep").arg("30");
        let mut handle = SystemLauncher.spawn(&command).unwrap();
        assert!(handle.pid().is_some());

        SystemLauncher.kill(&mut handle);
        let status = handle.child_mut().unwrap().wait().await.unwrap();
        assert!(!status.success());
    }
}
