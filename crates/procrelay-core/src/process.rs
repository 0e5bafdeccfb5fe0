use crate::config::RunnerConfig;
use crate::error::RelayError;
use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

/// Native identifier of a process, captured at spawn time
pub type ProcessId = u32;

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Status of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Process is currently running
    Running,
    /// Process exited normally with the given exit code
    Exited(i32),
    /// Process was terminated by the given signal
    Signaled(i32),
}

impl ProcessStatus {
    /// Exit code as a shell would report it: `128 + signal` for signal deaths.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessStatus::Running => None,
            ProcessStatus::Exited(code) => Some(*code),
            ProcessStatus::Signaled(signal) => Some(128 + signal),
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    PermissionDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// The standard streams of a freshly spawned process.
///
/// Each pipe can be taken exactly once.
#[derive(Default)]
pub struct ProcessPipes {
    pub stdin: Option<BoxedWriter>,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
}

/// Trait representing a handle to a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None once the process has been reaped)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Get the command string passed to the shell
    fn get_command(&self) -> &str;

    /// Whether the command was routed through the sandbox bootstrap
    fn is_sandboxed(&self) -> bool;

    /// Take ownership of the standard streams
    fn take_pipes(&mut self) -> ProcessPipes;

    /// Try to get exit status without blocking
    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ProcessStatus>;

    /// Destroy the process directly (platform-specific implementation)
    async fn kill(&mut self) -> Result<()>;
}

/// Creates shell processes from command strings
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// The type of process handle this spawner produces
    type Handle: ProcessHandle + 'static;

    /// Start `command` through the configured shell, optionally sourcing the
    /// sandbox bootstrap first.
    ///
    /// Fails with [`RelayError::Spawn`] when the shell is unavailable or the
    /// OS refuses to create the process. Never retried.
    async fn spawn_process(&self, command: &str, sandboxed: bool) -> Result<Self::Handle, RelayError>;
}

/// Trait for termination of processes including their descendants
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Find all descendants of a process, deepest first
    async fn find_descendants(&self, pid: ProcessId) -> Vec<ProcessId>;

    /// Forcefully kill the process group led by `pid`
    async fn terminate_process_group(&self, pid: ProcessId) -> TerminationResult;

    /// Forcefully kill a single process
    async fn force_kill_pid(&self, pid: ProcessId) -> TerminationResult;

    /// Best-effort kill of a process and its tree.
    ///
    /// Group kill first, then any descendant that left the group, then the
    /// handle's direct destroy, which always runs. Failures are logged and
    /// reported in the returned value only.
    async fn kill_tree(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        let mut result = TerminationResult::ProcessNotFound;

        if let Some(pid) = handle.get_pid() {
            // Snapshot before the group dies and its members get reparented.
            let descendants = self.find_descendants(pid).await;

            result = self.terminate_process_group(pid).await;
            if !matches!(result, TerminationResult::Success) {
                warn!("Group kill for process {} reported {:?}", pid, result);
            }

            for descendant in descendants {
                match self.force_kill_pid(descendant).await {
                    TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                    other => warn!("Failed to kill descendant {}: {:?}", descendant, other),
                }
            }
        }

        if let Err(e) = handle.kill().await {
            warn!("Direct destroy of '{}' failed: {}", handle.get_command(), e);
        }

        result
    }
}

/// Platform process manager combining spawning and termination
pub trait ProcessManager: ProcessSpawner + ProcessTermination {
    /// Create a new process manager instance for the given configuration
    fn new(config: &RunnerConfig) -> Self
    where
        Self: Sized;

    fn config(&self) -> &RunnerConfig;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager + 'static;

    /// Create a process manager for the current platform
    fn create_process_manager(config: &RunnerConfig) -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(ProcessStatus::Running.exit_code(), None);
        assert_eq!(ProcessStatus::Exited(7).exit_code(), Some(7));
        assert_eq!(ProcessStatus::Signaled(9).exit_code(), Some(137));
    }

    struct FakeHandle {
        pid: Option<ProcessId>,
        killed: bool,
    }

    #[async_trait]
    impl ProcessHandle for FakeHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            self.pid
        }
        fn get_command(&self) -> &str {
            "fake"
        }
        fn is_sandboxed(&self) -> bool {
            false
        }
        fn take_pipes(&mut self) -> ProcessPipes {
            ProcessPipes::default()
        }
        async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
            Ok(None)
        }
        async fn wait(&mut self) -> Result<ProcessStatus> {
            Ok(ProcessStatus::Exited(0))
        }
        async fn kill(&mut self) -> Result<()> {
            self.killed = true;
            Err(anyhow::anyhow!("already gone"))
        }
    }

    #[derive(Default)]
    struct RecordingTerminator {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProcessTermination for RecordingTerminator {
        async fn find_descendants(&self, pid: ProcessId) -> Vec<ProcessId> {
            self.calls.lock().unwrap().push(format!("find {pid}"));
            vec![pid + 2, pid + 1]
        }
        async fn terminate_process_group(&self, pid: ProcessId) -> TerminationResult {
            self.calls.lock().unwrap().push(format!("group {pid}"));
            TerminationResult::Failed("EPERM".to_string())
        }
        async fn force_kill_pid(&self, pid: ProcessId) -> TerminationResult {
            self.calls.lock().unwrap().push(format!("kill {pid}"));
            TerminationResult::ProcessNotFound
        }
    }

    #[tokio::test]
    async fn test_kill_tree_always_destroys_handle() {
        let terminator = RecordingTerminator::default();
        let mut handle = FakeHandle {
            pid: Some(10),
            killed: false,
        };

        let result = terminator.kill_tree(&mut handle).await;

        assert!(handle.killed);
        assert_eq!(result, TerminationResult::Failed("EPERM".to_string()));
        assert_eq!(
            *terminator.calls.lock().unwrap(),
            vec!["find 10", "group 10", "kill 12", "kill 11"]
        );
    }

    #[tokio::test]
    async fn test_kill_tree_without_pid() {
        let terminator = RecordingTerminator::default();
        let mut handle = FakeHandle {
            pid: None,
            killed: false,
        };

        let result = terminator.kill_tree(&mut handle).await;

        assert!(handle.killed);
        assert_eq!(result, TerminationResult::ProcessNotFound);
        assert!(terminator.calls.lock().unwrap().is_empty());
    }
}
