use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use procrelay_core::{
    BoxedReader, BoxedWriter, ProcessEnvironment, ProcessHandle, ProcessId, ProcessManager,
    ProcessPipes, ProcessSpawner, ProcessStatus, ProcessTermination, RelayError, RunnerConfig,
    TerminationResult,
};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use sysinfo::System;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Unix-specific process handle implementation
pub struct UnixProcessHandle {
    child: Child,
    pid: Option<ProcessId>,
    command: String,
    sandboxed: bool,
}

impl UnixProcessHandle {
    pub fn new(child: Child, command: String, sandboxed: bool) -> Self {
        // The pid is captured once, here; it doubles as the process group id.
        let pid = child.id();
        Self {
            child,
            pid,
            command,
            sandboxed,
        }
    }

    fn record_exit(&mut self, status: ExitStatus) -> ProcessStatus {
        // A reaped pid may be recycled, never signal it again.
        self.pid = None;
        to_process_status(status)
    }
}

fn to_process_status(status: ExitStatus) -> ProcessStatus {
    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessStatus::Exited(code),
        (None, Some(signal)) => ProcessStatus::Signaled(signal),
        (None, None) => ProcessStatus::Exited(-1),
    }
}

#[async_trait]
impl ProcessHandle for UnixProcessHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        self.pid
    }

    fn get_command(&self) -> &str {
        &self.command
    }

    fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    fn take_pipes(&mut self) -> ProcessPipes {
        ProcessPipes {
            stdin: self
                .child
                .stdin
                .take()
                .map(|stdin| Box::new(stdin) as BoxedWriter),
            stdout: self
                .child
                .stdout
                .take()
                .map(|stdout| Box::new(stdout) as BoxedReader),
            stderr: self
                .child
                .stderr
                .take()
                .map(|stderr| Box::new(stderr) as BoxedReader),
        }
    }

    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(self.record_exit(status))),
            None => Ok(None),
        }
    }

    async fn wait(&mut self) -> Result<ProcessStatus> {
        let status = self.child.wait().await?;
        Ok(self.record_exit(status))
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to kill process: {}", e))?;
        self.pid = None;
        Ok(())
    }
}

/// Unix-specific process manager with process tree management
pub struct UnixProcessManager {
    config: RunnerConfig,
    environment: ProcessEnvironment,
    system: Mutex<System>,
}

impl UnixProcessManager {
    /// Program and arguments used to run `command`
    pub fn shell_invocation(&self, command: &str, sandboxed: bool) -> (String, Vec<String>) {
        let script = if sandboxed {
            format!(
                "source {} {}",
                self.config.sandbox_script_path().display(),
                command
            )
        } else {
            command.to_string()
        };

        (self.config.shell.clone(), vec!["-c".to_string(), script])
    }

    pub fn environment(&self) -> &ProcessEnvironment {
        &self.environment
    }

    fn build_command(&self, command: &str, sandboxed: bool) -> Command {
        let (program, args) = self.shell_invocation(command, sandboxed);
        let mut cmd = Command::new(program);
        cmd.args(args);

        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }

        cmd.envs(self.environment.iter());

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so the whole tree can be signalled at once.
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        cmd
    }

    fn spawn_child(&self, command: &str, sandboxed: bool) -> Result<Child> {
        self.build_command(command, sandboxed)
            .spawn()
            .with_context(|| format!("Failed to start shell '{}'", self.config.shell))
    }

    /// Recursively find all child processes
    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            #[allow(clippy::collapsible_if)]
            if let Some(ppid) = process.parent() {
                if ppid.as_u32() == parent_pid {
                    let child_pid = pid.as_u32();
                    // Recursively find grandchildren first
                    Self::find_children_recursive(system, child_pid, result);
                    // Then add this child
                    result.push(child_pid);
                }
            }
        }
    }
}

#[async_trait]
impl ProcessSpawner for UnixProcessManager {
    type Handle = UnixProcessHandle;

    async fn spawn_process(
        &self,
        command: &str,
        sandboxed: bool,
    ) -> Result<UnixProcessHandle, RelayError> {
        let child = self
            .spawn_child(command, sandboxed)
            .map_err(|e| RelayError::Spawn(format!("{e:#}")))?;

        let handle = UnixProcessHandle::new(child, command.to_string(), sandboxed);
        info!(
            "Spawned Unix process (PID: {:?}, sandboxed: {}): {}",
            handle.get_pid(),
            sandboxed,
            command
        );

        Ok(handle)
    }
}

fn signal_result(target: &str, pid: ProcessId, result: nix::Result<()>) -> TerminationResult {
    match result {
        Ok(()) => {
            debug!("Sent SIGKILL to {} {}", target, pid);
            TerminationResult::Success
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!("{} {} not found (already terminated)", target, pid);
            TerminationResult::ProcessNotFound
        }
        Err(nix::errno::Errno::EPERM) => {
            warn!("Permission denied to kill {} {}", target, pid);
            TerminationResult::PermissionDenied
        }
        Err(e) => {
            warn!("Failed to send SIGKILL to {} {}: {}", target, pid, e);
            TerminationResult::Failed(format!("SIGKILL failed: {e}"))
        }
    }
}

#[async_trait]
impl ProcessTermination for UnixProcessManager {
    async fn find_descendants(&self, pid: ProcessId) -> Vec<ProcessId> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::default(),
        );

        let mut descendants = Vec::new();
        Self::find_children_recursive(&system, pid, &mut descendants);
        descendants
    }

    async fn terminate_process_group(&self, pid: ProcessId) -> TerminationResult {
        let pgid = NixPid::from_raw(pid as i32);
        signal_result("process group", pid, signal::killpg(pgid, Signal::SIGKILL))
    }

    async fn force_kill_pid(&self, pid: ProcessId) -> TerminationResult {
        let nix_pid = NixPid::from_raw(pid as i32);
        signal_result("process", pid, signal::kill(nix_pid, Signal::SIGKILL))
    }
}

impl ProcessManager for UnixProcessManager {
    fn new(config: &RunnerConfig) -> Self {
        info!("Initializing Unix process manager with system monitoring");
        Self {
            environment: ProcessEnvironment::from_config(config),
            config: config.clone(),
            system: Mutex::new(System::new()),
        }
    }

    fn config(&self) -> &RunnerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn test_config() -> RunnerConfig {
        RunnerConfig::builder()
            .files_dir("/tmp/procrelay-files")
            .native_lib_dir("/tmp/procrelay-lib")
            .timezone("Etc/UTC")
            .build()
            .unwrap()
    }

    async fn read_all(reader: Option<BoxedReader>) -> String {
        let mut text = String::new();
        reader
            .unwrap()
            .read_to_string(&mut text)
            .await
            .unwrap();
        text
    }

    fn is_gone(system: &mut System, pid: ProcessId) -> bool {
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::default(),
        );
        match system.process(sysinfo::Pid::from_u32(pid)) {
            None => true,
            Some(process) => process.status() == sysinfo::ProcessStatus::Zombie,
        }
    }

    #[test]
    fn test_shell_invocation() {
        let manager = UnixProcessManager::new(&test_config());

        let (program, args) = manager.shell_invocation("ls -al", false);
        assert_eq!(program, "sh");
        assert_eq!(args, vec!["-c", "ls -al"]);

        let (_, args) = manager.shell_invocation("apk add git", true);
        assert_eq!(
            args,
            vec!["-c", "source /tmp/procrelay-files/init-sandbox.sh apk add git"]
        );
    }

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let manager = UnixProcessManager::new(&test_config());
        let mut handle = manager.spawn_process("echo hello", false).await.unwrap();
        assert!(handle.get_pid().is_some());
        assert!(!handle.is_sandboxed());

        let pipes = handle.take_pipes();
        assert!(pipes.stdin.is_some());
        assert_eq!(read_all(pipes.stdout).await, "hello\n");

        let status = handle.wait().await.unwrap();
        assert_eq!(status, ProcessStatus::Exited(0));
        assert!(handle.get_pid().is_none());
    }

    #[tokio::test]
    async fn test_environment_is_injected() {
        let manager = UnixProcessManager::new(&test_config());
        let mut handle = manager
            .spawn_process("printf '%s|%s|%s' \"$PREFIX\" \"$ANDROID_TZ\" \"$FDROID\"", false)
            .await
            .unwrap();

        let pipes = handle.take_pipes();
        assert_eq!(
            read_all(pipes.stdout).await,
            "/tmp/procrelay-files|Etc/UTC|false"
        );
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_shell_is_spawn_error() {
        let mut config = test_config();
        config.shell = "/nonexistent/bin/sh".to_string();
        let manager = UnixProcessManager::new(&config);

        let result = manager.spawn_process("true", false).await;
        assert!(matches!(result, Err(RelayError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_exit_code() {
        let manager = UnixProcessManager::new(&test_config());
        let mut handle = manager.spawn_process("exit 7", false).await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), ProcessStatus::Exited(7));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kill_tree_kills_descendants() {
        let manager = UnixProcessManager::new(&test_config());
        let mut handle = manager
            .spawn_process("sleep 30 & sleep 30 & wait", false)
            .await
            .unwrap();
        let pid = handle.get_pid().unwrap();

        let mut descendants = Vec::new();
        for _ in 0..50 {
            descendants = manager.find_descendants(pid).await;
            if descendants.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(descendants.len() >= 2, "children never appeared");

        manager.kill_tree(&mut handle).await;

        let status = handle.wait().await.unwrap();
        assert_eq!(status, ProcessStatus::Signaled(9));
        assert_eq!(status.exit_code(), Some(137));

        let mut system = System::new();
        let mut all_gone = false;
        for _ in 0..50 {
            all_gone = descendants.iter().all(|pid| is_gone(&mut system, *pid));
            if all_gone {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(all_gone, "descendants survived kill_tree");
    }

    #[tokio::test]
    async fn test_kill_tree_after_exit_is_harmless() {
        let manager = UnixProcessManager::new(&test_config());
        let mut handle = manager.spawn_process("true", false).await.unwrap();
        handle.wait().await.unwrap();

        let result = manager.kill_tree(&mut handle).await;
        assert_eq!(result, TerminationResult::ProcessNotFound);
    }
}
