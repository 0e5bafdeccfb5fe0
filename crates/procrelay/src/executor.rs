use procrelay_core::{BoxedReader, ProcessHandle, ProcessManager, ProcessPipes, RelayError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of a run-to-completion command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    /// Build a result from raw captured output, decoded lossily and trimmed.
    pub fn from_output(exit_code: i32, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            exit_code,
            stdout: String::from_utf8_lossy(stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Text reported for a failed run
    pub fn error_message(&self) -> String {
        if self.stderr.is_empty() {
            format!("Command exited with code: {}", self.exit_code)
        } else {
            self.stderr.clone()
        }
    }
}

/// Runs a command to completion and captures its output.
///
/// [`cancel`](Executor::cancel) aborts every run in flight and kills its
/// whole process tree; runs submitted afterwards are refused.
pub struct Executor<M: ProcessManager> {
    manager: Arc<M>,
    cancel: CancellationToken,
}

impl<M: ProcessManager> Executor<M> {
    pub fn new(manager: Arc<M>) -> Self {
        Self::with_cancellation(manager, CancellationToken::new())
    }

    /// Executor whose runs end when `cancel` fires
    pub fn with_cancellation(manager: Arc<M>, cancel: CancellationToken) -> Self {
        Self { manager, cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Either a complete [`ExecResult`] or [`RelayError::Execution`].
    ///
    /// Fails with [`RelayError::CarrierClosed`] when the executor was
    /// cancelled before or during the run.
    pub async fn execute(&self, command: &str, sandboxed: bool) -> Result<ExecResult, RelayError> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::CarrierClosed);
        }

        let mut handle = self
            .manager
            .spawn_process(command, sandboxed)
            .await
            .map_err(|e| match e {
                RelayError::Spawn(reason) => RelayError::Execution(reason),
                other => RelayError::Execution(other.to_string()),
            })?;

        let pipes = handle.take_pipes();
        let outcome = tokio::select! {
            result = collect(&mut handle, pipes) => Some(result),
            _ = self.cancel.cancelled() => None,
        };

        match outcome {
            Some(result) => {
                let (exit_code, stdout, stderr) = result?;
                debug!("Command '{}' finished with code {}", command, exit_code);
                Ok(ExecResult::from_output(exit_code, &stdout, &stderr))
            }
            None => {
                info!("Cancelling command '{}'", command);
                let result = self.manager.kill_tree(&mut handle).await;
                debug!("Kill of '{}' finished: {:?}", command, result);
                Err(RelayError::CarrierClosed)
            }
        }
    }
}

async fn collect<H: ProcessHandle>(
    handle: &mut H,
    pipes: ProcessPipes,
) -> Result<(i32, Vec<u8>, Vec<u8>), RelayError> {
    // No interactive input for exec: the child sees end of file.
    drop(pipes.stdin);

    let (stdout, stderr) = tokio::try_join!(read_all(pipes.stdout), read_all(pipes.stderr))?;

    let status = handle
        .wait()
        .await
        .map_err(|e| RelayError::Execution(e.to_string()))?;
    Ok((status.exit_code().unwrap_or(-1), stdout, stderr))
}

async fn read_all(reader: Option<BoxedReader>) -> Result<Vec<u8>, RelayError> {
    let mut buffer = Vec::new();
    if let Some(mut reader) = reader {
        reader
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| RelayError::Execution(format!("Failed to read output: {e}")))?;
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_is_trimmed() {
        let result = ExecResult::from_output(0, b"  hello\n\n", b"\n");
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.stderr, "");
        assert!(result.is_success());
    }

    #[test]
    fn test_error_message() {
        let result = ExecResult::from_output(7, b"", b"");
        assert!(!result.is_success());
        assert_eq!(result.error_message(), "Command exited with code: 7");

        let result = ExecResult::from_output(2, b"", b"ls: missing\n");
        assert_eq!(result.error_message(), "ls: missing");
    }

    #[test]
    fn test_serializes_camel_case() {
        let result = ExecResult::from_output(1, b"out", b"err");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"exitCode": 1, "stdout": "out", "stderr": "err"})
        );
    }
}
