use procrelay::{
    ExecResult, Executor, PlatformProcessManagerFactory, ProcessManagerFactory, ProcessRelay,
    RelayError, RunnerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::time::timeout;

fn test_config() -> RunnerConfig {
    RunnerConfig::builder()
        .files_dir(std::env::temp_dir())
        .native_lib_dir(std::env::temp_dir())
        .timezone("UTC")
        .build()
        .unwrap()
}

fn relay() -> ProcessRelay {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    ProcessRelay::new(&test_config())
}

/// Live (non-zombie) processes whose full command line is `command_line`
fn live_processes(system: &mut System, command_line: &str) -> usize {
    system.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::All,
        true,
        sysinfo::ProcessRefreshKind::everything(),
    );
    system
        .processes()
        .values()
        .filter(|process| process.status() != sysinfo::ProcessStatus::Zombie)
        .filter(|process| {
            let args: Vec<_> = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            args.join(" ") == command_line
        })
        .count()
}

#[tokio::test]
async fn test_exec_true() {
    let result = relay().exec("true", false).await.unwrap();
    assert_eq!(
        result,
        ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    );
    assert!(result.is_success());
}

#[tokio::test]
async fn test_exec_exit_code() {
    let result = relay().exec("exit 7", false).await.unwrap();
    assert!(!result.is_success());
    assert_eq!(result.exit_code, 7);
    assert_eq!(result.error_message(), "Command exited with code: 7");
}

#[tokio::test]
async fn test_exec_captures_both_streams() {
    let result = relay()
        .exec("echo out; echo err >&2; exit 2", false)
        .await
        .unwrap();
    assert_eq!(result.stdout, "out");
    assert_eq!(result.stderr, "err");
    assert_eq!(result.error_message(), "err");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exec_large_output_on_both_pipes() {
    // stderr fills first; a sequential reader would deadlock here.
    let result = relay()
        .exec("seq 1 50000 >&2; seq 1 50000", false)
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.stdout.lines().count(), 50000);
    assert_eq!(result.stderr.lines().count(), 50000);
    assert!(result.stdout.ends_with("50000"));
}

#[tokio::test]
async fn test_exec_sees_injected_environment() {
    let result = relay()
        .exec("printf '%s %s' \"$ANDROID_TZ\" \"$FDROID\"", false)
        .await
        .unwrap();
    assert_eq!(result.stdout, "UTC false");
}

#[tokio::test]
async fn test_exec_stdin_is_closed() {
    let result = relay().exec("cat", false).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.stdout, "");
}

#[tokio::test]
async fn test_exec_spawn_failure_is_execution_error() {
    let mut config = test_config();
    config.shell = "/nonexistent/bin/sh".to_string();
    let relay = ProcessRelay::new(&config);

    let result = relay.exec("true", false).await;
    assert!(matches!(result, Err(RelayError::Execution(_))));
}

#[tokio::test]
async fn test_exec_sandboxed_sources_bootstrap() {
    if !PathBuf::from("/bin/bash").exists() {
        return;
    }

    let files_dir = std::env::temp_dir().join(format!("procrelay-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&files_dir).unwrap();
    std::fs::write(
        files_dir.join("init-sandbox.sh"),
        "export SANDBOX_MARK=sourced\n\"$@\"\n",
    )
    .unwrap();

    let config = RunnerConfig::builder()
        .shell("/bin/bash")
        .files_dir(files_dir.clone())
        .native_lib_dir(files_dir.clone())
        .timezone("UTC")
        .build()
        .unwrap();
    let relay = ProcessRelay::new(&config);

    let sandboxed = relay.exec("printenv SANDBOX_MARK", true).await.unwrap();
    assert_eq!(sandboxed.stdout, "sourced");

    let direct = relay.exec("printenv SANDBOX_MARK", false).await.unwrap();
    assert_eq!(direct.exit_code, 1);

    std::fs::remove_dir_all(files_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_kills_running_tree() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let manager = Arc::new(PlatformProcessManagerFactory::create_process_manager(
        &test_config(),
    ));
    let executor = Arc::new(Executor::new(manager));
    let mut system = System::new();

    let run = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute("sleep 3219 & wait", false).await }
    });

    let mut started = false;
    for _ in 0..200 {
        if live_processes(&mut system, "sleep 3219") > 0 {
            started = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(started, "child never appeared");

    executor.cancel();
    let result = timeout(Duration::from_secs(10), run)
        .await
        .expect("cancelled exec hung")
        .unwrap();
    assert!(matches!(result, Err(RelayError::CarrierClosed)));

    let mut gone = false;
    for _ in 0..100 {
        if live_processes(&mut system, "sleep 3219") == 0 {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "child survived cancellation");

    let late = executor.execute("true", false).await;
    assert!(matches!(late, Err(RelayError::CarrierClosed)));
}
