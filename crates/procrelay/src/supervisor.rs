use crate::gate::{Delivery, EventGate};
use crate::registry::{PendingWrite, ProcessEntry, ProcessRegistry};
use procrelay_core::relay::stream_output;
use procrelay_core::{
    BoxedReader, EventSink, ProcessEvent, ProcessHandle, ProcessManager, RelayError,
};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long the exit-wait lets the relays flush once the child is gone
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Liveness of a process id as answered to `isRunning`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited,
    NotFound,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Running => "running",
            ProcessState::Exited => "exited",
            ProcessState::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs long-lived processes and streams their output to a sink.
///
/// Each process gets two relay tasks (stdout, stderr), one stdin writer task
/// and one exit-wait task, all on the supervisor's tracker.
pub struct Supervisor<M: ProcessManager + 'static> {
    manager: Arc<M>,
    registry: Arc<ProcessRegistry>,
    tracker: TaskTracker,
    drain_timeout: Duration,
}

impl<M: ProcessManager + 'static> Supervisor<M> {
    pub fn new(manager: Arc<M>, drain_timeout: Duration) -> Self {
        Self {
            manager,
            registry: Arc::new(ProcessRegistry::new()),
            tracker: TaskTracker::new(),
            drain_timeout,
        }
    }

    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Spawn `command` and start relaying its events to `sink`.
    ///
    /// Returns the process id, generated when `id` is `None`. A spawn failure
    /// is delivered to the sink as an `Error` event and also returned.
    pub async fn start(
        &self,
        id: Option<String>,
        command: &str,
        sandboxed: bool,
        sink: Arc<dyn EventSink>,
    ) -> Result<String, RelayError> {
        if self.tracker.is_closed() {
            return Err(RelayError::CarrierClosed);
        }

        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.registry.contains(&id) {
            return Err(RelayError::AlreadyExists(id));
        }

        let gate = Arc::new(EventGate::new(id.clone(), sink));
        let mut handle = match self.manager.spawn_process(command, sandboxed).await {
            Ok(handle) => handle,
            Err(e) => {
                let reason = match &e {
                    RelayError::Spawn(reason) => reason.clone(),
                    other => other.to_string(),
                };
                warn!("Failed to start process {}: {}", id, reason);
                gate.finish(ProcessEvent::Error(format!(
                    "Failed to start process: {reason}"
                )));
                return Err(e);
            }
        };

        let pipes = handle.take_pipes();
        let (entry, pump) = ProcessEntry::new(
            command,
            sandboxed,
            handle.get_pid(),
            pipes.stdin,
            gate,
        );

        let entry = match self.registry.put(entry) {
            Ok(entry) => entry,
            Err(e) => {
                self.manager.kill_tree(&mut handle).await;
                return Err(e);
            }
        };

        if self.tracker.is_closed() {
            self.registry.remove_entry(&entry);
            self.manager.kill_tree(&mut handle).await;
            return Err(RelayError::CarrierClosed);
        }

        info!(
            "Started process {} (PID: {:?}): {}",
            id,
            entry.pid(),
            command
        );

        if let Some(pump) = pump {
            self.tracker.spawn(pump.run());
        }

        let relays = [
            pipes.stdout.map(|reader| self.spawn_relay(reader, &entry, ProcessEvent::Stdout)),
            pipes.stderr.map(|reader| self.spawn_relay(reader, &entry, ProcessEvent::Stderr)),
        ]
        .into_iter()
        .flatten()
        .collect();

        self.tracker.spawn(supervise_exit(
            self.manager.clone(),
            handle,
            entry,
            self.registry.clone(),
            relays,
            self.drain_timeout,
        ));

        Ok(id)
    }

    fn spawn_relay(
        &self,
        reader: BoxedReader,
        entry: &Arc<ProcessEntry>,
        wrap: fn(String) -> ProcessEvent,
    ) -> JoinHandle<()> {
        let entry = entry.clone();
        let registry = self.registry.clone();

        self.tracker.spawn(async move {
            stream_output(reader, |line| match entry.gate().deliver(wrap(line)) {
                Delivery::Delivered => ControlFlow::Continue(()),
                Delivery::Closed => ControlFlow::Break(()),
                Delivery::SinkGone => {
                    abandon(&registry, &entry);
                    ControlFlow::Break(())
                }
            })
            .await;
        })
    }

    /// Queue `text` for the stdin of `id` without waiting for the write.
    pub fn enqueue_write(&self, id: &str, text: &str) -> Result<PendingWrite, RelayError> {
        self.registry.get(id)?.submit(text)
    }

    /// Write one line to the stdin of `id`.
    pub async fn write(&self, id: &str, text: &str) -> Result<(), RelayError> {
        self.enqueue_write(id, text)?
            .await
            .map_err(|_| RelayError::Write("stdin is closed".to_string()))?
    }

    /// Stop `id` and its process tree. Returns before the kill completes.
    pub fn stop(&self, id: &str) -> Result<(), RelayError> {
        let entry = self.registry.get(id)?;
        self.registry.remove_entry(&entry);
        entry.gate().close();
        entry.mark_killed();
        entry.kill_token().cancel();
        info!("Stop requested for process {}", id);
        Ok(())
    }

    /// Liveness of `id`; an exited process is cleaned up by the query.
    pub fn status(&self, id: &str) -> ProcessState {
        match self.registry.get(id) {
            Err(_) => ProcessState::NotFound,
            Ok(entry) if entry.is_running() => ProcessState::Running,
            Ok(entry) => {
                self.registry.remove_entry(&entry);
                ProcessState::Exited
            }
        }
    }

    /// Kill every tracked process and wait for all supervision tasks.
    pub async fn shutdown(&self) {
        self.tracker.close();

        let entries = self.registry.drain();
        if !entries.is_empty() {
            info!("Killing {} tracked processes", entries.len());
        }
        for entry in entries {
            entry.gate().close();
            entry.mark_killed();
            entry.kill_token().cancel();
        }

        self.tracker.wait().await;
        debug!("Supervisor shut down");
    }
}

/// The client behind a process is gone: forget it and kill its tree.
fn abandon(registry: &ProcessRegistry, entry: &ProcessEntry) {
    registry.remove_entry(entry);
    entry.gate().close();
    entry.mark_killed();
    entry.kill_token().cancel();
}

async fn supervise_exit<M: ProcessManager + 'static>(
    manager: Arc<M>,
    mut handle: M::Handle,
    entry: Arc<ProcessEntry>,
    registry: Arc<ProcessRegistry>,
    relays: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
) {
    let outcome = tokio::select! {
        status = handle.wait() => Some(status),
        _ = entry.kill_token().cancelled() => None,
    };

    match outcome {
        Some(Ok(status)) => {
            let code = status.exit_code().unwrap_or(-1);
            entry.mark_exited();
            drain_relays(entry.id(), relays, drain_timeout).await;
            if entry.gate().finish(ProcessEvent::Exit(code)) == Delivery::Delivered {
                info!("Process {} exited with code {}", entry.id(), code);
            }
        }
        Some(Err(e)) => {
            error!("Failed to wait for process {}: {}", entry.id(), e);
            entry.mark_exited();
            for relay in relays {
                relay.abort();
            }
            entry
                .gate()
                .finish(ProcessEvent::Error(format!("Failed to wait for process: {e}")));
            manager.kill_tree(&mut handle).await;
        }
        None => {
            info!("Killing process tree of {}", entry.id());
            let result = manager.kill_tree(&mut handle).await;
            debug!("Kill of {} finished: {:?}", entry.id(), result);
            for relay in relays {
                relay.abort();
            }
        }
    }

    registry.remove_entry(&entry);
}

async fn drain_relays(id: &str, relays: Vec<JoinHandle<()>>, timeout: Duration) {
    let aborts: Vec<_> = relays.iter().map(JoinHandle::abort_handle).collect();
    let drained = tokio::time::timeout(timeout, async move {
        for relay in relays {
            let _ = relay.await;
        }
    })
    .await;

    if drained.is_err() {
        // A background grandchild still holds the pipes open.
        warn!("Output of process {} still open after exit, detaching", id);
        for abort in aborts {
            abort.abort();
        }
    }
}
