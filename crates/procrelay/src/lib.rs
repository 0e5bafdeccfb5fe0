//! procrelay - process supervision and streaming execution
//!
//! Spawns shell commands as child processes, relays their output line by
//! line, accepts interactive input, runs commands to completion, and kills
//! whole process trees. [`ProcessRelay`] is the in-process command surface;
//! [`carrier`] hosts the same engine behind an address-routed message
//! protocol.

#[cfg(not(unix))]
compile_error!("Unsupported platform: only Unix is currently supported");

pub mod carrier;
pub mod config;
pub mod executor;
pub mod factory;
pub mod gate;
pub mod logging;
pub mod registry;
pub mod supervisor;

pub use carrier::{Carrier, CarrierHandle, CarrierMessage, ClientAddress};
pub use config::CarrierConfig;
pub use executor::{ExecResult, Executor};
pub use factory::{PlatformManager, PlatformProcessManagerFactory};
pub use registry::ProcessRegistry;
pub use supervisor::{ProcessState, Supervisor};

// Re-export core functionality
pub use procrelay_core::*;

use std::sync::Arc;
use std::time::Duration;

/// The command surface: start, write, stop, exec and isRunning over one
/// process manager.
pub struct ProcessRelay<M: ProcessManager + 'static = PlatformManager> {
    supervisor: Supervisor<M>,
    executor: Executor<M>,
}

impl ProcessRelay<PlatformManager> {
    /// Relay on the platform process manager
    pub fn new(config: &RunnerConfig) -> Self {
        let manager = PlatformProcessManagerFactory::create_process_manager(config);
        Self::with_manager(Arc::new(manager), supervisor::DEFAULT_DRAIN_TIMEOUT)
    }
}

impl<M: ProcessManager + 'static> ProcessRelay<M> {
    pub fn with_manager(manager: Arc<M>, drain_timeout: Duration) -> Self {
        Self {
            supervisor: Supervisor::new(manager.clone(), drain_timeout),
            executor: Executor::new(manager),
        }
    }

    pub fn supervisor(&self) -> &Supervisor<M> {
        &self.supervisor
    }

    /// Start `command`; events for the returned id go to `sink`.
    pub async fn start(
        &self,
        id: Option<String>,
        command: &str,
        sandboxed: bool,
        sink: Arc<dyn EventSink>,
    ) -> Result<String, RelayError> {
        self.supervisor.start(id, command, sandboxed, sink).await
    }

    pub async fn write(&self, id: &str, text: &str) -> Result<(), RelayError> {
        self.supervisor.write(id, text).await
    }

    pub fn stop(&self, id: &str) -> Result<(), RelayError> {
        self.supervisor.stop(id)
    }

    pub async fn exec(&self, command: &str, sandboxed: bool) -> Result<ExecResult, RelayError> {
        self.executor.execute(command, sandboxed).await
    }

    pub fn is_running(&self, id: &str) -> ProcessState {
        self.supervisor.status(id)
    }

    /// Kill every tracked process and in-flight exec, then wait for their
    /// supervision to end.
    pub async fn shutdown(&self) {
        self.executor.cancel();
        self.supervisor.shutdown().await;
    }
}
