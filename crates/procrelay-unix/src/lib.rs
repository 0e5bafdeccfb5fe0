//! Unix process manager: `sh -c` spawning inside a dedicated process group and
//! process-tree termination through `killpg` plus a descendant sweep.

#[cfg(unix)]
mod unix_process_manager;

#[cfg(unix)]
pub use unix_process_manager::{UnixProcessHandle, UnixProcessManager};

#[cfg(unix)]
pub struct UnixProcessManagerFactory;

#[cfg(unix)]
impl procrelay_core::ProcessManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;

    fn create_process_manager(config: &procrelay_core::RunnerConfig) -> UnixProcessManager {
        <UnixProcessManager as procrelay_core::ProcessManager>::new(config)
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
