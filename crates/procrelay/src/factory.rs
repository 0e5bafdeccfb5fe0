use procrelay_core::{ProcessManagerFactory, RunnerConfig};

/// Process manager of the platform this crate was built for
#[cfg(unix)]
pub type PlatformManager = procrelay_unix::UnixProcessManager;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    type Manager = PlatformManager;

    fn create_process_manager(config: &RunnerConfig) -> Self::Manager {
        #[cfg(unix)]
        return procrelay_unix::UnixProcessManagerFactory::create_process_manager(config);
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return procrelay_unix::UnixProcessManagerFactory::platform_name();
    }
}
