use thiserror::Error;

/// Error types for process relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Process already exists: {0}")]
    AlreadyExists(String),

    #[error("Process is not writable: {0}")]
    NotWritable(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Carrier is not running")]
    CarrierClosed,

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    pub fn process_not_found(id: impl Into<String>) -> Self {
        RelayError::ProcessNotFound(id.into())
    }

    /// True when the operation referenced an id that is not tracked.
    ///
    /// Callers report this as a normal result rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RelayError::ProcessNotFound(_))
    }

    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, RelayError::Spawn(_))
    }
}
