//! procrelay core - platform-independent abstractions and configurations
//!
//! This crate provides the process traits, configuration, error types, event
//! plumbing and line relay that are shared by the platform-specific process
//! managers and the supervisor built on top of them.

pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod process;
pub mod relay;
pub mod storage;

pub use config::*;
pub use environment::ProcessEnvironment;
pub use error::*;
pub use events::*;
pub use process::*;
pub use storage::{KeyValueStore, MemoryStore};
