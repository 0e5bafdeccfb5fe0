use derive_builder::Builder;
use procrelay_core::{RelayError, RunnerConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const PREFIX_ENV: &str = "PROCRELAY_PREFIX";
pub const NATIVE_DIR_ENV: &str = "PROCRELAY_NATIVE_DIR";
pub const SHELL_ENV: &str = "PROCRELAY_SHELL";
pub const SANDBOX_SCRIPT_ENV: &str = "PROCRELAY_SANDBOX_SCRIPT";
pub const TIMEZONE_ENV: &str = "PROCRELAY_TZ";
pub const TARGET_API_ENV: &str = "PROCRELAY_TARGET_API";
pub const FOREGROUND_ENV: &str = "PROCRELAY_FOREGROUND";
pub const DRAIN_TIMEOUT_ENV: &str = "PROCRELAY_DRAIN_TIMEOUT_MS";

pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_WAKE_LOCK_TAG: &str = "procrelay:carrier";

/// Configuration of a carrier instance
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
#[serde(rename_all = "camelCase")]
pub struct CarrierConfig {
    pub runner: RunnerConfig,

    /// Show the foreground indicator at startup unless a stored preference says otherwise
    #[builder(default = "true")]
    #[serde(default = "default_foreground")]
    pub foreground_by_default: bool,

    /// Bounded wait for output to flush after a child exits
    #[builder(default = "DEFAULT_DRAIN_TIMEOUT_MS")]
    #[serde(default = "default_drain_timeout_ms")]
    pub exit_drain_timeout_ms: u64,

    #[builder(default = "DEFAULT_WAKE_LOCK_TAG.to_string()")]
    #[serde(default = "default_wake_lock_tag")]
    pub wake_lock_tag: String,
}

fn default_foreground() -> bool {
    true
}

fn default_drain_timeout_ms() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_MS
}

fn default_wake_lock_tag() -> String {
    DEFAULT_WAKE_LOCK_TAG.to_string()
}

impl CarrierConfig {
    pub fn builder() -> CarrierConfigBuilder {
        CarrierConfigBuilder::default()
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_drain_timeout_ms)
    }

    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name
    /// to its value.
    ///
    /// `PROCRELAY_PREFIX` is required. The native library directory defaults
    /// to `<prefix>/lib`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let files_dir = lookup(PREFIX_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| RelayError::Configuration(format!("{PREFIX_ENV} is not set")))?;
        let native_lib_dir = lookup(NATIVE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| files_dir.join("lib"));

        let mut runner = RunnerConfig::builder();
        runner.files_dir(files_dir).native_lib_dir(native_lib_dir);
        if let Some(shell) = lookup(SHELL_ENV) {
            runner.shell(shell);
        }
        if let Some(script) = lookup(SANDBOX_SCRIPT_ENV) {
            runner.sandbox_script(PathBuf::from(script));
        }
        if let Some(timezone) = lookup(TIMEZONE_ENV) {
            runner.timezone(timezone);
        }
        if let Some(level) = lookup(TARGET_API_ENV) {
            runner.target_api_level(parse_number::<u32>(TARGET_API_ENV, &level)?);
        }

        let runner = runner
            .build()
            .map_err(|e| RelayError::Configuration(e.to_string()))?;
        runner.validate()?;

        let mut config = CarrierConfig::builder();
        config.runner(runner);
        if let Some(value) = lookup(FOREGROUND_ENV) {
            config.foreground_by_default(parse_bool(FOREGROUND_ENV, &value)?);
        }
        if let Some(value) = lookup(DRAIN_TIMEOUT_ENV) {
            config.exit_drain_timeout_ms(parse_number::<u64>(DRAIN_TIMEOUT_ENV, &value)?);
        }

        config
            .build()
            .map_err(|e| RelayError::Configuration(e.to_string()))
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, RelayError> {
    value
        .trim()
        .parse()
        .map_err(|_| RelayError::Configuration(format!("{name} is not a valid number: {value}")))
}

pub(crate) fn parse_bool(name: &str, value: &str) -> Result<bool, RelayError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(RelayError::Configuration(format!(
            "{name} is not a valid boolean: {value}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CarrierConfig::from_lookup(lookup(&[(PREFIX_ENV, "/data/files")])).unwrap();

        assert_eq!(config.runner.files_dir, PathBuf::from("/data/files"));
        assert_eq!(config.runner.native_lib_dir, PathBuf::from("/data/files/lib"));
        assert_eq!(config.runner.shell, "sh");
        assert!(config.foreground_by_default);
        assert_eq!(config.drain_timeout(), Duration::from_secs(2));
        assert_eq!(config.wake_lock_tag, DEFAULT_WAKE_LOCK_TAG);
    }

    #[test]
    fn test_overrides() {
        let config = CarrierConfig::from_lookup(lookup(&[
            (PREFIX_ENV, "/data/files"),
            (NATIVE_DIR_ENV, "/data/lib"),
            (SHELL_ENV, "/bin/bash"),
            (SANDBOX_SCRIPT_ENV, "/data/init.sh"),
            (TIMEZONE_ENV, "Asia/Kolkata"),
            (TARGET_API_ENV, "28"),
            (FOREGROUND_ENV, "false"),
            (DRAIN_TIMEOUT_ENV, "150"),
        ]))
        .unwrap();

        assert_eq!(config.runner.native_lib_dir, PathBuf::from("/data/lib"));
        assert_eq!(config.runner.shell, "/bin/bash");
        assert_eq!(
            config.runner.sandbox_script_path(),
            PathBuf::from("/data/init.sh")
        );
        assert_eq!(config.runner.timezone.as_deref(), Some("Asia/Kolkata"));
        assert_eq!(config.runner.target_api_level, Some(28));
        assert!(!config.foreground_by_default);
        assert_eq!(config.exit_drain_timeout_ms, 150);
    }

    #[test]
    fn test_invalid_values() {
        let missing = CarrierConfig::from_lookup(lookup(&[]));
        assert!(matches!(missing, Err(RelayError::Configuration(_))));

        let bad_api = CarrierConfig::from_lookup(lookup(&[
            (PREFIX_ENV, "/data/files"),
            (TARGET_API_ENV, "new"),
        ]));
        assert!(matches!(bad_api, Err(RelayError::Configuration(_))));

        let bad_bool = CarrierConfig::from_lookup(lookup(&[
            (PREFIX_ENV, "/data/files"),
            (FOREGROUND_ENV, "maybe"),
        ]));
        assert!(matches!(bad_bool, Err(RelayError::Configuration(_))));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: CarrierConfig = serde_json::from_str(
            r#"{"runner": {"filesDir": "/f", "nativeLibDir": "/n"}}"#,
        )
        .unwrap();
        assert!(config.foreground_by_default);
        assert_eq!(config.exit_drain_timeout_ms, DEFAULT_DRAIN_TIMEOUT_MS);
        assert_eq!(config.runner.shell, "sh");
    }
}
