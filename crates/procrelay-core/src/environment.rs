//! Environment injected into every spawned command.
//!
//! The variable names are the contract with the sandbox bootstrap script and
//! must stay stable.

use crate::config::RunnerConfig;
use std::collections::BTreeMap;
use std::path::Path;

pub const PREFIX_VAR: &str = "PREFIX";
pub const NATIVE_DIR_VAR: &str = "NATIVE_DIR";
pub const TIMEZONE_VAR: &str = "ANDROID_TZ";
pub const LEGACY_FLAG_VAR: &str = "FDROID";

/// Highest target API level that still requires the legacy execution mode.
pub const LEGACY_API_LEVEL: u32 = 28;

const RESERVED: [&str; 4] = [PREFIX_VAR, NATIVE_DIR_VAR, TIMEZONE_VAR, LEGACY_FLAG_VAR];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEnvironment {
    vars: BTreeMap<String, String>,
}

impl ProcessEnvironment {
    /// Build the environment, detecting the host timezone unless configured.
    pub fn from_config(config: &RunnerConfig) -> Self {
        let timezone = config.timezone.clone().unwrap_or_else(local_timezone);
        Self::with_timezone(config, timezone)
    }

    pub fn with_timezone(config: &RunnerConfig, timezone: impl Into<String>) -> Self {
        let mut vars = BTreeMap::new();

        // Extra entries first so the reserved names always win.
        for (key, value) in &config.env {
            if !RESERVED.contains(&key.as_str()) {
                vars.insert(key.clone(), value.clone());
            }
        }

        vars.insert(PREFIX_VAR.to_string(), path_string(&config.files_dir));
        vars.insert(
            NATIVE_DIR_VAR.to_string(),
            path_string(&config.native_lib_dir),
        );
        vars.insert(TIMEZONE_VAR.to_string(), timezone.into());
        vars.insert(
            LEGACY_FLAG_VAR.to_string(),
            is_legacy_platform(config.target_api_level).to_string(),
        );

        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_legacy(&self) -> bool {
        self.get(LEGACY_FLAG_VAR) == Some("true")
    }
}

/// Unknown API levels are treated as modern.
pub fn is_legacy_platform(target_api_level: Option<u32>) -> bool {
    target_api_level.is_some_and(|level| level <= LEGACY_API_LEVEL)
}

/// Best-effort identifier of the host's local timezone, `UTC` when unknown.
pub fn local_timezone() -> String {
    if let Ok(tz) = std::env::var("TZ") {
        let tz = tz.trim_start_matches(':').trim();
        if !tz.is_empty() {
            return tz.to_string();
        }
    }

    if let Ok(contents) = std::fs::read_to_string("/etc/timezone") {
        let tz = contents.trim();
        if !tz.is_empty() {
            return tz.to_string();
        }
    }

    std::fs::read_link("/etc/localtime")
        .ok()
        .and_then(|target| zoneinfo_name(&target))
        .unwrap_or_else(|| "UTC".to_string())
}

fn zoneinfo_name(target: &Path) -> Option<String> {
    let target = target.to_string_lossy();
    let (_, name) = target.split_once("zoneinfo/")?;
    (!name.is_empty()).then(|| name.to_string())
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: Option<u32>) -> RunnerConfig {
        let mut builder = RunnerConfig::builder();
        builder
            .files_dir("/data/user/0/app/files")
            .native_lib_dir("/data/app/lib/arm64")
            .env("PREFIX", "/should/not/win")
            .env("LANG", "C.UTF-8");
        if let Some(level) = level {
            builder.target_api_level(level);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_reserved_variables() {
        let env = ProcessEnvironment::with_timezone(&config(Some(33)), "Europe/Berlin");
        assert_eq!(env.get(PREFIX_VAR), Some("/data/user/0/app/files"));
        assert_eq!(env.get(NATIVE_DIR_VAR), Some("/data/app/lib/arm64"));
        assert_eq!(env.get(TIMEZONE_VAR), Some("Europe/Berlin"));
        assert_eq!(env.get(LEGACY_FLAG_VAR), Some("false"));
        assert_eq!(env.get("LANG"), Some("C.UTF-8"));
        assert!(!env.is_legacy());
    }

    #[test]
    fn test_legacy_flag() {
        assert!(is_legacy_platform(Some(28)));
        assert!(is_legacy_platform(Some(21)));
        assert!(!is_legacy_platform(Some(29)));
        assert!(!is_legacy_platform(None));

        let env = ProcessEnvironment::with_timezone(&config(Some(28)), "UTC");
        assert!(env.is_legacy());
        let env = ProcessEnvironment::with_timezone(&config(None), "UTC");
        assert_eq!(env.get(LEGACY_FLAG_VAR), Some("false"));
    }

    #[test]
    fn test_stable_across_calls() {
        let config = config(Some(30));
        assert_eq!(
            ProcessEnvironment::from_config(&config),
            ProcessEnvironment::from_config(&config)
        );
    }

    #[test]
    fn test_configured_timezone_wins() {
        let mut config = config(None);
        config.timezone = Some("Asia/Tokyo".to_string());
        let env = ProcessEnvironment::from_config(&config);
        assert_eq!(env.get(TIMEZONE_VAR), Some("Asia/Tokyo"));
    }

    #[test]
    fn test_local_timezone_never_empty() {
        assert!(!local_timezone().is_empty());
    }

    #[test]
    fn test_zoneinfo_name() {
        assert_eq!(
            zoneinfo_name(Path::new("/usr/share/zoneinfo/America/New_York")),
            Some("America/New_York".to_string())
        );
        assert_eq!(zoneinfo_name(Path::new("/etc/UTC")), None);
        assert_eq!(zoneinfo_name(Path::new("/usr/share/zoneinfo/")), None);
    }
}
