use crate::error::RelayError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// File name of the sandbox bootstrap looked up under `files_dir` when no
/// explicit script is configured.
pub const DEFAULT_SANDBOX_SCRIPT: &str = "init-sandbox.sh";

/// Configuration shared by every process the runner spawns
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Shell used to interpret commands (`<shell> -c <command>`)
    #[builder(default = "default_shell()")]
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Directory holding application-private files, exported as `PREFIX`
    pub files_dir: PathBuf,

    /// Directory holding native libraries, exported as `NATIVE_DIR`
    pub native_lib_dir: PathBuf,

    /// Script sourced before sandboxed commands
    #[builder(default)]
    #[serde(default)]
    pub sandbox_script: Option<PathBuf>,

    /// Timezone identifier override; detected from the host when unset
    #[builder(default)]
    #[serde(default)]
    pub timezone: Option<String>,

    /// Platform API level the environment targets
    #[builder(default)]
    #[serde(default)]
    pub target_api_level: Option<u32>,

    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

impl RunnerConfig {
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder::default()
    }

    /// Path of the sandbox bootstrap script
    pub fn sandbox_script_path(&self) -> PathBuf {
        self.sandbox_script
            .clone()
            .unwrap_or_else(|| self.files_dir.join(DEFAULT_SANDBOX_SCRIPT))
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.shell.trim().is_empty() {
            return Err(RelayError::Configuration(
                "shell must not be empty".to_string(),
            ));
        }

        if self.files_dir.as_os_str().is_empty() {
            return Err(RelayError::Configuration(
                "files_dir must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl RunnerConfigBuilder {
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

fn default_shell() -> String {
    "sh".to_string()
}
