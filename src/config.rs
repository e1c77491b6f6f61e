use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::arch::paths;

pub const ENV_TSH: &str = "OPSPAD_TSH";
pub const ENV_SHELL: &str = "OPSPAD_SHELL";
pub const ENV_SHELL_ENV_TIMEOUT_MS: &str = "OPSPAD_SHELL_ENV_TIMEOUT_MS";
pub const ENV_KUBECONFIGS_DIR: &str = "OPSPAD_KUBECONFIGS_DIR";

const DEFAULT_SHELL_ENV_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_COLS: u16 = 120;
const DEFAULT_ROWS: u16 = 30;

/// Runtime settings for launching terminal processes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Explicit `tsh` binary; looked up on PATH when unset.
    pub tsh_program: Option<String>,
    /// Explicit shell for local sessions; `$SHELL` and PATH lookup otherwise.
    pub shell_program: Option<String>,
    /// Deadline for reading the login shell's environment before launch.
    pub shell_env_timeout_ms: u64,
    pub kubeconfigs_dir: Option<PathBuf>,
    pub initial_cols: u16,
    pub initial_rows: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tsh_program: None,
            shell_program: None,
            shell_env_timeout_ms: DEFAULT_SHELL_ENV_TIMEOUT_MS,
            kubeconfigs_dir: None,
            initial_cols: DEFAULT_COLS,
            initial_rows: DEFAULT_ROWS,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whichever `OPSPAD_*` variables `get` returns.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| {
            get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self {
            tsh_program: var(ENV_TSH),
            shell_program: var(ENV_SHELL),
            kubeconfigs_dir: var(ENV_KUBECONFIGS_DIR).map(PathBuf::from),
            ..Self::default()
        };

        if let Some(raw) = var(ENV_SHELL_ENV_TIMEOUT_MS) {
            match raw.parse::<u64>() {
                Ok(ms) => config.shell_env_timeout_ms = ms,
                Err(err) => warn!(value = %raw, %err, "ignoring invalid {ENV_SHELL_ENV_TIMEOUT_MS}"),
            }
        }

        config
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn shell_env_timeout(&self) -> Duration {
        Duration::from_millis(self.shell_env_timeout_ms)
    }

    pub fn kubeconfigs_dir(&self) -> PathBuf {
        self.kubeconfigs_dir
            .clone()
            .unwrap_or_else(paths::kubeconfigs_dir)
    }
}
