//! Environment-variable configuration.
//!
//! The runtime is loaded into arbitrary host programs, so all configuration
//! arrives through the environment (the launcher CLI assembles these
//! variables before spawning the target). Values are read once and cached.

use std::path::PathBuf;
use std::sync::OnceLock;

pub use heapscope_common::env::{
    DEFAULT_OUT, ENV_LOG, ENV_OUT, ENV_PROFILE_CHILDREN, ENV_STARTED,
};

/// Get an environment variable, falling back to a default when unset.
#[must_use]
pub fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Interpret an environment variable as a boolean toggle.
/// Accepts `1`/`true`/`yes` (case-insensitive); anything else is false.
#[must_use]
pub fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => false,
    }
}

/// Runtime configuration snapshot, taken once at first use.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where to write the report.
    pub output_path: PathBuf,
    /// Keep tracing enabled in processes spawned by the target.
    pub profile_children: bool,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            output_path: PathBuf::from(env_or(ENV_OUT, DEFAULT_OUT)),
            profile_children: env_flag(ENV_PROFILE_CHILDREN),
        }
    }

    /// Resolve the report path for this process.
    ///
    /// Secondary processes (children of the original target, profiled only
    /// when `--profile-children` is set) get a `.<pid>` suffix so they do not
    /// clobber the parent's report.
    #[must_use]
    pub fn report_path(&self, secondary: bool, pid: u32) -> PathBuf {
        if !secondary {
            return self.output_path.clone();
        }
        let mut name = self.output_path.as_os_str().to_os_string();
        name.push(format!(".{pid}"));
        PathBuf::from(name)
    }
}

/// Process-wide configuration, read from the environment on first access.
pub fn global() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(Config::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_default() {
        assert_eq!(env_or("HEAPSCOPE_TEST_UNSET_VAR", "fallback"), "fallback");
    }

    #[test]
    fn test_env_flag_parses_toggles() {
        std::env::set_var("HEAPSCOPE_TEST_FLAG_A", "TRUE");
        std::env::set_var("HEAPSCOPE_TEST_FLAG_B", "0");
        assert!(env_flag("HEAPSCOPE_TEST_FLAG_A"));
        assert!(!env_flag("HEAPSCOPE_TEST_FLAG_B"));
        assert!(!env_flag("HEAPSCOPE_TEST_FLAG_UNSET"));
    }

    #[test]
    fn test_report_path_suffixes_secondary_processes() {
        let config = Config {
            output_path: PathBuf::from("/tmp/stats.json"),
            profile_children: true,
        };
        assert_eq!(config.report_path(false, 42), PathBuf::from("/tmp/stats.json"));
        assert_eq!(config.report_path(true, 42), PathBuf::from("/tmp/stats.json.42"));
    }
}
