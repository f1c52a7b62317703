use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use wisp_scripting_host::SandboxPolicy;

/// Host-wide configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Worker threads for the event bus pool
    #[serde(default = "default_event_workers")]
    pub event_workers: usize,

    /// Worker threads for the scheduler pool
    #[serde(default = "default_scheduler_workers")]
    pub scheduler_workers: usize,

    /// Grace period for draining worker pools at shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Sandbox policy applied to untrusted executions
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Free-form values handed to embedder bindings (binding name -> config)
    #[serde(default)]
    pub bindings: HashMap<String, toml::Value>,
}

fn default_event_workers() -> usize {
    4
}

fn default_scheduler_workers() -> usize {
    2
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            event_workers: default_event_workers(),
            scheduler_workers: default_scheduler_workers(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            sandbox: SandboxConfig::default(),
            bindings: HashMap::new(),
        }
    }
}

impl HostConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Default config file location (`<os config dir>/wisp/wisp.toml`), if
    /// a home directory can be determined.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "wisp")
            .map(|dirs| dirs.config_dir().join("wisp.toml"))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Sandbox capability flags and timeout. All capabilities default to
/// denied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub allow_file_access: bool,

    #[serde(default)]
    pub allow_network_access: bool,

    #[serde(default)]
    pub allow_process_access: bool,

    /// Wall-clock budget for one sandboxed execution
    #[serde(default = "default_sandbox_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_sandbox_timeout_ms() -> u64 {
    5000
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allow_file_access: false,
            allow_network_access: false,
            allow_process_access: false,
            timeout_ms: default_sandbox_timeout_ms(),
        }
    }
}

impl SandboxConfig {
    pub fn to_policy(&self) -> SandboxPolicy {
        SandboxPolicy::builder()
            .allow_file_access(self.allow_file_access)
            .allow_network_access(self.allow_network_access)
            .allow_process_access(self.allow_process_access)
            .timeout(Duration::from_millis(self.timeout_ms))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = HostConfig::default();
        assert_eq!(config.event_workers, 4);
        assert_eq!(config.scheduler_workers, 2);
        assert!(!config.sandbox.allow_file_access);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(2));
    }

    #[test]
    fn parses_partial_toml() {
        let config: HostConfig = toml::from_str(
            r#"
            event_workers = 8

            [sandbox]
            allow_file_access = true
            timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.event_workers, 8);
        assert_eq!(config.scheduler_workers, 2);
        assert!(config.sandbox.allow_file_access);
        assert!(!config.sandbox.allow_network_access);
        assert_eq!(config.sandbox.timeout_ms, 250);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wisp.toml");
        std::fs::write(&path, "scheduler_workers = 3\n").unwrap();

        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.scheduler_workers, 3);
    }

    #[test]
    fn load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HostConfig::load(&dir.path().join("absent.toml")).is_err());
    }
}
