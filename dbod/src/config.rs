//! Daemon configuration loading.
//!
//! Configuration is TOML with a section per concern plus a `[[targets]]`
//! table array describing the deployable projects. Every field has a
//! default so an empty file (or no file) yields a working daemon.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub remote: RemoteLayout,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Port the HTTP control API listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Maximum command-log records kept in memory per session.
    #[serde(default = "default_command_log_capacity")]
    pub command_log_capacity: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            log_level: default_log_level(),
            command_log_capacity: default_command_log_capacity(),
        }
    }
}

/// File layout on each devbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLayout {
    /// Where the worker executable is installed.
    #[serde(default = "default_worker_path")]
    pub worker_path: String,
    /// Worker stdout/stderr log, sibling of the executable.
    #[serde(default = "default_worker_log")]
    pub worker_log: String,
    /// Append-only log of commands executed through sessions.
    #[serde(default = "default_command_log")]
    pub command_log: String,
}

impl Default for RemoteLayout {
    fn default() -> Self {
        Self {
            worker_path: default_worker_path(),
            worker_log: default_worker_log(),
            command_log: default_command_log(),
        }
    }
}

/// Health monitoring defaults; per-request values can override interval
/// and retry count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Interval between health checks, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Recovery attempts per failing cycle.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Hard deadline for one health probe, in seconds.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Consecutive failures before recovery starts.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Pause between recovery attempts, in milliseconds.
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,
    /// Remote log lines fetched for diagnostics on failure.
    #[serde(default = "default_diagnostic_log_lines")]
    pub diagnostic_log_lines: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_retries: default_max_retries(),
            http_timeout_secs: default_http_timeout_secs(),
            failure_threshold: default_failure_threshold(),
            recovery_delay_ms: default_recovery_delay_ms(),
            diagnostic_log_lines: default_diagnostic_log_lines(),
        }
    }
}

/// One deployable project: which devbox it lives on, how to reach it, and
/// where its worker serves from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Project identifier.
    pub project: String,
    /// SSH hostname or IP address.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// SSH username.
    pub username: String,
    /// Password authentication. Exactly one of password / private_key_path.
    #[serde(default)]
    pub password: Option<String>,
    /// Private key authentication.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    /// Base URL the worker serves once started.
    pub base_url: String,
    /// Local artifact to deploy for this project.
    pub artifact: PathBuf,
    /// Port the worker binds on the devbox.
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,
}

fn default_listen_port() -> u16 {
    7070
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_command_log_capacity() -> usize {
    200
}

fn default_worker_path() -> String {
    "/opt/devbox/worker".to_string()
}

fn default_worker_log() -> String {
    "/opt/devbox/worker.log".to_string()
}

fn default_command_log() -> String {
    "/opt/devbox/command.log".to_string()
}

fn default_interval_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_recovery_delay_ms() -> u64 {
    5_000
}

fn default_diagnostic_log_lines() -> u32 {
    50
}

fn default_ssh_port() -> u16 {
    22
}

fn default_worker_port() -> u16 {
    8000
}

/// Default configuration path under the user config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("dbo").join("config.toml"))
}

/// Load configuration from `path`, or from the default location, or fall
/// back to built-in defaults when no file exists.
pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig> {
    let candidate = match path {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path(),
    };

    let Some(candidate) = candidate else {
        return Ok(DaemonConfig::default());
    };

    if !candidate.exists() {
        if path.is_some() {
            anyhow::bail!("config file not found: {}", candidate.display());
        }
        info!("No config file at {:?}, using defaults", candidate);
        return Ok(DaemonConfig::default());
    }

    let raw = std::fs::read_to_string(&candidate)
        .with_context(|| format!("reading {}", candidate.display()))?;
    let config: DaemonConfig =
        toml::from_str(&raw).with_context(|| format!("parsing {}", candidate.display()))?;
    info!(
        "Loaded config from {:?} ({} targets)",
        candidate,
        config.targets.len()
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.general.listen_port, 7070);
        assert_eq!(config.remote.worker_path, "/opt/devbox/worker");
        assert_eq!(config.monitor.failure_threshold, 2);
        assert_eq!(config.monitor.interval_ms, 30_000);
        assert!(config.targets.is_empty());
    }

    #[test]
    fn test_full_config_parse() {
        let raw = r#"
            [general]
            listen_port = 9090
            command_log_capacity = 50

            [remote]
            worker_path = "/srv/worker"

            [monitor]
            interval_ms = 5000
            max_retries = 5

            [[targets]]
            project = "acme-api"
            host = "devbox-1.internal"
            username = "deploy"
            password = "s3cret"
            base_url = "http://devbox-1.internal:8000"
            artifact = "/var/artifacts/acme-api"
            worker_port = 8000

            [[targets]]
            project = "acme-web"
            host = "devbox-2.internal"
            ssh_port = 2222
            username = "deploy"
            private_key_path = "~/.ssh/devbox"
            base_url = "http://devbox-2.internal:8100"
            artifact = "/var/artifacts/acme-web"
            worker_port = 8100
        "#;
        let config: DaemonConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.general.listen_port, 9090);
        assert_eq!(config.general.command_log_capacity, 50);
        assert_eq!(config.remote.worker_path, "/srv/worker");
        assert_eq!(config.remote.worker_log, "/opt/devbox/worker.log");
        assert_eq!(config.monitor.interval_ms, 5000);
        assert_eq!(config.monitor.max_retries, 5);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].ssh_port, 22);
        assert_eq!(config.targets[1].ssh_port, 2222);
        assert!(config.targets[1].password.is_none());
    }

    #[test]
    fn test_load_config_missing_explicit_path_fails() {
        let err = load_config(Some(Path::new("/nonexistent/dbo.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[general]\nlisten_port = 8088").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.general.listen_port, 8088);
    }
}
