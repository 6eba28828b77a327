//! Common types used across DBO components.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a user owning a devbox session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authentication material for an SSH session. Exactly one mechanism
/// per credential set.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication.
    Password(String),
    /// Private key file on the orchestrator host.
    PrivateKeyPath(PathBuf),
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => write!(f, "Password(***)"),
            Self::PrivateKeyPath(path) => write!(f, "PrivateKeyPath({})", path.display()),
        }
    }
}

/// Connection parameters for a user's devbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// SSH hostname or IP address.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username.
    pub username: String,
    /// Authentication material.
    pub auth: AuthMethod,
}

fn default_ssh_port() -> u16 {
    22
}

impl Credentials {
    /// Check the fields the type system cannot enforce.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.username.trim().is_empty() {
            return Err("username must not be empty".to_string());
        }
        if let AuthMethod::Password(password) = &self.auth
            && password.is_empty()
        {
            return Err("password must not be empty".to_string());
        }
        Ok(())
    }
}

/// Output captured from one remote command invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One entry in a session's command log. The command string is stored
/// with secrets masked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Lifecycle state of a supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Launch issued, liveness not yet confirmed.
    Starting,
    /// Confirmed alive after the startup grace period.
    Running,
    /// Stopped by request or found dead on re-probe.
    Stopped,
    /// Last start or recovery attempt failed.
    Error,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Tracked state of a user's worker process on the devbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteProcess {
    /// Owner of the process.
    pub user_id: UserId,
    /// Pid on the devbox, once the launch reported one.
    pub pid: Option<u32>,
    /// Port the worker was asked to bind.
    pub port: u16,
    /// Current lifecycle state.
    pub status: ProcessStatus,
    /// When the last successful launch happened.
    pub started_at: Option<DateTime<Utc>>,
    /// Reason for the last failure, if any.
    pub last_error: Option<String>,
    /// First lines of the worker log captured right after startup.
    pub initial_log: Option<String>,
}

impl RemoteProcess {
    /// Fresh record for a launch attempt on `port`.
    pub fn starting(user_id: UserId, port: u16) -> Self {
        Self {
            user_id,
            pid: None,
            port,
            status: ProcessStatus::Starting,
            started_at: None,
            last_error: None,
            initial_log: None,
        }
    }
}
