//! Error taxonomy for orchestrator operations.
//!
//! Every fallible operation in the daemon returns one of these variants so
//! callers (and the HTTP layer) can distinguish credential problems from
//! transport loss, deployment failures, process lifecycle errors, and
//! monitoring outcomes.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Credentials incomplete or rejected by the remote host.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Transport could not be established or was lost.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A remote command could not be run or its channel broke mid-flight.
    #[error("command execution failed: {0}")]
    CommandExecution(String),

    /// Artifact transfer or permission setup failed.
    #[error("deployment failed: {0}")]
    Deployment(String),

    /// Requested port is occupied and could not be freed.
    #[error("port {port} is in use and could not be freed")]
    PortConflict { port: u16 },

    /// Process launched but died within the startup grace period.
    #[error("worker failed to start: {reason}")]
    ProcessStartup {
        reason: String,
        log_tail: Option<String>,
    },

    /// No tracked running process for this user.
    #[error("no running worker process")]
    NotRunning,

    /// Health endpoint did not answer within the deadline.
    #[error("health check timed out after {timeout:?}")]
    HealthCheckTimeout { timeout: Duration },

    /// Every recovery attempt in a cycle failed.
    #[error("recovery failed after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },

    /// No deployment target is known for this project or user.
    #[error("unknown deployment target: {0}")]
    UnknownTarget(String),

    /// Invariant break inside the daemon itself.
    #[error("{0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Stable snake_case label for structured responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Connection(_) => "connection",
            Self::CommandExecution(_) => "command_execution",
            Self::Deployment(_) => "deployment",
            Self::PortConflict { .. } => "port_conflict",
            Self::ProcessStartup { .. } => "process_startup",
            Self::NotRunning => "not_running",
            Self::HealthCheckTimeout { .. } => "health_check_timeout",
            Self::RecoveryExhausted { .. } => "recovery_exhausted",
            Self::UnknownTarget(_) => "unknown_target",
            Self::Internal(_) => "internal",
        }
    }
}
