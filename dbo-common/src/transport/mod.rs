//! Remote shell transport seam.
//!
//! The orchestrator talks to devboxes through `RemoteShell` trait objects so
//! daemon logic can run against the real SSH transport or the in-memory mock
//! interchangeably. A transport is disposed by dropping it.

pub mod mock;
#[cfg(unix)]
pub mod ssh;

use std::path::Path;

use async_trait::async_trait;

use crate::errors::OrchestratorError;
use crate::types::{Credentials, ExecOutput};

/// One live connection to a devbox.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run a command, capturing stdout, stderr, and exit status.
    ///
    /// Each call runs in a fresh shell on the remote side; working-directory
    /// persistence is the caller's concern.
    async fn exec(&self, command: &str) -> Result<ExecOutput, OrchestratorError>;

    /// Upload a local file to `remote_path`, creating or truncating it,
    /// with the given permission bits.
    async fn upload(
        &self,
        local: &Path,
        remote_path: &str,
        mode: u32,
    ) -> Result<(), OrchestratorError>;

    /// Cheap probe that the transport is still usable.
    async fn is_alive(&self) -> bool;
}

/// Opens transports from credentials.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteShell>, OrchestratorError>;
}
