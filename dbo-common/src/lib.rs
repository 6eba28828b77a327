//! Shared types, errors, and the devbox transport seam for the DevBox
//! Orchestrator.

pub mod errors;
pub mod logging;
pub mod shell;
pub mod transport;
pub mod types;

pub use errors::OrchestratorError;
pub use logging::{LogConfig, init_logging};
pub use types::{
    AuthMethod, CommandRecord, Credentials, ExecOutput, ProcessStatus, RemoteProcess, UserId,
};
