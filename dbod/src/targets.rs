//! Deployment target resolution.
//!
//! Which devbox a project maps to is decided outside the orchestrator; the
//! catalog built from `[[targets]]` config is the narrow interface that
//! decision arrives through.

use std::collections::HashMap;
use std::path::PathBuf;

use dbo_common::errors::OrchestratorError;
use dbo_common::types::{AuthMethod, Credentials};

use crate::config::TargetConfig;

/// Everything the daemon needs to act on one project's devbox.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub project: String,
    pub credentials: Credentials,
    /// Base URL the worker serves once started.
    pub base_url: String,
    /// Local artifact for this project.
    pub artifact: PathBuf,
    /// Port the worker binds on the devbox.
    pub worker_port: u16,
}

/// Project-id to devbox catalog.
pub struct TargetCatalog {
    targets: HashMap<String, TargetConfig>,
}

impl TargetCatalog {
    pub fn from_config(targets: &[TargetConfig]) -> Self {
        let targets = targets
            .iter()
            .map(|t| (t.project.clone(), t.clone()))
            .collect();
        Self { targets }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Resolve the deployment target for a project id.
    pub fn resolve(&self, project: &str) -> Result<ResolvedTarget, OrchestratorError> {
        let target = self
            .targets
            .get(project)
            .ok_or_else(|| OrchestratorError::UnknownTarget(project.to_string()))?;

        let auth = build_auth(
            target.password.as_deref(),
            target.private_key_path.as_deref().map(PathBuf::from),
        )?;

        let credentials = Credentials {
            host: target.host.clone(),
            port: target.ssh_port,
            username: target.username.clone(),
            auth,
        };
        credentials
            .validate()
            .map_err(OrchestratorError::Authentication)?;

        Ok(ResolvedTarget {
            project: target.project.clone(),
            credentials,
            base_url: target.base_url.clone(),
            artifact: target.artifact.clone(),
            worker_port: target.worker_port,
        })
    }
}

/// Enforce the exactly-one-mechanism rule on raw credential fields.
pub fn build_auth(
    password: Option<&str>,
    private_key_path: Option<PathBuf>,
) -> Result<AuthMethod, OrchestratorError> {
    match (password, private_key_path) {
        (Some(password), None) => Ok(AuthMethod::Password(password.to_string())),
        (None, Some(path)) => Ok(AuthMethod::PrivateKeyPath(path)),
        (Some(_), Some(_)) => Err(OrchestratorError::Authentication(
            "both password and private_key_path supplied; pick one".to_string(),
        )),
        (None, None) => Err(OrchestratorError::Authentication(
            "no authentication material: supply password or private_key_path".to_string(),
        )),
    }
}
