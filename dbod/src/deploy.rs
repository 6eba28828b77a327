//! Idempotent worker artifact deployment.
//!
//! A deploy is a no-op when the artifact already sits at the remote path
//! with its execute bit set; nothing is transferred in that case. Fresh
//! uploads are verified with a checksum before the deploy is reported done.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use dbo_common::errors::OrchestratorError;
use dbo_common::shell;
use dbo_common::types::UserId;

use crate::sessions::{SessionRegistry, UserSlot};

/// What a deploy call actually did.
#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    /// False when the artifact was already present and no bytes moved.
    pub uploaded: bool,
    pub made_executable: bool,
    pub remote_path: String,
}

pub struct Deployer {
    registry: Arc<SessionRegistry>,
}

impl Deployer {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Ensure the worker artifact is present and executable on the user's
    /// devbox.
    pub async fn deploy(
        &self,
        user: &UserId,
        local: &Path,
        remote_path: &str,
    ) -> Result<DeployOutcome, OrchestratorError> {
        let slot = self.registry.slot(user).await;
        let mut slot = slot.lock().await;
        self.deploy_in_slot(user, &mut slot, local, remote_path).await
    }

    /// Deploy inside an already-locked slot.
    pub(crate) async fn deploy_in_slot(
        &self,
        user: &UserId,
        slot: &mut UserSlot,
        local: &Path,
        remote_path: &str,
    ) -> Result<DeployOutcome, OrchestratorError> {
        if !slot.session.connected && slot.session.active_credentials.is_none() {
            return Err(OrchestratorError::Connection(
                "deploy requires an active session".to_string(),
            ));
        }
        if !local.is_file() {
            return Err(OrchestratorError::Deployment(format!(
                "local artifact not found: {}",
                local.display()
            )));
        }

        let quoted = shell::quote(remote_path);

        let exists = self
            .registry
            .exec_in_slot(user, slot, &format!("test -f {}", quoted))
            .await?;
        if exists.success() {
            let executable = self
                .registry
                .exec_in_slot(user, slot, &format!("test -x {}", quoted))
                .await?;
            if executable.success() {
                debug!(user = %user, path = remote_path, "artifact already deployed");
                return Ok(DeployOutcome {
                    uploaded: false,
                    made_executable: false,
                    remote_path: remote_path.to_string(),
                });
            }
            let chmod = self
                .registry
                .exec_in_slot(user, slot, &format!("chmod +x {}", quoted))
                .await?;
            if !chmod.success() {
                return Err(OrchestratorError::Deployment(format!(
                    "chmod +x {} failed: {}",
                    remote_path,
                    chmod.stderr.trim()
                )));
            }
            info!(user = %user, path = remote_path, "restored execute bit on deployed artifact");
            return Ok(DeployOutcome {
                uploaded: false,
                made_executable: true,
                remote_path: remote_path.to_string(),
            });
        }

        self.registry.ensure_transport_in_slot(user, slot).await?;
        let transport = slot
            .session
            .transport
            .as_ref()
            .ok_or_else(|| OrchestratorError::Connection("no transport".to_string()))?;

        if let Err(e) = transport.upload(local, remote_path, 0o755).await {
            return Err(match e {
                OrchestratorError::Deployment(_) => e,
                other => OrchestratorError::Deployment(format!("upload failed: {}", other)),
            });
        }

        let chmod = self
            .registry
            .exec_in_slot(user, slot, &format!("chmod +x {}", quoted))
            .await?;
        if !chmod.success() {
            return Err(OrchestratorError::Deployment(format!(
                "chmod +x {} failed: {}",
                remote_path,
                chmod.stderr.trim()
            )));
        }

        self.verify_upload(user, slot, local, remote_path).await?;

        info!(user = %user, path = remote_path, "artifact uploaded and marked executable");
        Ok(DeployOutcome {
            uploaded: true,
            made_executable: true,
            remote_path: remote_path.to_string(),
        })
    }

    /// Compare checksums of the local artifact and the freshly uploaded
    /// remote copy.
    async fn verify_upload(
        &self,
        user: &UserId,
        slot: &mut UserSlot,
        local: &Path,
        remote_path: &str,
    ) -> Result<(), OrchestratorError> {
        let local_path = local.to_path_buf();
        let local_digest = tokio::task::spawn_blocking(move || local_sha256(&local_path))
            .await
            .map_err(|e| OrchestratorError::Internal(format!("hash task failed: {}", e)))??;

        let out = self
            .registry
            .exec_in_slot(
                user,
                slot,
                &format!("sha256sum {}", shell::quote(remote_path)),
            )
            .await?;
        if !out.success() {
            return Err(OrchestratorError::Deployment(format!(
                "verify uploaded artifact: {}",
                out.stderr.trim()
            )));
        }
        let remote_digest = out.stdout.split_whitespace().next().unwrap_or("");
        if remote_digest != local_digest {
            return Err(OrchestratorError::Deployment(format!(
                "checksum mismatch after upload to {}",
                remote_path
            )));
        }
        Ok(())
    }
}

fn local_sha256(path: &Path) -> Result<String, OrchestratorError> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        OrchestratorError::Deployment(format!("open local artifact {}: {}", path.display(), e))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| {
        OrchestratorError::Deployment(format!("read local artifact {}: {}", path.display(), e))
    })?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteLayout;
    use dbo_common::transport::mock::MockHost;
    use dbo_common::types::{AuthMethod, Credentials};
    use std::io::Write;

    const REMOTE: &str = "/opt/devbox/worker";

    fn test_creds() -> Credentials {
        Credentials {
            host: "devbox.test".to_string(),
            port: 22,
            username: "dev".to_string(),
            auth: AuthMethod::Password("pw".to_string()),
        }
    }

    fn user() -> UserId {
        UserId::new("alice")
    }

    async fn deployer(host: &MockHost) -> (Arc<SessionRegistry>, Deployer) {
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(host.connector()),
            RemoteLayout::default(),
            200,
        ));
        registry.connect(&user(), test_creds(), None).await.unwrap();
        (registry.clone(), Deployer::new(registry))
    }

    fn artifact(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_fresh_deploy_uploads_and_marks_executable() {
        let host = MockHost::new("/home/dev");
        let (_, deployer) = deployer(&host).await;
        let local = artifact(b"worker binary");

        let outcome = deployer.deploy(&user(), local.path(), REMOTE).await.unwrap();
        assert!(outcome.uploaded);
        assert!(outcome.made_executable);
        assert_eq!(outcome.remote_path, REMOTE);

        assert_eq!(host.upload_count(), 1);
        let file = host.file(REMOTE).unwrap();
        assert!(file.executable);
        assert_eq!(file.content, b"worker binary");
    }

    #[tokio::test]
    async fn test_redeploy_transfers_nothing() {
        let host = MockHost::new("/home/dev");
        let (_, deployer) = deployer(&host).await;
        let local = artifact(b"worker binary");

        deployer.deploy(&user(), local.path(), REMOTE).await.unwrap();
        let outcome = deployer.deploy(&user(), local.path(), REMOTE).await.unwrap();

        assert!(!outcome.uploaded);
        assert!(!outcome.made_executable);
        assert_eq!(host.upload_count(), 1);
    }

    #[tokio::test]
    async fn test_existing_artifact_gets_execute_bit_restored() {
        let host = MockHost::new("/home/dev");
        host.add_file(REMOTE, b"worker binary", false);
        let (_, deployer) = deployer(&host).await;
        let local = artifact(b"worker binary");

        let outcome = deployer.deploy(&user(), local.path(), REMOTE).await.unwrap();
        assert!(!outcome.uploaded);
        assert!(outcome.made_executable);
        assert_eq!(host.upload_count(), 0);
        assert!(host.file(REMOTE).unwrap().executable);
    }

    #[tokio::test]
    async fn test_missing_local_artifact() {
        let host = MockHost::new("/home/dev");
        let (_, deployer) = deployer(&host).await;

        let err = deployer
            .deploy(&user(), Path::new("/no/such/artifact"), REMOTE)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Deployment(_)));
        assert_eq!(host.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_upload_fails_verification() {
        let host = MockHost::new("/home/dev");
        host.corrupt_uploads(true);
        let (_, deployer) = deployer(&host).await;
        let local = artifact(b"worker binary");

        let err = deployer
            .deploy(&user(), local.path(), REMOTE)
            .await
            .unwrap_err();
        match err {
            OrchestratorError::Deployment(msg) => assert!(msg.contains("checksum")),
            other => panic!("expected deployment error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deploy_requires_session() {
        let host = MockHost::new("/home/dev");
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(host.connector()),
            RemoteLayout::default(),
            200,
        ));
        let deployer = Deployer::new(registry);
        let local = artifact(b"worker binary");

        let err = deployer
            .deploy(&user(), local.path(), REMOTE)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Connection(_)));
    }
}
