//! Automatic worker recovery.
//!
//! A recovery pass holds the user's slot for its whole duration: sweep the
//! worker port (TERM, then KILL), make sure the artifact is deployed, then
//! start the worker again. Step failures degrade the process record to
//! `Error` and report an unrecovered pass rather than bubbling up, so the
//! monitor loop can simply count outcomes.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use dbo_common::errors::OrchestratorError;
use dbo_common::types::{ProcessStatus, RemoteProcess, UserId};

use crate::config::RemoteLayout;
use crate::deploy::Deployer;
use crate::sessions::{SessionRegistry, UserSlot};
use crate::supervisor::Supervisor;

pub struct RecoveryEngine {
    registry: Arc<SessionRegistry>,
    deployer: Arc<Deployer>,
    supervisor: Arc<Supervisor>,
    remote: RemoteLayout,
}

impl RecoveryEngine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        deployer: Arc<Deployer>,
        supervisor: Arc<Supervisor>,
        remote: RemoteLayout,
    ) -> Self {
        Self {
            registry,
            deployer,
            supervisor,
            remote,
        }
    }

    /// One full recovery pass. `Ok(true)` only when the worker is confirmed
    /// running afterwards.
    pub async fn recover(&self, user: &UserId) -> Result<bool, OrchestratorError> {
        let slot = self.registry.slot(user).await;
        let mut slot = slot.lock().await;

        let Some(target) = slot.target.clone() else {
            return Err(OrchestratorError::UnknownTarget(format!(
                "no deployment target configured for user {}",
                user
            )));
        };
        let port = slot
            .process
            .as_ref()
            .map(|p| p.port)
            .unwrap_or(target.worker_port);
        let run_id = Uuid::new_v4();
        info!(user = %user, %run_id, port, "recovery pass started");

        if let Err(e) = self.supervisor.free_port(user, &mut slot, port, true).await {
            warn!(user = %user, %run_id, "recovery port sweep failed: {}", e);
            degrade(&mut slot, user, port, &e);
            return Ok(false);
        }

        if let Err(e) = self
            .deployer
            .deploy_in_slot(user, &mut slot, &target.artifact, &self.remote.worker_path)
            .await
        {
            warn!(user = %user, %run_id, "recovery deploy failed: {}", e);
            degrade(&mut slot, user, port, &e);
            return Ok(false);
        }

        // A record still claiming to run gets re-probed, otherwise start
        // would short-circuit on a worker that died with the record stale.
        let claimed_pid = slot
            .process
            .as_ref()
            .and_then(|p| (p.status == ProcessStatus::Running).then_some(p.pid))
            .flatten();
        if let Some(pid) = claimed_pid {
            match self
                .registry
                .exec_in_slot(user, &mut slot, &format!("kill -0 {}", pid))
                .await
            {
                Ok(out) if out.success() => {}
                Ok(_) => {
                    if let Some(process) = &mut slot.process {
                        process.status = ProcessStatus::Stopped;
                    }
                }
                Err(e) => {
                    warn!(user = %user, %run_id, "recovery liveness probe failed: {}", e);
                    degrade(&mut slot, user, port, &e);
                    return Ok(false);
                }
            }
        }

        match self.supervisor.start_in_slot(user, &mut slot, port).await {
            Ok(process) => {
                info!(user = %user, %run_id, pid = ?process.pid, "recovery succeeded");
                Ok(true)
            }
            Err(e) => {
                // start_in_slot already degraded the record.
                warn!(user = %user, %run_id, "recovery start failed: {}", e);
                Ok(false)
            }
        }
    }
}

fn degrade(slot: &mut UserSlot, user: &UserId, port: u16, error: &OrchestratorError) {
    let record = slot
        .process
        .get_or_insert_with(|| RemoteProcess::starting(user.clone(), port));
    record.status = ProcessStatus::Error;
    record.last_error = Some(error.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteLayout;
    use crate::supervisor::SupervisorConfig;
    use crate::targets::ResolvedTarget;
    use dbo_common::transport::mock::MockHost;
    use dbo_common::types::{AuthMethod, Credentials};
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    const WORKER: &str = "/opt/devbox/worker";
    const PORT: u16 = 8000;

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

    fn target(artifact: PathBuf) -> ResolvedTarget {
        ResolvedTarget {
            project: "api".to_string(),
            credentials: test_creds(),
            base_url: format!("http://devbox.test:{}", PORT),
            artifact,
            worker_port: PORT,
        }
    }

    fn artifact(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    struct Rig {
        supervisor: Arc<Supervisor>,
        recovery: RecoveryEngine,
    }

    async fn rig(host: &MockHost, artifact: PathBuf) -> Rig {
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(host.connector()),
            RemoteLayout::default(),
            200,
        ));
        registry
            .connect(&user(), test_creds(), Some(target(artifact)))
            .await
            .unwrap();
        let deployer = Arc::new(Deployer::new(registry.clone()));
        let supervisor = Arc::new(Supervisor::new(
            registry.clone(),
            RemoteLayout::default(),
            SupervisorConfig {
                startup_grace: Duration::from_millis(10),
                port_release_wait: Duration::from_millis(5),
                ..SupervisorConfig::default()
            },
        ));
        let recovery = RecoveryEngine::new(
            registry,
            deployer,
            supervisor.clone(),
            RemoteLayout::default(),
        );
        Rig {
            supervisor,
            recovery,
        }
    }

    #[tokio::test]
    async fn test_recover_restarts_dead_worker() {
        let host = MockHost::new("/home/dev");
        host.add_file(WORKER, b"worker binary", true);
        let local = artifact(b"worker binary");
        let rig = rig(&host, local.path().to_path_buf()).await;

        let process = rig.supervisor.start(&user(), PORT).await.unwrap();
        let old_pid = process.pid.unwrap();
        host.kill_pid(old_pid);

        assert!(rig.recovery.recover(&user()).await.unwrap());
        let status = rig.supervisor.status(&user()).await.unwrap();
        assert_eq!(status.status, ProcessStatus::Running);
        assert_ne!(status.pid.unwrap(), old_pid);
        assert_eq!(host.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_recover_deploys_missing_artifact() {
        let host = MockHost::new("/home/dev");
        let local = artifact(b"worker binary");
        let rig = rig(&host, local.path().to_path_buf()).await;

        assert!(rig.recovery.recover(&user()).await.unwrap());
        assert_eq!(host.upload_count(), 1);
        let status = rig.supervisor.status(&user()).await.unwrap();
        assert_eq!(status.status, ProcessStatus::Running);
    }

    #[tokio::test]
    async fn test_recover_reprobes_stale_running_record() {
        let host = MockHost::new("/home/dev");
        host.add_file(WORKER, b"worker binary", true);
        let local = artifact(b"worker binary");
        let rig = rig(&host, local.path().to_path_buf()).await;

        let process = rig.supervisor.start(&user(), PORT).await.unwrap();
        // The worker dies without releasing the record.
        host.kill_pid(process.pid.unwrap());

        assert!(rig.recovery.recover(&user()).await.unwrap());
        assert_eq!(host.launch_count(), 2);
        let status = rig.supervisor.status(&user()).await.unwrap();
        assert_eq!(status.status, ProcessStatus::Running);
        assert!(host.pid_alive(status.pid.unwrap()));
    }

    #[tokio::test]
    async fn test_recover_kills_port_squatter_before_restart() {
        let host = MockHost::new("/home/dev");
        host.add_file(WORKER, b"worker binary", true);
        let squatter = host.listen_on_port(PORT);
        let local = artifact(b"worker binary");
        let rig = rig(&host, local.path().to_path_buf()).await;

        assert!(rig.recovery.recover(&user()).await.unwrap());
        assert!(!host.pid_alive(squatter));
        let status = rig.supervisor.status(&user()).await.unwrap();
        assert_eq!(status.status, ProcessStatus::Running);
    }

    #[tokio::test]
    async fn test_recover_degrades_record_when_port_cannot_be_freed() {
        let host = MockHost::new("/home/dev");
        host.add_file(WORKER, b"worker binary", true);
        let squatter = host.listen_on_port(PORT);
        host.make_unkillable(squatter);
        let local = artifact(b"worker binary");
        let rig = rig(&host, local.path().to_path_buf()).await;

        assert!(!rig.recovery.recover(&user()).await.unwrap());
        assert_eq!(host.launch_count(), 0);
        let status = rig.supervisor.status(&user()).await.unwrap();
        assert_eq!(status.status, ProcessStatus::Error);
        assert!(status.last_error.unwrap().contains("8000"));
    }

    #[tokio::test]
    async fn test_recover_degrades_record_when_deploy_fails() {
        let host = MockHost::new("/home/dev");
        let rig = rig(&host, PathBuf::from("/no/such/artifact")).await;

        assert!(!rig.recovery.recover(&user()).await.unwrap());
        let status = rig.supervisor.status(&user()).await.unwrap();
        assert_eq!(status.status, ProcessStatus::Error);
        assert!(status.last_error.unwrap().contains("artifact"));
    }

    #[tokio::test]
    async fn test_recover_reports_failure_when_start_fails() {
        let host = MockHost::new("/home/dev");
        host.add_file(WORKER, b"worker binary", true);
        host.workers_die_on_start(true);
        let local = artifact(b"worker binary");
        let rig = rig(&host, local.path().to_path_buf()).await;

        assert!(!rig.recovery.recover(&user()).await.unwrap());
        let status = rig.supervisor.status(&user()).await.unwrap();
        assert_eq!(status.status, ProcessStatus::Error);
    }

    #[tokio::test]
    async fn test_recover_requires_target() {
        let host = MockHost::new("/home/dev");
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(host.connector()),
            RemoteLayout::default(),
            200,
        ));
        registry.connect(&user(), test_creds(), None).await.unwrap();
        let deployer = Arc::new(Deployer::new(registry.clone()));
        let supervisor = Arc::new(Supervisor::new(
            registry.clone(),
            RemoteLayout::default(),
            SupervisorConfig::default(),
        ));
        let recovery =
            RecoveryEngine::new(registry, deployer, supervisor, RemoteLayout::default());

        let err = recovery.recover(&user()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownTarget(_)));
    }
}
