//! Remote worker process supervision.
//!
//! Workers are launched detached over the session (`nohup ... & echo $!`)
//! and tracked by pid. A start only reports success after the process
//! survives a short grace period; an occupied port is cleared with TERM
//! before launch, and recovery escalates to KILL.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use dbo_common::errors::OrchestratorError;
use dbo_common::shell;
use dbo_common::types::{ProcessStatus, RemoteProcess, UserId};

use crate::config::RemoteLayout;
use crate::sessions::{SessionRegistry, UserSlot};

/// Timing and log-capture knobs for process supervision.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a worker must survive after launch before it counts as
    /// started.
    pub startup_grace: Duration,
    /// Pause between signalling a port's listeners and re-checking.
    pub port_release_wait: Duration,
    /// Worker log lines captured into the record after a successful start.
    pub snapshot_lines: u32,
    /// Worker log lines attached to a startup failure.
    pub failure_tail_lines: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(2),
            port_release_wait: Duration::from_secs(1),
            snapshot_lines: 20,
            failure_tail_lines: 40,
        }
    }
}

pub struct Supervisor {
    registry: Arc<SessionRegistry>,
    remote: RemoteLayout,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(registry: Arc<SessionRegistry>, remote: RemoteLayout, config: SupervisorConfig) -> Self {
        Self {
            registry,
            remote,
            config,
        }
    }

    /// Start the user's worker on `port`.
    ///
    /// A start while the tracked process is already running returns the
    /// existing record untouched.
    pub async fn start(&self, user: &UserId, port: u16) -> Result<RemoteProcess, OrchestratorError> {
        let slot = self.registry.slot(user).await;
        let mut slot = slot.lock().await;
        self.start_in_slot(user, &mut slot, port).await
    }

    pub(crate) async fn start_in_slot(
        &self,
        user: &UserId,
        slot: &mut UserSlot,
        port: u16,
    ) -> Result<RemoteProcess, OrchestratorError> {
        if let Some(process) = &slot.process
            && process.status == ProcessStatus::Running
        {
            debug!(user = %user, pid = ?process.pid, "start requested but worker already running");
            return Ok(process.clone());
        }

        slot.process = Some(RemoteProcess::starting(user.clone(), port));
        match self.launch(user, slot, port).await {
            Ok(process) => {
                slot.process = Some(process.clone());
                Ok(process)
            }
            Err(e) => {
                if let Some(process) = &mut slot.process {
                    process.status = ProcessStatus::Error;
                    process.last_error = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        user: &UserId,
        slot: &mut UserSlot,
        port: u16,
    ) -> Result<RemoteProcess, OrchestratorError> {
        self.free_port(user, slot, port, false).await?;

        let quoted_bin = shell::quote(&self.remote.worker_path);
        let present = self
            .registry
            .exec_in_slot(user, slot, &format!("test -f {}", quoted_bin))
            .await?;
        if !present.success() {
            return Err(OrchestratorError::Deployment(format!(
                "worker artifact missing at {}; deploy first",
                self.remote.worker_path
            )));
        }
        let executable = self
            .registry
            .exec_in_slot(user, slot, &format!("test -x {}", quoted_bin))
            .await?;
        if !executable.success() {
            return Err(OrchestratorError::Deployment(format!(
                "worker artifact at {} is not executable; deploy first",
                self.remote.worker_path
            )));
        }

        let launch_cmd = format!(
            "nohup {} --port {} >> {} 2>&1 < /dev/null & echo $!",
            quoted_bin,
            port,
            shell::quote(&self.remote.worker_log)
        );
        let out = self.registry.exec_in_slot(user, slot, &launch_cmd).await?;
        if !out.success() {
            return Err(OrchestratorError::ProcessStartup {
                reason: format!(
                    "launch command exited {}: {}",
                    out.exit_code,
                    out.stderr.trim()
                ),
                log_tail: None,
            });
        }
        let pid: u32 = out.stdout.trim().parse().map_err(|_| {
            OrchestratorError::ProcessStartup {
                reason: format!("could not parse pid from launch output {:?}", out.stdout.trim()),
                log_tail: None,
            }
        })?;

        debug!(user = %user, pid, port, "worker launched, waiting out startup grace");
        tokio::time::sleep(self.config.startup_grace).await;

        let probe = self
            .registry
            .exec_in_slot(user, slot, &format!("kill -0 {}", pid))
            .await?;
        if !probe.success() {
            let log_tail = self
                .log_tail(user, slot, self.config.failure_tail_lines)
                .await;
            return Err(OrchestratorError::ProcessStartup {
                reason: format!("worker (pid {}) exited during startup grace", pid),
                log_tail,
            });
        }

        let initial_log = self.log_tail(user, slot, self.config.snapshot_lines).await;
        info!(user = %user, pid, port, "worker running");

        Ok(RemoteProcess {
            user_id: user.clone(),
            pid: Some(pid),
            port,
            status: ProcessStatus::Running,
            started_at: Some(Utc::now()),
            last_error: None,
            initial_log,
        })
    }

    /// Best-effort tail of the worker log.
    async fn log_tail(&self, user: &UserId, slot: &mut UserSlot, lines: u32) -> Option<String> {
        let cmd = shell::tail_file(&self.remote.worker_log, lines);
        match self.registry.exec_in_slot(user, slot, &cmd).await {
            Ok(out) if out.success() => {
                let text = out.stdout.trim_end().to_string();
                (!text.is_empty()).then_some(text)
            }
            _ => None,
        }
    }

    /// Clear `port` of listeners. TERM first; `escalate` adds a KILL pass.
    /// Still-occupied afterwards is a `PortConflict`.
    pub(crate) async fn free_port(
        &self,
        user: &UserId,
        slot: &mut UserSlot,
        port: u16,
        escalate: bool,
    ) -> Result<(), OrchestratorError> {
        let listeners = self.port_listeners(user, slot, port).await?;
        if listeners.is_empty() {
            return Ok(());
        }

        info!(user = %user, port, pids = ?listeners, "port occupied, terminating listeners");
        for pid in &listeners {
            self.registry
                .exec_in_slot(user, slot, &format!("kill {}", pid))
                .await?;
        }
        tokio::time::sleep(self.config.port_release_wait).await;

        let mut remaining = self.port_listeners(user, slot, port).await?;
        if remaining.is_empty() {
            return Ok(());
        }

        if escalate {
            warn!(user = %user, port, pids = ?remaining, "listeners survived TERM, sending KILL");
            for pid in &remaining {
                self.registry
                    .exec_in_slot(user, slot, &format!("kill -9 {}", pid))
                    .await?;
            }
            tokio::time::sleep(self.config.port_release_wait).await;
            remaining = self.port_listeners(user, slot, port).await?;
            if remaining.is_empty() {
                return Ok(());
            }
        }

        Err(OrchestratorError::PortConflict { port })
    }

    async fn port_listeners(
        &self,
        user: &UserId,
        slot: &mut UserSlot,
        port: u16,
    ) -> Result<Vec<u32>, OrchestratorError> {
        let cmd = format!("lsof -t -i tcp:{} -s TCP:LISTEN 2>/dev/null || true", port);
        let out = self.registry.exec_in_slot(user, slot, &cmd).await?;
        Ok(out
            .stdout
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect())
    }

    /// Stop the user's tracked worker with TERM.
    ///
    /// A process that already died still transitions to stopped.
    pub async fn stop(&self, user: &UserId) -> Result<RemoteProcess, OrchestratorError> {
        let slot = self.registry.slot(user).await;
        let mut slot = slot.lock().await;
        self.stop_in_slot(user, &mut slot).await
    }

    pub(crate) async fn stop_in_slot(
        &self,
        user: &UserId,
        slot: &mut UserSlot,
    ) -> Result<RemoteProcess, OrchestratorError> {
        let Some(process) = slot.process.clone() else {
            return Err(OrchestratorError::NotRunning);
        };
        if process.status != ProcessStatus::Running {
            return Err(OrchestratorError::NotRunning);
        }

        if let Some(pid) = process.pid {
            let out = self
                .registry
                .exec_in_slot(user, slot, &format!("kill {}", pid))
                .await?;
            if !out.success() {
                debug!(user = %user, pid, "TERM found no process, marking stopped anyway");
            }
        }

        let record = slot
            .process
            .as_mut()
            .ok_or_else(|| OrchestratorError::Internal("process record vanished".to_string()))?;
        record.status = ProcessStatus::Stopped;
        info!(user = %user, pid = ?record.pid, "worker stopped");
        Ok(record.clone())
    }

    /// Current record with liveness re-probed against the devbox.
    pub async fn status(&self, user: &UserId) -> Result<RemoteProcess, OrchestratorError> {
        let slot = self.registry.slot(user).await;
        let mut slot = slot.lock().await;
        self.status_in_slot(user, &mut slot).await
    }

    pub(crate) async fn status_in_slot(
        &self,
        user: &UserId,
        slot: &mut UserSlot,
    ) -> Result<RemoteProcess, OrchestratorError> {
        let Some(process) = slot.process.clone() else {
            return Err(OrchestratorError::NotRunning);
        };

        if let Some(pid) = process.pid {
            let probe = self
                .registry
                .exec_in_slot(user, slot, &format!("kill -0 {}", pid))
                .await?;
            let record = slot
                .process
                .as_mut()
                .ok_or_else(|| OrchestratorError::Internal("process record vanished".to_string()))?;
            let observed = if probe.success() {
                ProcessStatus::Running
            } else {
                ProcessStatus::Stopped
            };
            if record.status != observed {
                info!(user = %user, pid, was = %record.status, now = %observed, "probe corrected process state");
                record.status = observed;
            }
            return Ok(record.clone());
        }

        Ok(process)
    }
}
