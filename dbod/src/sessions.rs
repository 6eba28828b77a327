//! Per-user devbox sessions.
//!
//! The registry hands out one `UserSlot` per user; the slot's mutex is the
//! serialization point for everything that touches that user's session or
//! supervised process. Commands run with the session's stored working
//! directory as context, and directory changes survive across commands even
//! though every remote invocation runs in a fresh shell.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use dbo_common::errors::OrchestratorError;
use dbo_common::shell;
use dbo_common::transport::{RemoteShell, ShellConnector};
use dbo_common::types::{CommandRecord, Credentials, ExecOutput, ProcessStatus, RemoteProcess, UserId};

use crate::config::RemoteLayout;
use crate::targets::ResolvedTarget;

/// Connection state for one user.
pub struct UserSession {
    pub transport: Option<Box<dyn RemoteShell>>,
    pub connected: bool,
    /// Working directory applied to every command.
    pub cwd: Option<String>,
    /// Bounded in-memory command history, secrets masked.
    pub command_log: VecDeque<CommandRecord>,
    /// Source of truth for silent reconnects. Cleared on any connection
    /// failure and on explicit disconnect.
    pub active_credentials: Option<Credentials>,
}

impl UserSession {
    fn new() -> Self {
        Self {
            transport: None,
            connected: false,
            cwd: None,
            command_log: VecDeque::new(),
            active_credentials: None,
        }
    }
}

/// All orchestrator state for one user. The slot mutex serializes session,
/// deployment, and supervision operations for that user.
pub struct UserSlot {
    pub session: UserSession,
    pub process: Option<RemoteProcess>,
    pub target: Option<ResolvedTarget>,
}

impl UserSlot {
    fn new() -> Self {
        Self {
            session: UserSession::new(),
            process: None,
            target: None,
        }
    }
}

/// Result of a connect call.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    /// True when the existing session matched and was kept as-is.
    pub reused: bool,
    pub cwd: Option<String>,
}

/// Read-only view of one session for the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub user_id: UserId,
    pub connected: bool,
    pub host: Option<String>,
    pub username: Option<String>,
    pub cwd: Option<String>,
    pub project: Option<String>,
    pub recent_commands: Vec<CommandRecord>,
    pub process: Option<RemoteProcess>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub user_id: UserId,
    pub connected: bool,
    pub cwd: Option<String>,
    pub process_status: Option<ProcessStatus>,
}

/// Registry of per-user sessions and process records.
pub struct SessionRegistry {
    connector: Arc<dyn ShellConnector>,
    slots: RwLock<HashMap<UserId, Arc<Mutex<UserSlot>>>>,
    remote: RemoteLayout,
    log_capacity: usize,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn ShellConnector>,
        remote: RemoteLayout,
        log_capacity: usize,
    ) -> Self {
        Self {
            connector,
            slots: RwLock::new(HashMap::new()),
            remote,
            log_capacity,
        }
    }

    /// Slot for a user, created on first reference.
    pub async fn slot(&self, user: &UserId) -> Arc<Mutex<UserSlot>> {
        if let Some(slot) = self.slots.read().await.get(user) {
            return slot.clone();
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(user.clone())
            .or_insert_with(|| Arc::new(Mutex::new(UserSlot::new())))
            .clone()
    }

    /// Establish (or reuse) the user's session.
    ///
    /// A connect with the credentials of an already-live session is a no-op.
    /// Anything else tears down the old transport, opens a new one, and
    /// seeds the working directory from a `pwd` probe.
    pub async fn connect(
        &self,
        user: &UserId,
        credentials: Credentials,
        target: Option<ResolvedTarget>,
    ) -> Result<ConnectOutcome, OrchestratorError> {
        credentials
            .validate()
            .map_err(OrchestratorError::Authentication)?;

        let slot = self.slot(user).await;
        let mut slot = slot.lock().await;

        if slot.session.connected
            && slot.session.active_credentials.as_ref() == Some(&credentials)
        {
            let alive = match &slot.session.transport {
                Some(t) => t.is_alive().await,
                None => false,
            };
            if alive {
                debug!(user = %user, "connect reused existing session");
                if let Some(target) = target {
                    slot.target = Some(target);
                }
                return Ok(ConnectOutcome {
                    reused: true,
                    cwd: slot.session.cwd.clone(),
                });
            }
        }

        slot.session.transport = None;
        slot.session.connected = false;
        slot.session.cwd = None;

        let transport = match self.connector.connect(&credentials).await {
            Ok(t) => t,
            Err(e) => {
                slot.session.active_credentials = None;
                return Err(e);
            }
        };

        let cwd = match transport.exec("pwd").await {
            Ok(out) if out.success() => out.stdout.trim().to_string(),
            Ok(out) => {
                slot.session.active_credentials = None;
                return Err(OrchestratorError::Connection(format!(
                    "pwd probe exited {}: {}",
                    out.exit_code,
                    out.stderr.trim()
                )));
            }
            Err(e) => {
                slot.session.active_credentials = None;
                return Err(OrchestratorError::Connection(format!("pwd probe: {}", e)));
            }
        };

        slot.session.transport = Some(transport);
        slot.session.connected = true;
        slot.session.cwd = Some(cwd.clone());
        slot.session.active_credentials = Some(credentials);
        if let Some(target) = target {
            slot.target = Some(target);
        }

        info!(user = %user, cwd = %cwd, "session connected");
        Ok(ConnectOutcome {
            reused: false,
            cwd: Some(cwd),
        })
    }

    /// Run a user command in the session.
    pub async fn execute(
        &self,
        user: &UserId,
        command: &str,
    ) -> Result<ExecOutput, OrchestratorError> {
        let slot = self.slot(user).await;
        let mut slot = slot.lock().await;
        self.execute_in_slot(user, &mut slot, command).await
    }

    /// Run a user command inside an already-locked slot, applying the stored
    /// working directory and tracking directory changes.
    pub(crate) async fn execute_in_slot(
        &self,
        user: &UserId,
        slot: &mut UserSlot,
        command: &str,
    ) -> Result<ExecOutput, OrchestratorError> {
        let contextual = match &slot.session.cwd {
            Some(cwd) => shell::with_cwd(cwd, command),
            None => command.to_string(),
        };

        if shell::is_cd_command(command) {
            let probed = shell::with_pwd_probe(&contextual);
            let out = self
                .exec_raw(user, &mut slot.session, &probed, command)
                .await?;
            if out.success() {
                // The probe's pwd is the last non-empty stdout line.
                if let Some(dir) = out.stdout.lines().rev().find(|l| !l.trim().is_empty()) {
                    slot.session.cwd = Some(dir.trim().to_string());
                }
            }
            return Ok(out);
        }

        self.exec_raw(user, &mut slot.session, &contextual, command)
            .await
    }

    /// Run a plumbing command as-is inside an already-locked slot.
    pub(crate) async fn exec_in_slot(
        &self,
        user: &UserId,
        slot: &mut UserSlot,
        command: &str,
    ) -> Result<ExecOutput, OrchestratorError> {
        self.exec_raw(user, &mut slot.session, command, command).await
    }

    /// Make sure the slot has a usable transport, reconnecting at most once
    /// from stored credentials.
    pub(crate) async fn ensure_transport_in_slot(
        &self,
        user: &UserId,
        slot: &mut UserSlot,
    ) -> Result<(), OrchestratorError> {
        self.ensure_transport(user, &mut slot.session).await
    }

    async fn exec_raw(
        &self,
        user: &UserId,
        session: &mut UserSession,
        wire_command: &str,
        log_label: &str,
    ) -> Result<ExecOutput, OrchestratorError> {
        self.ensure_transport(user, session).await?;

        let result = match &session.transport {
            Some(transport) => transport.exec(wire_command).await,
            None => Err(OrchestratorError::Connection("no transport".to_string())),
        };

        let record = match &result {
            Ok(out) => CommandRecord {
                timestamp: Utc::now(),
                command: shell::mask_secrets(log_label),
                stdout: out.stdout.clone(),
                stderr: out.stderr.clone(),
                success: out.success(),
            },
            Err(e) => CommandRecord {
                timestamp: Utc::now(),
                command: shell::mask_secrets(log_label),
                stdout: String::new(),
                stderr: e.to_string(),
                success: false,
            },
        };
        session.command_log.push_back(record.clone());
        while session.command_log.len() > self.log_capacity {
            session.command_log.pop_front();
        }

        match result {
            Ok(out) => {
                self.mirror_record(user, session, &record).await;
                Ok(out)
            }
            Err(e) => {
                if matches!(e, OrchestratorError::Connection(_)) {
                    // Transport is gone; the next command gets one reconnect.
                    session.transport = None;
                    session.connected = false;
                }
                Err(e)
            }
        }
    }

    /// Append one record to the remote command-log file. Never fails the
    /// calling command.
    async fn mirror_record(&self, user: &UserId, session: &UserSession, record: &CommandRecord) {
        let Some(transport) = &session.transport else {
            return;
        };
        let line = format!(
            "[{}] {} => {}",
            record.timestamp.to_rfc3339(),
            record.command,
            if record.success { "ok" } else { "failed" }
        );
        let cmd = shell::append_line(&self.remote.command_log, &line);
        match transport.exec(&cmd).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(
                user = %user,
                "failed to mirror command log to remote: {}",
                out.stderr.trim()
            ),
            Err(e) => warn!(user = %user, "failed to mirror command log to remote: {}", e),
        }
    }

    async fn ensure_transport(
        &self,
        user: &UserId,
        session: &mut UserSession,
    ) -> Result<(), OrchestratorError> {
        if session.connected {
            let alive = match &session.transport {
                Some(t) => t.is_alive().await,
                None => false,
            };
            if alive {
                return Ok(());
            }
        }
        session.transport = None;
        session.connected = false;

        let Some(credentials) = session.active_credentials.clone() else {
            return Err(OrchestratorError::Connection(
                "no active session and no stored credentials".to_string(),
            ));
        };

        info!(user = %user, "session transport lost, reconnecting");
        match self.connector.connect(&credentials).await {
            Ok(transport) => {
                session.transport = Some(transport);
                session.connected = true;
                Ok(())
            }
            Err(e) => {
                session.active_credentials = None;
                Err(e)
            }
        }
    }

    /// Tear down the user's session. The in-memory command log is retained
    /// for inspection.
    pub async fn disconnect(&self, user: &UserId) {
        let slot = self.slot(user).await;
        let mut slot = slot.lock().await;
        slot.session.transport = None;
        slot.session.connected = false;
        slot.session.cwd = None;
        slot.session.active_credentials = None;
        info!(user = %user, "session disconnected");
    }

    /// The deployment target stored with the user's session, if any.
    pub async fn target_of(&self, user: &UserId) -> Option<ResolvedTarget> {
        let slot = self.slot(user).await;
        let slot = slot.lock().await;
        slot.target.clone()
    }

    pub async fn session_view(&self, user: &UserId, recent: usize) -> SessionView {
        let slot = self.slot(user).await;
        let slot = slot.lock().await;
        let start = slot.session.command_log.len().saturating_sub(recent);
        SessionView {
            user_id: user.clone(),
            connected: slot.session.connected,
            host: slot
                .session
                .active_credentials
                .as_ref()
                .map(|c| c.host.clone()),
            username: slot
                .session
                .active_credentials
                .as_ref()
                .map(|c| c.username.clone()),
            cwd: slot.session.cwd.clone(),
            project: slot.target.as_ref().map(|t| t.project.clone()),
            recent_commands: slot.session.command_log.iter().skip(start).cloned().collect(),
            process: slot.process.clone(),
        }
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let slots: Vec<(UserId, Arc<Mutex<UserSlot>>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut out = Vec::with_capacity(slots.len());
        for (user, slot) in slots {
            let slot = slot.lock().await;
            out.push(SessionSummary {
                user_id: user,
                connected: slot.session.connected,
                cwd: slot.session.cwd.clone(),
                process_status: slot.process.as_ref().map(|p| p.status),
            });
        }
        out
    }
}
