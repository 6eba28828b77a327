//! SSH transport over libssh2.
//!
//! libssh2 calls are blocking, so every operation runs on the blocking
//! thread pool. One `SshShell` owns one authenticated session; commands
//! serialize on the session mutex.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ssh2::{OpenFlags, OpenType, Session};
use tokio::task;
use tracing::debug;

use crate::errors::OrchestratorError;
use crate::transport::{RemoteShell, ShellConnector};
use crate::types::{AuthMethod, Credentials, ExecOutput};

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Deadline for TCP connect and the SSH handshake.
    pub connect_timeout: Duration,
    /// Deadline for a single command, including output drain.
    pub command_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(120),
        }
    }
}

/// Opens authenticated SSH sessions from credentials.
pub struct SshConnector {
    options: SshOptions,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteShell>, OrchestratorError> {
        let creds = credentials.clone();
        let options = self.options.clone();
        let session = task::spawn_blocking(move || open_session(&creds, &options))
            .await
            .map_err(|e| OrchestratorError::Internal(format!("ssh connect task: {}", e)))??;

        Ok(Box::new(SshShell {
            session: Arc::new(Mutex::new(session)),
            command_timeout: self.options.command_timeout,
        }))
    }
}

/// One authenticated session to a devbox.
pub struct SshShell {
    session: Arc<Mutex<Session>>,
    command_timeout: Duration,
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, command: &str) -> Result<ExecOutput, OrchestratorError> {
        let session = self.session.clone();
        let command = command.to_string();
        let timeout = self.command_timeout;
        task::spawn_blocking(move || {
            let session = session
                .lock()
                .map_err(|_| OrchestratorError::Internal("ssh session lock poisoned".to_string()))?;
            exec_blocking(&session, &command, timeout)
        })
        .await
        .map_err(|e| OrchestratorError::Internal(format!("ssh exec task: {}", e)))?
    }

    async fn upload(
        &self,
        local: &Path,
        remote_path: &str,
        mode: u32,
    ) -> Result<(), OrchestratorError> {
        let session = self.session.clone();
        let local = local.to_path_buf();
        let remote_path = remote_path.to_string();
        task::spawn_blocking(move || {
            let session = session
                .lock()
                .map_err(|_| OrchestratorError::Internal("ssh session lock poisoned".to_string()))?;
            upload_blocking(&session, &local, &remote_path, mode)
        })
        .await
        .map_err(|e| OrchestratorError::Internal(format!("ssh upload task: {}", e)))?
    }

    async fn is_alive(&self) -> bool {
        let session = self.session.clone();
        task::spawn_blocking(move || {
            let Ok(session) = session.lock() else {
                return false;
            };
            session.authenticated() && session.keepalive_send().is_ok()
        })
        .await
        .unwrap_or(false)
    }
}

fn open_session(
    credentials: &Credentials,
    options: &SshOptions,
) -> Result<Session, OrchestratorError> {
    let addr = (credentials.host.as_str(), credentials.port)
        .to_socket_addrs()
        .map_err(|e| {
            OrchestratorError::Connection(format!("resolve {}: {}", credentials.host, e))
        })?
        .next()
        .ok_or_else(|| {
            OrchestratorError::Connection(format!("no address for {}", credentials.host))
        })?;

    let tcp = TcpStream::connect_timeout(&addr, options.connect_timeout).map_err(|e| {
        OrchestratorError::Connection(format!(
            "tcp connect {}:{}: {}",
            credentials.host, credentials.port, e
        ))
    })?;

    let mut session = Session::new()
        .map_err(|e| OrchestratorError::Connection(format!("ssh session init: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(options.connect_timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| OrchestratorError::Connection(format!("ssh handshake: {}", e)))?;

    match &credentials.auth {
        AuthMethod::Password(password) => {
            session
                .userauth_password(&credentials.username, password)
                .map_err(|e| {
                    OrchestratorError::Authentication(format!(
                        "password auth for {}@{}: {}",
                        credentials.username, credentials.host, e
                    ))
                })?;
        }
        AuthMethod::PrivateKeyPath(path) => {
            let expanded = shellexpand::tilde(&path.to_string_lossy().into_owned()).into_owned();
            session
                .userauth_pubkey_file(&credentials.username, None, Path::new(&expanded), None)
                .map_err(|e| {
                    OrchestratorError::Authentication(format!(
                        "key auth for {}@{} with {}: {}",
                        credentials.username, credentials.host, expanded, e
                    ))
                })?;
        }
    }

    if !session.authenticated() {
        return Err(OrchestratorError::Authentication(format!(
            "{}@{} rejected the supplied credentials",
            credentials.username, credentials.host
        )));
    }

    // Commands get a longer deadline than the handshake.
    session.set_timeout(options.command_timeout.as_millis() as u32);
    session.set_keepalive(true, 30);
    debug!(
        host = %credentials.host,
        port = credentials.port,
        user = %credentials.username,
        "ssh session established"
    );
    Ok(session)
}

fn exec_blocking(
    session: &Session,
    command: &str,
    timeout: Duration,
) -> Result<ExecOutput, OrchestratorError> {
    let mut channel = session
        .channel_session()
        .map_err(|e| OrchestratorError::Connection(format!("open channel: {}", e)))?;
    channel
        .exec(command)
        .map_err(|e| OrchestratorError::CommandExecution(format!("exec: {}", e)))?;

    // Drain stdout and stderr together; reading them one after the other can
    // stall when the unread stream fills its window.
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut buf = [0u8; 8192];
    let deadline = Instant::now() + timeout;

    session.set_blocking(false);
    while !(stdout_done && stderr_done) {
        if Instant::now() > deadline {
            session.set_blocking(true);
            return Err(OrchestratorError::CommandExecution(format!(
                "command output not drained within {:?}",
                timeout
            )));
        }

        let mut progressed = false;

        if !stdout_done {
            match channel.read(&mut buf) {
                Ok(0) => stdout_done = true,
                Ok(n) => {
                    stdout.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    session.set_blocking(true);
                    return Err(OrchestratorError::CommandExecution(format!(
                        "read stdout: {}",
                        e
                    )));
                }
            }
        }

        if !stderr_done {
            match channel.stderr().read(&mut buf) {
                Ok(0) => stderr_done = true,
                Ok(n) => {
                    stderr.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    session.set_blocking(true);
                    return Err(OrchestratorError::CommandExecution(format!(
                        "read stderr: {}",
                        e
                    )));
                }
            }
        }

        if !progressed {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
    session.set_blocking(true);

    channel
        .wait_close()
        .map_err(|e| OrchestratorError::CommandExecution(format!("close channel: {}", e)))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| OrchestratorError::CommandExecution(format!("exit status: {}", e)))?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    })
}

fn upload_blocking(
    session: &Session,
    local: &Path,
    remote_path: &str,
    mode: u32,
) -> Result<(), OrchestratorError> {
    let mut file = std::fs::File::open(local).map_err(|e| {
        OrchestratorError::Deployment(format!("open local artifact {}: {}", local.display(), e))
    })?;
    let sftp = session
        .sftp()
        .map_err(|e| OrchestratorError::Deployment(format!("sftp init: {}", e)))?;
    let mut remote = sftp
        .open_mode(
            Path::new(remote_path),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            mode as i32,
            OpenType::File,
        )
        .map_err(|e| OrchestratorError::Deployment(format!("open remote {}: {}", remote_path, e)))?;
    let bytes = std::io::copy(&mut file, &mut remote)
        .map_err(|e| OrchestratorError::Deployment(format!("write {}: {}", remote_path, e)))?;
    debug!(remote = remote_path, bytes, "artifact uploaded");
    Ok(())
}
