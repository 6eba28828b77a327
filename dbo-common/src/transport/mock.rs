//! In-memory devbox used by tests.
//!
//! `MockHost` models just enough of a remote box for the daemon's command
//! recipes: a directory tree, files with an execute bit, a process table
//! with port bindings, and an upload counter. Connection and auth failures
//! can be scripted, and dropping all transports simulates a network cut.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::errors::OrchestratorError;
use crate::transport::{RemoteShell, ShellConnector};
use crate::types::{Credentials, ExecOutput};

/// A file on the mock devbox.
#[derive(Debug, Clone)]
pub struct MockFile {
    pub content: Vec<u8>,
    pub executable: bool,
}

#[derive(Debug, Clone)]
struct MockProc {
    port: Option<u16>,
    alive: bool,
}

#[derive(Debug, Default)]
struct HostState {
    initial_dir: String,
    dirs: HashSet<String>,
    files: HashMap<String, MockFile>,
    procs: HashMap<u32, MockProc>,
    next_pid: u32,
    uploads: u32,
    launches: u32,
    exec_log: Vec<String>,
    connect_attempts: u32,
    fail_next_connects: u32,
    reject_auth: bool,
    generation: u64,
    fail_log_appends: bool,
    corrupt_uploads: bool,
    unkillable: HashSet<u32>,
    workers_die_on_start: bool,
    responses: HashMap<String, ExecOutput>,
}

/// Handle to one simulated devbox. Cloning shares the same box.
#[derive(Clone)]
pub struct MockHost {
    state: Arc<Mutex<HostState>>,
}

impl MockHost {
    pub fn new(initial_dir: &str) -> Self {
        let mut state = HostState {
            initial_dir: initial_dir.to_string(),
            next_pid: 4000,
            ..Default::default()
        };
        state.dirs.insert(initial_dir.to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connector handing out transports to this box.
    pub fn connector(&self) -> MockConnector {
        MockConnector { host: self.clone() }
    }

    pub fn add_dir(&self, path: &str) {
        self.state().dirs.insert(path.to_string());
    }

    pub fn add_file(&self, path: &str, content: &[u8], executable: bool) {
        self.state().files.insert(
            path.to_string(),
            MockFile {
                content: content.to_vec(),
                executable,
            },
        );
    }

    pub fn file(&self, path: &str) -> Option<MockFile> {
        self.state().files.get(path).cloned()
    }

    /// Register a foreign process listening on `port`, returning its pid.
    pub fn listen_on_port(&self, port: u16) -> u32 {
        let mut st = self.state();
        let pid = st.next_pid;
        st.next_pid += 1;
        st.procs.insert(
            pid,
            MockProc {
                port: Some(port),
                alive: true,
            },
        );
        pid
    }

    pub fn pid_alive(&self, pid: u32) -> bool {
        self.state().procs.get(&pid).map(|p| p.alive).unwrap_or(false)
    }

    /// Kill a process out from under the orchestrator.
    pub fn kill_pid(&self, pid: u32) {
        if let Some(proc) = self.state().procs.get_mut(&pid) {
            proc.alive = false;
        }
    }

    /// Number of file transfers the box has received.
    pub fn upload_count(&self) -> u32 {
        self.state().uploads
    }

    /// Number of detached worker launches the box has seen.
    pub fn launch_count(&self) -> u32 {
        self.state().launches
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// Every raw command the box executed, in order.
    pub fn exec_history(&self) -> Vec<String> {
        self.state().exec_log.clone()
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state().fail_next_connects = n;
    }

    pub fn reject_auth(&self, reject: bool) {
        self.state().reject_auth = reject;
    }

    /// Invalidate every open transport, as a network cut would.
    pub fn drop_connections(&self) {
        self.state().generation += 1;
    }

    /// Make appends to remote files fail, as a read-only filesystem would.
    pub fn fail_log_appends(&self, fail: bool) {
        self.state().fail_log_appends = fail;
    }

    /// Store garbage instead of uploaded content.
    pub fn corrupt_uploads(&self, corrupt: bool) {
        self.state().corrupt_uploads = corrupt;
    }

    /// Make a pid ignore TERM and report EPERM on KILL.
    pub fn make_unkillable(&self, pid: u32) {
        self.state().unkillable.insert(pid);
    }

    /// Make launched workers exit immediately after spawn.
    pub fn workers_die_on_start(&self, die: bool) {
        self.state().workers_die_on_start = die;
    }

    /// Script the output of an exact command string.
    pub fn script_response(&self, command: &str, output: ExecOutput) {
        self.state().responses.insert(command.to_string(), output);
    }
}

/// Opens transports to a `MockHost`.
pub struct MockConnector {
    host: MockHost,
}

#[async_trait]
impl ShellConnector for MockConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteShell>, OrchestratorError> {
        let mut st = self.host.state();
        st.connect_attempts += 1;
        if st.fail_next_connects > 0 {
            st.fail_next_connects -= 1;
            return Err(OrchestratorError::Connection(
                "simulated connection failure".to_string(),
            ));
        }
        if st.reject_auth {
            return Err(OrchestratorError::Authentication(format!(
                "{}@{} rejected the supplied credentials",
                credentials.username, credentials.host
            )));
        }
        let generation = st.generation;
        drop(st);
        Ok(Box::new(MockShell {
            host: self.host.clone(),
            generation,
        }))
    }
}

struct MockShell {
    host: MockHost,
    generation: u64,
}

#[async_trait]
impl RemoteShell for MockShell {
    async fn exec(&self, command: &str) -> Result<ExecOutput, OrchestratorError> {
        let mut st = self.host.state();
        if st.generation != self.generation {
            return Err(OrchestratorError::Connection("transport closed".to_string()));
        }
        st.exec_log.push(command.to_string());
        Ok(interpret(&mut st, command, None))
    }

    async fn upload(
        &self,
        local: &Path,
        remote_path: &str,
        mode: u32,
    ) -> Result<(), OrchestratorError> {
        let mut st = self.host.state();
        if st.generation != self.generation {
            return Err(OrchestratorError::Connection("transport closed".to_string()));
        }
        let content = std::fs::read(local).map_err(|e| {
            OrchestratorError::Deployment(format!("open local artifact {}: {}", local.display(), e))
        })?;
        let content = if st.corrupt_uploads {
            b"corrupted".to_vec()
        } else {
            content
        };
        st.uploads += 1;
        st.files.insert(
            remote_path.to_string(),
            MockFile {
                content,
                executable: mode & 0o111 != 0,
            },
        );
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.host.state().generation == self.generation
    }
}

fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: if stdout.is_empty() {
            String::new()
        } else {
            format!("{}\n", stdout)
        },
        stderr: String::new(),
        exit_code: 0,
    }
}

fn fail(exit_code: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: if stderr.is_empty() {
            String::new()
        } else {
            format!("{}\n", stderr)
        },
        exit_code,
    }
}

/// Strip one layer of single quotes, undoing POSIX shell quoting.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        s[1..s.len() - 1].replace("'\\''", "'")
    } else {
        s.to_string()
    }
}

fn resolve_dir(st: &HostState, dir: &str, cwd: Option<&str>) -> Option<String> {
    let full = if dir.starts_with('/') {
        dir.to_string()
    } else {
        let base = cwd.unwrap_or(&st.initial_dir);
        format!("{}/{}", base.trim_end_matches('/'), dir)
    };
    st.dirs.contains(&full).then_some(full)
}

fn interpret(st: &mut HostState, command: &str, cwd: Option<&str>) -> ExecOutput {
    let command = command.trim();

    if let Some(rest) = command.strip_prefix("cd ") {
        if let Some((dir_part, tail)) = rest.split_once(" && ") {
            let dir = unquote(dir_part);
            return match resolve_dir(st, &dir, cwd) {
                Some(full) => interpret(st, tail, Some(&full)),
                None => fail(1, &format!("sh: cd: {}: No such file or directory", dir)),
            };
        }
        let dir = unquote(rest);
        return match resolve_dir(st, &dir, cwd) {
            Some(_) => ok(""),
            None => fail(1, &format!("sh: cd: {}: No such file or directory", dir)),
        };
    }

    if command == "pwd" {
        return ok(cwd.unwrap_or(&st.initial_dir));
    }
    if command == "true" {
        return ok("");
    }
    if let Some(rest) = command.strip_prefix("echo ") {
        return ok(&unquote(rest));
    }

    if let Some(rest) = command.strip_prefix("test -f ") {
        return if st.files.contains_key(&unquote(rest)) {
            ok("")
        } else {
            fail(1, "")
        };
    }
    if let Some(rest) = command.strip_prefix("test -x ") {
        let executable = st
            .files
            .get(&unquote(rest))
            .map(|f| f.executable)
            .unwrap_or(false);
        return if executable { ok("") } else { fail(1, "") };
    }
    if let Some(rest) = command.strip_prefix("chmod +x ") {
        let path = unquote(rest);
        return match st.files.get_mut(&path) {
            Some(file) => {
                file.executable = true;
                ok("")
            }
            None => fail(
                1,
                &format!("chmod: cannot access '{}': No such file or directory", path),
            ),
        };
    }
    if let Some(rest) = command.strip_prefix("sha256sum ") {
        let path = unquote(rest);
        return match st.files.get(&path) {
            Some(file) => {
                let digest = Sha256::digest(&file.content);
                ok(&format!("{:x}  {}", digest, path))
            }
            None => fail(1, &format!("sha256sum: {}: No such file or directory", path)),
        };
    }

    if command.starts_with("lsof ") {
        let port = command
            .split("tcp:")
            .nth(1)
            .and_then(|s| {
                s.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse::<u16>()
                    .ok()
            })
            .unwrap_or(0);
        let mut pids: Vec<u32> = st
            .procs
            .iter()
            .filter(|(_, p)| p.alive && p.port == Some(port))
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        let out = pids
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        return ok(&out);
    }

    if let Some(rest) = command.strip_prefix("kill -0 ") {
        return match parse_pid(rest) {
            Some(pid) if st.procs.get(&pid).map(|p| p.alive).unwrap_or(false) => ok(""),
            Some(pid) => fail(1, &format!("kill: ({}): No such process", pid)),
            None => fail(1, "kill: bad pid"),
        };
    }
    if let Some(rest) = command.strip_prefix("kill -9 ") {
        return match parse_pid(rest) {
            Some(pid) if st.unkillable.contains(&pid) => {
                fail(1, &format!("kill: ({}): Operation not permitted", pid))
            }
            Some(pid) if st.procs.contains_key(&pid) => {
                if let Some(proc) = st.procs.get_mut(&pid) {
                    proc.alive = false;
                }
                ok("")
            }
            Some(pid) => fail(1, &format!("kill: ({}): No such process", pid)),
            None => fail(1, "kill: bad pid"),
        };
    }
    if let Some(rest) = command.strip_prefix("kill ") {
        return match parse_pid(rest) {
            // A TERM-ignoring process: kill succeeds, nothing dies.
            Some(pid) if st.unkillable.contains(&pid) => ok(""),
            Some(pid) if st.procs.get(&pid).map(|p| p.alive).unwrap_or(false) => {
                if let Some(proc) = st.procs.get_mut(&pid) {
                    proc.alive = false;
                }
                ok("")
            }
            Some(pid) => fail(1, &format!("kill: ({}): No such process", pid)),
            None => fail(1, "kill: bad pid"),
        };
    }

    if command.starts_with("nohup ") {
        return launch(st, command);
    }

    if let Some(rest) = command.strip_prefix("tail -n ") {
        let mut parts = rest.splitn(2, ' ');
        let n: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(10);
        let path = parts
            .next()
            .map(|s| s.trim_end_matches(" 2>/dev/null || true"))
            .map(unquote)
            .unwrap_or_default();
        let content = st
            .files
            .get(&path)
            .map(|f| String::from_utf8_lossy(&f.content).into_owned())
            .unwrap_or_default();
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(n);
        // `|| true` swallows missing files.
        return ok(&lines[start..].join("\n"));
    }

    if command.starts_with("printf ") && command.contains(" >> ") {
        if st.fail_log_appends {
            return fail(1, "printf: write error: Permission denied");
        }
        if let Some((left, path_part)) = command.split_once(" >> ") {
            let line = unquote(left.trim_start_matches("printf '%s\\n'"));
            let path = unquote(path_part);
            let file = st.files.entry(path).or_insert_with(|| MockFile {
                content: Vec::new(),
                executable: false,
            });
            file.content.extend_from_slice(line.as_bytes());
            file.content.push(b'\n');
            return ok("");
        }
    }

    if let Some(resp) = st.responses.get(command) {
        return resp.clone();
    }

    let verb = command.split_whitespace().next().unwrap_or(command);
    fail(127, &format!("sh: {}: command not found", verb))
}

fn parse_pid(s: &str) -> Option<u32> {
    s.split_whitespace().next()?.parse().ok()
}

/// `nohup BIN --port PORT > LOG 2>&1 < /dev/null & echo $!`
fn launch(st: &mut HostState, command: &str) -> ExecOutput {
    let bin = command
        .strip_prefix("nohup ")
        .and_then(|s| s.split(" --port").next())
        .map(unquote)
        .unwrap_or_default();
    let port = command
        .split("--port ")
        .nth(1)
        .and_then(|s| s.split_whitespace().next())
        .and_then(|s| s.parse::<u16>().ok());
    let log = command
        .split("> ")
        .nth(1)
        .and_then(|s| s.split(" 2>&1").next())
        .map(unquote);

    let executable = st.files.get(&bin).map(|f| f.executable).unwrap_or(false);
    let alive = executable && !st.workers_die_on_start;

    let pid = st.next_pid;
    st.next_pid += 1;
    st.launches += 1;
    st.procs.insert(pid, MockProc { port, alive });

    if let Some(log) = log {
        let content = if alive {
            format!("worker listening on port {}\n", port.unwrap_or(0))
        } else {
            "fatal: failed to start, exiting\n".to_string()
        };
        st.files.insert(
            log,
            MockFile {
                content: content.into_bytes(),
                executable: false,
            },
        );
    }

    ok(&pid.to_string())
}
