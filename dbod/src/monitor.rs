//! Worker health checking and the per-user monitor loop.
//!
//! A monitor loop wakes on a fixed interval, probes the worker's `/health`
//! endpoint, and after enough consecutive failures runs recovery passes with
//! a fixed delay between attempts. Loops are stopped cooperatively through a
//! watch channel; a loop mid-recovery finishes the pass before exiting.
//! Cycle errors are logged and swallowed so one bad probe never kills the
//! loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use dbo_common::errors::OrchestratorError;
use dbo_common::types::UserId;

use crate::config::MonitorSettings;
use crate::recovery::RecoveryEngine;
use crate::sessions::SessionRegistry;

const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

/// Raw response from one HTTP probe.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
}

/// HTTP GET seam so the checker can be tested without a live worker.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<ProbeResponse, OrchestratorError>;
}

/// Blocking-client probe run on the blocking pool.
pub struct UreqProbe;

#[async_trait]
impl HealthProbe for UreqProbe {
    async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<ProbeResponse, OrchestratorError> {
        let url = url.to_string();
        tokio::task::spawn_blocking(move || {
            let agent: ureq::Agent = ureq::Agent::config_builder()
                .timeout_global(Some(timeout))
                .http_status_as_error(false)
                .build()
                .into();
            let mut response = agent.get(&url).call().map_err(|e| match e {
                ureq::Error::Timeout(_) => OrchestratorError::HealthCheckTimeout { timeout },
                other => OrchestratorError::Connection(format!("GET {}: {}", url, other)),
            })?;
            let status = response.status().as_u16();
            // Body is informational; a broken body never fails the probe.
            let body = response.body_mut().read_to_string().unwrap_or_default();
            Ok(ProbeResponse { status, body })
        })
        .await
        .map_err(|e| OrchestratorError::Internal(format!("health probe task failed: {}", e)))?
    }
}

/// Outcome of one health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: Option<u16>,
    pub response_time_ms: u64,
    pub error: Option<String>,
    /// Recent worker log lines fetched after a failed check.
    pub diagnostics: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    fn success(status: u16, response_time_ms: u64) -> Self {
        Self {
            healthy: true,
            status: Some(status),
            response_time_ms,
            error: None,
            diagnostics: None,
            checked_at: Utc::now(),
        }
    }

    fn failure(status: Option<u16>, response_time_ms: u64, error: String) -> Self {
        Self {
            healthy: false,
            status,
            response_time_ms,
            error: Some(error),
            diagnostics: None,
            checked_at: Utc::now(),
        }
    }
}

/// Probes a worker's health endpoint. Only a 2xx answer within the deadline
/// counts as healthy.
pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
    log_lines: u32,
}

impl HealthChecker {
    pub fn new(probe: Arc<dyn HealthProbe>, timeout: Duration, log_lines: u32) -> Self {
        Self {
            probe,
            timeout,
            log_lines,
        }
    }

    /// Single bounded check of `{base_url}/health`.
    pub async fn check(&self, base_url: &str) -> HealthReport {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        let started = Instant::now();
        match self.probe.fetch(&url, self.timeout).await {
            Ok(resp) => {
                let elapsed = started.elapsed().as_millis() as u64;
                if (200..300).contains(&resp.status) {
                    HealthReport::success(resp.status, elapsed)
                } else {
                    HealthReport::failure(
                        Some(resp.status),
                        elapsed,
                        format!("health endpoint returned status {}", resp.status),
                    )
                }
            }
            Err(e) => {
                HealthReport::failure(None, started.elapsed().as_millis() as u64, e.to_string())
            }
        }
    }

    /// Check, and on failure pull recent worker log lines for the report.
    /// Diagnostics are best-effort and never change the verdict.
    pub async fn check_with_diagnostics(&self, base_url: &str) -> HealthReport {
        let mut report = self.check(base_url).await;
        if !report.healthy {
            let url = format!(
                "{}/logs?lines={}",
                base_url.trim_end_matches('/'),
                self.log_lines
            );
            match self.probe.fetch(&url, self.timeout).await {
                Ok(resp) if (200..300).contains(&resp.status) => {
                    report.diagnostics = Some(resp.body);
                }
                Ok(resp) => {
                    debug!(status = resp.status, "worker log endpoint unavailable");
                }
                Err(e) => debug!("could not fetch worker logs: {}", e),
            }
        }
        report
    }
}

/// Acknowledgement returned when a monitor loop is scheduled.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStarted {
    pub monitoring_started: bool,
    pub interval_ms: u64,
    pub max_retries: u32,
}

struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the per-user monitor loops.
pub struct Monitor {
    registry: Arc<SessionRegistry>,
    checker: Arc<HealthChecker>,
    recovery: Arc<RecoveryEngine>,
    loops: Mutex<HashMap<UserId, MonitorHandle>>,
    settings: MonitorSettings,
}

impl Monitor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        checker: Arc<HealthChecker>,
        recovery: Arc<RecoveryEngine>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            registry,
            checker,
            recovery,
            loops: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// One on-demand health check against the user's worker, outside any
    /// monitor loop.
    pub async fn check_health(&self, user: &UserId) -> Result<HealthReport, OrchestratorError> {
        let slot = self.registry.slot(user).await;
        let base_url = {
            let slot = slot.lock().await;
            slot.target.as_ref().map(|t| t.base_url.clone())
        };
        let Some(base_url) = base_url else {
            return Err(OrchestratorError::UnknownTarget(format!(
                "no deployment target configured for user {}",
                user
            )));
        };
        Ok(self.checker.check_with_diagnostics(&base_url).await)
    }

    /// Schedule the monitor loop for a user, replacing any existing loop.
    pub async fn start(
        &self,
        user: &UserId,
        interval: Duration,
        max_retries: u32,
    ) -> Result<MonitorStarted, OrchestratorError> {
        let slot = self.registry.slot(user).await;
        {
            let slot = slot.lock().await;
            if !slot.session.connected && slot.session.active_credentials.is_none() {
                return Err(OrchestratorError::Connection(
                    "monitoring requires an active session".to_string(),
                ));
            }
            if slot.target.is_none() {
                return Err(OrchestratorError::UnknownTarget(format!(
                    "no deployment target configured for user {}",
                    user
                )));
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = LoopCtx {
            user: user.clone(),
            registry: self.registry.clone(),
            checker: self.checker.clone(),
            recovery: self.recovery.clone(),
            interval,
            max_retries,
            failure_threshold: self.settings.failure_threshold,
            recovery_delay: Duration::from_millis(self.settings.recovery_delay_ms),
        };
        let task = tokio::spawn(monitor_loop(ctx, stop_rx));

        let mut loops = self.loops.lock().await;
        if let Some(old) = loops.insert(
            user.clone(),
            MonitorHandle {
                stop: stop_tx,
                task,
            },
        ) {
            info!(user = %user, "replacing existing monitor loop");
            let _ = old.stop.send(true);
        }

        Ok(MonitorStarted {
            monitoring_started: true,
            interval_ms: interval.as_millis() as u64,
            max_retries,
        })
    }

    /// Signal the user's loop to stop. Returns whether a loop was present.
    /// The loop exits at its next checkpoint rather than being aborted.
    pub async fn stop(&self, user: &UserId) -> bool {
        match self.loops.lock().await.remove(user) {
            Some(handle) => {
                let _ = handle.stop.send(true);
                info!(user = %user, "monitor loop signalled to stop");
                true
            }
            None => false,
        }
    }

    pub async fn is_monitoring(&self, user: &UserId) -> bool {
        self.loops.lock().await.contains_key(user)
    }

    pub async fn active_count(&self) -> usize {
        self.loops.lock().await.len()
    }

    /// Stop every loop and wait briefly for each to wind down.
    pub async fn stop_all(&self) {
        let handles: Vec<(UserId, MonitorHandle)> =
            self.loops.lock().await.drain().collect();
        for (_, handle) in &handles {
            let _ = handle.stop.send(true);
        }
        for (user, handle) in handles {
            if tokio::time::timeout(SHUTDOWN_WAIT, handle.task).await.is_err() {
                warn!(user = %user, "monitor loop still busy at shutdown");
            }
        }
    }
}

struct LoopCtx {
    user: UserId,
    registry: Arc<SessionRegistry>,
    checker: Arc<HealthChecker>,
    recovery: Arc<RecoveryEngine>,
    interval: Duration,
    max_retries: u32,
    failure_threshold: u32,
    recovery_delay: Duration,
}

async fn monitor_loop(ctx: LoopCtx, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(ctx.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;

    'outer: loop {
        tokio::select! {
            _ = stop_rx.changed() => break 'outer,
            _ = ticker.tick() => {}
        }

        let base_url = {
            let slot = ctx.registry.slot(&ctx.user).await;
            let slot = slot.lock().await;
            match &slot.target {
                Some(target) => target.base_url.clone(),
                None => {
                    debug!(user = %ctx.user, "monitor cycle skipped, no target");
                    continue;
                }
            }
        };

        let report = ctx.checker.check_with_diagnostics(&base_url).await;
        if report.healthy {
            if consecutive_failures > 0 {
                info!(user = %ctx.user, "worker healthy again");
            }
            consecutive_failures = 0;
            continue;
        }

        consecutive_failures += 1;
        warn!(
            user = %ctx.user,
            failures = consecutive_failures,
            error = report.error.as_deref().unwrap_or("unknown"),
            "health check failed"
        );
        if let Some(diagnostics) = &report.diagnostics {
            debug!(user = %ctx.user, "worker log tail:\n{}", diagnostics);
        }
        if consecutive_failures < ctx.failure_threshold {
            continue;
        }

        info!(user = %ctx.user, "failure threshold reached, recovering");
        let mut recovered = false;
        for attempt in 1..=ctx.max_retries {
            if *stop_rx.borrow() {
                break 'outer;
            }
            match ctx.recovery.recover(&ctx.user).await {
                Ok(true) => {
                    info!(user = %ctx.user, attempt, "recovery succeeded");
                    recovered = true;
                    break;
                }
                Ok(false) => {
                    warn!(user = %ctx.user, attempt, "recovery attempt did not restore the worker");
                }
                Err(e) => {
                    warn!(user = %ctx.user, attempt, "recovery attempt errored: {}", e);
                }
            }
            if attempt < ctx.max_retries {
                tokio::select! {
                    _ = stop_rx.changed() => break 'outer,
                    _ = tokio::time::sleep(ctx.recovery_delay) => {}
                }
            }
        }

        if recovered {
            consecutive_failures = 0;
        } else {
            // The counter stays above threshold so the next failed check
            // triggers another recovery round.
            warn!(
                user = %ctx.user,
                "{}",
                OrchestratorError::RecoveryExhausted {
                    attempts: ctx.max_retries
                }
            );
        }
    }
    debug!(user = %ctx.user, "monitor loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteLayout;
    use crate::deploy::Deployer;
    use crate::supervisor::{Supervisor, SupervisorConfig};
    use crate::targets::ResolvedTarget;
    use dbo_common::transport::mock::MockHost;
    use dbo_common::types::{AuthMethod, Credentials, ProcessStatus};
    use std::collections::VecDeque;
    use std::io::Write;
    use std::path::PathBuf;

    const WORKER: &str = "/opt/devbox/worker";
    const PORT: u16 = 8000;
    const BASE_URL: &str = "http://devbox.test:8000";

    #[derive(Clone, Copy)]
    enum Scripted {
        Healthy,
        Status(u16),
        Timeout,
    }

    struct ScriptedProbe {
        plan: std::sync::Mutex<VecDeque<Scripted>>,
        default: Scripted,
        urls: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedProbe {
        fn new(plan: Vec<Scripted>, default: Scripted) -> Arc<Self> {
            Arc::new(Self {
                plan: std::sync::Mutex::new(plan.into()),
                default,
                urls: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn urls(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }

        fn health_calls(&self) -> usize {
            self.urls().iter().filter(|u| u.contains("/health")).count()
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn fetch(
            &self,
            url: &str,
            timeout: Duration,
        ) -> Result<ProbeResponse, OrchestratorError> {
            self.urls.lock().unwrap().push(url.to_string());
            if url.contains("/logs") {
                return Ok(ProbeResponse {
                    status: 200,
                    body: "worker log tail".to_string(),
                });
            }
            let step = self
                .plan
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.default);
            match step {
                Scripted::Healthy => Ok(ProbeResponse {
                    status: 200,
                    body: "ok".to_string(),
                }),
                Scripted::Status(status) => Ok(ProbeResponse {
                    status,
                    body: format!("status {}", status),
                }),
                Scripted::Timeout => Err(OrchestratorError::HealthCheckTimeout { timeout }),
            }
        }
    }

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
            base_url: BASE_URL.to_string(),
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

    fn fast_settings() -> MonitorSettings {
        MonitorSettings {
            interval_ms: 20,
            max_retries: 2,
            http_timeout_secs: 1,
            failure_threshold: 2,
            recovery_delay_ms: 5,
            diagnostic_log_lines: 10,
        }
    }

    struct Rig {
        host: MockHost,
        registry: Arc<SessionRegistry>,
        supervisor: Arc<Supervisor>,
        monitor: Monitor,
        probe: Arc<ScriptedProbe>,
    }

    async fn rig(probe: Arc<ScriptedProbe>, artifact_path: PathBuf) -> Rig {
        let host = MockHost::new("/home/dev");
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(host.connector()),
            RemoteLayout::default(),
            200,
        ));
        registry
            .connect(&user(), test_creds(), Some(target(artifact_path)))
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
        let recovery = Arc::new(RecoveryEngine::new(
            registry.clone(),
            deployer,
            supervisor.clone(),
            RemoteLayout::default(),
        ));
        let checker = Arc::new(HealthChecker::new(
            probe.clone(),
            Duration::from_secs(1),
            10,
        ));
        let monitor = Monitor::new(registry.clone(), checker, recovery, fast_settings());
        Rig {
            host,
            registry,
            supervisor,
            monitor,
            probe,
        }
    }

    #[tokio::test]
    async fn test_checker_healthy_on_2xx() {
        let probe = ScriptedProbe::new(vec![Scripted::Healthy], Scripted::Healthy);
        let checker = HealthChecker::new(probe.clone(), Duration::from_secs(1), 10);

        let report = checker.check(BASE_URL).await;
        assert!(report.healthy);
        assert_eq!(report.status, Some(200));
        assert!(report.error.is_none());
        assert_eq!(probe.urls(), vec![format!("{}/health", BASE_URL)]);
    }

    #[tokio::test]
    async fn test_checker_unhealthy_on_server_error() {
        let probe = ScriptedProbe::new(vec![Scripted::Status(500)], Scripted::Healthy);
        let checker = HealthChecker::new(probe, Duration::from_secs(1), 10);

        let report = checker.check(BASE_URL).await;
        assert!(!report.healthy);
        assert_eq!(report.status, Some(500));
        assert!(report.error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_checker_unhealthy_on_timeout() {
        let probe = ScriptedProbe::new(vec![Scripted::Timeout], Scripted::Healthy);
        let checker = HealthChecker::new(probe, Duration::from_secs(1), 10);

        let report = checker.check(BASE_URL).await;
        assert!(!report.healthy);
        assert!(report.status.is_none());
        assert!(report.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_checker_fetches_diagnostics_on_failure() {
        let probe = ScriptedProbe::new(vec![Scripted::Status(503)], Scripted::Healthy);
        let checker = HealthChecker::new(probe.clone(), Duration::from_secs(1), 10);

        let report = checker.check_with_diagnostics(BASE_URL).await;
        assert!(!report.healthy);
        assert_eq!(report.diagnostics.as_deref(), Some("worker log tail"));
        let urls = probe.urls();
        assert!(urls[1].ends_with("/logs?lines=10"));
    }

    #[tokio::test]
    async fn test_checker_skips_diagnostics_when_healthy() {
        let probe = ScriptedProbe::new(vec![], Scripted::Healthy);
        let checker = HealthChecker::new(probe.clone(), Duration::from_secs(1), 10);

        let report = checker.check_with_diagnostics(BASE_URL).await;
        assert!(report.healthy);
        assert!(report.diagnostics.is_none());
        assert_eq!(probe.urls().len(), 1);
    }

    #[tokio::test]
    async fn test_on_demand_check_uses_target_url() {
        let probe = ScriptedProbe::new(vec![Scripted::Status(503)], Scripted::Healthy);
        let rig = rig(probe.clone(), PathBuf::from("/tmp/ignored")).await;

        let report = rig.monitor.check_health(&user()).await.unwrap();
        assert!(!report.healthy);
        assert_eq!(report.diagnostics.as_deref(), Some("worker log tail"));
        assert_eq!(rig.probe.urls()[0], format!("{}/health", BASE_URL));

        let report = rig.monitor.check_health(&user()).await.unwrap();
        assert!(report.healthy);
    }

    #[tokio::test]
    async fn test_monitor_requires_session() {
        let probe = ScriptedProbe::new(vec![], Scripted::Healthy);
        let rig = rig(probe, PathBuf::from("/tmp/ignored")).await;
        rig.registry.disconnect(&user()).await;

        let err = rig
            .monitor
            .start(&user(), Duration::from_millis(20), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Connection(_)));
    }

    #[tokio::test]
    async fn test_monitor_requires_target() {
        let probe = ScriptedProbe::new(vec![], Scripted::Healthy);
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
        let recovery = Arc::new(RecoveryEngine::new(
            registry.clone(),
            deployer,
            supervisor,
            RemoteLayout::default(),
        ));
        let checker = Arc::new(HealthChecker::new(probe, Duration::from_secs(1), 10));
        let monitor = Monitor::new(registry, checker, recovery, fast_settings());

        let err = monitor
            .start(&user(), Duration::from_millis(20), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownTarget(_)));
    }

    #[tokio::test]
    async fn test_monitor_recovers_after_consecutive_failures() {
        let local = artifact(b"worker binary");
        let probe = ScriptedProbe::new(
            vec![Scripted::Status(503), Scripted::Status(503)],
            Scripted::Healthy,
        );
        let rig = rig(probe, local.path().to_path_buf()).await;
        rig.host.add_file(WORKER, b"worker binary", true);

        let process = rig.supervisor.start(&user(), PORT).await.unwrap();
        rig.host.kill_pid(process.pid.unwrap());

        rig.monitor
            .start(&user(), Duration::from_millis(20), 2)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rig.monitor.stop(&user()).await);

        // One relaunch on top of the manual start.
        assert_eq!(rig.host.launch_count(), 2);
        let status = rig.supervisor.status(&user()).await.unwrap();
        assert_eq!(status.status, ProcessStatus::Running);
        assert!(rig.host.pid_alive(status.pid.unwrap()));
    }

    #[tokio::test]
    async fn test_monitor_single_failure_does_not_recover() {
        let local = artifact(b"worker binary");
        let probe = ScriptedProbe::new(vec![Scripted::Status(503)], Scripted::Healthy);
        let rig = rig(probe.clone(), local.path().to_path_buf()).await;
        rig.host.add_file(WORKER, b"worker binary", true);

        rig.monitor
            .start(&user(), Duration::from_millis(20), 2)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        rig.monitor.stop(&user()).await;

        assert_eq!(rig.host.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_monitor_keeps_trying_after_exhausted_round() {
        let local = artifact(b"worker binary");
        let probe = ScriptedProbe::new(vec![], Scripted::Status(503));
        let rig = rig(probe, local.path().to_path_buf()).await;
        rig.host.add_file(WORKER, b"worker binary", true);
        rig.host.workers_die_on_start(true);

        rig.monitor
            .start(&user(), Duration::from_millis(20), 2)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Every attempt so far failed; the worker stops dying now.
        rig.host.workers_die_on_start(false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        rig.monitor.stop(&user()).await;

        assert!(rig.host.launch_count() >= 3);
        let status = rig.supervisor.status(&user()).await.unwrap();
        assert_eq!(status.status, ProcessStatus::Running);
        assert!(rig.host.pid_alive(status.pid.unwrap()));
    }

    #[tokio::test]
    async fn test_monitor_stop_is_cooperative_and_idempotent() {
        let local = artifact(b"worker binary");
        let probe = ScriptedProbe::new(vec![], Scripted::Healthy);
        let rig = rig(probe.clone(), local.path().to_path_buf()).await;

        rig.monitor
            .start(&user(), Duration::from_millis(20), 2)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rig.monitor.stop(&user()).await);
        assert!(!rig.monitor.stop(&user()).await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let calls_after_stop = rig.probe.health_calls();
        assert!(calls_after_stop >= 1);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(rig.probe.health_calls(), calls_after_stop);
    }

    #[tokio::test]
    async fn test_monitor_restart_replaces_loop() {
        let local = artifact(b"worker binary");
        let probe = ScriptedProbe::new(vec![], Scripted::Healthy);
        let rig = rig(probe, local.path().to_path_buf()).await;

        rig.monitor
            .start(&user(), Duration::from_millis(20), 2)
            .await
            .unwrap();
        let ack = rig
            .monitor
            .start(&user(), Duration::from_millis(40), 3)
            .await
            .unwrap();
        assert!(ack.monitoring_started);
        assert_eq!(ack.interval_ms, 40);
        assert_eq!(ack.max_retries, 3);
        assert_eq!(rig.monitor.active_count().await, 1);
        assert!(rig.monitor.is_monitoring(&user()).await);

        rig.monitor.stop_all().await;
        assert_eq!(rig.monitor.active_count().await, 0);
    }
}
