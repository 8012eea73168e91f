//! Backend supervision: make sure the inference server answers before any
//! request is sent, starting it if necessary.

use crate::config::Config;
use crate::error::ShellmandoError;
use crate::http_client::HttpClient;
use crate::providers::ProcessLauncher;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

/// Timeout for the first liveness probe.
pub const QUICK_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// Timeout for probes inside the wait-for-ready loop.
pub const POLL_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause between probes inside the wait-for-ready loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What a probe learned about the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Nothing answers at the host.
    Unreachable,
    /// Something answers but does not report itself healthy (yet).
    RespondingUnknown,
    Healthy,
}

/// Probes the backend and, when it is down, launches the configured starter
/// and waits for it to come up.
pub struct BackendSupervisor {
    host: String,
    starter: Option<PathBuf>,
    startup_timeout: Duration,
    http: Arc<dyn HttpClient>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl BackendSupervisor {
    pub fn new(config: &Config, http: Arc<dyn HttpClient>, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            host: config.host.clone(),
            starter: config.starter_path.clone(),
            startup_timeout: Duration::from_secs(config.startup_timeout_seconds),
            http,
            launcher,
        }
    }

    /// Probes `{host}/health`, falling back to `{host}` when the health path
    /// does not exist.
    pub async fn probe(&self, timeout: Duration) -> BackendState {
        let health_url = format!("{}/health", self.host);
        match self.http.get(&health_url, timeout).await {
            Ok(response) if response.is_success() => BackendState::Healthy,
            Ok(response) if response.status == 404 => {
                debug!("{} has no health endpoint, probing host root", self.host);
                match self.http.get(&self.host, timeout).await {
                    Ok(response) if response.is_success() => BackendState::Healthy,
                    Ok(_) => BackendState::RespondingUnknown,
                    Err(_) => BackendState::Unreachable,
                }
            }
            Ok(response) => {
                debug!("Health probe answered {}", response.status);
                BackendState::RespondingUnknown
            }
            Err(e) => {
                debug!("Health probe failed: {}", e);
                BackendState::Unreachable
            }
        }
    }

    /// Ensures the backend is healthy, aborting the wait on Ctrl-C.
    pub async fn ensure_ready(&self) -> Result<(), ShellmandoError> {
        self.ensure_ready_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                // No signal handler available: never cancel.
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Ensures the backend is healthy; `cancel` resolving aborts the wait.
    ///
    /// A healthy backend returns immediately without side effects, so this is
    /// safe to call on every invocation.
    pub async fn ensure_ready_until<C>(&self, cancel: C) -> Result<(), ShellmandoError>
    where
        C: Future<Output = ()>,
    {
        match self.probe(QUICK_PROBE_TIMEOUT).await {
            BackendState::Healthy => {
                debug!("Backend at {} is healthy", self.host);
                Ok(())
            }
            BackendState::RespondingUnknown => {
                info!("Backend at {} is answering but not ready, waiting", self.host);
                self.wait_until_healthy(cancel, None).await
            }
            BackendState::Unreachable => {
                let starter = self.usable_starter()?;
                warn!("Backend at {} not reachable, starting local LLM with {}", self.host, starter.display());
                self.launcher
                    .launch_detached(&starter)
                    .map_err(|source| ShellmandoError::StarterLaunchFailed {
                        starter: starter.clone(),
                        source,
                    })?;
                self.wait_until_healthy(cancel, Some(starter)).await
            }
        }
    }

    fn usable_starter(&self) -> Result<PathBuf, ShellmandoError> {
        let unavailable = |reason: String| ShellmandoError::BackendUnavailable {
            host: self.host.clone(),
            reason,
        };

        let configured = self
            .starter
            .as_ref()
            .ok_or_else(|| unavailable("no starter configured (use --starter)".to_string()))?;

        let resolved = resolve_starter(configured).ok_or_else(|| {
            unavailable(format!("starter {} not found", configured.display()))
        })?;

        if !is_executable(&resolved) {
            return Err(unavailable(format!(
                "starter {} is not executable",
                resolved.display()
            )));
        }
        Ok(resolved)
    }

    /// Polls until healthy, the startup deadline passes, or `cancel` fires.
    async fn wait_until_healthy<C>(&self, cancel: C, starter: Option<PathBuf>) -> Result<(), ShellmandoError>
    where
        C: Future<Output = ()>,
    {
        let deadline = Instant::now() + self.startup_timeout;
        let poll = async {
            loop {
                if self.probe(POLL_PROBE_TIMEOUT).await == BackendState::Healthy {
                    return;
                }
                sleep(POLL_INTERVAL).await;
            }
        };

        tokio::select! {
            _ = cancel => Err(ShellmandoError::StartupCancelled { host: self.host.clone() }),
            result = timeout_at(deadline, poll) => match result {
                Ok(()) => {
                    info!("Backend at {} is ready", self.host);
                    Ok(())
                }
                Err(_) => Err(ShellmandoError::BackendStartupTimeout {
                    host: self.host.clone(),
                    starter: starter
                        .or_else(|| self.starter.clone())
                        .unwrap_or_else(|| PathBuf::from("(none)")),
                    seconds: self.startup_timeout.as_secs(),
                }),
            },
        }
    }
}

/// Bare names are looked up on `PATH`; anything with a separator is taken
/// as a path.
fn resolve_starter(starter: &Path) -> Option<PathBuf> {
    if starter.components().count() == 1 && !starter.is_absolute() {
        if let Ok(found) = which::which(starter) {
            return Some(found);
        }
    }
    starter.is_file().then(|| starter.to_path_buf())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigResolver, Overrides};
    use crate::http_client::testing::ScriptedHttpClient;
    use crate::http_client::{HttpResponse, TransportError};
    use crate::providers::testing::RecordingLauncher;
    use std::fs;
    use tempfile::TempDir;

    const HOST: &str = "http://127.0.0.1:8280";

    fn config(starter: Option<&Path>, startup_timeout: u64) -> Config {
        let cli = Overrides {
            host: Some(HOST.to_string()),
            starter_path: starter.map(|p| p.to_string_lossy().to_string()),
            startup_timeout_seconds: Some(startup_timeout),
            os_string: Some("Linux".to_string()),
            ..Overrides::default()
        };
        ConfigResolver::new(Default::default(), vec![]).resolve(&cli).unwrap()
    }

    #[cfg(unix)]
    fn executable_starter(dir: &TempDir) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("start-llm.sh");
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn health(outcomes: Vec<Result<HttpResponse, TransportError>>) -> ScriptedHttpClient {
        ScriptedHttpClient::new().on_get(&format!("{}/health", HOST), outcomes)
    }

    fn never() -> impl Future<Output = ()> {
        std::future::pending()
    }

    #[tokio::test]
    async fn test_probe_healthy() {
        let http = Arc::new(health(vec![Ok(HttpResponse::new(200, "{\"status\":\"ok\"}"))]));
        let supervisor = BackendSupervisor::new(&config(None, 5), http, Arc::new(RecordingLauncher::default()));
        assert_eq!(supervisor.probe(QUICK_PROBE_TIMEOUT).await, BackendState::Healthy);
    }

    #[tokio::test]
    async fn test_probe_falls_back_to_host_root() {
        let http = Arc::new(
            health(vec![Ok(HttpResponse::new(404, "not found"))])
                .on_get(HOST, vec![Ok(HttpResponse::new(200, "hello"))]),
        );
        let supervisor = BackendSupervisor::new(&config(None, 5), http.clone(), Arc::new(RecordingLauncher::default()));
        assert_eq!(supervisor.probe(QUICK_PROBE_TIMEOUT).await, BackendState::Healthy);
        assert_eq!(http.get_count(), 2);
    }

    #[tokio::test]
    async fn test_probe_states() {
        let loading = Arc::new(health(vec![Ok(HttpResponse::new(503, "loading model"))]));
        let supervisor = BackendSupervisor::new(&config(None, 5), loading, Arc::new(RecordingLauncher::default()));
        assert_eq!(supervisor.probe(QUICK_PROBE_TIMEOUT).await, BackendState::RespondingUnknown);

        let down = Arc::new(health(vec![Err(TransportError::ConnectionRefused)]));
        let supervisor = BackendSupervisor::new(&config(None, 5), down, Arc::new(RecordingLauncher::default()));
        assert_eq!(supervisor.probe(QUICK_PROBE_TIMEOUT).await, BackendState::Unreachable);
    }

    #[tokio::test]
    async fn test_healthy_backend_is_idempotent_and_spawns_nothing() {
        let dir = TempDir::new().unwrap();
        let starter = dir.path().join("start.sh");
        let http = Arc::new(health(vec![Ok(HttpResponse::new(200, "ok"))]));
        let launcher = Arc::new(RecordingLauncher::default());
        let supervisor = BackendSupervisor::new(&config(Some(&starter), 5), http, launcher.clone());

        supervisor.ensure_ready_until(never()).await.unwrap();
        supervisor.ensure_ready_until(never()).await.unwrap();
        assert_eq!(launcher.count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_without_starter_fails_immediately() {
        let http = Arc::new(health(vec![Err(TransportError::ConnectionRefused)]));
        let launcher = Arc::new(RecordingLauncher::default());
        let supervisor = BackendSupervisor::new(&config(None, 5), http, launcher.clone());

        let err = supervisor.ensure_ready_until(never()).await.unwrap_err();
        assert!(matches!(err, ShellmandoError::BackendUnavailable { .. }));
        assert_eq!(launcher.count(), 0);
    }

    #[tokio::test]
    async fn test_missing_starter_is_unavailable() {
        let http = Arc::new(health(vec![Err(TransportError::ConnectionRefused)]));
        let cfg = config(Some(Path::new("/nonexistent/start-llm.sh")), 5);
        let supervisor = BackendSupervisor::new(&cfg, http, Arc::new(RecordingLauncher::default()));

        let err = supervisor.ensure_ready_until(never()).await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/start-llm.sh"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_executable_starter_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let starter = dir.path().join("start.sh");
        fs::write(&starter, "#!/bin/sh\n").unwrap();
        let http = Arc::new(health(vec![Err(TransportError::ConnectionRefused)]));
        let launcher = Arc::new(RecordingLauncher::default());
        let supervisor = BackendSupervisor::new(&config(Some(&starter), 5), http, launcher.clone());

        let err = supervisor.ensure_ready_until(never()).await.unwrap_err();
        assert!(err.to_string().contains("not executable"));
        assert_eq!(launcher.count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_starter_launched_once_then_polled_until_healthy() {
        let dir = TempDir::new().unwrap();
        let starter = executable_starter(&dir);
        let http = Arc::new(health(vec![
            Err(TransportError::ConnectionRefused),
            Err(TransportError::ConnectionRefused),
            Ok(HttpResponse::new(503, "loading")),
            Ok(HttpResponse::new(200, "ok")),
        ]));
        let launcher = Arc::new(RecordingLauncher::default());
        let supervisor = BackendSupervisor::new(&config(Some(&starter), 30), http.clone(), launcher.clone());

        supervisor.ensure_ready_until(never()).await.unwrap();
        assert_eq!(launcher.count(), 1);
        assert_eq!(launcher.launched.lock().unwrap()[0], starter);
        assert_eq!(http.get_count(), 4);
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_startup_timeout_after_configured_seconds() {
        let dir = TempDir::new().unwrap();
        let starter = executable_starter(&dir);
        let http = Arc::new(health(vec![Err(TransportError::ConnectionRefused)]));
        let launcher = Arc::new(RecordingLauncher::default());
        let supervisor = BackendSupervisor::new(&config(Some(&starter), 7), http, launcher.clone());

        let start = Instant::now();
        let err = supervisor.ensure_ready_until(never()).await.unwrap_err();
        let elapsed = start.elapsed();

        match err {
            ShellmandoError::BackendStartupTimeout { starter: reported, seconds, .. } => {
                assert_eq!(reported, starter);
                assert_eq!(seconds, 7);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(elapsed >= Duration::from_secs(7));
        assert!(elapsed < Duration::from_secs(7) + POLL_INTERVAL * 2);
        assert_eq!(launcher.count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_failure_is_distinct_from_timeout() {
        let dir = TempDir::new().unwrap();
        let starter = executable_starter(&dir);
        let http = Arc::new(health(vec![Err(TransportError::ConnectionRefused)]));
        let supervisor = BackendSupervisor::new(&config(Some(&starter), 5), http, Arc::new(RecordingLauncher::failing()));

        let err = supervisor.ensure_ready_until(never()).await.unwrap_err();
        assert!(matches!(err, ShellmandoError::StarterLaunchFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancellable() {
        let dir = TempDir::new().unwrap();
        let starter = executable_starter(&dir);
        let http = Arc::new(health(vec![Err(TransportError::ConnectionRefused)]));
        let supervisor = BackendSupervisor::new(&config(Some(&starter), 600), http, Arc::new(RecordingLauncher::default()));

        let start = Instant::now();
        let err = supervisor
            .ensure_ready_until(sleep(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, ShellmandoError::StartupCancelled { .. }));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_responding_backend_is_awaited_without_launch() {
        let http = Arc::new(health(vec![
            Ok(HttpResponse::new(503, "loading")),
            Ok(HttpResponse::new(503, "loading")),
            Ok(HttpResponse::new(200, "ok")),
        ]));
        let launcher = Arc::new(RecordingLauncher::default());
        let supervisor = BackendSupervisor::new(&config(None, 10), http, launcher.clone());

        supervisor.ensure_ready_until(never()).await.unwrap();
        assert_eq!(launcher.count(), 0);
    }

    #[test]
    fn test_resolve_starter_by_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("start.sh");
        assert!(resolve_starter(&path).is_none());
        fs::write(&path, "").unwrap();
        assert_eq!(resolve_starter(&path), Some(path));
    }
}
