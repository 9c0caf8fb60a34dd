//! llama-server instance management and process lifecycle

use crate::error::{TrackerError, TrackerResult};
use crate::ledger::safe_file_stem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

/// Artifact name of the model weights passed to the server
pub const MODEL_PATH: &str = "model_path";

// ============================================================================
// Launch description
// ============================================================================

/// Named local artifacts handed to a server process
///
/// The `model_path` entry always exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
    model_path: PathBuf,
    extra: BTreeMap<String, PathBuf>,
}

impl ModelArtifacts {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Add another named artifact; `model_path` replaces the weights file
    pub fn with(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let name = name.into();
        if name == MODEL_PATH {
            self.model_path = path.into();
        } else {
            self.extra.insert(name, path.into());
        }
        self
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        if name == MODEL_PATH {
            Some(&self.model_path)
        } else {
            self.extra.get(name).map(PathBuf::as_path)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        std::iter::once((MODEL_PATH, self.model_path.as_path()))
            .chain(self.extra.iter().map(|(k, v)| (k.as_str(), v.as_path())))
    }
}

impl From<PathBuf> for ModelArtifacts {
    fn from(model_path: PathBuf) -> Self {
        Self::new(model_path)
    }
}

impl From<&Path> for ModelArtifacts {
    fn from(model_path: &Path) -> Self {
        Self::new(model_path)
    }
}

impl From<&PathBuf> for ModelArtifacts {
    fn from(model_path: &PathBuf) -> Self {
        Self::new(model_path.as_path())
    }
}

/// Everything needed to spawn one llama-server process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub model_id: String,
    pub binary_path: String,
    pub host: String,
    pub port: u16,
    pub artifacts: ModelArtifacts,
    pub extra_args: Vec<String>,
    pub log_dir: PathBuf,
    /// Directory for `<model_id>.pid`; no pid file when unset
    pub run_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Command-line arguments for llama-server
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.artifacts.model_path().display().to_string(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--alias".to_string(),
            self.model_id.clone(),
        ];

        // Optional auxiliary files llama-server understands
        if let Some(mmproj) = self.artifacts.get("mmproj") {
            args.push("--mmproj".to_string());
            args.push(mmproj.display().to_string());
        }
        if let Some(template) = self.artifacts.get("chat_template") {
            args.push("--chat-template-file".to_string());
            args.push(template.display().to_string());
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

// ============================================================================
// Trait Definitions
// ============================================================================

/// Opaque handle to a spawned process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub(crate) id: String,
}

/// Trait for managing process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn a new server process
    async fn spawn(&self, spec: LaunchSpec) -> TrackerResult<ProcessHandle>;

    /// Stop a process gracefully with timeout
    async fn stop(&self, handle: ProcessHandle, timeout: Duration) -> TrackerResult<()>;

    /// Check if process is running
    async fn is_running(&self, handle: &ProcessHandle) -> bool;

    /// Get process ID
    async fn pid(&self, handle: &ProcessHandle) -> Option<u32>;
}

// ============================================================================
// Pid files
// ============================================================================

pub fn pid_file_path(run_dir: &Path, model_id: &str) -> PathBuf {
    run_dir.join(format!("{}.pid", safe_file_stem(model_id)))
}

/// Pid recorded in `path`, `None` if the file does not exist
///
/// Only positive pids are accepted: signalling 0 or a negative pid addresses
/// a whole process group.
pub async fn read_pid_file(path: &Path) -> TrackerResult<Option<i32>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_pid(content.trim())
            .map(Some)
            .map_err(|reason| TrackerError::Process(format!("Invalid pid file {:?}: {}", path, reason))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TrackerError::io(format!("Failed to read pid file {:?}", path), e)),
    }
}

fn parse_pid(raw: &str) -> Result<i32, String> {
    let pid: i64 = raw.parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
    match i32::try_from(pid) {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(format!("{} is not a process id", raw)),
    }
}

/// Stop a server started by another process, found through its pid file
///
/// Sends SIGTERM, then SIGKILL once `timeout` has passed. Returns false when
/// no live process was recorded.
#[cfg(unix)]
pub async fn stop_by_pid_file(
    run_dir: &Path,
    model_id: &str,
    timeout: Duration,
) -> TrackerResult<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let path = pid_file_path(run_dir, model_id);
    let Some(pid) = read_pid_file(&path).await? else {
        return Ok(false);
    };
    let pid = Pid::from_raw(pid);

    match kill(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            tracing::warn!(model_id = %model_id, pid = %pid, "Removing stale pid file");
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(false);
        }
        Err(e) => {
            return Err(TrackerError::Process(format!(
                "Failed to signal pid {}: {}",
                pid, e
            )));
        }
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while kill(pid, None).is_ok() {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(model_id = %model_id, pid = %pid, "Graceful shutdown timeout, sending SIGKILL");
            let _ = kill(pid, Signal::SIGKILL);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let _ = tokio::fs::remove_file(&path).await;
    tracing::info!(model_id = %model_id, pid = %pid, "Server stopped through pid file");

    Ok(true)
}

// ============================================================================
// Production Implementation
// ============================================================================

struct RunningProcess {
    child: Child,
    pid_file: Option<PathBuf>,
}

/// Production process manager using tokio::process
pub struct SystemProcessManager {
    processes: Arc<RwLock<std::collections::HashMap<String, RunningProcess>>>,
}

impl SystemProcessManager {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(std::collections::HashMap::new())),
        }
    }

    /// Log directory, falling back to the temp dir if it cannot be created
    fn prepare_log_dir(log_dir: &Path) -> TrackerResult<PathBuf> {
        match std::fs::create_dir_all(log_dir) {
            Ok(()) => Ok(log_dir.to_path_buf()),
            Err(e) => {
                let fallback = std::env::temp_dir().join("gguf-tracker").join("logs");
                tracing::warn!(
                    error = %e,
                    attempted_dir = ?log_dir,
                    fallback = ?fallback,
                    "Failed to create log directory, falling back"
                );
                std::fs::create_dir_all(&fallback)
                    .map_err(|e| TrackerError::io("Failed to create fallback log directory", e))?;
                Ok(fallback)
            }
        }
    }
}

impl Default for SystemProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessManager for SystemProcessManager {
    async fn spawn(&self, spec: LaunchSpec) -> TrackerResult<ProcessHandle> {
        let mut cmd = Command::new(&spec.binary_path);
        cmd.args(spec.args());

        // Setup log file redirection
        let log_dir = Self::prepare_log_dir(&spec.log_dir)?;
        let log_path = log_dir.join(format!("{}.log", safe_file_stem(&spec.model_id)));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| TrackerError::io(format!("Failed to open log file: {:?}", log_path), e))?;

        let stdout_file = log_file
            .try_clone()
            .map_err(|e| TrackerError::io("Failed to clone log file for stdout", e))?;
        let stderr_file = log_file
            .try_clone()
            .map_err(|e| TrackerError::io("Failed to clone log file for stderr", e))?;

        // Spawn process
        let child = cmd
            .stdout(stdout_file)
            .stderr(stderr_file)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TrackerError::Process(format!(
                    "Failed to spawn {} for '{}': {}",
                    spec.binary_path, spec.model_id, e
                ))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| TrackerError::Process("Failed to get PID".to_string()))?;
        let handle_id = format!("process_{}", pid);

        let pid_file = match &spec.run_dir {
            Some(run_dir) => {
                tokio::fs::create_dir_all(run_dir)
                    .await
                    .map_err(|e| TrackerError::io(format!("Failed to create {:?}", run_dir), e))?;
                let path = pid_file_path(run_dir, &spec.model_id);
                tokio::fs::write(&path, pid.to_string())
                    .await
                    .map_err(|e| TrackerError::io(format!("Failed to write pid file {:?}", path), e))?;
                Some(path)
            }
            None => None,
        };

        tracing::info!(
            model_id = %spec.model_id,
            port = spec.port,
            pid = pid,
            log = ?log_path,
            "llama-server process spawned"
        );

        let handle = ProcessHandle {
            id: handle_id.clone(),
        };

        self.processes
            .write()
            .await
            .insert(handle_id, RunningProcess { child, pid_file });

        Ok(handle)
    }

    async fn stop(&self, handle: ProcessHandle, timeout: Duration) -> TrackerResult<()> {
        // Release the map before waiting so other instances stay observable
        let removed = self.processes.write().await.remove(&handle.id);

        if let Some(RunningProcess {
            mut child,
            pid_file,
        }) = removed
        {
            // Try graceful shutdown first (SIGTERM)
            if let Some(pid) = child.id() {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    match i32::try_from(pid) {
                        Ok(raw) if raw > 0 => {
                            let pid = Pid::from_raw(raw);
                            let _ = kill(pid, Signal::SIGTERM);

                            // Wait for graceful shutdown with timeout
                            tokio::select! {
                                _ = child.wait() => {
                                    tracing::info!(pid = %pid, "Process stopped gracefully");
                                }
                                _ = tokio::time::sleep(timeout) => {
                                    tracing::warn!(pid = %pid, "Graceful shutdown timeout, sending SIGKILL");
                                    let _ = kill(pid, Signal::SIGKILL);
                                    let _ = child.wait().await;
                                }
                            }
                        }
                        _ => {
                            let _ = child.kill().await;
                        }
                    }
                }

                #[cfg(not(unix))]
                {
                    // On non-Unix, just kill
                    let _ = child.kill().await;
                }
            }

            if let Some(path) = pid_file {
                let _ = tokio::fs::remove_file(path).await;
            }
        }

        Ok(())
    }

    async fn is_running(&self, handle: &ProcessHandle) -> bool {
        let mut processes = self.processes.write().await;
        processes
            .get_mut(&handle.id)
            .is_some_and(|p| matches!(p.child.try_wait(), Ok(None)))
    }

    async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
        let processes = self.processes.read().await;
        processes.get(&handle.id).and_then(|p| p.child.id())
    }
}

// ============================================================================
// Server instance with Dependency Injection
// ============================================================================

/// Instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Registered, process not spawned yet
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Instance statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceStats {
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub restarts: u32,
}

/// One llama-server serving one model id
pub struct ServerInstance {
    pub spec: LaunchSpec,
    process_manager: Arc<dyn ProcessManager>,
    process_handle: Arc<RwLock<Option<ProcessHandle>>>,
    graceful_timeout: Duration,
    pub status: Arc<RwLock<InstanceStatus>>,
    pub stats: Arc<RwLock<InstanceStats>>,
}

impl ServerInstance {
    pub fn new(
        spec: LaunchSpec,
        manager: Arc<dyn ProcessManager>,
        graceful_timeout: Duration,
    ) -> Self {
        Self {
            spec,
            process_manager: manager,
            process_handle: Arc::new(RwLock::new(None)),
            graceful_timeout,
            status: Arc::new(RwLock::new(InstanceStatus::Stopped)),
            stats: Arc::new(RwLock::new(InstanceStats::default())),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.spec.model_id
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn model_file(&self) -> &Path {
        self.spec.artifacts.model_path()
    }

    /// Start the server process
    pub async fn start(&self) -> TrackerResult<()> {
        let handle = match self.process_manager.spawn(self.spec.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                *self.status.write().await = InstanceStatus::Failed;
                return Err(e);
            }
        };
        let pid = self.process_manager.pid(&handle).await;

        *self.process_handle.write().await = Some(handle);
        *self.status.write().await = InstanceStatus::Running;
        self.stats.write().await.started_at = Some(chrono::Utc::now());

        tracing::info!(
            model_id = %self.spec.model_id,
            port = self.spec.port,
            model_file = ?self.spec.artifacts.model_path(),
            pid = ?pid,
            "Server instance started"
        );

        Ok(())
    }

    /// Stop the server process gracefully
    pub async fn stop(&self) -> TrackerResult<()> {
        *self.status.write().await = InstanceStatus::Stopping;

        let mut handle_guard = self.process_handle.write().await;

        if let Some(handle) = handle_guard.take() {
            self.process_manager
                .stop(handle, self.graceful_timeout)
                .await?;

            tracing::info!(model_id = %self.spec.model_id, "Instance stopped");
        }

        *self.status.write().await = InstanceStatus::Stopped;
        Ok(())
    }

    /// Restart the instance
    pub async fn restart(&self) -> TrackerResult<()> {
        tracing::info!(model_id = %self.spec.model_id, "Restarting instance");

        self.stop().await?;
        self.start().await?;

        self.stats.write().await.restarts += 1;

        Ok(())
    }

    /// Check if process is still running
    pub async fn is_running(&self) -> bool {
        let handle_guard = self.process_handle.read().await;
        if let Some(handle) = handle_guard.as_ref() {
            self.process_manager.is_running(handle).await
        } else {
            false
        }
    }

    /// Get current PID
    pub async fn pid(&self) -> Option<u32> {
        let handle_guard = self.process_handle.read().await;
        if let Some(handle) = handle_guard.as_ref() {
            self.process_manager.pid(handle).await
        } else {
            None
        }
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use mocks::MockProcessManager;

    fn spec(model_id: &str, port: u16) -> LaunchSpec {
        LaunchSpec {
            model_id: model_id.to_string(),
            binary_path: "/usr/bin/llama-server".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            artifacts: ModelArtifacts::new(format!("/models/{}/artifacts/model.gguf", model_id)),
            extra_args: Vec::new(),
            log_dir: std::env::temp_dir(),
            run_dir: None,
        }
    }

    #[test]
    fn test_model_artifacts() {
        let artifacts = ModelArtifacts::new("/m/model.gguf").with("mmproj", "/m/mmproj.gguf");
        assert_eq!(artifacts.model_path(), Path::new("/m/model.gguf"));
        assert_eq!(artifacts.get("mmproj"), Some(Path::new("/m/mmproj.gguf")));
        assert_eq!(artifacts.get("missing"), None);
        assert_eq!(artifacts.iter().count(), 2);

        let names: Vec<&str> = artifacts.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec![MODEL_PATH, "mmproj"]);

        let replaced = artifacts.with(MODEL_PATH, "/m/other.gguf");
        assert_eq!(replaced.model_path(), Path::new("/m/other.gguf"));

        let from_path = ModelArtifacts::from(Path::new("/m/model.gguf"));
        assert_eq!(from_path.iter().count(), 1);
    }

    #[test]
    fn test_launch_args() {
        let mut launch = spec("qa_model", 8080);
        launch.artifacts = ModelArtifacts::new("/m/model.gguf").with("mmproj", "/m/proj.gguf");
        launch.extra_args = vec!["--ctx-size".to_string(), "4096".to_string()];

        assert_eq!(
            launch.args(),
            vec![
                "-m",
                "/m/model.gguf",
                "--host",
                "127.0.0.1",
                "--port",
                "8080",
                "--alias",
                "qa_model",
                "--mmproj",
                "/m/proj.gguf",
                "--ctx-size",
                "4096"
            ]
        );
    }

    #[test]
    fn test_pid_file_path_sanitizes() {
        assert_eq!(
            pid_file_path(Path::new("/run"), "org/model"),
            PathBuf::from("/run/org_model.pid")
        );
    }

    #[tokio::test]
    async fn test_read_pid_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("m.pid");

        assert_eq!(read_pid_file(&path).await.unwrap(), None);

        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid_file(&path).await.unwrap(), Some(4242));

        for content in ["garbage", "0", "-1", "-4242", "4294967295", "2147483648", "99999999999999999999"] {
            std::fs::write(&path, content).unwrap();
            assert!(
                matches!(read_pid_file(&path).await, Err(TrackerError::Process(_))),
                "{content}"
            );
        }

        std::fs::write(&path, "2147483647").unwrap();
        assert_eq!(read_pid_file(&path).await.unwrap(), Some(i32::MAX));
    }

    #[tokio::test]
    async fn test_instance_creation() {
        let manager = Arc::new(MockProcessManager::new());
        let instance = ServerInstance::new(spec("m", 9999), manager, Duration::from_secs(1));
        assert_eq!(*instance.status.read().await, InstanceStatus::Stopped);
        assert!(!instance.is_running().await);
        assert!(instance.pid().await.is_none());
    }

    #[tokio::test]
    async fn test_instance_start_stop() {
        let manager = Arc::new(MockProcessManager::new());
        let instance =
            ServerInstance::new(spec("qa_model", 8080), manager.clone(), Duration::from_secs(1));

        instance.start().await.unwrap();
        assert_eq!(*instance.status.read().await, InstanceStatus::Running);
        assert!(instance.is_running().await);
        assert!(instance.pid().await.is_some());
        assert!(instance.stats.read().await.started_at.is_some());
        assert!(manager.is_serving("qa_model", 8080).await);

        instance.stop().await.unwrap();
        assert_eq!(*instance.status.read().await, InstanceStatus::Stopped);
        assert!(!instance.is_running().await);
        assert_eq!(manager.process_count().await, 0);
    }

    #[tokio::test]
    async fn test_instance_restart() {
        let manager = Arc::new(MockProcessManager::new());
        let instance = ServerInstance::new(spec("m", 8082), manager, Duration::from_secs(1));

        instance.start().await.unwrap();
        let initial_pid = instance.pid().await.unwrap();

        instance.restart().await.unwrap();
        let new_pid = instance.pid().await.unwrap();

        assert_ne!(initial_pid, new_pid);
        assert_eq!(instance.stats.read().await.restarts, 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_failed() {
        let manager = Arc::new(MockProcessManager::new());
        manager.set_spawn_error("No such file or directory").await;
        let instance = ServerInstance::new(spec("m", 8083), manager, Duration::from_secs(1));

        let result = instance.start().await;
        assert!(matches!(result, Err(TrackerError::Process(_))));
        assert_eq!(*instance.status.read().await, InstanceStatus::Failed);
        assert!(!instance.is_running().await);
    }

    #[tokio::test]
    async fn test_crash_detected() {
        let manager = Arc::new(MockProcessManager::new());
        let instance =
            ServerInstance::new(spec("m", 8084), manager.clone(), Duration::from_secs(1));

        instance.start().await.unwrap();
        manager.crash("m").await;
        assert!(!instance.is_running().await);
    }

    #[tokio::test]
    async fn test_spec_propagation() {
        let manager = Arc::new(MockProcessManager::new());
        let mut launch = spec("custom", 7777);
        launch.binary_path = "/custom/llama-server".to_string();
        launch.extra_args = vec!["--n-gpu-layers".to_string(), "99".to_string()];
        let instance = ServerInstance::new(launch, manager.clone(), Duration::from_secs(1));

        instance.start().await.unwrap();

        let history = manager.spawn_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].binary_path, "/custom/llama-server");
        assert_eq!(history[0].port, 7777);
        assert_eq!(history[0].extra_args.len(), 2);
    }

    #[cfg(unix)]
    mod system {
        use super::*;
        use serial_test::serial;
        use std::os::unix::fs::PermissionsExt;

        /// Fake llama-server: prints its arguments, then idles
        fn fake_server(dir: &Path) -> String {
            let path = dir.join("fake-llama-server");
            std::fs::write(&path, "#!/bin/sh\necho \"$@\"\nexec sleep 30\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.display().to_string()
        }

        fn system_spec(dir: &Path, model_id: &str) -> LaunchSpec {
            LaunchSpec {
                model_id: model_id.to_string(),
                binary_path: fake_server(dir),
                host: "127.0.0.1".to_string(),
                port: 18080,
                artifacts: ModelArtifacts::new(dir.join("model.gguf")),
                extra_args: vec!["--ctx-size".to_string(), "512".to_string()],
                log_dir: dir.join("logs"),
                run_dir: Some(dir.join("run")),
            }
        }

        async fn wait_for_log(path: &Path, needle: &str) -> bool {
            for _ in 0..50 {
                if std::fs::read_to_string(path).is_ok_and(|c| c.contains(needle)) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            false
        }

        #[tokio::test]
        #[serial]
        async fn test_system_spawn_logs_and_pid_file() {
            let temp_dir = tempfile::tempdir().unwrap();
            let manager = SystemProcessManager::new();
            let launch = system_spec(temp_dir.path(), "qa_model");

            let handle = manager.spawn(launch).await.unwrap();
            let pid = manager.pid(&handle).await.unwrap();
            assert!(manager.is_running(&handle).await);

            let pid_file = temp_dir.path().join("run/qa_model.pid");
            assert_eq!(
                read_pid_file(&pid_file).await.unwrap(),
                Some(i32::try_from(pid).unwrap())
            );

            let log = temp_dir.path().join("logs/qa_model.log");
            assert!(wait_for_log(&log, "--alias qa_model --ctx-size 512").await);

            manager.stop(handle.clone(), Duration::from_secs(5)).await.unwrap();
            assert!(!manager.is_running(&handle).await);
            assert!(!pid_file.exists());
        }

        #[tokio::test]
        #[serial]
        async fn test_system_spawn_missing_binary() {
            let temp_dir = tempfile::tempdir().unwrap();
            let manager = SystemProcessManager::new();
            let mut launch = system_spec(temp_dir.path(), "m");
            launch.binary_path = "/nonexistent/llama-server".to_string();

            let result = manager.spawn(launch).await;
            assert!(matches!(result, Err(TrackerError::Process(_))));
        }

        #[tokio::test]
        #[serial]
        async fn test_stop_by_pid_file() {
            let temp_dir = tempfile::tempdir().unwrap();
            let run_dir = temp_dir.path().join("run");

            // Nothing recorded
            assert!(
                !stop_by_pid_file(&run_dir, "qa_model", Duration::from_secs(1))
                    .await
                    .unwrap()
            );

            let manager = SystemProcessManager::new();
            let handle = manager
                .spawn(system_spec(temp_dir.path(), "qa_model"))
                .await
                .unwrap();

            let stopped = stop_by_pid_file(&run_dir, "qa_model", Duration::from_secs(2))
                .await
                .unwrap();
            assert!(stopped);
            assert!(!pid_file_path(&run_dir, "qa_model").exists());

            manager.stop(handle, Duration::from_secs(1)).await.unwrap();
        }

        #[tokio::test]
        #[serial]
        async fn test_stale_pid_file_removed() {
            let temp_dir = tempfile::tempdir().unwrap();
            let run_dir = temp_dir.path().join("run");
            std::fs::create_dir_all(&run_dir).unwrap();
            let path = pid_file_path(&run_dir, "m");
            // Max pid on Linux is 2^22, so this never names a live process
            std::fs::write(&path, "99999999").unwrap();

            assert!(
                !stop_by_pid_file(&run_dir, "m", Duration::from_secs(1))
                    .await
                    .unwrap()
            );
            assert!(!path.exists());
        }

        #[tokio::test]
        #[serial]
        async fn test_pid_file_never_signals_process_groups() {
            let temp_dir = tempfile::tempdir().unwrap();
            let run_dir = temp_dir.path().join("run");
            std::fs::create_dir_all(&run_dir).unwrap();
            let path = pid_file_path(&run_dir, "m");

            // 0 and -1 would reach our own group or every process we may signal
            for content in ["0", "-1", "4294967295"] {
                std::fs::write(&path, content).unwrap();
                let result = stop_by_pid_file(&run_dir, "m", Duration::from_secs(1)).await;
                assert!(matches!(result, Err(TrackerError::Process(_))), "{content}");
                assert!(path.exists());
            }
        }
    }
}
