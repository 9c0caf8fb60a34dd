//! Serving lifecycle: at most one llama-server per model id

use crate::config::{MIN_SERVE_PORT, ServerConfig};
use crate::error::{TrackerError, TrackerResult};
use crate::instance::{InstanceStatus, LaunchSpec, ModelArtifacts, ProcessManager, ServerInstance};
use crate::metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};

/// Events that occur during instance lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    /// Instance was added to the manager
    Added(String),
    /// Instance process was started
    Started(String),
    /// Instance process was stopped
    Stopped(String),
    /// Instance was removed from the manager
    Removed(String),
}

/// Which instances `delete_serve` removes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteTarget {
    One(String),
    All,
}

/// Snapshot of one tracked instance
#[derive(Debug, Clone, Serialize)]
pub struct ServeStatus {
    pub model_id: String,
    pub port: u16,
    pub model_file: PathBuf,
    pub status: InstanceStatus,
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub restarts: u32,
}

/// Thread-safe manager of serving instances keyed by model id
pub struct ServeManager {
    instances: Arc<RwLock<HashMap<String, Arc<ServerInstance>>>>,
    /// Serializes add/update/stop/delete for one model id
    op_locks: DashMap<String, Arc<Mutex<()>>>,
    process_manager: Arc<dyn ProcessManager>,
    server: ServerConfig,
    record_pid_files: bool,
    event_tx: broadcast::Sender<InstanceEvent>,
}

impl ServeManager {
    pub fn new(server: ServerConfig, process_manager: Arc<dyn ProcessManager>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            op_locks: DashMap::new(),
            process_manager,
            server,
            record_pid_files: false,
            event_tx,
        }
    }

    /// Write `<run_dir>/<model_id>.pid` for every started server
    pub fn with_pid_files(mut self, enabled: bool) -> Self {
        self.record_pid_files = enabled;
        self
    }

    /// Subscribe to lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<InstanceEvent> {
        self.event_tx.subscribe()
    }

    fn op_lock(&self, model_id: &str) -> Arc<Mutex<()>> {
        self.op_locks
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn emit(&self, event: InstanceEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn launch_spec(&self, model_id: &str, artifacts: ModelArtifacts, port: u16) -> LaunchSpec {
        LaunchSpec {
            model_id: model_id.to_string(),
            binary_path: self.server.binary_path.clone(),
            host: self.server.host.clone(),
            port,
            artifacts,
            extra_args: self.server.extra_args.clone(),
            log_dir: self.server.log_dir.clone(),
            run_dir: self
                .record_pid_files
                .then(|| self.server.run_dir.clone()),
        }
    }

    /// Serve `artifacts` as `model_id` on `port`
    ///
    /// A running instance with the same id is returned unchanged.
    pub async fn add_serve(
        &self,
        model_id: &str,
        artifacts: impl Into<ModelArtifacts>,
        port: u16,
    ) -> TrackerResult<Arc<ServerInstance>> {
        let lock = self.op_lock(model_id);
        let _guard = lock.lock().await;

        self.add_locked(model_id, artifacts.into(), port).await
    }

    /// True if `instance` holds or is about to hold its port
    async fn claims_port(instance: &ServerInstance) -> bool {
        *instance.status.read().await == InstanceStatus::Starting || instance.is_running().await
    }

    /// Put `previous` back in place of `instance`, unless it was replaced since
    async fn rollback(
        &self,
        model_id: &str,
        instance: &Arc<ServerInstance>,
        previous: Option<Arc<ServerInstance>>,
    ) {
        let mut instances = self.instances.write().await;
        if instances
            .get(model_id)
            .is_some_and(|current| Arc::ptr_eq(current, instance))
        {
            match previous {
                Some(previous) => {
                    instances.insert(model_id.to_string(), previous);
                }
                None => {
                    instances.remove(model_id);
                }
            }
        }
    }

    async fn add_locked(
        &self,
        model_id: &str,
        artifacts: ModelArtifacts,
        port: u16,
    ) -> TrackerResult<Arc<ServerInstance>> {
        let existing = self.instances.read().await.get(model_id).cloned();

        if let Some(existing) = &existing
            && existing.is_running().await
        {
            tracing::debug!(model_id = %model_id, port = existing.port(), "Model already being served");
            return Ok(existing.clone());
        }

        if port < MIN_SERVE_PORT {
            return Err(TrackerError::InvalidPort(port));
        }

        if let Some((_, missing)) = artifacts.iter().find(|(_, path)| !path.exists()) {
            return Err(TrackerError::ModelFileNotFound(missing.to_path_buf()));
        }

        let model_file = artifacts.model_path().to_path_buf();
        let instance = Arc::new(ServerInstance::new(
            self.launch_spec(model_id, artifacts, port),
            self.process_manager.clone(),
            Duration::from_secs(self.server.graceful_shutdown_timeout_secs),
        ));
        *instance.status.write().await = InstanceStatus::Starting;

        // Register under the map lock, spawn outside it
        {
            let mut instances = self.instances.write().await;
            for other in instances.values() {
                if other.model_id() != model_id
                    && other.port() == port
                    && Self::claims_port(other).await
                {
                    return Err(TrackerError::PortConflict {
                        port,
                        model_id: other.model_id().to_string(),
                    });
                }
            }
            instances.insert(model_id.to_string(), instance.clone());
        }

        // Stopped or crashed: reap what is left of it
        if let Some(previous) = &existing {
            if let Err(e) = previous.stop().await {
                self.rollback(model_id, &instance, existing.clone()).await;
                return Err(e);
            }
            self.emit(InstanceEvent::Removed(model_id.to_string()));
        }

        if let Err(e) = instance.start().await {
            self.rollback(model_id, &instance, existing).await;
            return Err(e);
        }

        let total = self.instances.read().await.len();

        tracing::info!(
            model_id = %model_id,
            port,
            model_file = ?model_file,
            total_instances = total,
            "Serving model"
        );

        metrics::record_instance_started(model_id, port);
        metrics::update_instance_count(total);
        self.emit(InstanceEvent::Added(model_id.to_string()));
        self.emit(InstanceEvent::Started(model_id.to_string()));

        Ok(instance)
    }

    /// Replace whatever serves `model_id` with a new instance
    pub async fn update_serve(
        &self,
        model_id: &str,
        artifacts: impl Into<ModelArtifacts>,
        port: u16,
    ) -> TrackerResult<Arc<ServerInstance>> {
        let lock = self.op_lock(model_id);
        let _guard = lock.lock().await;
        let artifacts = artifacts.into();

        match self.delete_locked(model_id).await {
            Ok(()) | Err(TrackerError::ModelNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        tracing::info!(
            model_id = %model_id,
            port,
            model_file = ?artifacts.model_path(),
            "Replacing served model"
        );

        self.add_locked(model_id, artifacts, port).await
    }

    /// Stop the process but keep the instance tracked
    pub async fn stop_serve(&self, model_id: &str) -> TrackerResult<()> {
        let lock = self.op_lock(model_id);
        let _guard = lock.lock().await;

        let instance = self
            .instances
            .read()
            .await
            .get(model_id)
            .cloned()
            .ok_or_else(|| TrackerError::ModelNotFound(model_id.to_string()))?;

        instance.stop().await?;

        metrics::record_instance_stopped(model_id);
        self.emit(InstanceEvent::Stopped(model_id.to_string()));

        Ok(())
    }

    async fn delete_locked(&self, model_id: &str) -> TrackerResult<()> {
        let mut instances = self.instances.write().await;

        let instance = instances
            .remove(model_id)
            .ok_or_else(|| TrackerError::ModelNotFound(model_id.to_string()))?;
        let total = instances.len();

        // Drop write lock before stopping (stop may take time)
        drop(instances);

        instance.stop().await?;

        tracing::info!(model_id = %model_id, "Instance removed");

        metrics::record_instance_stopped(model_id);
        metrics::update_instance_count(total);
        self.emit(InstanceEvent::Stopped(model_id.to_string()));
        self.emit(InstanceEvent::Removed(model_id.to_string()));

        Ok(())
    }

    /// Stop and forget one instance, or all of them
    ///
    /// Returns how many instances were removed. `All` never fails on an
    /// empty manager; stop failures are logged and the sweep continues.
    pub async fn delete_serve(&self, target: DeleteTarget) -> TrackerResult<usize> {
        match target {
            DeleteTarget::One(model_id) => {
                let lock = self.op_lock(&model_id);
                let _guard = lock.lock().await;
                self.delete_locked(&model_id).await?;
                Ok(1)
            }
            DeleteTarget::All => {
                let ids: Vec<String> = self.instances.read().await.keys().cloned().collect();
                let mut removed = 0;
                for model_id in ids {
                    let lock = self.op_lock(&model_id);
                    let _guard = lock.lock().await;
                    match self.delete_locked(&model_id).await {
                        Ok(()) => removed += 1,
                        Err(TrackerError::ModelNotFound(_)) => {}
                        Err(e) => {
                            tracing::warn!(model_id = %model_id, error = %e, "Failed to stop instance")
                        }
                    }
                }
                Ok(removed)
            }
        }
    }

    /// Stop everything; used on shutdown
    pub async fn shutdown(&self) -> usize {
        let removed = self.delete_serve(DeleteTarget::All).await.unwrap_or(0);
        tracing::info!(removed, "All serving instances stopped");
        removed
    }

    async fn snapshot(instance: &ServerInstance) -> ServeStatus {
        let stats = instance.stats.read().await.clone();
        ServeStatus {
            model_id: instance.model_id().to_string(),
            port: instance.port(),
            model_file: instance.model_file().to_path_buf(),
            status: *instance.status.read().await,
            running: instance.is_running().await,
            pid: instance.pid().await,
            started_at: stats.started_at,
            restarts: stats.restarts,
        }
    }

    /// Status of `model_id`, `None` if not tracked
    pub async fn get_status(&self, model_id: &str) -> Option<ServeStatus> {
        let instance = self.instances.read().await.get(model_id).cloned()?;
        Some(Self::snapshot(&instance).await)
    }

    /// Status of every tracked instance, sorted by model id
    pub async fn list(&self) -> Vec<ServeStatus> {
        let instances: Vec<Arc<ServerInstance>> =
            self.instances.read().await.values().cloned().collect();

        let mut statuses = Vec::with_capacity(instances.len());
        for instance in instances {
            statuses.push(Self::snapshot(&instance).await);
        }
        statuses.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        statuses
    }

    /// Get instance count
    pub async fn count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Restart instances whose process exited without being stopped
    ///
    /// Returns the ids that were restarted.
    pub async fn restart_crashed(&self) -> Vec<String> {
        let instances: Vec<Arc<ServerInstance>> =
            self.instances.read().await.values().cloned().collect();

        let mut restarted = Vec::new();
        for instance in instances {
            let model_id = instance.model_id().to_string();
            let lock = self.op_lock(&model_id);
            let _guard = lock.lock().await;

            // Replaced or removed while waiting for the lock
            let current = self
                .instances
                .read()
                .await
                .get(&model_id)
                .is_some_and(|i| Arc::ptr_eq(i, &instance));
            if !current
                || *instance.status.read().await != InstanceStatus::Running
                || instance.is_running().await
            {
                continue;
            }

            tracing::warn!(
                model_id = %model_id,
                port = instance.port(),
                "Server exited unexpectedly, restarting"
            );

            match instance.restart().await {
                Ok(()) => {
                    metrics::record_instance_started(&model_id, instance.port());
                    self.emit(InstanceEvent::Started(model_id.clone()));
                    restarted.push(model_id);
                }
                Err(e) => {
                    tracing::error!(model_id = %model_id, error = %e, "Failed to restart server");
                }
            }
        }

        restarted
    }
}
