//! Tracker facade: keeps each tracked model synchronized and served

use crate::config::{StorageBackendKind, TrackedModel, TrackerConfig};
use crate::error::{TrackerError, TrackerResult};
use crate::instance::{ModelArtifacts, SystemProcessManager};
use crate::ledger::{Ledger, ModelRecord};
use crate::lifecycle::{DeleteTarget, ServeManager, ServeStatus};
use crate::models::cache::{
    dir_size, find_gguf_files, has_files, is_strictly_within, remove_dir, validate_model_name,
};
use crate::models::registry::{MlflowRegistryClient, RegistryClient};
use crate::models::store::{ArtifactStore, FsArtifactStore, GcsArtifactStore};
use crate::sync::{SyncOutcome, Synchronizer};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result of `ensure_model`
#[derive(Debug, Clone)]
pub struct EnsureOutcome {
    pub model_name: String,
    pub version_id: Option<String>,
    pub local_dir: PathBuf,
    /// A new version was downloaded
    pub synced: bool,
    pub serving: ServeStatus,
}

/// Per-model result of `update_all`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Updated { version_id: String },
    AlreadyCurrent,
    Failed { reason: String },
}

/// Local vs. registry view of one model
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub model_name: String,
    pub alias: String,
    pub local_version: Option<String>,
    pub registry_version: Option<String>,
    /// `None` when the registry check failed
    pub needs_update: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_error: Option<String>,
    pub local_dir: Option<PathBuf>,
    pub local_available: bool,
    pub local_size_bytes: u64,
    pub synced_at: Option<chrono::DateTime<chrono::Utc>>,
    pub serving: Option<ServeStatus>,
}

pub struct Tracker {
    config: TrackerConfig,
    sync: Arc<Synchronizer>,
    serve: Arc<ServeManager>,
}

impl Tracker {
    pub fn new(config: TrackerConfig, sync: Arc<Synchronizer>, serve: Arc<ServeManager>) -> Self {
        Self {
            config,
            sync,
            serve,
        }
    }

    /// Wire production clients from configuration
    pub fn from_config(config: TrackerConfig) -> TrackerResult<Self> {
        let registry: Arc<dyn RegistryClient> = Arc::new(MlflowRegistryClient::new(&config.registry)?);

        let store: Arc<dyn ArtifactStore> = match config.storage.backend {
            StorageBackendKind::Gcs => Arc::new(GcsArtifactStore::new(&config.storage)?),
            StorageBackendKind::Local => {
                let root = config.storage.local_root.clone().ok_or_else(|| {
                    TrackerError::Config("storage.local_root is required for the local backend".to_string())
                })?;
                Arc::new(FsArtifactStore::new(root))
            }
        };

        let ledger = Arc::new(Ledger::new(config.ledger_path.clone()));
        let sync = Arc::new(Synchronizer::new(
            registry,
            store,
            ledger,
            config.models_root.clone(),
            config.sync.clone(),
        ));
        let serve = Arc::new(
            ServeManager::new(config.server.clone(), Arc::new(SystemProcessManager::new()))
                .with_pid_files(true),
        );

        Ok(Self::new(config, sync, serve))
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    pub fn serve_manager(&self) -> &Arc<ServeManager> {
        &self.serve
    }

    fn ledger(&self) -> &Ledger {
        self.sync.ledger()
    }

    /// Configured settings for `model_name`, defaults if not configured
    fn tracked(&self, model_name: &str) -> TrackedModel {
        self.config
            .tracked_model(model_name)
            .cloned()
            .unwrap_or_else(|| TrackedModel::new(model_name))
    }

    /// Files handed to llama-server for the copy in `local_dir`
    ///
    /// Without a per-model `gguf_relative_path`, a missing default weights
    /// file falls back to the only `.gguf` in the directory that is not the
    /// projector.
    fn artifacts(&self, local_dir: &Path, model: &TrackedModel) -> ModelArtifacts {
        let mmproj = model.mmproj.as_ref().map(|p| local_dir.join(p));

        let weights = match &model.gguf_relative_path {
            Some(rel) => local_dir.join(rel),
            None => {
                let default = local_dir.join(&self.config.server.gguf_relative_path);
                if default.exists() {
                    default
                } else {
                    let found: Vec<PathBuf> = find_gguf_files(local_dir)
                        .into_iter()
                        .filter(|p| Some(p) != mmproj.as_ref())
                        .collect();
                    match found.as_slice() {
                        [only] => {
                            tracing::debug!(model = %model.name, file = ?only, "Using discovered GGUF file");
                            only.clone()
                        }
                        _ => default,
                    }
                }
            }
        };

        let mut artifacts = ModelArtifacts::new(weights);
        if let Some(mmproj) = mmproj {
            artifacts = artifacts.with("mmproj", mmproj);
        }
        if let Some(template) = &model.chat_template {
            artifacts = artifacts.with("chat_template", local_dir.join(template));
        }
        artifacts
    }

    fn port_for(&self, model: &TrackedModel) -> u16 {
        model.port.unwrap_or(self.config.server.default_port)
    }

    /// Sync destination: the configured `local_dir` wins over the one the
    /// ledger recorded; `None` means `<models_root>/<name>`
    fn destination(model: &TrackedModel, record: &ModelRecord) -> Option<PathBuf> {
        model.local_dir.clone().or_else(|| record.local_dir.clone())
    }

    /// Alias and artifact sub-path to use for an update, preferring what the
    /// ledger remembers
    fn sync_target(record: &ModelRecord, model: &TrackedModel) -> (String, String) {
        (
            record.alias.clone().unwrap_or_else(|| model.alias.clone()),
            record
                .artifact_path
                .clone()
                .unwrap_or_else(|| model.artifact_path.clone()),
        )
    }

    /// Alias last synchronized for `model_name`, else the configured one
    pub async fn alias_for(&self, model_name: &str) -> TrackerResult<String> {
        let record = self.ledger().get(model_name).await?;
        Ok(Self::sync_target(&record, &self.tracked(model_name)).0)
    }

    /// Ledger entries plus configured models, sorted
    pub async fn list_models(&self) -> TrackerResult<Vec<String>> {
        let mut names: BTreeSet<String> = self.ledger().list().await?.into_iter().collect();
        names.extend(self.config.models.iter().map(|m| m.name.clone()));
        Ok(names.into_iter().collect())
    }

    async fn is_tracked(&self, model_name: &str) -> TrackerResult<bool> {
        Ok(self.config.tracked_model(model_name).is_some()
            || self.ledger().contains(model_name).await?)
    }

    /// Bring `model_name` up to its aliased version and serve it
    ///
    /// Downloads only when stale and `download_if_missing` is set. A server
    /// already running for the model is replaced when a new version landed.
    pub async fn ensure_model(
        &self,
        model_name: &str,
        alias: &str,
        download_if_missing: bool,
    ) -> TrackerResult<EnsureOutcome> {
        validate_model_name(model_name)?;
        let tracked = self.tracked(model_name);
        let check = self.sync.check(model_name, alias).await?;

        let (local_dir, version_id, synced) = if check.stale && download_if_missing {
            let artifact_path = check
                .stored
                .artifact_path
                .clone()
                .unwrap_or_else(|| tracked.artifact_path.clone());
            // Configured local_dir, then the recorded one
            let destination = Self::destination(&tracked, &check.stored);

            let outcome = self
                .sync
                .ensure_synced(model_name, alias, &artifact_path, destination.as_deref(), false)
                .await?;
            (outcome.local_dir, Some(outcome.version_id), outcome.fetched)
        } else {
            if check.stale {
                tracing::warn!(
                    model = %model_name,
                    local_version = ?check.stored.version(),
                    registry_version = %check.resolved.version_id,
                    "Model is stale but downloads are disabled, serving local copy"
                );
            }
            (
                check
                    .stored
                    .local_dir
                    .clone()
                    .unwrap_or_else(|| self.sync.default_dir(model_name)),
                check.stored.version().map(str::to_string),
                false,
            )
        };

        let artifacts = self.artifacts(&local_dir, &tracked);
        match self.serve.get_status(model_name).await {
            Some(current) if current.running && synced => {
                self.serve
                    .update_serve(model_name, artifacts, current.port)
                    .await?;
            }
            Some(current) if current.running => {
                self.serve
                    .add_serve(model_name, artifacts, current.port)
                    .await?;
            }
            _ => {
                self.serve
                    .add_serve(model_name, artifacts, self.port_for(&tracked))
                    .await?;
            }
        }

        let serving = self
            .serve
            .get_status(model_name)
            .await
            .ok_or_else(|| TrackerError::ModelNotFound(model_name.to_string()))?;

        Ok(EnsureOutcome {
            model_name: model_name.to_string(),
            version_id,
            local_dir,
            synced,
            serving,
        })
    }

    /// Update one model and hot-swap its server if it is being served
    async fn update_one(&self, model_name: &str) -> TrackerResult<UpdateOutcome> {
        validate_model_name(model_name)?;
        let tracked = self.tracked(model_name);
        let record = self.ledger().get(model_name).await?;
        let (alias, artifact_path) = Self::sync_target(&record, &tracked);
        // Same precedence as ensure_model
        let destination = Self::destination(&tracked, &record);

        let outcome = self
            .sync
            .ensure_synced(model_name, &alias, &artifact_path, destination.as_deref(), false)
            .await?;

        if !outcome.fetched {
            return Ok(UpdateOutcome::AlreadyCurrent);
        }

        if let Some(current) = self.serve.get_status(model_name).await
            && current.running
        {
            let artifacts = self.artifacts(&outcome.local_dir, &tracked);
            self.serve
                .update_serve(model_name, artifacts, current.port)
                .await?;
        }

        Ok(UpdateOutcome::Updated {
            version_id: outcome.version_id,
        })
    }

    /// Update every tracked model; one failure never stops the others
    pub async fn update_all(&self) -> TrackerResult<BTreeMap<String, UpdateOutcome>> {
        let mut results = BTreeMap::new();

        for model_name in self.list_models().await? {
            let outcome = match self.update_one(&model_name).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(model = %model_name, error = %e, "Model update failed");
                    UpdateOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            results.insert(model_name, outcome);
        }

        let updated = results
            .values()
            .filter(|o| matches!(o, UpdateOutcome::Updated { .. }))
            .count();
        tracing::info!(models = results.len(), updated, "Update pass complete");

        Ok(results)
    }

    /// Start tracking a model and perform its initial synchronization
    ///
    /// On an already tracked model this switches alias or artifact path.
    pub async fn add_model(&self, model: &TrackedModel, force: bool) -> TrackerResult<SyncOutcome> {
        validate_model_name(&model.name)?;
        let record = self.ledger().get(&model.name).await?;
        let destination = model
            .local_dir
            .clone()
            .or_else(|| Self::destination(&self.tracked(&model.name), &record));

        let outcome = self
            .sync
            .ensure_synced(
                &model.name,
                &model.alias,
                &model.artifact_path,
                destination.as_deref(),
                force,
            )
            .await?;

        if !outcome.fetched {
            // Same version under a different alias still has to be remembered
            let mut record = self.ledger().get(&model.name).await?;
            if record.alias.as_deref() != Some(model.alias.as_str())
                || record.artifact_path.as_deref() != Some(model.artifact_path.as_str())
            {
                record.alias = Some(model.alias.clone());
                record.artifact_path = Some(model.artifact_path.clone());
                self.ledger().upsert(&model.name, record).await?;
            }
        }

        tracing::info!(
            model = %model.name,
            alias = %model.alias,
            version = %outcome.version_id,
            fetched = outcome.fetched,
            "Model added"
        );

        Ok(outcome)
    }

    /// Status of one tracked model
    pub async fn model_status(&self, model_name: &str) -> TrackerResult<ModelStatus> {
        validate_model_name(model_name)?;
        if !self.is_tracked(model_name).await? {
            return Err(TrackerError::ModelNotFound(model_name.to_string()));
        }

        let tracked = self.tracked(model_name);
        let record = self.ledger().get(model_name).await?;
        let (alias, _) = Self::sync_target(&record, &tracked);

        let (registry_version, needs_update, check_error) =
            match self.sync.check(model_name, &alias).await {
                Ok(check) => (Some(check.resolved.version_id), Some(check.stale), None),
                Err(e) => (None, None, Some(e.to_string())),
            };

        let local_available = record.local_dir.as_deref().is_some_and(has_files);
        let local_size_bytes = record.local_dir.as_deref().map(dir_size).unwrap_or(0);

        Ok(ModelStatus {
            model_name: model_name.to_string(),
            alias,
            local_version: record.version().map(str::to_string),
            registry_version,
            needs_update,
            check_error,
            local_dir: record.local_dir,
            local_available,
            local_size_bytes,
            synced_at: record.synced_at,
            serving: self.serve.get_status(model_name).await,
        })
    }

    /// Status of every tracked model
    pub async fn status(&self) -> TrackerResult<Vec<ModelStatus>> {
        let mut statuses = Vec::new();
        for model_name in self.list_models().await? {
            statuses.push(self.model_status(&model_name).await?);
        }
        Ok(statuses)
    }

    /// Stop serving, forget and remove the files of `model_name`
    ///
    /// Nothing is changed when the recorded directory is not removable.
    pub async fn delete_model(&self, model_name: &str) -> TrackerResult<()> {
        validate_model_name(model_name)?;
        if !self.is_tracked(model_name).await? {
            return Err(TrackerError::ModelNotFound(model_name.to_string()));
        }

        let _lock = if self.config.sync.cross_process_lock {
            Some(self.ledger().lock_model(model_name).await?)
        } else {
            None
        };

        if let Some(local_dir) = self.ledger().get(model_name).await?.local_dir {
            self.check_removable(model_name, &local_dir)?;
        }

        match self
            .serve
            .delete_serve(DeleteTarget::One(model_name.to_string()))
            .await
        {
            Ok(_) | Err(TrackerError::ModelNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let removed = self.ledger().delete(model_name).await?;

        if let Some(local_dir) = removed.and_then(|r| r.local_dir) {
            remove_dir(&local_dir)
                .await
                .map_err(|e| TrackerError::io(format!("Failed to remove {:?}", local_dir), e))?;
            tracing::info!(model = %model_name, dir = ?local_dir, "Model files removed");
        }

        tracing::info!(model = %model_name, "Model deleted");

        Ok(())
    }

    /// Directories under `models_root`, or exactly the configured
    /// `local_dir` of the model
    fn check_removable(&self, model_name: &str, dir: &Path) -> TrackerResult<()> {
        if is_strictly_within(&self.config.models_root, dir) {
            return Ok(());
        }

        let configured = self
            .config
            .tracked_model(model_name)
            .and_then(|m| m.local_dir.as_deref())
            .and_then(|p| std::path::absolute(p).ok());
        if configured.is_some() && configured == std::path::absolute(dir).ok() {
            return Ok(());
        }

        tracing::error!(model = %model_name, dir = ?dir, "Refusing to remove directory");
        Err(TrackerError::UnsafeRemoval(dir.to_path_buf()))
    }

    /// Serve the local copy of `model_name` without contacting the registry
    pub async fn serve_model(
        &self,
        model_name: &str,
        port: Option<u16>,
    ) -> TrackerResult<ServeStatus> {
        validate_model_name(model_name)?;
        let tracked = self.tracked(model_name);
        let record = self.ledger().get(model_name).await?;
        let local_dir = record
            .local_dir
            .unwrap_or_else(|| self.sync.default_dir(model_name));
        let artifacts = self.artifacts(&local_dir, &tracked);
        let port = port.unwrap_or_else(|| self.port_for(&tracked));

        self.serve.add_serve(model_name, artifacts, port).await?;

        self.serve
            .get_status(model_name)
            .await
            .ok_or_else(|| TrackerError::ModelNotFound(model_name.to_string()))
    }

    pub async fn stop_model(&self, model_name: &str) -> TrackerResult<()> {
        self.serve.stop_serve(model_name).await
    }

    /// Stop every server; used on shutdown
    pub async fn shutdown(&self) -> usize {
        self.serve.shutdown().await
    }
}
