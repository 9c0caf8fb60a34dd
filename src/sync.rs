//! Artifact synchronization
//!
//! Reconciles the local copy of a model with the version its registry alias
//! currently points at. The ledger is only written after at least one file
//! of the new version landed on disk, so a failed sync never advances the
//! recorded version.

use crate::config::SyncConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::ledger::{Ledger, ModelRecord};
use crate::metrics;
use crate::models::cache::{clear_dir_contents, has_files, model_dir, validate_model_name};
use crate::models::registry::{RegistryClient, ResolvedVersion};
use crate::models::store::{ArtifactStore, ObjectEntry, ObjectPrefix, part_path};
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The one staleness predicate
///
/// Stale iff `force`, or nothing is recorded, or the recorded version differs
/// from the resolved one. With `require_local_files`, a recorded version
/// whose directory is missing or empty is stale too.
pub fn is_stale(
    stored: &ModelRecord,
    resolved_version: &str,
    force: bool,
    require_local_files: bool,
) -> bool {
    if force {
        return true;
    }

    match stored.version() {
        None => true,
        Some(version) if version != resolved_version => true,
        Some(_) => {
            require_local_files
                && !stored
                    .local_dir
                    .as_deref()
                    .is_some_and(has_files)
        }
    }
}

/// Path of `object_name` relative to the artifact prefix
///
/// Returns `None` for directory markers and for objects that merely share
/// the prefix string (`model_path-foo/...` under `model_path`). An object
/// whose key equals the prefix is a single-file artifact and maps to its
/// last path segment.
pub fn relative_path(prefix: &str, object: &ObjectEntry) -> Option<String> {
    let prefix = prefix.trim_end_matches('/');

    let rel = if prefix.is_empty() {
        object.name.as_str()
    } else if object.name == prefix {
        if object.size == 0 {
            return None;
        }
        return prefix.rsplit('/').next().map(str::to_string);
    } else {
        object.name.strip_prefix(prefix)?.strip_prefix('/')?
    };

    if rel.is_empty() || rel.ends_with('/') {
        return None;
    }
    Some(rel.to_string())
}

/// Join `rel` onto `root`, refusing anything that would escape it
pub fn safe_join(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (path != root).then_some(path)
}

/// Result of comparing the ledger against the registry
#[derive(Debug, Clone)]
pub struct SyncCheck {
    pub model_name: String,
    pub alias: String,
    pub resolved: ResolvedVersion,
    pub stored: ModelRecord,
    pub stale: bool,
}

/// One object that could not be transferred
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTransfer {
    pub object: String,
    pub reason: String,
}

/// What `ensure_synced` did
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub model_name: String,
    pub local_dir: PathBuf,
    pub version_id: String,
    /// False when the local copy was already current
    pub fetched: bool,
    pub files: usize,
    pub bytes: u64,
    pub failed: Vec<FailedTransfer>,
}

/// Downloads model artifacts and keeps the ledger in step
pub struct Synchronizer {
    registry: Arc<dyn RegistryClient>,
    store: Arc<dyn ArtifactStore>,
    ledger: Arc<Ledger>,
    models_root: PathBuf,
    options: SyncConfig,
    /// Serializes operations on the same model name within this process
    name_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Synchronizer {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        store: Arc<dyn ArtifactStore>,
        ledger: Arc<Ledger>,
        models_root: PathBuf,
        options: SyncConfig,
    ) -> Self {
        Self {
            registry,
            store,
            ledger,
            models_root,
            options,
            name_locks: DashMap::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<dyn RegistryClient> {
        &self.registry
    }

    /// Default destination for `model_name`
    pub fn default_dir(&self, model_name: &str) -> PathBuf {
        model_dir(&self.models_root, model_name)
    }

    fn name_lock(&self, model_name: &str) -> Arc<Mutex<()>> {
        self.name_locks
            .entry(model_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Compare the ledger with the registry without fetching anything
    pub async fn check(&self, model_name: &str, alias: &str) -> TrackerResult<SyncCheck> {
        validate_model_name(model_name)?;
        let resolved = self.registry.resolve(model_name, alias).await?;
        let stored = self.ledger.get(model_name).await?;
        let stale = is_stale(
            &stored,
            &resolved.version_id,
            false,
            self.options.verify_local_files,
        );

        tracing::debug!(
            model = %model_name,
            alias = %alias,
            local_version = ?stored.version(),
            registry_version = %resolved.version_id,
            stale,
            "Checked model version"
        );

        Ok(SyncCheck {
            model_name: model_name.to_string(),
            alias: alias.to_string(),
            resolved,
            stored,
            stale,
        })
    }

    /// Make the local copy of `model_name` match its aliased version
    ///
    /// Returns the directory holding the synchronized tree. `destination`
    /// defaults to `<models_root>/<model_name>`.
    pub async fn ensure_synced(
        &self,
        model_name: &str,
        alias: &str,
        artifact_path: &str,
        destination: Option<&Path>,
        force: bool,
    ) -> TrackerResult<SyncOutcome> {
        validate_model_name(model_name)?;

        let name_lock = self.name_lock(model_name);
        let _name_guard = name_lock.lock().await;

        let resolved = self.registry.resolve(model_name, alias).await?;

        let _file_lock = if self.options.cross_process_lock {
            Some(self.ledger.lock_model(model_name).await?)
        } else {
            None
        };

        let stored = self.ledger.get(model_name).await?;

        if !is_stale(
            &stored,
            &resolved.version_id,
            force,
            self.options.verify_local_files,
        ) {
            tracing::info!(
                model = %model_name,
                alias = %alias,
                version = %resolved.version_id,
                "Model already up to date"
            );
            metrics::record_up_to_date(model_name);

            return Ok(SyncOutcome {
                model_name: model_name.to_string(),
                local_dir: stored
                    .local_dir
                    .unwrap_or_else(|| self.default_dir(model_name)),
                version_id: resolved.version_id,
                fetched: false,
                files: 0,
                bytes: 0,
                failed: Vec::new(),
            });
        }

        let destination = match destination {
            Some(dir) => dir.to_path_buf(),
            None => self.default_dir(model_name),
        };
        let destination = std::path::absolute(&destination)
            .map_err(|e| TrackerError::io(format!("Failed to resolve {:?}", destination), e))?;

        if force
            && let Some(old_dir) = stored.local_dir.as_deref()
            && old_dir.exists()
        {
            tracing::info!(model = %model_name, dir = ?old_dir, "Clearing previous download");
            clear_dir_contents(old_dir)
                .await
                .map_err(|e| TrackerError::io(format!("Failed to clear {:?}", old_dir), e))?;
        }

        let prefix = self
            .store
            .resolve_prefix(&resolved.artifact_uri, artifact_path)?;
        let location = self.store.location(&prefix);

        tracing::info!(
            model = %model_name,
            alias = %alias,
            from_version = ?stored.version(),
            to_version = %resolved.version_id,
            location = %location,
            dest = ?destination,
            "Downloading model artifacts"
        );

        let objects = self.store.list(&prefix).await?;
        if objects.is_empty() {
            return Err(TrackerError::ArtifactNotFound {
                location,
                failed: 0,
            });
        }

        let (files, bytes, failed) = self
            .transfer_all(model_name, &prefix, objects, &destination)
            .await;

        if files == 0 {
            return Err(TrackerError::ArtifactNotFound {
                location,
                failed: failed.len(),
            });
        }

        self.ledger
            .upsert(
                model_name,
                ModelRecord {
                    version_id: Some(resolved.version_id.clone()),
                    model_name: model_name.to_string(),
                    local_dir: Some(destination.clone()),
                    alias: Some(alias.to_string()),
                    artifact_path: Some(artifact_path.to_string()),
                    synced_at: Some(Utc::now()),
                },
            )
            .await?;

        metrics::record_sync(model_name, files, bytes);

        tracing::info!(
            model = %model_name,
            version = %resolved.version_id,
            files,
            bytes,
            failed = failed.len(),
            dest = ?destination,
            "Model synchronized"
        );

        Ok(SyncOutcome {
            model_name: model_name.to_string(),
            local_dir: destination,
            version_id: resolved.version_id,
            fetched: true,
            files,
            bytes,
            failed,
        })
    }

    /// Stream every object under `prefix` into `destination`
    ///
    /// Returns (files written, bytes written, failures).
    async fn transfer_all(
        &self,
        model_name: &str,
        prefix: &ObjectPrefix,
        objects: Vec<ObjectEntry>,
        destination: &Path,
    ) -> (usize, u64, Vec<FailedTransfer>) {
        let mut failed = Vec::new();
        let mut planned = Vec::new();

        for object in objects {
            let Some(rel) = relative_path(&prefix.key, &object) else {
                tracing::debug!(object = %object.name, "Skipping object outside artifact tree");
                continue;
            };
            match safe_join(destination, &rel) {
                Some(local_path) => planned.push((object, local_path)),
                None => failed.push(FailedTransfer {
                    object: object.name,
                    reason: format!("relative path {} escapes the destination", rel),
                }),
            }
        }

        let timeout = Duration::from_secs(self.options.transfer_timeout_secs);
        let store = &self.store;

        let results: Vec<(String, TrackerResult<u64>)> = futures::stream::iter(planned)
            .map(|(object, local_path)| async move {
                let result = transfer_one(store.as_ref(), prefix, &object, &local_path, timeout).await;
                (object.name, result)
            })
            .buffer_unordered(self.options.max_parallel_downloads.max(1))
            .collect()
            .await;

        let mut files = 0;
        let mut bytes = 0;
        for (object, result) in results {
            match result {
                Ok(written) => {
                    tracing::debug!(object = %object, bytes = written, "Downloaded object");
                    files += 1;
                    bytes += written;
                }
                Err(e) => failed.push(FailedTransfer {
                    object,
                    reason: e.to_string(),
                }),
            }
        }

        for failure in &failed {
            tracing::warn!(
                model = %model_name,
                object = %failure.object,
                reason = %failure.reason,
                "Failed to download object"
            );
            metrics::record_transfer_failure(model_name);
        }

        (files, bytes, failed)
    }
}

async fn transfer_one(
    store: &dyn ArtifactStore,
    prefix: &ObjectPrefix,
    object: &ObjectEntry,
    local_path: &Path,
    timeout: Duration,
) -> TrackerResult<u64> {
    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TrackerError::io(format!("Failed to create {:?}", parent), e))?;
    }

    match tokio::time::timeout(timeout, store.stream_to_file(prefix, object, local_path)).await {
        Ok(result) => result,
        Err(_) => {
            let _ = tokio::fs::remove_file(part_path(local_path)).await;
            Err(TrackerError::Transfer {
                object: object.name.clone(),
                reason: format!("timed out after {}s", timeout.as_secs()),
            })
        }
    }
}
