//! Artifact store clients
//!
//! Object stores are flat: a "directory" is just a common key prefix. A
//! listing returns every object whose key starts with the prefix string;
//! deciding which of those belong to the artifact tree is the synchronizer's
//! job.

use crate::config::StorageConfig;
use crate::error::{TrackerError, TrackerResult};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Where an artifact tree lives: a container (bucket or directory) plus a key
/// prefix inside it, without a trailing slash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPrefix {
    pub container: String,
    pub key: String,
}

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Full key inside the container
    pub name: String,
    pub size: u64,
}

/// Artifact store capability consumed by the synchronizer
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Map a run's artifact URI plus a sub-path to a listable prefix
    fn resolve_prefix(&self, artifact_uri: &str, artifact_path: &str)
    -> TrackerResult<ObjectPrefix>;

    /// Every object whose key starts with `prefix.key`
    async fn list(&self, prefix: &ObjectPrefix) -> TrackerResult<Vec<ObjectEntry>>;

    /// Stream one object to `local_path`, returning bytes written
    ///
    /// Data lands in a `.part` sibling and is renamed into place on success.
    async fn stream_to_file(
        &self,
        prefix: &ObjectPrefix,
        object: &ObjectEntry,
        local_path: &Path,
    ) -> TrackerResult<u64>;

    /// Human-readable location, used in errors and logs
    fn location(&self, prefix: &ObjectPrefix) -> String;
}

/// In-progress download path for `path`
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

fn transfer_error(object: &str, reason: impl std::fmt::Display) -> TrackerError {
    TrackerError::Transfer {
        object: object.to_string(),
        reason: reason.to_string(),
    }
}

fn join_uri(artifact_uri: &str, artifact_path: &str) -> String {
    let base = artifact_uri.trim_end_matches('/');
    let sub = artifact_path.trim_matches('/');
    if sub.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, sub)
    }
}

// ============================================================================
// Google Cloud Storage
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsObject {
    name: String,
    /// The JSON API encodes uint64 as a decimal string
    #[serde(default)]
    size: Option<String>,
}

/// Artifact store backed by the GCS JSON API
pub struct GcsArtifactStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
}

impl GcsArtifactStore {
    pub fn new(config: &StorageConfig) -> TrackerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TrackerError::Config(format!("Failed to build storage client: {}", e)))?;

        let token = match (&config.access_token, &config.token_file) {
            (Some(token), _) => Some(token.trim().to_string()),
            (None, Some(path)) => Some(
                std::fs::read_to_string(path)
                    .map_err(|e| TrackerError::io(format!("Failed to read token file {:?}", path), e))?
                    .trim()
                    .to_string(),
            ),
            (None, None) => None,
        };

        if token.is_none() {
            tracing::warn!("No GCS access token configured, requests will be anonymous");
        }

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            token,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn list_page(
        &self,
        prefix: &ObjectPrefix,
        page_token: Option<&str>,
    ) -> TrackerResult<ListResponse> {
        let url = format!(
            "{}/storage/v1/b/{}/o",
            self.endpoint,
            urlencoding::encode(&prefix.container)
        );
        let mut query = vec![("prefix", prefix.key.as_str())];
        if let Some(page_token) = page_token {
            query.push(("pageToken", page_token));
        }

        let response = self
            .authorized(self.client.get(&url).query(&query))
            .send()
            .await
            .map_err(|e| transfer_error(&self.location(prefix), e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(transfer_error(
                &self.location(prefix),
                format!("listing returned HTTP {}: {}", status, body.trim()),
            ));
        }

        response
            .json::<ListResponse>()
            .await
            .map_err(|e| transfer_error(&self.location(prefix), e))
    }
}

#[async_trait]
impl ArtifactStore for GcsArtifactStore {
    fn resolve_prefix(
        &self,
        artifact_uri: &str,
        artifact_path: &str,
    ) -> TrackerResult<ObjectPrefix> {
        let uri = artifact_uri.replacen("mlflow-artifacts:", &format!("gs://{}", self.bucket), 1);
        let full = join_uri(&uri, artifact_path);

        let rest = full.strip_prefix("gs://").ok_or_else(|| {
            TrackerError::Config(format!(
                "Artifact URI {} is not a GCS location",
                artifact_uri
            ))
        })?;

        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(TrackerError::Config(format!(
                "Artifact URI {} has no bucket",
                artifact_uri
            )));
        }

        Ok(ObjectPrefix {
            container: bucket.to_string(),
            key: key.trim_matches('/').to_string(),
        })
    }

    async fn list(&self, prefix: &ObjectPrefix) -> TrackerResult<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self.list_page(prefix, page_token.as_deref()).await?;
            entries.extend(page.items.into_iter().map(|item| ObjectEntry {
                size: item.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                name: item.name,
            }));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::debug!(location = %self.location(prefix), objects = entries.len(), "Listed objects");

        Ok(entries)
    }

    async fn stream_to_file(
        &self,
        prefix: &ObjectPrefix,
        object: &ObjectEntry,
        local_path: &Path,
    ) -> TrackerResult<u64> {
        let url = format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            urlencoding::encode(&prefix.container),
            urlencoding::encode(&object.name)
        );

        let response = self
            .authorized(self.client.get(&url).query(&[("alt", "media")]))
            .send()
            .await
            .map_err(|e| transfer_error(&object.name, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(transfer_error(
                &object.name,
                format!("download returned HTTP {}", status),
            ));
        }

        let part = part_path(local_path);
        let result = async {
            let mut file = tokio::fs::File::create(&part)
                .await
                .map_err(|e| transfer_error(&object.name, e))?;

            let mut written = 0u64;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| transfer_error(&object.name, e))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| transfer_error(&object.name, e))?;
                written += chunk.len() as u64;
            }
            file.flush()
                .await
                .map_err(|e| transfer_error(&object.name, e))?;

            Ok::<u64, TrackerError>(written)
        }
        .await;

        finish_part(&object.name, &part, local_path, result).await
    }

    fn location(&self, prefix: &ObjectPrefix) -> String {
        format!("gs://{}/{}", prefix.container, prefix.key)
    }
}

/// Rename a completed `.part` file into place, or remove it on failure
async fn finish_part(
    object: &str,
    part: &Path,
    local_path: &Path,
    result: TrackerResult<u64>,
) -> TrackerResult<u64> {
    match result {
        Ok(written) => {
            tokio::fs::rename(part, local_path)
                .await
                .map_err(|e| transfer_error(object, e))?;
            Ok(written)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(part).await;
            Err(e)
        }
    }
}

// ============================================================================
// Local directory mirror
// ============================================================================

/// Artifact store reading from the local filesystem
///
/// `file://` URIs and absolute paths are used as-is. `mlflow-artifacts:/x`
/// and `gs://bucket/x` resolve under `root` (`root/x` and `root/bucket/x`),
/// so a mirrored bucket can stand in for GCS.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn container_dir(&self, artifact_uri: &str) -> PathBuf {
        if let Some(path) = artifact_uri.strip_prefix("file://") {
            PathBuf::from(path)
        } else if let Some(rest) = artifact_uri.strip_prefix("mlflow-artifacts:") {
            self.root.join(rest.trim_start_matches('/'))
        } else if let Some(rest) = artifact_uri.strip_prefix("gs://") {
            self.root.join(rest)
        } else {
            let path = PathBuf::from(artifact_uri);
            if path.is_absolute() {
                path
            } else {
                self.root.join(path)
            }
        }
    }
}

/// All regular files under `dir`, as `/`-joined paths relative to `dir`
fn walk_files(dir: &Path) -> std::io::Result<Vec<(String, u64)>> {
    let mut files = Vec::new();
    let mut pending = vec![(dir.to_path_buf(), String::new())];

    while let Some((current, rel)) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let child_rel = if rel.is_empty() {
                name
            } else {
                format!("{}/{}", rel, name)
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push((entry.path(), child_rel));
            } else if file_type.is_file() {
                files.push((child_rel, entry.metadata()?.len()));
            }
        }
    }

    files.sort();
    Ok(files)
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn resolve_prefix(
        &self,
        artifact_uri: &str,
        artifact_path: &str,
    ) -> TrackerResult<ObjectPrefix> {
        let container = self.container_dir(artifact_uri.trim_end_matches('/'));
        Ok(ObjectPrefix {
            container: container.to_string_lossy().to_string(),
            key: artifact_path.trim_matches('/').to_string(),
        })
    }

    async fn list(&self, prefix: &ObjectPrefix) -> TrackerResult<Vec<ObjectEntry>> {
        let container = PathBuf::from(&prefix.container);
        let files = tokio::task::spawn_blocking(move || walk_files(&container))
            .await
            .map_err(|e| transfer_error(&prefix.container, e))?
            .map_err(|e| TrackerError::io(format!("Failed to list {}", prefix.container), e))?;

        Ok(files
            .into_iter()
            .filter(|(name, _)| name.starts_with(&prefix.key))
            .map(|(name, size)| ObjectEntry { name, size })
            .collect())
    }

    async fn stream_to_file(
        &self,
        prefix: &ObjectPrefix,
        object: &ObjectEntry,
        local_path: &Path,
    ) -> TrackerResult<u64> {
        let source = Path::new(&prefix.container).join(&object.name);
        let part = part_path(local_path);

        let result = tokio::fs::copy(&source, &part)
            .await
            .map_err(|e| transfer_error(&object.name, e));

        finish_part(&object.name, &part, local_path, result).await
    }

    fn location(&self, prefix: &ObjectPrefix) -> String {
        Path::new(&prefix.container)
            .join(&prefix.key)
            .display()
            .to_string()
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gcs_store() -> GcsArtifactStore {
        let config = StorageConfig {
            bucket: "mlflow-artifacts-bucket".to_string(),
            access_token: Some("token".to_string()),
            ..Default::default()
        };
        GcsArtifactStore::new(&config).unwrap()
    }

    #[test]
    fn test_gcs_resolves_mlflow_artifacts_uri() {
        let store = gcs_store();
        let prefix = store
            .resolve_prefix("mlflow-artifacts:/1/abc123/artifacts", "model_path")
            .unwrap();

        assert_eq!(prefix.container, "mlflow-artifacts-bucket");
        assert_eq!(prefix.key, "1/abc123/artifacts/model_path");
        assert_eq!(
            store.location(&prefix),
            "gs://mlflow-artifacts-bucket/1/abc123/artifacts/model_path"
        );
    }

    #[test]
    fn test_gcs_resolves_gs_uri_with_own_bucket() {
        let store = gcs_store();
        let prefix = store
            .resolve_prefix("gs://other-bucket/mlruns/7/run/artifacts/", "/model_path/")
            .unwrap();

        assert_eq!(prefix.container, "other-bucket");
        assert_eq!(prefix.key, "mlruns/7/run/artifacts/model_path");
    }

    #[test]
    fn test_gcs_rejects_foreign_scheme() {
        let store = gcs_store();
        let result = store.resolve_prefix("s3://bucket/run/artifacts", "model_path");
        assert!(matches!(result, Err(TrackerError::Config(_))));
    }

    #[test]
    fn test_gcs_token_file_is_read() {
        let temp_dir = TempDir::new().unwrap();
        let token_file = temp_dir.path().join("token");
        std::fs::write(&token_file, "ya29.secret\n").unwrap();

        let config = StorageConfig {
            token_file: Some(token_file),
            ..Default::default()
        };
        let store = GcsArtifactStore::new(&config).unwrap();
        assert_eq!(store.token.as_deref(), Some("ya29.secret"));
    }

    #[test]
    fn test_gcs_missing_token_file_fails() {
        let config = StorageConfig {
            token_file: Some(PathBuf::from("/nonexistent/token")),
            ..Default::default()
        };
        assert!(matches!(
            GcsArtifactStore::new(&config),
            Err(TrackerError::Io { .. })
        ));
    }

    #[test]
    fn test_parse_list_response() {
        let body = r#"{
            "kind": "storage#objects",
            "items": [
                {"name": "run/model_path/artifacts/model.gguf", "size": "4096"},
                {"name": "run/model_path/", "size": "0"}
            ],
            "nextPageToken": "CiRydW4v"
        }"#;
        let page: ListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].size.as_deref(), Some("4096"));
        assert_eq!(page.next_page_token.as_deref(), Some("CiRydW4v"));

        let empty: ListResponse = serde_json::from_str(r#"{"kind": "storage#objects"}"#).unwrap();
        assert!(empty.items.is_empty());
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/m/artifacts/model.gguf")),
            PathBuf::from("/m/artifacts/model.gguf.part")
        );
    }

    #[test]
    fn test_fs_resolves_uri_forms() {
        let store = FsArtifactStore::new("/mirror");

        let prefix = store
            .resolve_prefix("file:///runs/abc/artifacts", "model_path")
            .unwrap();
        assert_eq!(prefix.container, "/runs/abc/artifacts");
        assert_eq!(prefix.key, "model_path");

        let prefix = store
            .resolve_prefix("mlflow-artifacts:/1/abc/artifacts", "model_path")
            .unwrap();
        assert_eq!(PathBuf::from(&prefix.container), PathBuf::from("/mirror/1/abc/artifacts"));

        let prefix = store.resolve_prefix("gs://bucket/1/abc", "model_path").unwrap();
        assert_eq!(PathBuf::from(&prefix.container), PathBuf::from("/mirror/bucket/1/abc"));
    }

    #[tokio::test]
    async fn test_fs_list_uses_string_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let run = temp_dir.path().join("run");
        std::fs::create_dir_all(run.join("model_path/artifacts")).unwrap();
        std::fs::create_dir_all(run.join("model_path-foo")).unwrap();
        std::fs::write(run.join("model_path/artifacts/model.gguf"), b"gguf").unwrap();
        std::fs::write(run.join("model_path-foo/other.bin"), b"x").unwrap();
        std::fs::write(run.join("metrics.json"), b"{}").unwrap();

        let store = FsArtifactStore::new(temp_dir.path());
        let prefix = store
            .resolve_prefix(&format!("file://{}", run.display()), "model_path")
            .unwrap();
        let entries = store.list(&prefix).await.unwrap();

        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["model_path-foo/other.bin", "model_path/artifacts/model.gguf"]
        );
        assert_eq!(entries[1].size, 4);
    }

    #[tokio::test]
    async fn test_fs_list_missing_container_is_empty() {
        let store = FsArtifactStore::new("/nonexistent-mirror");
        let prefix = store.resolve_prefix("file:///nonexistent/run", "model_path").unwrap();
        assert!(store.list(&prefix).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fs_stream_to_file_renames_part() {
        let temp_dir = TempDir::new().unwrap();
        let run = temp_dir.path().join("run");
        std::fs::create_dir_all(run.join("model_path")).unwrap();
        std::fs::write(run.join("model_path/model.gguf"), b"weights").unwrap();

        let store = FsArtifactStore::new(temp_dir.path());
        let prefix = store
            .resolve_prefix(&format!("file://{}", run.display()), "model_path")
            .unwrap();
        let entries = store.list(&prefix).await.unwrap();

        let dest = temp_dir.path().join("out.gguf");
        let written = store.stream_to_file(&prefix, &entries[0], &dest).await.unwrap();

        assert_eq!(written, 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"weights");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_fs_stream_missing_object_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp_dir.path());
        let prefix = ObjectPrefix {
            container: temp_dir.path().to_string_lossy().to_string(),
            key: "model_path".to_string(),
        };
        let object = ObjectEntry {
            name: "model_path/missing.gguf".to_string(),
            size: 1,
        };

        let dest = temp_dir.path().join("out.gguf");
        let result = store.stream_to_file(&prefix, &object, &dest).await;

        assert!(matches!(result, Err(TrackerError::Transfer { .. })));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }
}
