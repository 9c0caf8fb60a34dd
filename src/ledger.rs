//! Ledger persistence: which model version is materialized locally
//!
//! The ledger is a single JSON document keyed by model name. Every mutation
//! reads the whole document, changes one key and writes the whole document
//! back through a temp file + rename, so readers never observe a partial
//! write.

use crate::error::{TrackerError, TrackerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically
    async fn save(&self, path: &Path, content: &str) -> TrackerResult<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> TrackerResult<Option<String>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
pub struct FileSystemStorage;

impl FileSystemStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileSystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Temp file used while writing `path`; unique per process so two writers
/// never share one
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> TrackerResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TrackerError::io(format!("Failed to create {:?}", parent), e))?;
        }

        // Atomic write: write to temp file, then rename
        let temp_file = temp_path_for(path);

        let mut file = fs::File::create(&temp_file)
            .await
            .map_err(|e| TrackerError::io("Failed to create temp ledger file", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| TrackerError::io("Failed to write ledger file", e))?;
        file.sync_all()
            .await
            .map_err(|e| TrackerError::io("Failed to sync ledger file", e))?;

        fs::rename(&temp_file, path)
            .await
            .map_err(|e| TrackerError::io("Failed to rename temp ledger file", e))?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> TrackerResult<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TrackerError::io(
                format!("Failed to read ledger file: {:?}", path),
                e,
            )),
        }
    }
}

// ============================================================================
// Ledger records
// ============================================================================

/// What is materialized locally for one model name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Registry snapshot id (MLflow run id); `None` means never synchronized
    #[serde(rename = "run_id", alias = "version_id", default)]
    pub version_id: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub model_name: String,

    #[serde(rename = "model_dir", default, deserialize_with = "optional_dir")]
    pub local_dir: Option<PathBuf>,

    #[serde(default)]
    pub alias: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl ModelRecord {
    /// Zero-valued record for a model that has never been synchronized
    pub fn unsynced(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Default::default()
        }
    }

    /// Stored version id, treating an empty string like an absent one
    pub fn version(&self) -> Option<&str> {
        self.version_id.as_deref().filter(|v| !v.is_empty())
    }

    pub fn is_synced(&self) -> bool {
        self.version().is_some()
    }
}

fn null_as_default<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Older ledgers wrote the literal string "None" for an unset directory
fn optional_dir<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .filter(|s| !s.is_empty() && s != "None")
        .map(PathBuf::from))
}

/// Full ledger contents
pub type LedgerDocument = BTreeMap<String, ModelRecord>;

// ============================================================================
// Ledger with Dependency Injection
// ============================================================================

/// Persisted mapping from model name to its synchronized version
pub struct Ledger {
    path: PathBuf,
    storage: Arc<dyn StorageBackend>,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
    /// Also serialize them across processes through `<path>.lock`
    document_lock: bool,
}

impl Ledger {
    /// Create a ledger with a custom storage backend
    pub fn new_with_storage(path: PathBuf, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            path,
            storage,
            write_lock: Mutex::new(()),
            document_lock: false,
        }
    }

    /// Create a ledger backed by the filesystem
    pub fn new(path: PathBuf) -> Self {
        Self {
            document_lock: true,
            ..Self::new_with_storage(path, Arc::new(FileSystemStorage::new()))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse a ledger document
    /// FAILS HARD if the document is corrupted - user must fix or delete
    pub fn decode(path: &Path, content: &str) -> TrackerResult<LedgerDocument> {
        let parsed: Option<LedgerDocument> =
            serde_json::from_str(content).map_err(|e| TrackerError::CorruptLedger {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut document = parsed.unwrap_or_default();
        for (name, record) in document.iter_mut() {
            if record.model_name.is_empty() {
                record.model_name = name.clone();
            }
        }
        Ok(document)
    }

    pub fn encode(document: &LedgerDocument) -> TrackerResult<String> {
        serde_json::to_string_pretty(document).map_err(|e| TrackerError::CorruptLedger {
            path: PathBuf::new(),
            reason: format!("Failed to serialize ledger: {}", e),
        })
    }

    /// Load the full document, creating an empty one if none exists yet
    pub async fn load(&self) -> TrackerResult<LedgerDocument> {
        if let Some(content) = self.storage.load(&self.path).await? {
            return Self::decode(&self.path, &content);
        }

        let _guard = self.write_lock.lock().await;
        let _document_lock = self.lock_document().await?;
        self.load_or_create().await
    }

    /// Caller holds the write lock
    async fn load_or_create(&self) -> TrackerResult<LedgerDocument> {
        let Some(content) = self.storage.load(&self.path).await? else {
            tracing::info!(path = ?self.path, "No ledger found, creating an empty one");
            let empty = LedgerDocument::new();
            self.save(&empty).await?;
            return Ok(empty);
        };

        let document = Self::decode(&self.path, &content)?;

        tracing::debug!(path = ?self.path, models = document.len(), "Ledger loaded");

        Ok(document)
    }

    /// Cross-process lock on the whole document, for filesystem ledgers
    async fn lock_document(&self) -> TrackerResult<Option<ModelLock>> {
        if !self.document_lock {
            return Ok(None);
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TrackerError::io(format!("Failed to create {:?}", parent), e))?;
        }

        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        Ok(Some(ModelLock::acquire(self.path.with_file_name(name)).await?))
    }

    /// Overwrite the document atomically
    pub async fn save(&self, document: &LedgerDocument) -> TrackerResult<()> {
        let content = Self::encode(document)?;
        self.storage.save(&self.path, &content).await?;

        tracing::debug!(path = ?self.path, models = document.len(), "Ledger saved");

        Ok(())
    }

    /// Record for `model_name`, or an unsynced record if it is not tracked
    pub async fn get(&self, model_name: &str) -> TrackerResult<ModelRecord> {
        let document = self.load().await?;
        Ok(document
            .get(model_name)
            .cloned()
            .unwrap_or_else(|| ModelRecord::unsynced(model_name)))
    }

    pub async fn contains(&self, model_name: &str) -> TrackerResult<bool> {
        Ok(self.load().await?.contains_key(model_name))
    }

    /// Tracked model names, sorted
    pub async fn list(&self) -> TrackerResult<Vec<String>> {
        Ok(self.load().await?.into_keys().collect())
    }

    /// Replace the record for `model_name`
    pub async fn upsert(&self, model_name: &str, mut record: ModelRecord) -> TrackerResult<()> {
        let _guard = self.write_lock.lock().await;
        let _document_lock = self.lock_document().await?;

        let mut document = self.load_or_create().await?;
        record.model_name = model_name.to_string();
        document.insert(model_name.to_string(), record);
        self.save(&document).await?;

        tracing::info!(model = %model_name, "Ledger entry updated");

        Ok(())
    }

    /// Remove `model_name` and return the removed record
    ///
    /// The caller deletes the record's files afterwards, so an interrupted
    /// deletion leaves no ledger entry pointing at missing files.
    pub async fn delete(&self, model_name: &str) -> TrackerResult<Option<ModelRecord>> {
        let _guard = self.write_lock.lock().await;
        let _document_lock = self.lock_document().await?;

        let mut document = self.load_or_create().await?;
        let removed = document.remove(model_name);
        if removed.is_some() {
            self.save(&document).await?;
            tracing::info!(model = %model_name, "Ledger entry removed");
        }

        Ok(removed)
    }

    /// Acquire the cross-process advisory lock for `model_name`
    ///
    /// Blocks until any other holder releases it. Released on drop.
    pub async fn lock_model(&self, model_name: &str) -> TrackerResult<ModelLock> {
        let lock_dir = self
            .path
            .parent()
            .map(|p| p.join("locks"))
            .unwrap_or_else(|| PathBuf::from("locks"));
        fs::create_dir_all(&lock_dir)
            .await
            .map_err(|e| TrackerError::io(format!("Failed to create {:?}", lock_dir), e))?;

        let lock_path = lock_dir.join(format!("{}.lock", safe_file_stem(model_name)));
        ModelLock::acquire(lock_path).await
    }
}

pub(crate) fn safe_file_stem(model_name: &str) -> String {
    model_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Exclusive advisory lock file, released on drop
pub struct ModelLock {
    path: PathBuf,
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<std::fs::File>,
}

impl ModelLock {
    #[cfg(unix)]
    async fn acquire(path: PathBuf) -> TrackerResult<Self> {
        use nix::fcntl::{Flock, FlockArg};

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| TrackerError::io(format!("Failed to open lock file {:?}", path), e))?;

        let flock = tokio::task::spawn_blocking(move || {
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| errno)
        })
        .await
        .map_err(|e| TrackerError::Process(format!("Lock task failed: {}", e)))?
        .map_err(|errno| {
            TrackerError::io(
                format!("Failed to lock {:?}", path),
                std::io::Error::from(errno),
            )
        })?;

        tracing::debug!(path = ?path, "Model lock acquired");

        Ok(Self {
            path,
            _flock: flock,
        })
    }

    #[cfg(not(unix))]
    async fn acquire(path: PathBuf) -> TrackerResult<Self> {
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use mocks::MockStorage;
    use tempfile::TempDir;

    fn synced(version: &str, alias: &str, dir: &str) -> ModelRecord {
        ModelRecord {
            version_id: Some(version.to_string()),
            model_name: String::new(),
            local_dir: Some(PathBuf::from(dir)),
            alias: Some(alias.to_string()),
            artifact_path: Some("model_path".to_string()),
            synced_at: None,
        }
    }

    #[tokio::test]
    async fn test_load_missing_creates_empty_document() {
        let path = PathBuf::from("/test/config.json");
        let storage = Arc::new(MockStorage::new());
        let ledger = Ledger::new_with_storage(path.clone(), storage.clone());

        let document = ledger.load().await.unwrap();
        assert!(document.is_empty());
        assert_eq!(storage.get_file(&path).await.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_corrupted_ledger_fails() {
        let path = PathBuf::from("/test/config.json");
        let storage = Arc::new(MockStorage::new());
        storage.put_file(&path, "{ this is not json").await;
        let ledger = Ledger::new_with_storage(path.clone(), storage.clone());

        let result = ledger.load().await;
        assert!(matches!(result, Err(TrackerError::CorruptLedger { .. })));

        // No auto-repair
        assert_eq!(
            storage.get_file(&path).await.as_deref(),
            Some("{ this is not json")
        );
    }

    #[tokio::test]
    async fn test_get_missing_returns_unsynced_record() {
        let ledger =
            Ledger::new_with_storage(PathBuf::from("/test/config.json"), Arc::new(MockStorage::new()));

        let record = ledger.get("qa_model").await.unwrap();
        assert_eq!(record.model_name, "qa_model");
        assert!(!record.is_synced());
        assert!(record.local_dir.is_none());
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let ledger =
            Ledger::new_with_storage(PathBuf::from("/test/config.json"), Arc::new(MockStorage::new()));

        ledger
            .upsert("qa_model", synced("v1", "champion", "/models/qa_model"))
            .await
            .unwrap();

        let record = ledger.get("qa_model").await.unwrap();
        assert_eq!(record.version(), Some("v1"));
        assert_eq!(record.alias.as_deref(), Some("champion"));
        assert_eq!(record.model_name, "qa_model");
        assert_eq!(record.local_dir, Some(PathBuf::from("/models/qa_model")));
        assert!(ledger.contains("qa_model").await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_preserves_other_models() {
        let ledger =
            Ledger::new_with_storage(PathBuf::from("/test/config.json"), Arc::new(MockStorage::new()));

        ledger.upsert("a", synced("v1", "champion", "/m/a")).await.unwrap();
        ledger.upsert("b", synced("v7", "challenger", "/m/b")).await.unwrap();
        ledger.upsert("a", synced("v2", "champion", "/m/a")).await.unwrap();

        let document = ledger.load().await.unwrap();
        assert_eq!(document.len(), 2);
        assert_eq!(document["a"].version(), Some("v2"));
        assert_eq!(document["b"].version(), Some("v7"));
        assert_eq!(ledger.list().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_delete_returns_record() {
        let ledger =
            Ledger::new_with_storage(PathBuf::from("/test/config.json"), Arc::new(MockStorage::new()));

        ledger.upsert("a", synced("v1", "champion", "/m/a")).await.unwrap();

        let removed = ledger.delete("a").await.unwrap().unwrap();
        assert_eq!(removed.local_dir, Some(PathBuf::from("/m/a")));
        assert!(!ledger.contains("a").await.unwrap());

        // Deleting an unknown name is not an error at this layer
        assert!(ledger.delete("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_error_leaves_previous_document() {
        let path = PathBuf::from("/test/config.json");
        let storage = Arc::new(MockStorage::new());
        let ledger = Ledger::new_with_storage(path.clone(), storage.clone());

        ledger.upsert("a", synced("v1", "champion", "/m/a")).await.unwrap();

        storage.set_save_error("disk full".to_string()).await;
        let result = ledger.upsert("a", synced("v2", "champion", "/m/a")).await;
        assert!(result.is_err());

        assert_eq!(ledger.get("a").await.unwrap().version(), Some("v1"));
    }

    #[tokio::test]
    async fn test_load_error_propagates() {
        let storage = Arc::new(MockStorage::new());
        let ledger = Ledger::new_with_storage(PathBuf::from("/test/config.json"), storage.clone());

        storage.set_load_error("permission denied".to_string()).await;
        let result = ledger.get("a").await;
        assert!(matches!(result, Err(TrackerError::Io { .. })));
    }

    #[tokio::test]
    async fn test_atomic_write_no_temp_files() {
        let path = PathBuf::from("/test/config.json");
        let storage = Arc::new(MockStorage::new());
        let ledger = Ledger::new_with_storage(path.clone(), storage.clone());

        ledger.upsert("a", synced("v1", "champion", "/m/a")).await.unwrap();

        assert!(!storage.has_temp_file(&path).await);
    }

    #[test]
    fn test_decode_legacy_document() {
        // Shape written by the earlier tooling: null ids and "None" directories
        let content = r#"{
            "qa_model": {
                "run_id": "abc123",
                "model_name": "qa_model",
                "model_dir": "/srv/models/qa_model",
                "alias": "champion"
            },
            "fresh": {
                "run_id": null,
                "model_name": null,
                "model_dir": "None",
                "alias": null
            }
        }"#;

        let document = Ledger::decode(Path::new("/x"), content).unwrap();
        assert_eq!(document["qa_model"].version(), Some("abc123"));
        assert_eq!(document["fresh"].model_name, "fresh");
        assert!(document["fresh"].local_dir.is_none());
        assert!(!document["fresh"].is_synced());
    }

    #[test]
    fn test_decode_accepts_version_id_and_unknown_fields() {
        let content = r#"{
            "m": {
                "version_id": "v9",
                "model_name": "m",
                "model_dir": "/d",
                "alias": "champion",
                "checksum": "sha256:deadbeef"
            }
        }"#;

        let document = Ledger::decode(Path::new("/x"), content).unwrap();
        assert_eq!(document["m"].version(), Some("v9"));
    }

    #[test]
    fn test_decode_null_document_is_empty() {
        let document = Ledger::decode(Path::new("/x"), "null").unwrap();
        assert!(document.is_empty());
    }

    #[test]
    fn test_encode_uses_ledger_field_names() {
        let mut document = LedgerDocument::new();
        document.insert("m".to_string(), synced("v1", "champion", "/d"));

        let json = Ledger::encode(&document).unwrap();
        assert!(json.contains("\"run_id\": \"v1\""));
        assert!(json.contains("\"model_dir\": \"/d\""));
        assert!(!json.contains("synced_at"));
    }

    #[test]
    fn test_empty_version_is_unsynced() {
        let record = ModelRecord {
            version_id: Some(String::new()),
            local_dir: Some(PathBuf::from("/d")),
            ..Default::default()
        };
        assert!(!record.is_synced());
    }

    #[tokio::test]
    async fn test_filesystem_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("models/config.json");
        let ledger = Ledger::new(path.clone());

        let mut record = synced("v1", "champion", "/m/a");
        record.synced_at = Some(Utc::now());
        ledger.upsert("a", record).await.unwrap();

        let before = std::fs::read_to_string(&path).unwrap();
        let document = ledger.load().await.unwrap();
        ledger.save(&document).await.unwrap();
        let after = std::fs::read_to_string(&path).unwrap();

        assert_eq!(
            Ledger::decode(&path, &before).unwrap(),
            Ledger::decode(&path, &after).unwrap()
        );

        // No temp files left next to the ledger
        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path().join("models"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_all_land() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::new(temp_dir.path().join("config.json")));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..10 {
            let ledger = ledger.clone();
            tasks.spawn(async move {
                ledger
                    .upsert(&format!("model-{}", i), synced("v1", "champion", "/m"))
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(ledger.list().await.unwrap().len(), 10);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_separate_handles_do_not_lose_updates() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        // One handle per task, as separate processes would have
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let ledger = Ledger::new(path.clone());
            tasks.spawn(async move {
                ledger
                    .upsert(&format!("model-{}", i), synced("v1", "champion", "/m"))
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(Ledger::new(path).list().await.unwrap().len(), 8);
    }

    #[test]
    fn test_safe_file_stem_sanitizes() {
        assert_eq!(safe_file_stem("qa_model"), "qa_model");
        assert_eq!(safe_file_stem("org/model v2"), "org_model_v2");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_model_lock_is_exclusive() {
        use std::time::Duration;

        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::new(temp_dir.path().join("config.json"));

        let first = ledger.lock_model("qa_model").await.unwrap();
        assert!(first.path().exists());

        let contended =
            tokio::time::timeout(Duration::from_millis(200), ledger.lock_model("qa_model")).await;
        assert!(contended.is_err(), "second lock should block while first is held");

        // Other models are independent
        let other = tokio::time::timeout(Duration::from_secs(5), ledger.lock_model("other"))
            .await
            .expect("independent model lock should not block");
        assert!(other.is_ok());

        drop(first);
        let again = tokio::time::timeout(Duration::from_secs(5), ledger.lock_model("qa_model"))
            .await
            .expect("lock should be available after release");
        assert!(again.is_ok());
    }
}
