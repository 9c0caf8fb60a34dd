//! Configuration structures and loading logic

use crate::models::cache::validate_model_name;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Lowest port a serving instance may bind
pub const MIN_SERVE_PORT: u16 = 1024;

/// Main tracker configuration
///
/// Built once at startup and passed explicitly to every client constructor.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Ledger document (model name -> synchronized version)
    pub ledger_path: PathBuf,
    /// Root under which `<model_name>/` directories are created
    pub models_root: PathBuf,
    pub registry: RegistryConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub sync: SyncConfig,
    /// Models tracked even before their first synchronization
    pub models: Vec<TrackedModel>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            ledger_path: data_dir.join("models").join("config.json"),
            models_root: data_dir.join("models"),
            registry: RegistryConfig::default(),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
            sync: SyncConfig::default(),
            models: Vec::new(),
        }
    }
}

/// MLflow registry connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub tracking_uri: String,
    /// Defaults to `tracking_uri` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tracking_uri: "http://localhost:5000".to_string(),
            registry_uri: None,
            username: None,
            password: None,
            request_timeout_secs: 30,
        }
    }
}

impl RegistryConfig {
    pub fn effective_registry_uri(&self) -> &str {
        self.registry_uri.as_deref().unwrap_or(&self.tracking_uri)
    }
}

/// Object store backend for run artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// Google Cloud Storage JSON API
    Gcs,
    /// Local directory mirror rooted at `storage.local_root`
    Local,
}

/// Artifact store settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    /// Bucket that `mlflow-artifacts:` URIs resolve against
    pub bucket: String,
    pub endpoint: String,
    /// OAuth2 bearer token; takes precedence over `token_file`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// File holding a bearer token (re-read on every client construction)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    /// Root directory for the `local` backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_root: Option<PathBuf>,
    pub request_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Gcs,
            bucket: "mlflow-artifacts-bucket".to_string(),
            endpoint: "https://storage.googleapis.com".to_string(),
            access_token: None,
            token_file: None,
            local_root: None,
            request_timeout_secs: 3600,
        }
    }
}

/// llama-server process settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub binary_path: String,
    pub host: String,
    pub default_port: u16,
    /// Model file location relative to a model's local directory
    pub gguf_relative_path: PathBuf,
    pub log_dir: PathBuf,
    /// Pid files for servers started by `serve`, read by `stop`
    pub run_dir: PathBuf,
    pub graceful_shutdown_timeout_secs: u64,
    /// Additional CLI args passed to every llama-server
    pub extra_args: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            binary_path: "llama-server".to_string(),
            host: "127.0.0.1".to_string(),
            default_port: 8080,
            gguf_relative_path: PathBuf::from("artifacts/model.gguf"),
            log_dir: data_dir.join("logs"),
            run_dir: data_dir.join("run"),
            graceful_shutdown_timeout_secs: 30,
            extra_args: Vec::new(),
        }
    }
}

/// Synchronizer tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_parallel_downloads: usize,
    pub transfer_timeout_secs: u64,
    /// Hold a per-model lock file across check, fetch and ledger write
    pub cross_process_lock: bool,
    /// Treat a missing or empty local directory as stale even when the
    /// ledger version matches the registry
    pub verify_local_files: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: 4,
            transfer_timeout_secs: 3600,
            cross_process_lock: true,
            verify_local_files: false,
        }
    }
}

/// A model tracked by name against a registry alias
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TrackedModel {
    pub name: String,

    #[serde(default = "default_alias")]
    pub alias: String,

    #[serde(default = "default_artifact_path")]
    pub artifact_path: String,

    /// Overrides `<models_root>/<name>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<PathBuf>,

    /// Overrides `server.default_port`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Overrides `server.gguf_relative_path`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gguf_relative_path: Option<PathBuf>,

    /// Multimodal projector inside the model directory, passed as `--mmproj`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmproj: Option<PathBuf>,

    /// Jinja chat template inside the model directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<PathBuf>,
}

impl TrackedModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: default_alias(),
            artifact_path: default_artifact_path(),
            local_dir: None,
            port: None,
            gguf_relative_path: None,
            mmproj: None,
            chat_template: None,
        }
    }
}

impl TrackerConfig {
    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables are only read here; nothing in the crate sets them.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        if let Ok(ledger) = std::env::var("GGUF_TRACKER_LEDGER") {
            config.ledger_path = PathBuf::from(ledger);
        }
        if let Ok(models_dir) = std::env::var("GGUF_TRACKER_MODELS_DIR") {
            config.models_root = PathBuf::from(models_dir);
        }
        if let Ok(binary_path) = std::env::var("GGUF_TRACKER_LLAMA_SERVER") {
            config.server.binary_path = binary_path;
        }
        if let Ok(uri) = std::env::var("MLFLOW_TRACKING_URI") {
            config.registry.tracking_uri = uri;
        }
        if let Ok(uri) = std::env::var("MLFLOW_REGISTRY_URI") {
            config.registry.registry_uri = Some(uri);
        }
        if let Ok(username) = std::env::var("MLFLOW_TRACKING_USERNAME") {
            config.registry.username = Some(username);
        }
        if let Ok(password) = std::env::var("MLFLOW_TRACKING_PASSWORD") {
            config.registry.password = Some(password);
        }
        if let Ok(bucket) = std::env::var("GCS_BUCKET") {
            config.storage.bucket = bucket;
        }
        if let Ok(token) = std::env::var("GCS_ACCESS_TOKEN") {
            config.storage.access_token = Some(token);
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.registry.tracking_uri.is_empty() {
            anyhow::bail!("registry.tracking_uri cannot be empty");
        }
        if self.registry.username.is_some() != self.registry.password.is_some() {
            anyhow::bail!("registry.username and registry.password must be set together");
        }

        match self.storage.backend {
            StorageBackendKind::Gcs => {
                if self.storage.bucket.is_empty() {
                    anyhow::bail!("storage.bucket cannot be empty for the gcs backend");
                }
            }
            StorageBackendKind::Local => {
                if self.storage.local_root.is_none() {
                    anyhow::bail!("storage.local_root is required for the local backend");
                }
            }
        }

        if self.sync.max_parallel_downloads == 0 {
            anyhow::bail!("sync.max_parallel_downloads must be at least 1");
        }
        if self.sync.transfer_timeout_secs == 0 {
            anyhow::bail!("sync.transfer_timeout_secs must be at least 1");
        }

        if self.server.default_port < MIN_SERVE_PORT {
            anyhow::bail!(
                "server.default_port must be >= {} (got {})",
                MIN_SERVE_PORT,
                self.server.default_port
            );
        }
        if self.server.gguf_relative_path.is_absolute() {
            anyhow::bail!(
                "server.gguf_relative_path must be relative (got {:?})",
                self.server.gguf_relative_path
            );
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();

        for model in &self.models {
            validate_model_name(&model.name)?;
            for (key, path) in [
                ("gguf_relative_path", &model.gguf_relative_path),
                ("mmproj", &model.mmproj),
                ("chat_template", &model.chat_template),
            ] {
                if let Some(path) = path
                    && path.is_absolute()
                {
                    anyhow::bail!(
                        "Model '{}' {} must be relative to its directory (got {:?})",
                        model.name,
                        key,
                        path
                    );
                }
            }
            if !names.insert(&model.name) {
                anyhow::bail!("Duplicate model name: {}", model.name);
            }
            if let Some(port) = model.port {
                if port < MIN_SERVE_PORT {
                    anyhow::bail!(
                        "Model '{}' port must be >= {} (got {})",
                        model.name,
                        MIN_SERVE_PORT,
                        port
                    );
                }
                if !ports.insert(port) {
                    anyhow::bail!("Duplicate port {} in model configs", port);
                }
            }
        }

        // Ensure ledger directory exists or can be created
        if let Some(parent) = self.ledger_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create ledger directory: {:?}", parent))?;
        }

        Ok(())
    }

    /// Configured model entry by name
    pub fn tracked_model(&self, name: &str) -> Option<&TrackedModel> {
        self.models.iter().find(|m| m.name == name)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("gguf-tracker"))
        .unwrap_or_else(|| PathBuf::from("/tmp/gguf-tracker"))
}
fn default_alias() -> String {
    "champion".to_string()
}
fn default_artifact_path() -> String {
    "model_path".to_string()
}
