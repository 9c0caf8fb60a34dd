//! Model registry client
//!
//! Resolves `(model name, alias)` to the version currently carrying the alias
//! and the artifact location of the run that produced it.

use crate::config::RegistryConfig;
use crate::error::{TrackerError, TrackerResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Version a registry alias currently points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    /// Opaque snapshot id (MLflow run id); what the ledger compares
    pub version_id: String,
    /// Registry version number, informational
    pub version: String,
    /// Root URI of the run's artifacts
    pub artifact_uri: String,
    pub status: Option<String>,
}

/// Registry capability consumed by the synchronizer
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Resolve `alias` of `model_name`; every failure is `RegistryLookup`
    async fn resolve(&self, model_name: &str, alias: &str) -> TrackerResult<ResolvedVersion>;
}

// ============================================================================
// MLflow REST client
// ============================================================================

#[derive(Debug, Deserialize)]
struct AliasResponse {
    model_version: ModelVersion,
}

#[derive(Debug, Deserialize)]
struct ModelVersion {
    #[serde(default)]
    version: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: Run,
}

#[derive(Debug, Deserialize)]
struct Run {
    info: RunInfo,
}

#[derive(Debug, Deserialize)]
struct RunInfo {
    #[serde(default)]
    artifact_uri: Option<String>,
}

/// Registry client speaking the MLflow 2.x REST API
pub struct MlflowRegistryClient {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl MlflowRegistryClient {
    pub fn new(config: &RegistryConfig) -> TrackerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TrackerError::Config(format!("Failed to build registry client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.effective_registry_uri().trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn lookup_error(model_name: &str, alias: &str, reason: impl Into<String>) -> TrackerError {
        TrackerError::RegistryLookup {
            model_name: model_name.to_string(),
            alias: alias.to_string(),
            reason: reason.into(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, String> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url).query(query);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("{} returned HTTP {}: {}", path, status, body.trim()));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| format!("unexpected response from {}: {}", path, e))
    }
}

#[async_trait]
impl RegistryClient for MlflowRegistryClient {
    async fn resolve(&self, model_name: &str, alias: &str) -> TrackerResult<ResolvedVersion> {
        tracing::debug!(model = %model_name, alias = %alias, registry = %self.base_url, "Resolving alias");

        let by_alias: AliasResponse = self
            .get_json(
                "/api/2.0/mlflow/registered-models/alias",
                &[("name", model_name), ("alias", alias)],
            )
            .await
            .map_err(|reason| Self::lookup_error(model_name, alias, reason))?;

        let run_id = by_alias
            .model_version
            .run_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                Self::lookup_error(model_name, alias, "model version has no run_id")
            })?;

        let run: RunResponse = self
            .get_json("/api/2.0/mlflow/runs/get", &[("run_id", run_id.as_str())])
            .await
            .map_err(|reason| Self::lookup_error(model_name, alias, reason))?;

        let artifact_uri = run
            .run
            .info
            .artifact_uri
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| {
                Self::lookup_error(
                    model_name,
                    alias,
                    format!("run {} has no artifact_uri", run_id),
                )
            })?;

        tracing::info!(
            model = %model_name,
            alias = %alias,
            version = %by_alias.model_version.version,
            run_id = %run_id,
            artifact_uri = %artifact_uri,
            "Resolved registry alias"
        );

        Ok(ResolvedVersion {
            version_id: run_id,
            version: by_alias.model_version.version,
            artifact_uri,
            status: by_alias.model_version.status,
        })
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    /// In-memory registry; aliases can be re-pointed between calls
    #[derive(Default)]
    pub struct MockRegistry {
        versions: Arc<RwLock<HashMap<(String, String), ResolvedVersion>>>,
        errors: Arc<RwLock<HashMap<String, String>>>,
        resolve_calls: AtomicUsize,
    }

    impl MockRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        /// Point `alias` of `model_name` at `version_id`, with artifacts under
        /// `runs/<version_id>`
        pub async fn set_alias(&self, model_name: &str, alias: &str, version_id: &str) {
            self.versions.write().await.insert(
                (model_name.to_string(), alias.to_string()),
                ResolvedVersion {
                    version_id: version_id.to_string(),
                    version: "1".to_string(),
                    artifact_uri: format!("runs/{}", version_id),
                    status: Some("READY".to_string()),
                },
            );
        }

        /// Make every lookup of `model_name` fail
        pub async fn set_error(&self, model_name: &str, reason: &str) {
            self.errors
                .write()
                .await
                .insert(model_name.to_string(), reason.to_string());
        }

        pub async fn clear_error(&self, model_name: &str) {
            self.errors.write().await.remove(model_name);
        }

        pub fn resolve_calls(&self) -> usize {
            self.resolve_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RegistryClient for MockRegistry {
        async fn resolve(&self, model_name: &str, alias: &str) -> TrackerResult<ResolvedVersion> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);

            if let Some(reason) = self.errors.read().await.get(model_name) {
                return Err(MlflowRegistryClient::lookup_error(model_name, alias, reason.clone()));
            }

            self.versions
                .read()
                .await
                .get(&(model_name.to_string(), alias.to_string()))
                .cloned()
                .ok_or_else(|| {
                    MlflowRegistryClient::lookup_error(
                        model_name,
                        alias,
                        "RESOURCE_DOES_NOT_EXIST: alias not found",
                    )
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::MockRegistry;
    use super::*;

    #[test]
    fn test_client_uses_registry_uri_when_set() {
        let config = RegistryConfig {
            tracking_uri: "http://tracking:5000/".to_string(),
            registry_uri: Some("http://registry:5001/".to_string()),
            ..Default::default()
        };
        let client = MlflowRegistryClient::new(&config).unwrap();
        assert_eq!(client.base_url(), "http://registry:5001");
    }

    #[test]
    fn test_client_falls_back_to_tracking_uri() {
        let config = RegistryConfig {
            tracking_uri: "http://tracking:5000".to_string(),
            ..Default::default()
        };
        let client = MlflowRegistryClient::new(&config).unwrap();
        assert_eq!(client.base_url(), "http://tracking:5000");
    }

    #[test]
    fn test_parse_alias_response() {
        let body = r#"{
            "model_version": {
                "name": "qa_model",
                "version": "3",
                "run_id": "0f1e2d3c",
                "status": "READY",
                "aliases": ["champion"],
                "source": "mlflow-artifacts:/1/0f1e2d3c/artifacts/model_path"
            }
        }"#;
        let parsed: AliasResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.model_version.version, "3");
        assert_eq!(parsed.model_version.run_id.as_deref(), Some("0f1e2d3c"));
    }

    #[test]
    fn test_parse_run_response() {
        let body = r#"{
            "run": {
                "info": {
                    "run_id": "0f1e2d3c",
                    "experiment_id": "1",
                    "artifact_uri": "mlflow-artifacts:/1/0f1e2d3c/artifacts"
                },
                "data": {}
            }
        }"#;
        let parsed: RunResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.run.info.artifact_uri.as_deref(),
            Some("mlflow-artifacts:/1/0f1e2d3c/artifacts")
        );
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_lookup_error() {
        let config = RegistryConfig {
            // Port 9 (discard) on localhost is not an HTTP server
            tracking_uri: "http://127.0.0.1:9".to_string(),
            request_timeout_secs: 2,
            ..Default::default()
        };
        let client = MlflowRegistryClient::new(&config).unwrap();

        let result = client.resolve("qa_model", "champion").await;
        match result {
            Err(TrackerError::RegistryLookup {
                model_name, alias, ..
            }) => {
                assert_eq!(model_name, "qa_model");
                assert_eq!(alias, "champion");
            }
            other => panic!("expected RegistryLookup, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mock_registry_repoints_alias() {
        let registry = MockRegistry::new();
        registry.set_alias("qa_model", "champion", "v1").await;
        assert_eq!(
            registry.resolve("qa_model", "champion").await.unwrap().version_id,
            "v1"
        );

        registry.set_alias("qa_model", "champion", "v2").await;
        let resolved = registry.resolve("qa_model", "champion").await.unwrap();
        assert_eq!(resolved.version_id, "v2");
        assert_eq!(resolved.artifact_uri, "runs/v2");

        assert!(registry.resolve("qa_model", "challenger").await.is_err());
        assert_eq!(registry.resolve_calls(), 3);
    }
}
