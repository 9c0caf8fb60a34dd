//! GGUF ingest from the HuggingFace Hub
//!
//! Fetches one `.gguf` file through the hf-hub cache and places it in the
//! serving layout (`<dest>/artifacts/model.gguf`), so a model that never went
//! through the registry can still be served.

use crate::error::{TrackerError, TrackerResult};
use crate::models::store::part_path;
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};

/// Model file location inside a pulled directory
pub const SERVING_FILE: &str = "artifacts/model.gguf";

/// What to pull and where to put it
#[derive(Debug, Clone)]
pub struct HubPull {
    /// Repository id, e.g. "TheBloke/Mistral-7B-Instruct-v0.2-GGUF"
    pub repo_id: String,
    /// Exact file in the repository; chosen automatically when unset
    pub file: Option<String>,
    pub revision: Option<String>,
    /// Directory receiving `artifacts/model.gguf`
    pub dest: PathBuf,
    /// hf-hub cache; default HF cache when unset
    pub cache_dir: Option<PathBuf>,
    pub token: Option<String>,
}

/// Pick the GGUF file to download from a repository listing
///
/// An explicit request must exist in the listing. Otherwise the single
/// `.gguf` file wins; with several, the first by name is used.
pub fn select_gguf(repo_id: &str, files: &[String], requested: Option<&str>) -> TrackerResult<String> {
    if let Some(requested) = requested {
        return files
            .iter()
            .find(|f| f.as_str() == requested)
            .cloned()
            .ok_or_else(|| {
                TrackerError::Hub(format!("{} has no file named {}", repo_id, requested))
            });
    }

    let mut candidates: Vec<&String> = files
        .iter()
        .filter(|f| f.to_ascii_lowercase().ends_with(".gguf"))
        .collect();
    candidates.sort();

    match candidates.as_slice() {
        [] => Err(TrackerError::Hub(format!("No .gguf file found in {}", repo_id))),
        [only] => Ok((*only).clone()),
        [first, ..] => {
            tracing::warn!(
                repo_id = %repo_id,
                candidates = candidates.len(),
                chosen = %first,
                "Multiple .gguf files found, using the first one"
            );
            Ok((*first).clone())
        }
    }
}

/// Download the selected GGUF file and place it at `<dest>/artifacts/model.gguf`
///
/// Returns the placed file path.
pub async fn pull_gguf(request: &HubPull) -> TrackerResult<PathBuf> {
    tracing::info!(
        repo_id = %request.repo_id,
        dest = ?request.dest,
        "Starting GGUF download via hf-hub"
    );

    let mut builder = ApiBuilder::new().with_token(request.token.clone());
    if let Some(dir) = &request.cache_dir {
        builder = builder.with_cache_dir(dir.clone());
    }
    let api = builder
        .build()
        .map_err(|e| TrackerError::Hub(format!("Failed to create HF API client: {}", e)))?;

    let repo = match &request.revision {
        Some(revision) => api.repo(Repo::with_revision(
            request.repo_id.clone(),
            RepoType::Model,
            revision.clone(),
        )),
        None => api.model(request.repo_id.clone()),
    };

    let info = repo
        .info()
        .await
        .map_err(|e| TrackerError::Hub(format!("Failed to list {}: {}", request.repo_id, e)))?;
    let files: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();

    let file = select_gguf(&request.repo_id, &files, request.file.as_deref())?;

    tracing::debug!(repo_id = %request.repo_id, file = %file, "Downloading file");
    let cached = repo
        .get(&file)
        .await
        .map_err(|e| TrackerError::Hub(format!("Failed to download {}: {}", file, e)))?;

    let target = place_model_file(&cached, &request.dest).await?;

    tracing::info!(repo_id = %request.repo_id, file = %file, path = ?target, "GGUF model placed");

    Ok(target)
}

/// Copy `source` into the serving layout under `dest`
pub async fn place_model_file(source: &Path, dest: &Path) -> TrackerResult<PathBuf> {
    let target = dest.join(SERVING_FILE);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TrackerError::io(format!("Failed to create {:?}", parent), e))?;
    }

    let part = part_path(&target);
    tokio::fs::copy(source, &part)
        .await
        .map_err(|e| TrackerError::io(format!("Failed to copy {:?}", source), e))?;
    tokio::fs::rename(&part, &target)
        .await
        .map_err(|e| TrackerError::io(format!("Failed to move {:?} into place", part), e))?;

    Ok(target)
}
