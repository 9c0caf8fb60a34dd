//! Local model directory utilities
//!
//! A synchronized model directory mirrors the artifact tree:
//! ```text
//! <models_root>/
//! └── qa_model/
//!     └── artifacts/
//!         ├── model.gguf
//!         └── tokenizer.json
//! ```

use crate::error::{TrackerError, TrackerResult};
use std::path::{Component, Path, PathBuf};

/// Check that `model_name` is usable as a single directory name
///
/// Rejects empty names, `.`, `..` and anything containing a path separator.
pub fn validate_model_name(model_name: &str) -> TrackerResult<()> {
    let reason = if model_name.is_empty() {
        "must not be empty"
    } else if model_name == "." || model_name == ".." {
        "is a reserved path component"
    } else if model_name.contains('/') || model_name.contains('\\') {
        "must not contain path separators"
    } else if model_name.contains('\0') {
        "must not contain NUL"
    } else {
        return Ok(());
    };

    Err(TrackerError::InvalidModelName {
        name: model_name.to_string(),
        reason: reason.to_string(),
    })
}

/// Default directory for a model under `models_root`
pub fn model_dir(models_root: &Path, model_name: &str) -> PathBuf {
    models_root.join(model_name)
}

/// True if `path` lies below `root`, never `root` itself
///
/// Both are made absolute first. A `path` with `..` components is never
/// considered inside.
pub fn is_strictly_within(root: &Path, path: &Path) -> bool {
    let (Ok(root), Ok(path)) = (std::path::absolute(root), std::path::absolute(path)) else {
        return false;
    };
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return false;
    }
    path != root && path.starts_with(&root)
}

/// Recursively calculate directory size
pub fn dir_size(path: &Path) -> u64 {
    let mut size = 0;

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                size += dir_size(&path);
            } else if let Ok(metadata) = std::fs::metadata(&path) {
                size += metadata.len();
            }
        }
    }

    size
}

/// True if `path` is a directory containing at least one file, at any depth
pub fn has_files(path: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(path) else {
        return false;
    };

    entries.flatten().any(|entry| {
        let path = entry.path();
        if path.is_dir() { has_files(&path) } else { true }
    })
}

/// Remove everything inside `path`, keeping the directory itself
pub async fn clear_dir_contents(path: &Path) -> std::io::Result<()> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }

    Ok(())
}

/// Remove `path` and everything in it; a missing directory is not an error
pub async fn remove_dir(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// `.gguf` files directly inside `path` or below it, sorted
pub fn find_gguf_files(path: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                found.extend(find_gguf_files(&path));
            } else if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gguf")) {
                found.push(path);
            }
        }
    }

    found.sort();
    found
}
