//! Error types shared by the ledger, synchronizer and lifecycle manager

use std::path::PathBuf;
use thiserror::Error;

pub type TrackerResult<T> = Result<T, TrackerError>;

/// Tracker errors
///
/// Transport and filesystem failures are wrapped into one of these kinds at
/// the component boundary that observed them.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Registry lookup failed for '{model_name}' (alias '{alias}'): {reason}")]
    RegistryLookup {
        model_name: String,
        alias: String,
        reason: String,
    },

    #[error("No artifacts found at {location}{}", failed_suffix(.failed))]
    ArtifactNotFound { location: String, failed: usize },

    #[error(
        "Ledger {path:?} is corrupted: {reason}. Please delete or fix the file manually."
    )]
    CorruptLedger { path: PathBuf, reason: String },

    #[error("Port {0} is outside the allowed range 1024-65535")]
    InvalidPort(u16),

    #[error("Model file not found: {0:?}")]
    ModelFileNotFound(PathBuf),

    #[error("Model '{0}' not found")]
    ModelNotFound(String),

    #[error("Invalid model name '{name}': {reason}")]
    InvalidModelName { name: String, reason: String },

    #[error("Refusing to remove {0:?}: not under models_root or the configured local_dir")]
    UnsafeRemoval(PathBuf),

    #[error("Port {port} already in use by model '{model_id}'")]
    PortConflict { port: u16, model_id: String },

    #[error("Failed to transfer {object}: {reason}")]
    Transfer { object: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Hugging Face Hub error: {0}")]
    Hub(String),
}

fn failed_suffix(failed: &usize) -> String {
    if *failed == 0 {
        String::new()
    } else {
        format!(" ({} transfer(s) failed)", failed)
    }
}

impl TrackerError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Process exit code used by the CLI for this error kind
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RegistryLookup { .. } => 10,
            Self::ArtifactNotFound { .. } => 11,
            Self::CorruptLedger { .. } => 12,
            Self::InvalidPort(_) | Self::PortConflict { .. } => 13,
            Self::ModelFileNotFound(_) => 14,
            Self::ModelNotFound(_) => 15,
            Self::Transfer { .. } => 16,
            Self::Io { .. } => 17,
            Self::Config(_) => 18,
            Self::Process(_) => 19,
            Self::Hub(_) => 20,
            Self::InvalidModelName { .. } => 21,
            Self::UnsafeRemoval(_) => 22,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_not_found_message() {
        let err = TrackerError::ArtifactNotFound {
            location: "gs://bucket/runs/abc/model_path".to_string(),
            failed: 0,
        };
        assert_eq!(
            err.to_string(),
            "No artifacts found at gs://bucket/runs/abc/model_path"
        );

        let err = TrackerError::ArtifactNotFound {
            location: "gs://bucket/x".to_string(),
            failed: 3,
        };
        assert!(err.to_string().ends_with("(3 transfer(s) failed)"));
    }

    #[test]
    fn test_exit_codes_are_distinct_per_kind() {
        let errors = [
            TrackerError::RegistryLookup {
                model_name: "m".into(),
                alias: "champion".into(),
                reason: "missing".into(),
            },
            TrackerError::ArtifactNotFound {
                location: "x".into(),
                failed: 0,
            },
            TrackerError::CorruptLedger {
                path: PathBuf::from("/tmp/config.json"),
                reason: "eof".into(),
            },
            TrackerError::InvalidPort(80),
            TrackerError::ModelFileNotFound(PathBuf::from("/nope")),
            TrackerError::ModelNotFound("m".into()),
            TrackerError::InvalidModelName {
                name: "..".into(),
                reason: "reserved".into(),
            },
            TrackerError::UnsafeRemoval(PathBuf::from("/srv")),
        ];

        let codes: std::collections::HashSet<_> = errors.iter().map(|e| e.exit_code()).collect();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn test_io_wraps_source() {
        let err = TrackerError::io(
            "Failed to read ledger",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.to_string(), "Failed to read ledger: denied");
        assert!(std::error::Error::source(&err).is_some());
    }
}
