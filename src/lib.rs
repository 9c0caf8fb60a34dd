//! gguf-tracker - Registry-aware GGUF model synchronizer
//!
//! Keeps local copies of registry-aliased GGUF models in step with an MLflow
//! registry, mirrors their artifacts from object storage and runs one
//! `llama-server` process per model.

pub mod config;
pub mod error;
pub mod instance;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod sync;
pub mod tracker;

pub use config::{TrackedModel, TrackerConfig};
pub use error::{TrackerError, TrackerResult};
pub use instance::{InstanceStats, InstanceStatus, ModelArtifacts, ServerInstance};
pub use ledger::{Ledger, ModelRecord};
pub use lifecycle::{DeleteTarget, InstanceEvent, ServeManager, ServeStatus};
pub use sync::{SyncCheck, SyncOutcome, Synchronizer};
pub use tracker::{EnsureOutcome, ModelStatus, Tracker, UpdateOutcome};
