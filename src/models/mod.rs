//! External model sources
//!
//! Provides functionality for:
//! - Resolving registry aliases to versions and artifact locations
//! - Listing and streaming artifacts from object storage
//! - Managing local model directories
//! - Pulling GGUF files from the HuggingFace Hub

pub mod cache;
pub mod hub;
pub mod registry;
pub mod store;

pub use cache::{dir_size, find_gguf_files, has_files, model_dir, validate_model_name};
pub use hub::{HubPull, pull_gguf};
pub use registry::{MlflowRegistryClient, RegistryClient, ResolvedVersion};
pub use store::{ArtifactStore, FsArtifactStore, GcsArtifactStore, ObjectEntry, ObjectPrefix};
