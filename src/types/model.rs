//! Model types
//!
//! Defines model registry entries.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A model known to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Lowercase unique identifier
    #[serde(default)]
    pub id: String,
    /// Display name of the model
    pub name: String,
    /// Human readable size label, e.g. "3.83GB"
    pub size: String,
    /// File type, e.g. "GGUF"
    #[serde(rename = "type")]
    pub file_type: String,
    /// Where the file can be fetched from
    pub url: String,
    /// Path to the local model file
    pub local_path: PathBuf,
    #[serde(default)]
    pub is_downloaded: bool,
    #[serde(default)]
    pub is_loaded: bool,
}

/// Normalize a model identifier to the single casing used for lookups.
pub fn normalize_model_id(id: &str) -> String {
    id.trim().to_lowercase()
}

impl ModelDescriptor {
    /// Build a descriptor whose file lives in `models_dir` as `<name>.<type>`.
    pub fn new(
        name: impl Into<String>,
        size: impl Into<String>,
        file_type: impl Into<String>,
        url: impl Into<String>,
        models_dir: &std::path::Path,
    ) -> Self {
        let name = name.into();
        let file_type = file_type.into();
        let local_path = models_dir.join(format!("{}.{}", name, file_type.to_lowercase()));
        Self {
            id: normalize_model_id(&name),
            is_downloaded: local_path.exists(),
            name,
            size: size.into(),
            file_type,
            url: url.into(),
            local_path,
            is_loaded: false,
        }
    }
}
