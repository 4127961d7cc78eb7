//! Persistent storage
//!
//! JSON files under the platform data directory: settings, the model registry
//! and conversation logs.

pub mod conversations;
pub mod models;
pub mod settings;

use directories::ProjectDirs;
use std::path::PathBuf;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not determine the application data directory")]
    NoDataDir,
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

/// Get the application data directory (platform specific)
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    ProjectDirs::from("", "", "localchat")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}

/// Reject identifiers that would escape their storage directory when used as a file name
pub(crate) fn check_file_id(id: &str) -> Result<(), StorageError> {
    let invalid = id.is_empty()
        || id == "."
        || id == ".."
        || id
            .chars()
            .any(|ch| matches!(ch, '/' | '\\' | ':' | '<' | '>' | '"' | '|' | '?' | '*') || ch.is_control());
    if invalid {
        return Err(StorageError::InvalidId(id.to_string()));
    }
    Ok(())
}
