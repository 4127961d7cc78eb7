//! Settings storage
//!
//! Manages persistence of inference defaults and storage locations.

use crate::inference::prompt::PromptPolicy;
use crate::storage::{get_data_dir, StorageError};
use crate::types::config::LoadConfig;
use crate::types::sampling::SamplingParameters;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Context window size
    pub context_size: u32,
    /// Prompt batch size
    pub batch_size: u32,
    /// Decode threads (unset = all cores)
    #[serde(default)]
    pub threads: Option<u32>,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Sampling parameters of the built-in assistant
    pub sampling: SamplingParameters,
    /// How conversation history is rendered into prompts
    #[serde(default)]
    pub prompt: PromptPolicy,
    /// Directory where model files and `models_info.json` live
    pub models_directory: PathBuf,
    /// Directory holding one JSON file per bot
    pub bots_directory: PathBuf,
    /// Directory holding one JSON file per conversation
    pub chats_directory: PathBuf,
    /// Last loaded model identifier (for auto-loading on startup)
    #[serde(default)]
    pub last_model: Option<String>,
    /// Auto-load last model on startup
    #[serde(default = "default_auto_load")]
    pub auto_load_model: bool,
}

fn default_auto_load() -> bool {
    true
}

impl Default for AppSettings {
    fn default() -> Self {
        let data_dir = get_data_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::with_data_dir(&data_dir)
    }
}

impl AppSettings {
    /// Default settings rooted at `data_dir`
    pub fn with_data_dir(data_dir: &Path) -> Self {
        let load = LoadConfig::default();
        Self {
            context_size: load.context_size,
            batch_size: load.batch_size,
            threads: load.threads,
            gpu_layers: load.gpu_layers,
            sampling: SamplingParameters::default(),
            prompt: PromptPolicy::default(),
            models_directory: data_dir.join("models"),
            bots_directory: data_dir.join("bots"),
            chats_directory: data_dir.join("chat_history"),
            last_model: None,
            auto_load_model: true,
        }
    }

    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges.
    pub fn validate(&mut self) {
        let valid_context_sizes = [512, 1024, 2048, 4096, 8192, 16384, 32768, 65536, 131072];
        if !valid_context_sizes.contains(&self.context_size) {
            self.context_size = *valid_context_sizes
                .iter()
                .min_by_key(|&&size| (size as i64 - self.context_size as i64).abs())
                .unwrap_or(&2048);
        }

        self.batch_size = self.batch_size.clamp(1, self.context_size);

        if self.threads == Some(0) {
            self.threads = None;
        }

        self.sampling = self.sampling.validated();

        // Can't generate more than the context allows
        if self.sampling.max_tokens > self.context_size {
            self.sampling.max_tokens = self.context_size / 2;
        }

        self.prompt.validate();
    }

    /// Load configuration derived from these settings
    pub fn load_config(&self) -> LoadConfig {
        LoadConfig {
            context_size: self.context_size,
            batch_size: self.batch_size,
            threads: self.threads,
            gpu_layers: self.gpu_layers,
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> AppSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            AppSettings::default()
        }
    }
}

/// Load settings from a specific file, falling back to defaults when it is absent
pub fn load_settings_from(path: &Path) -> Result<AppSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(AppSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: AppSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &AppSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

/// Save settings to a specific file
pub fn save_settings_to(settings: &AppSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings::with_data_dir(dir.path());
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.batch_size, 512);
        assert_eq!(settings.sampling.temperature, 0.7);
        assert_eq!(settings.prompt.history_window, 3);
        assert_eq!(settings.models_directory, dir.path().join("models"));
        assert!(settings.last_model.is_none());
    }

    #[test]
    fn test_settings_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AppSettings::with_data_dir(dir.path());

        settings.context_size = 3000;
        settings.validate();
        assert_eq!(settings.context_size, 2048);

        settings.sampling.temperature = 5.0;
        settings.sampling.top_p = 2.0;
        settings.validate();
        assert_eq!(settings.sampling.temperature, 2.0);
        assert_eq!(settings.sampling.top_p, 1.0);

        settings.sampling.max_tokens = 100_000;
        settings.validate();
        assert_eq!(settings.sampling.max_tokens, settings.context_size / 2);

        settings.threads = Some(0);
        settings.validate();
        assert!(settings.threads.is_none());
    }

    #[test]
    fn test_settings_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = AppSettings::with_data_dir(dir.path());
        settings.last_model = Some("demo-model".to_string());
        settings.gpu_layers = 12;
        save_settings_to(&settings, &path).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.last_model.as_deref(), Some("demo-model"));
        assert_eq!(loaded.gpu_layers, 12);
        assert_eq!(loaded.load_config().gpu_layers, 12);
    }

    #[test]
    fn test_corrupt_settings_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_settings_from(&path), Err(StorageError::Json(_))));
    }
}
