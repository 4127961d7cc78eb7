//! Model registry
//!
//! Maps model identifiers to local files and tracks their downloaded/loaded status.
//! Entries are persisted in `models_info.json` inside the models directory.

use crate::storage::StorageError;
use crate::types::model::{normalize_model_id, ModelDescriptor};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Lookup contract the inference session consumes
pub trait ModelRegistry: Send + Sync {
    /// Local file path for a model, if the identifier is known
    fn get_local_path(&self, id: &str) -> Option<PathBuf>;

    /// Whether the model file is present on disk
    fn is_downloaded(&self, id: &str) -> bool;

    /// Record whether the session currently holds a handle for this model
    fn set_loaded(&self, id: &str, loaded: bool) -> Result<(), StorageError>;
}

/// Entries seeded on first run: (name, size, type, url)
const DEFAULT_MODELS: &[(&str, &str, &str, &str)] = &[
    (
        "llama-2-7b-chat.Q4_K_M",
        "3.83GB",
        "GGUF",
        "https://huggingface.co/TheBloke/Llama-2-7B-Chat-GGUF/resolve/main/llama-2-7b-chat.Q4_K_M.gguf",
    ),
    (
        "llama-2-13b-chat.Q4_K_M",
        "7.16GB",
        "GGUF",
        "https://huggingface.co/TheBloke/Llama-2-13B-Chat-GGUF/resolve/main/llama-2-13b-chat.Q4_K_M.gguf",
    ),
];

const MODELS_INFO_FILE: &str = "models_info.json";

/// JSON-file backed registry
pub struct JsonModelRegistry {
    models_dir: PathBuf,
    models: DashMap<String, ModelDescriptor>,
}

impl JsonModelRegistry {
    /// Open the registry in `models_dir`, seeding the default entries if absent
    pub fn open(models_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let registry = Self::open_empty(models_dir)?;
        for (name, size, file_type, url) in DEFAULT_MODELS {
            let id = normalize_model_id(name);
            if !registry.models.contains_key(&id) {
                let descriptor = ModelDescriptor::new(*name, *size, *file_type, *url, &registry.models_dir);
                registry.models.insert(id, descriptor);
            }
        }
        registry.save()?;
        Ok(registry)
    }

    /// Open the registry without seeding defaults
    pub fn open_empty(models_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let models_dir = models_dir.into();
        fs::create_dir_all(&models_dir)?;

        let models = DashMap::new();
        let info_path = models_dir.join(MODELS_INFO_FILE);
        if info_path.exists() {
            let json = fs::read_to_string(&info_path)?;
            let stored: BTreeMap<String, ModelDescriptor> = serde_json::from_str(&json)?;
            for (key, mut descriptor) in stored {
                let id = normalize_model_id(&key);
                descriptor.id = id.clone();
                descriptor.is_downloaded = descriptor.local_path.exists();
                // No process holds a handle at startup
                descriptor.is_loaded = false;
                models.insert(id, descriptor);
            }
            tracing::debug!("Loaded {} model entries from {}", models.len(), info_path.display());
        }

        Ok(Self { models_dir, models })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Register (or replace) a descriptor under its normalized identifier
    pub fn insert(&self, mut descriptor: ModelDescriptor) -> Result<(), StorageError> {
        descriptor.id = normalize_model_id(&descriptor.id);
        descriptor.is_downloaded = descriptor.local_path.exists();
        self.models.insert(descriptor.id.clone(), descriptor);
        self.save()
    }

    pub fn get(&self, id: &str) -> Option<ModelDescriptor> {
        self.models.get(&normalize_model_id(id)).map(|m| m.clone())
    }

    /// All descriptors, sorted by identifier
    pub fn list(&self) -> Vec<ModelDescriptor> {
        let mut models: Vec<ModelDescriptor> = self.models.iter().map(|m| m.clone()).collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// First downloaded model, used when nothing was selected before
    pub fn first_downloaded(&self) -> Option<String> {
        self.list()
            .into_iter()
            .find(|m| m.local_path.exists())
            .map(|m| m.id)
    }

    fn save(&self) -> Result<(), StorageError> {
        let stored: BTreeMap<String, ModelDescriptor> = self
            .models
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let json = serde_json::to_string_pretty(&stored)?;
        fs::write(self.models_dir.join(MODELS_INFO_FILE), json)?;
        Ok(())
    }
}

impl ModelRegistry for JsonModelRegistry {
    fn get_local_path(&self, id: &str) -> Option<PathBuf> {
        self.models
            .get(&normalize_model_id(id))
            .map(|m| m.local_path.clone())
    }

    fn is_downloaded(&self, id: &str) -> bool {
        self.models
            .get(&normalize_model_id(id))
            .map(|m| m.local_path.exists())
            .unwrap_or(false)
    }

    fn set_loaded(&self, id: &str, loaded: bool) -> Result<(), StorageError> {
        {
            let Some(mut model) = self.models.get_mut(&normalize_model_id(id)) else {
                return Ok(());
            };
            model.is_loaded = loaded;
            model.is_downloaded = model.local_path.exists();
        }
        self.save()
    }
}
