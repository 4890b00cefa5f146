use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default top-k for similarity queries
const DEFAULT_TOP_K: usize = 10;
/// Default checkpoint interval (entries between mid-batch cache flushes)
const DEFAULT_CHECKPOINT_INTERVAL: usize = 25;
/// Default model artifact location, relative to the data directory
const DEFAULT_MODEL_FILE: &str = "models/clip-vision.onnx";

/// Configuration for the embedding index
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Path to the CLIP vision encoder ONNX artifact. Relative paths are
    /// resolved against the data directory.
    #[serde(default = "default_model_file")]
    pub model_path: String,

    /// Default number of neighbors returned by similarity queries
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Drop cache entries absent from the current folder listing after
    /// each ingestion. Disable when several folders share one store.
    #[serde(default = "default_reconcile")]
    pub reconcile: bool,

    /// Flush the cache every N entries during ingestion; 0 disables
    /// mid-batch checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            model_path: DEFAULT_MODEL_FILE.to_string(),
            default_top_k: DEFAULT_TOP_K,
            reconcile: true,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }
}

fn default_model_file() -> String {
    DEFAULT_MODEL_FILE.to_string()
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_reconcile() -> bool {
    true
}

fn default_checkpoint_interval() -> usize {
    DEFAULT_CHECKPOINT_INTERVAL
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,

    /// Folder used by the previous ingestion; reused when the command line
    /// omits one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_folder: Option<String>,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&mut self) {
        if self.index.model_path.trim().is_empty() {
            panic!("index.model_path must not be empty");
        }

        if self.index.default_top_k == 0 {
            panic!("index.default_top_k must be greater than 0");
        }
    }

    pub fn load_with(base_path: &Path) -> Self {
        std::fs::create_dir_all(base_path).expect("couldnt create data directory");
        let config_path = base_path.join("config.yaml");

        // create new if does not exist
        if !config_path.exists() {
            std::fs::write(
                &config_path,
                serde_yml::to_string(&Self::default()).unwrap().as_bytes(),
            )
            .expect("couldnt write default config");
        }

        let config_str =
            std::fs::read_to_string(&config_path).expect("config file is not valid utf8");
        let mut config: Self = serde_yml::from_str(&config_str).expect("config is malformed");

        config.base_path = base_path.to_path_buf();

        config.validate();

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config).unwrap() {
            config.save();
        }

        config
    }

    pub fn save(&self) {
        let config_path = self.base_path.join("config.yaml");
        let config_str = serde_yml::to_string(&self).unwrap();
        std::fs::write(config_path, config_str.as_bytes()).expect("couldnt write config");
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve the model artifact path against the data directory.
    pub fn model_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.index.model_path);
        if path.is_absolute() {
            path
        } else {
            self.base_path.join(path)
        }
    }
}
