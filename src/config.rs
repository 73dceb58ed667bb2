use crate::{
    semantic::DEFAULT_MODEL,
    storage::{self, StorageManager},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.yaml";

const QUERY_K: usize = 15;
const TAG_CACHE_TTL_SECS: u64 = 15 * 60;
const TAG_CACHE_SIZE: usize = 32;
const READ_LOCK_TIMEOUT_MS: u64 = 500;
const WRITE_LOCK_TIMEOUT_MS: u64 = 1000;
const LISTEN: &str = "0.0.0.0:16060";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error on config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file is not valid utf8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory scanned for images. Relative paths are resolved against the
    /// base directory.
    #[serde(default = "images_root")]
    pub images_root: PathBuf,

    /// Embedding model; the catalog and the index snapshot are kept per model.
    #[serde(default = "model")]
    pub model: String,

    /// Results per page.
    #[serde(default = "query_k")]
    pub query_k: usize,

    #[serde(default = "tag_cache_ttl_secs")]
    pub tag_cache_ttl_secs: u64,
    #[serde(default = "tag_cache_size")]
    pub tag_cache_size: usize,

    /// How long a query waits for a running rebuild before answering busy.
    #[serde(default = "read_lock_timeout_ms")]
    pub read_lock_timeout_ms: u64,
    /// How long starting a task waits for in-flight queries.
    #[serde(default = "write_lock_timeout_ms")]
    pub write_lock_timeout_ms: u64,

    #[serde(default = "listen")]
    pub listen: String,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

fn images_root() -> PathBuf {
    PathBuf::from("images")
}

fn model() -> String {
    DEFAULT_MODEL.to_string()
}

fn query_k() -> usize {
    QUERY_K
}

fn tag_cache_ttl_secs() -> u64 {
    TAG_CACHE_TTL_SECS
}

fn tag_cache_size() -> usize {
    TAG_CACHE_SIZE
}

fn read_lock_timeout_ms() -> u64 {
    READ_LOCK_TIMEOUT_MS
}

fn write_lock_timeout_ms() -> u64 {
    WRITE_LOCK_TIMEOUT_MS
}

fn listen() -> String {
    LISTEN.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            images_root: images_root(),
            model: model(),
            query_k: QUERY_K,
            tag_cache_ttl_secs: TAG_CACHE_TTL_SECS,
            tag_cache_size: TAG_CACHE_SIZE,
            read_lock_timeout_ms: READ_LOCK_TIMEOUT_MS,
            write_lock_timeout_ms: WRITE_LOCK_TIMEOUT_MS,
            listen: listen(),
            base_path: PathBuf::new(),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.query_k == 0 {
            return Err(ConfigError::Invalid("query_k must be greater than 0".into()));
        }

        if self.tag_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "tag_cache_size must be greater than 0".into(),
            ));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".into()));
        }

        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "listen must be an address like {LISTEN}, got '{}'",
                self.listen
            )));
        }

        Ok(())
    }

    pub fn load_with(base_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let base_path = base_path.as_ref();
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            log::info!("writing default config to {}", base_path.display());
            store.write(
                CONFIG_FILE,
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// `images_root` resolved against the base directory.
    pub fn images_root(&self) -> PathBuf {
        if self.images_root.is_absolute() {
            self.images_root.clone()
        } else {
            self.base_path.join(&self.images_root)
        }
    }
}
