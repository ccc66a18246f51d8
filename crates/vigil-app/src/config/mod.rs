//! Configuration loading and XDG path helpers.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use vigil_server::ServerConfig;

use crate::services::inference::{DEFAULT_BASE_URL, DEFAULT_MODEL};

const CONFIG_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    pub storage: StorageConfig,
}

/// Shared store used by both the result cache and the admission counters.
/// When absent, both degrade to their in-process backends.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedisConfig {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_ttl_secs")]
    pub ttl_secs: u64,
}

impl CacheConfig {
    fn default_ttl_secs() -> u64 {
        24 * 60 * 60
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: Self::default_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Directory of pre-built policy documents (the retrieval oracle's
    /// persisted form, maintained externally).
    pub docs_dir: PathBuf,
    #[serde(default = "RetrievalConfig::default_top_k")]
    pub top_k: usize,
    #[serde(default = "RetrievalConfig::default_max_context_bytes")]
    pub max_context_bytes: usize,
}

impl RetrievalConfig {
    fn default_top_k() -> usize {
        5
    }

    fn default_max_context_bytes() -> usize {
        16 * 1024
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    #[serde(default = "InferenceConfig::default_model")]
    pub model: String,
    #[serde(default = "InferenceConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "InferenceConfig::default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "InferenceConfig::default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "InferenceConfig::default_generate_timeout_secs")]
    pub generate_timeout_secs: u64,
}

impl InferenceConfig {
    fn default_model() -> String {
        DEFAULT_MODEL.to_string()
    }

    fn default_base_url() -> String {
        DEFAULT_BASE_URL.to_string()
    }

    fn default_poll_interval_secs() -> u64 {
        2
    }

    fn default_max_wait_secs() -> u64 {
        300
    }

    fn default_generate_timeout_secs() -> u64 {
        300
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_timeout_secs)
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            base_url: Self::default_base_url(),
            poll_interval_secs: Self::default_poll_interval_secs(),
            max_wait_secs: Self::default_max_wait_secs(),
            generate_timeout_secs: Self::default_generate_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Scratch directory for in-flight upload spools.
    pub scratch_dir: PathBuf,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let dirs = project_dirs()?;
    let default_scratch = dirs.cache_dir().join("uploads");
    let default_docs = dirs.data_dir().join("policy_docs");

    let builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default(
            "storage.scratch_dir",
            default_scratch.to_string_lossy().to_string(),
        )?
        .set_default(
            "retrieval.docs_dir",
            default_docs.to_string_lossy().to_string(),
        )?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("VIGIL").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "vigil", "vigil").ok_or(AppConfigError::MissingProjectDirs)
}
