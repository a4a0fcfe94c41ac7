use anyhow::Result;
use config::{Config, Environment, File};
use rag_embedding_worker::config::{EmbeddingConfig, VectorIndexConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub vector_index: VectorIndexConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SecurityConfig {
    pub allowed_ips: Vec<String>,
    pub custom_headers: CustomHeadersConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CustomHeadersConfig {
    pub app_id: String,
    pub api_key: String,
    pub request_signature: String,
    pub timestamp_tolerance: i64,
}

/// Tuning for `RetrievalEngine::retrieve`. `forum_only` selects the
/// `docType == 'forum_post'` filter mode; mixed deployments that also
/// index documentation can set it `false` to search across both.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    pub retrieval_count: usize,
    pub forum_only: bool,
    pub group_by_thread_on_retrieval: bool,
    pub time_decay_weighting: bool,
    pub time_decay_half_life_days: f64,
    pub max_posts_per_thread_in_context: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            retrieval_count: 30,
            forum_only: true,
            group_by_thread_on_retrieval: true,
            time_decay_weighting: false,
            time_decay_half_life_days: 365.0,
            max_posts_per_thread_in_context: 10,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    pub fn config_path(&self) -> PathBuf {
        PathBuf::from("config/settings.toml")
    }
}
