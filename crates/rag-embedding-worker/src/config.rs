use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub chunking: ChunkingConfig,
    pub forum: ForumConfig,
    pub pipeline: PipelineConfig,
    pub embedding: EmbeddingConfig,
    pub vector_index: VectorIndexConfig,
    pub state: StateConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub absolute_max_tokens: usize,
    pub fail_fast_validation: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 800,
            overlap_tokens: 120,
            absolute_max_tokens: 1024,
            fail_fast_validation: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ForumConfig {
    pub embed_quoted_content: bool,
    pub quoted_content_namespace: String,
    pub skip_unchanged_posts: bool,
}

impl Default for ForumConfig {
    fn default() -> Self {
        Self {
            embed_quoted_content: false,
            quoted_content_namespace: "forum-quote".to_string(),
            skip_unchanged_posts: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    pub embedding_threads: usize,
    pub upsert_threads: usize,
    pub resume: bool,
    pub max_chunks_per_batch: usize,
    pub embed_queue_capacity: usize,
    pub upsert_queue_capacity: usize,
    pub embedding_timeout_secs: u64,
    pub upsert_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            embedding_threads: 4,
            upsert_threads: 2,
            resume: false,
            max_chunks_per_batch: 500,
            embed_queue_capacity: 256,
            upsert_queue_capacity: 256,
            embedding_timeout_secs: 60,
            upsert_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VectorIndexConfig {
    pub database_url: String,
    pub collection: String,
    pub pool_max_size: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StateConfig {
    pub data_dir: String,
    pub flush_batch_size: usize,
    pub flush_interval_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: "data/ingest-state".to_string(),
            flush_batch_size: 20,
            flush_interval_secs: 3,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/ingest").required(true))
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    /// Settings suitable for unit/integration tests that never touch a
    /// config file on disk.
    pub fn for_tests(data_dir: impl Into<String>) -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            forum: ForumConfig::default(),
            pipeline: PipelineConfig::default(),
            embedding: EmbeddingConfig {
                base_url: "http://localhost:9999".to_string(),
                model: "test-embedding-model".to_string(),
                dimension: 8,
                api_key: None,
            },
            vector_index: VectorIndexConfig {
                database_url: "postgres://localhost/test".to_string(),
                collection: "test_chunks".to_string(),
                pool_max_size: 2,
            },
            state: StateConfig {
                data_dir: data_dir.into(),
                ..StateConfig::default()
            },
        }
    }
}
