use thiserror::Error;

/// Error taxonomy for the ingestion core.
///
/// Variants map directly onto the three severities the pipeline
/// distinguishes: transient (retried), per-chunk fatal (recorded, the
/// session continues), and session fatal (abort, flush, surface).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("unsupported source unit: {0}")]
    UnsupportedSourceUnit(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("chunking error: {0}")]
    ChunkingError(String),

    #[error("chunk exceeds absolute token budget: {actual} > {limit} ({context})")]
    ChunkBudgetExceeded {
        actual: usize,
        limit: usize,
        context: String,
    },

    #[error("embedding error: {0}")]
    EmbeddingError(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector index error: {0}")]
    VectorIndexError(String),

    #[error("vector index connection failure: {0}")]
    VectorIndexConnection(String),

    #[error("tokenizer initialization failure: {0}")]
    TokenizerInit(String),

    #[error("state store I/O failure: {0}")]
    StateStoreIo(String),

    #[error("progress store I/O failure: {0}")]
    ProgressStoreIo(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("http error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        WorkerError::Unknown(err.to_string())
    }
}

impl WorkerError {
    /// Session-fatal errors abort the pipeline after a final flush; every
    /// other variant is recorded per-chunk and the session continues.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::DimensionMismatch { .. }
                | WorkerError::TokenizerInit(_)
                | WorkerError::VectorIndexConnection(_)
                | WorkerError::StateStoreIo(_)
                | WorkerError::ProgressStoreIo(_)
        )
    }
}
