use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use rag_embedding_worker::config::Settings;
use rag_embedding_worker::core::TokenCounter;
use rag_embedding_worker::embedding::HttpEmbedderClient;
use rag_embedding_worker::health;
use rag_embedding_worker::pipeline::{CancellationToken, IngestionPipeline};
use rag_embedding_worker::progress::ProgressTracker;
use rag_embedding_worker::state::StateStore;
use rag_embedding_worker::utils::init_logger;
use rag_embedding_worker::vector_index::{DbPool, PgVectorIndex};

#[derive(Parser)]
#[command(name = "rag-embedding-worker", about = "Structure-aware RAG ingestion pipeline")]
struct Cli {
    /// Root of the documentation/forum tree to ingest.
    #[arg(long, default_value = "content", global = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drops and rebuilds the collection from the whole tree.
    IngestFull,
    /// Diffs the tree against the State Store and ingests only what changed.
    IngestIncremental,
    /// Ingests a named subset of paths regardless of change detection.
    IngestSelected {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Ingests one bounded batch of a full-corpus run starting at an offset.
    IngestFullPartial {
        #[arg(long, default_value_t = 0)]
        start_index: usize,
    },
    /// Reports vector-index reachability, collection dimension, point count.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger()?;
    info!("starting rag-embedding-worker");

    let settings = Settings::load()?;
    info!("configuration loaded");

    let cli = Cli::parse();

    let db_pool = DbPool::connect(&settings.vector_index).await?;
    let vector_index: Arc<PgVectorIndex> = Arc::new(PgVectorIndex::new(
        db_pool,
        settings.vector_index.collection.clone(),
    ));

    if matches!(cli.command, Command::Health) {
        let report = health::check(vector_index.as_ref()).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let tokenizer = TokenCounter::new()?;
    let embedder = Arc::new(HttpEmbedderClient::new(
        settings.embedding.base_url.clone(),
        settings.embedding.model.clone(),
        settings.embedding.api_key.clone(),
        Duration::from_secs(settings.pipeline.embedding_timeout_secs),
    )?);
    let state = Arc::new(
        StateStore::open(
            Path::new(&settings.state.data_dir),
            settings.state.flush_batch_size,
            settings.state.flush_interval_secs,
        )
        .await?,
    );
    let progress = Arc::new(
        ProgressTracker::load(
            Path::new(&settings.state.data_dir),
            settings.state.flush_batch_size,
            settings.state.flush_interval_secs,
        )
        .await?,
    );

    let pipeline = IngestionPipeline::new(settings, tokenizer, embedder, vector_index, state, progress);
    let cancel = CancellationToken::new();
    let listener = cancel.listener();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, cancelling ingestion");
            cancel.cancel();
        }
    });

    let report = match cli.command {
        Command::IngestFull => pipeline.ingest_full(&cli.root, listener, None).await,
        Command::IngestIncremental => pipeline.ingest_incremental(&cli.root, listener, None).await,
        Command::IngestSelected { paths } => pipeline.ingest_selected(&cli.root, &paths, listener, None).await,
        Command::IngestFullPartial { start_index } => {
            let partial = pipeline.ingest_full_partial(&cli.root, start_index, listener, None).await;
            match partial {
                Ok(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "partial ingestion failed");
                    return Err(e.into());
                }
            }
        }
        Command::Health => unreachable!("handled above"),
    };

    match report {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "ingestion session aborted");
            Err(e.into())
        }
    }
}
