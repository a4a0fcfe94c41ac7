pub mod cancel;
pub mod report;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

pub use cancel::{CancellationListener, CancellationToken};
pub use report::{Diagnostics, FailedChunk, IngestionReport, PartialIngestionReport, ProgressEvent};

use crate::chunking::forum::{ForumChunker, ForumChunkerConfig};
use crate::chunking::markdown::{MarkdownChunker, MarkdownChunkerConfig};
use crate::config::Settings;
use crate::core::{Chunk, SourceUnit, TokenCounter};
use crate::document;
use crate::embedding::EmbedderClient;
use crate::error::WorkerError;
use crate::progress::ProgressTracker;
use crate::state::StateStore;
use crate::vector_index::{Filter, Point, VectorIndex};

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A chunk queued for embedding, tagged with the key of the source unit
/// it came from (a file path for docs, `thread_id/post_id` for forum
/// posts) and its position within that unit. `source_key` is what
/// Progress's per-file `lastIndex` and the State Store's chunk-id list
/// are keyed on.
#[derive(Clone)]
struct PendingChunk {
    source_key: String,
    index: usize,
    chunk: Chunk,
}

/// What the producer learned about a source unit while building the
/// pending-chunk list: used to update the State Store once its chunks
/// have gone through the pipeline.
enum UnitRecord {
    Doc { file_path: String, content_hash: String },
    Post { thread_id: String, post_id: String, fingerprint: String },
}

/// Bounded producer -> embed pool -> upsert pool pipeline. Implements
/// spec.md §4.10: chunk ids are deterministic so re-running after a
/// crash upserts the same ids in place, and the three stages run
/// concurrently with independent worker pools rather than a single
/// lockstep loop.
pub struct IngestionPipeline {
    settings: Settings,
    tokenizer: TokenCounter,
    embedder: Arc<dyn EmbedderClient>,
    vector_index: Arc<dyn VectorIndex>,
    state: Arc<StateStore>,
    progress: Arc<ProgressTracker>,
}

impl IngestionPipeline {
    pub fn new(
        settings: Settings,
        tokenizer: TokenCounter,
        embedder: Arc<dyn EmbedderClient>,
        vector_index: Arc<dyn VectorIndex>,
        state: Arc<StateStore>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            settings,
            tokenizer,
            embedder,
            vector_index,
            state,
            progress,
        }
    }

    fn markdown_chunker(&self) -> MarkdownChunker {
        MarkdownChunker::new(
            self.tokenizer.clone(),
            MarkdownChunkerConfig {
                max_tokens: self.settings.chunking.max_tokens,
                overlap_tokens: self.settings.chunking.overlap_tokens,
                absolute_max_tokens: self.settings.chunking.absolute_max_tokens,
                fail_fast_validation: self.settings.chunking.fail_fast_validation,
            },
        )
    }

    fn forum_chunker(&self) -> ForumChunker {
        ForumChunker::new(
            self.tokenizer.clone(),
            ForumChunkerConfig {
                max_tokens: self.settings.chunking.max_tokens,
                overlap_tokens: self.settings.chunking.overlap_tokens,
                embed_quoted_content: self.settings.forum.embed_quoted_content,
                quoted_content_namespace: self.settings.forum.quoted_content_namespace.clone(),
            },
        )
    }

    fn chunk_unit(&self, unit: &SourceUnit) -> Result<Vec<Chunk>, WorkerError> {
        match unit {
            SourceUnit::Doc(doc) => self.markdown_chunker().chunk(doc, &self.settings.embedding.model),
            SourceUnit::Post(post) => Ok(self.forum_chunker().chunk(post, &self.settings.embedding.model)),
        }
    }

    /// Flattens source units into pending chunks plus the bookkeeping
    /// record each unit needs once its chunks clear the pipeline.
    fn build_pending(&self, units: &[SourceUnit]) -> Result<(Vec<PendingChunk>, Vec<UnitRecord>), WorkerError> {
        let mut pending = Vec::new();
        let mut records = Vec::new();

        for unit in units {
            let chunks = self.chunk_unit(unit)?;
            let source_key = unit.source_key();
            for chunk in &chunks {
                let index = match &chunk.metadata {
                    crate::core::ChunkMetadata::Doc(m) => m.chunk_index,
                    crate::core::ChunkMetadata::Forum(m) => m.sub_chunk_index,
                };
                pending.push(PendingChunk {
                    source_key: source_key.clone(),
                    index,
                    chunk: chunk.clone(),
                });
            }

            records.push(match unit {
                SourceUnit::Doc(doc) => UnitRecord::Doc {
                    file_path: doc.file_path.clone(),
                    content_hash: crate::core::fingerprint(&doc.body),
                },
                SourceUnit::Post(post) => UnitRecord::Post {
                    thread_id: post.thread_id.clone(),
                    post_id: post.post_id.clone(),
                    fingerprint: post.fingerprint.clone(),
                },
            });
        }

        Ok((pending, records))
    }

    /// Full ingestion: drops the collection, clears State and Progress,
    /// ensures a fresh collection at the configured dimension, and
    /// ingests every source unit under `root`.
    pub async fn ingest_full(
        &self,
        root: &Path,
        cancel: CancellationListener,
        on_progress: Option<ProgressCallback>,
    ) -> Result<IngestionReport, WorkerError> {
        self.vector_index.drop_collection().await?;
        self.state.clear_all().await;
        self.progress.clear().await;
        self.vector_index
            .ensure_collection(self.settings.embedding.dimension)
            .await?;

        let units = document::read_all(root)?;
        self.run_session(units, Vec::new(), cancel, on_progress).await
    }

    /// Incremental ingestion: diffs the current tree against the State
    /// Store by content fingerprint, replaces changed/new files in place
    /// (filter-delete then upsert), deletes removed files' vectors, and
    /// skips forum posts whose fingerprint is unchanged.
    pub async fn ingest_incremental(
        &self,
        root: &Path,
        cancel: CancellationListener,
        on_progress: Option<ProgressCallback>,
    ) -> Result<IngestionReport, WorkerError> {
        let all_units = document::read_all(root)?;

        let mut doc_hashes: HashMap<String, String> = HashMap::new();
        for unit in &all_units {
            if let SourceUnit::Doc(doc) = unit {
                doc_hashes.insert(doc.file_path.clone(), crate::core::fingerprint(&doc.body));
            }
        }
        let diff = self.state.diff(&doc_hashes).await;
        let changed_files: HashSet<String> = diff
            .to_add
            .iter()
            .chain(diff.to_replace.iter())
            .cloned()
            .collect();

        let mut units_to_ingest = Vec::new();
        for unit in all_units {
            match &unit {
                SourceUnit::Doc(doc) => {
                    if changed_files.contains(&doc.file_path) {
                        units_to_ingest.push(unit);
                    }
                }
                SourceUnit::Post(post) if self.settings.forum.skip_unchanged_posts => {
                    let stored = self
                        .state
                        .get_post_fingerprint(&post.thread_id, &post.post_id)
                        .await;
                    if stored.as_deref() != Some(post.fingerprint.as_str()) {
                        units_to_ingest.push(unit);
                    }
                }
                SourceUnit::Post(_) => units_to_ingest.push(unit),
            }
        }

        // Filter-delete changed doc files before re-upserting their chunks.
        for file in &diff.to_replace {
            self.vector_index
                .delete_by_filter(Filter::eq("source_file", file.as_str()))
                .await?;
        }

        let mut chunks_deleted = 0u64;
        for file in &diff.to_delete {
            let chunk_ids = self.state.delete(file).await;
            chunks_deleted += chunk_ids.len() as u64;
            self.vector_index
                .delete_by_filter(Filter::eq("source_file", file.as_str()))
                .await?;
        }

        let mut report = self
            .run_session(units_to_ingest, diff.to_delete.clone(), cancel, on_progress)
            .await?;
        report.files_deleted = diff.to_delete.len();
        report.chunks_deleted += chunks_deleted as usize;
        report.files_added = diff.to_add.len();
        report.files_updated = diff.to_replace.len();
        Ok(report)
    }

    /// Ingests only the given relative paths (used by `ingestSelected`,
    /// e.g. after a targeted re-upload), regardless of whether the State
    /// Store considers them changed.
    pub async fn ingest_selected(
        &self,
        root: &Path,
        paths: &[String],
        cancel: CancellationListener,
        on_progress: Option<ProgressCallback>,
    ) -> Result<IngestionReport, WorkerError> {
        let wanted: HashSet<&str> = paths.iter().map(|p| p.as_str()).collect();
        let all_units = document::read_all(root)?;
        let selected: Vec<SourceUnit> = all_units
            .into_iter()
            .filter(|unit| match unit {
                SourceUnit::Doc(doc) => wanted.contains(doc.file_path.as_str()),
                SourceUnit::Post(post) => wanted.contains(post.forum_path.as_str()),
            })
            .collect();

        for unit in &selected {
            if let SourceUnit::Doc(doc) = unit {
                self.vector_index
                    .delete_by_filter(Filter::eq("source_file", doc.file_path.as_str()))
                    .await?;
            }
        }

        self.run_session(selected, Vec::new(), cancel, on_progress).await
    }

    /// Processes up to `max_chunks_per_batch` chunks of a full-corpus
    /// ingestion starting at `start_index` in the flattened chunk stream,
    /// so a caller can iterate a large corpus across multiple calls
    /// without holding one pipeline invocation open for the whole run.
    pub async fn ingest_full_partial(
        &self,
        root: &Path,
        start_index: usize,
        cancel: CancellationListener,
        on_progress: Option<ProgressCallback>,
    ) -> Result<PartialIngestionReport, WorkerError> {
        let units = document::read_all(root)?;
        let (pending, _records) = self.build_pending(&units)?;

        let max_batch = self.settings.pipeline.max_chunks_per_batch;
        let end = (start_index + max_batch).min(pending.len());
        let batch = pending.get(start_index..end).unwrap_or_default().to_vec();

        let diagnostics = Arc::new(Diagnostics::default());
        let (_chunk_ids, failed, _fatal) = self
            .run_three_stage(batch.clone(), cancel, on_progress, diagnostics)
            .await?;

        Ok(PartialIngestionReport {
            processed_chunks: batch.len() - failed.len(),
            next_start_index: end,
            has_more: end < pending.len(),
            chunks_failed: failed.len(),
            failed_items: failed,
        })
    }

    /// Shared driver for `ingest_full`/`ingest_incremental`/`ingest_selected`:
    /// flattens `units` into pending chunks, runs the three-stage
    /// pipeline, then commits State Store entries for every unit whose
    /// chunks all succeeded.
    async fn run_session(
        &self,
        units: Vec<SourceUnit>,
        mut pre_deleted_files: Vec<String>,
        cancel: CancellationListener,
        on_progress: Option<ProgressCallback>,
    ) -> Result<IngestionReport, WorkerError> {
        let started = Instant::now();
        let session_id = uuid::Uuid::new_v4().to_string();
        let (pending, records) = self.build_pending(&units)?;

        self.progress.create(session_id.clone(), units.len(), pending.len()).await;
        let mut totals: HashMap<String, usize> = HashMap::new();
        for item in &pending {
            *totals.entry(item.source_key.clone()).or_insert(0) += 1;
        }
        for (key, total) in &totals {
            self.progress.init_file(key, *total).await;
        }

        let diagnostics = Arc::new(Diagnostics::default());
        let (chunk_ids, failed, cancelled) = self
            .run_three_stage(pending.clone(), cancel, on_progress, diagnostics.clone())
            .await?;

        // Commit State Store entries only for units whose chunks all
        // made it through; a unit with failures keeps its previous state
        // so the next incremental pass retries it.
        for record in &records {
            match record {
                UnitRecord::Doc { file_path, content_hash } => {
                    let expected = *totals.get(file_path).unwrap_or(&0);
                    let succeeded = chunk_ids.get(file_path).cloned().unwrap_or_default();
                    if succeeded.len() == expected {
                        self.state.upsert(file_path, content_hash, succeeded).await;
                    }
                }
                UnitRecord::Post {
                    thread_id,
                    post_id,
                    fingerprint,
                } => {
                    let key = format!("{thread_id}/{post_id}");
                    let expected = *totals.get(&key).unwrap_or(&0);
                    let succeeded = chunk_ids.get(&key).cloned().unwrap_or_default();
                    if succeeded.len() == expected {
                        self.state.upsert_post_fingerprint(thread_id, post_id, fingerprint).await;
                    }
                }
            }
        }

        self.state.flush().await?;
        self.progress.flush().await?;

        let wall_time = started.elapsed();
        let chunks_upserted: usize = chunk_ids.values().map(|v| v.len()).sum();
        let vectors_per_second = if wall_time.as_secs_f64() > 0.0 {
            chunks_upserted as f64 / wall_time.as_secs_f64()
        } else {
            0.0
        };

        pre_deleted_files.sort();
        pre_deleted_files.dedup();

        Ok(IngestionReport {
            session_id,
            files_added: 0,
            files_updated: 0,
            files_deleted: 0,
            chunks_upserted,
            chunks_deleted: 0,
            chunks_failed: failed.len(),
            failed_items: failed,
            peak_embedding_in_flight: diagnostics.peak_embedding_in_flight.load(Ordering::SeqCst),
            peak_upsert_in_flight: diagnostics.peak_upsert_in_flight.load(Ordering::SeqCst),
            mean_embedding_latency_ms: diagnostics.mean_embedding_latency().as_millis() as u64,
            rate_limit_hits: diagnostics.rate_limit_hits.load(Ordering::SeqCst),
            retry_count: diagnostics.retry_count.load(Ordering::SeqCst),
            wall_time_ms: wall_time.as_millis() as u64,
            vectors_per_second,
            cancelled,
        })
    }

    /// Runs the producer -> embed pool -> upsert pool pipeline over
    /// `pending`, honoring `resume` (skipping chunks Progress already
    /// marked done for their source key) and `cancel` (stop producing,
    /// let in-flight work drain, flush on the way out).
    ///
    /// Returns the chunk ids that were successfully upserted per source
    /// key, the list of failed chunks, and whether the run ended early
    /// because of cancellation.
    async fn run_three_stage(
        &self,
        pending: Vec<PendingChunk>,
        cancel: CancellationListener,
        on_progress: Option<ProgressCallback>,
        diagnostics: Arc<Diagnostics>,
    ) -> Result<(HashMap<String, Vec<String>>, Vec<FailedChunk>, bool), WorkerError> {
        let resume = self.settings.pipeline.resume;
        let embed_capacity = self.settings.pipeline.embed_queue_capacity.max(1);
        let upsert_capacity = self.settings.pipeline.upsert_queue_capacity.max(1);
        let absolute_max = self.settings.chunking.absolute_max_tokens;
        let expected_dim = self.settings.embedding.dimension;
        let embedding_model = self.settings.embedding.model.clone();

        let (embed_tx, embed_rx) = mpsc::channel::<PendingChunk>(embed_capacity);
        let (upsert_tx, upsert_rx) = mpsc::channel::<(PendingChunk, Vec<f32>)>(upsert_capacity);
        let embed_rx = Arc::new(Mutex::new(embed_rx));
        let upsert_rx = Arc::new(Mutex::new(upsert_rx));

        let chunk_ids: Arc<Mutex<HashMap<String, Vec<String>>>> = Arc::new(Mutex::new(HashMap::new()));
        let failed: Arc<Mutex<Vec<FailedChunk>>> = Arc::new(Mutex::new(Vec::new()));
        let session_fatal: Arc<Mutex<Option<WorkerError>>> = Arc::new(Mutex::new(None));
        let abort = CancellationToken::new();

        // Producer: pushes every chunk of every source unit, in order,
        // without waiting for downstream completion. Resume skips chunks
        // Progress already recorded for this source key.
        let producer_progress = self.progress.clone();
        let producer_cancel = cancel.clone();
        let producer_abort = abort.listener();
        let producer = tokio::spawn(async move {
            for item in pending {
                if producer_cancel.is_cancelled() || producer_abort.is_cancelled() {
                    break;
                }
                if resume && producer_progress.should_skip(&item.source_key, item.index).await {
                    continue;
                }
                if embed_tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        // Embedding pool: validates the token budget, calls the
        // Embedder Client, and forwards `{chunk, vector}` downstream on
        // success. A failure is recorded and the worker keeps pulling —
        // one bad chunk never stops the pool.
        let mut embed_workers = Vec::new();
        for _ in 0..self.settings.pipeline.embedding_threads.max(1) {
            let embed_rx = embed_rx.clone();
            let upsert_tx = upsert_tx.clone();
            let embedder = self.embedder.clone();
            let progress = self.progress.clone();
            let failed = failed.clone();
            let diagnostics = diagnostics.clone();
            let cancel = cancel.clone();
            let abort_listener = abort.listener();

            embed_workers.push(tokio::spawn(async move {
                loop {
                    let item = {
                        let mut rx = embed_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(item) = item else { break };

                    if item.chunk.token_count > absolute_max {
                        let msg = format!(
                            "chunk {} tokens exceeds absoluteMaxTokens {}",
                            item.chunk.token_count, absolute_max
                        );
                        progress.mark_failed(&item.source_key, item.index, &item.chunk.id, &msg).await;
                        failed.lock().await.push(FailedChunk {
                            file: item.source_key.clone(),
                            chunk_index: item.index,
                            chunk_id: item.chunk.id.clone(),
                            error: msg,
                        });
                        continue;
                    }

                    diagnostics.enter_embedding();
                    let started = Instant::now();
                    let result = embedder.embed_one(&item.chunk.content).await;
                    diagnostics.exit_embedding();

                    match result {
                        Ok(embedded) => {
                            diagnostics.record_embedding_latency(started.elapsed());
                            diagnostics.record_retries(embedded.retry_count);
                            if embedded.was_rate_limited {
                                diagnostics.record_rate_limit_hit();
                            }
                            if upsert_tx.send((item, embedded.vector)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            progress.mark_failed(&item.source_key, item.index, &item.chunk.id, &e.to_string()).await;
                            failed.lock().await.push(FailedChunk {
                                file: item.source_key.clone(),
                                chunk_index: item.index,
                                chunk_id: item.chunk.id.clone(),
                                error: e.to_string(),
                            });
                        }
                    }

                    if cancel.is_cancelled() || abort_listener.is_cancelled() {
                        break;
                    }
                }
            }));
        }
        // Drop the pipeline's own handle to the embed receiver: once every
        // embed worker has also dropped its clone (they do on abort or on
        // a closed upstream channel), `embed_tx.send` starts failing and
        // the producer loop above unblocks instead of stalling forever on
        // a full, unconsumed channel.
        drop(embed_rx);
        drop(upsert_tx);

        // Upsert pool: one upsert per chunk; on success records the
        // chunk id against its source key, updates Progress, and
        // invokes the caller's progress callback. A dimension mismatch
        // is session-fatal: it trips `abort`, which both pools observe.
        let mut upsert_workers = Vec::new();
        for _ in 0..self.settings.pipeline.upsert_threads.max(1) {
            let upsert_rx = upsert_rx.clone();
            let vector_index = self.vector_index.clone();
            let progress = self.progress.clone();
            let chunk_ids = chunk_ids.clone();
            let failed = failed.clone();
            let session_fatal = session_fatal.clone();
            let diagnostics = diagnostics.clone();
            let on_progress = on_progress.clone();
            let embedding_model = embedding_model.clone();
            let abort_handle = abort.listener();
            let abort_sender = abort.clone();

            upsert_workers.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = upsert_rx.lock().await;
                        rx.recv().await
                    };
                    let Some((item, vector)) = next else { break };

                    if vector.len() != expected_dim {
                        let err = WorkerError::DimensionMismatch {
                            expected: expected_dim,
                            actual: vector.len(),
                        };
                        *session_fatal.lock().await = Some(err);
                        abort_sender.cancel();
                        break;
                    }

                    diagnostics.enter_upsert();
                    let point = Point {
                        id: item.chunk.id.clone(),
                        vector,
                        payload: item.chunk.to_payload(&embedding_model),
                    };
                    let result = vector_index.upsert(vec![point]).await;
                    diagnostics.exit_upsert();

                    match result {
                        Ok(()) => {
                            progress.mark_processed(&item.source_key, item.index).await;
                            chunk_ids
                                .lock()
                                .await
                                .entry(item.source_key.clone())
                                .or_insert_with(Vec::new)
                                .push(item.chunk.id.clone());
                            if let Some(cb) = &on_progress {
                                cb(ProgressEvent::ChunkUpserted {
                                    file: item.source_key.clone(),
                                    index: item.index,
                                });
                            }
                        }
                        Err(e) => {
                            progress.mark_failed(&item.source_key, item.index, &item.chunk.id, &e.to_string()).await;
                            failed.lock().await.push(FailedChunk {
                                file: item.source_key.clone(),
                                chunk_index: item.index,
                                chunk_id: item.chunk.id.clone(),
                                error: e.to_string(),
                            });
                            if let Some(cb) = &on_progress {
                                cb(ProgressEvent::ChunkFailed {
                                    file: item.source_key.clone(),
                                    index: item.index,
                                    error: e.to_string(),
                                });
                            }
                        }
                    }

                    if abort_handle.is_cancelled() {
                        break;
                    }
                }
            }));
        }

        producer.await.ok();
        for worker in embed_workers {
            worker.await.ok();
        }
        for worker in upsert_workers {
            worker.await.ok();
        }

        if let Some(err) = session_fatal.lock().await.take() {
            self.progress.flush().await?;
            self.state.flush().await?;
            return Err(err);
        }

        let was_cancelled = cancel.is_cancelled();
        if was_cancelled {
            warn!("ingestion session cancelled, flushing partial progress");
        }
        info!(
            upserted = chunk_ids.lock().await.values().map(|v| v.len()).sum::<usize>(),
            failed = failed.lock().await.len(),
            "ingestion batch complete"
        );

        let chunk_ids = Arc::try_unwrap(chunk_ids).map(|m| m.into_inner()).unwrap_or_default();
        let failed = Arc::try_unwrap(failed).map(|m| m.into_inner()).unwrap_or_default();

        Ok((chunk_ids, failed, was_cancelled))
    }
}
