use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

/// One chunk that failed embedding or upsert. Recorded in the report and
/// mirrored into `Progress.failedItems`; a single entry never aborts the
/// session.
#[derive(Debug, Clone, Serialize)]
pub struct FailedChunk {
    pub file: String,
    pub chunk_index: usize,
    pub chunk_id: String,
    pub error: String,
}

/// Per-chunk lifecycle events a caller can subscribe to via a callback,
/// satisfying spec.md §9's "channel of progress events or caller-supplied
/// callback" choice with the callback form.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    ChunkUpserted { file: String, index: usize },
    ChunkFailed { file: String, index: usize, error: String },
}

/// Live counters updated concurrently by embed/upsert workers. Cheap to
/// share via `Arc` since every field is lock-free.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub embedding_in_flight: AtomicUsize,
    pub peak_embedding_in_flight: AtomicUsize,
    pub upsert_in_flight: AtomicUsize,
    pub peak_upsert_in_flight: AtomicUsize,
    pub embedding_latency_sum_micros: AtomicU64,
    pub embedding_latency_count: AtomicU64,
    pub rate_limit_hits: AtomicU64,
    pub retry_count: AtomicU64,
}

impl Diagnostics {
    pub fn enter_embedding(&self) {
        let n = self.embedding_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_embedding_in_flight.fetch_max(n, Ordering::SeqCst);
    }

    pub fn exit_embedding(&self) {
        self.embedding_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn enter_upsert(&self) {
        let n = self.upsert_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_upsert_in_flight.fetch_max(n, Ordering::SeqCst);
    }

    pub fn exit_upsert(&self) {
        self.upsert_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_embedding_latency(&self, latency: Duration) {
        self.embedding_latency_sum_micros
            .fetch_add(latency.as_micros() as u64, Ordering::SeqCst);
        self.embedding_latency_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_retries(&self, n: u32) {
        self.retry_count.fetch_add(n as u64, Ordering::SeqCst);
    }

    pub fn mean_embedding_latency(&self) -> Duration {
        let count = self.embedding_latency_count.load(Ordering::SeqCst);
        if count == 0 {
            return Duration::ZERO;
        }
        let sum = self.embedding_latency_sum_micros.load(Ordering::SeqCst);
        Duration::from_micros(sum / count)
    }
}

/// The final, caller-facing result of a full or incremental ingestion
/// session. Per-chunk failures are always captured here; the pipeline
/// only raises `WorkerError` to its caller for session-fatal conditions.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub session_id: String,
    pub files_added: usize,
    pub files_updated: usize,
    pub files_deleted: usize,
    pub chunks_upserted: usize,
    pub chunks_deleted: usize,
    pub chunks_failed: usize,
    pub failed_items: Vec<FailedChunk>,
    pub peak_embedding_in_flight: usize,
    pub peak_upsert_in_flight: usize,
    pub mean_embedding_latency_ms: u64,
    pub rate_limit_hits: u64,
    pub retry_count: u64,
    pub wall_time_ms: u64,
    pub vectors_per_second: f64,
    pub cancelled: bool,
}

/// Result of one `ingest_full_partial` batch: lets a caller iterate a
/// large corpus across multiple invocations instead of holding the whole
/// pipeline open in one call.
#[derive(Debug, Clone, Serialize)]
pub struct PartialIngestionReport {
    pub processed_chunks: usize,
    pub next_start_index: usize,
    pub has_more: bool,
    pub chunks_failed: usize,
    pub failed_items: Vec<FailedChunk>,
}
