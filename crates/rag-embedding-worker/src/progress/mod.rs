use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tokio::time::{interval, Duration};
use tracing::warn;

use crate::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProgress {
    pub total: usize,
    pub processed: usize,
    /// -1 means no chunk of this file has been upserted yet.
    pub last_index: i64,
    pub status: FileStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItem {
    pub file: String,
    pub chunk_index: usize,
    pub chunk_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub total_files: usize,
    pub total_chunks: usize,
    pub processed_chunks: usize,
    pub failed_chunks: usize,
    pub current_file: Option<String>,
    pub current_chunk_index: Option<usize>,
    pub files: HashMap<String, FileProgress>,
    pub failed_items: Vec<FailedItem>,
}

impl ProgressRecord {
    fn new(session_id: String, total_files: usize, total_chunks: usize) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            started_at: now,
            last_updated_at: now,
            total_files,
            total_chunks,
            processed_chunks: 0,
            failed_chunks: 0,
            current_file: None,
            current_chunk_index: None,
            files: HashMap::new(),
            failed_items: Vec::new(),
        }
    }
}

/// Durable, resumable log of per-chunk processing status. Same batched
/// write-then-rename discipline as the State Store; `shouldSkip` and
/// `resumeFrom` are what let a `resume=true` session pick up where a
/// crashed one left off.
pub struct ProgressTracker {
    record: Arc<RwLock<ProgressRecord>>,
    path: PathBuf,
    dirty_count: Arc<AtomicUsize>,
    flush_batch_size: usize,
    notify: Arc<Notify>,
}

impl ProgressTracker {
    pub async fn load(data_dir: &Path, flush_batch_size: usize, flush_interval_secs: u64) -> Result<Self, WorkerError> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| WorkerError::ProgressStoreIo(e.to_string()))?;
        let path = data_dir.join("progress.json");

        let record = if path.exists() {
            let raw = tokio::fs::read(&path)
                .await
                .map_err(|e| WorkerError::ProgressStoreIo(e.to_string()))?;
            serde_json::from_slice(&raw)
                .unwrap_or_else(|_| ProgressRecord::new(String::new(), 0, 0))
        } else {
            ProgressRecord::new(String::new(), 0, 0)
        };

        let tracker = Self {
            record: Arc::new(RwLock::new(record)),
            path,
            dirty_count: Arc::new(AtomicUsize::new(0)),
            flush_batch_size: flush_batch_size.max(1),
            notify: Arc::new(Notify::new()),
        };
        tracker.spawn_flusher(Duration::from_secs(flush_interval_secs.max(1)));
        Ok(tracker)
    }

    fn spawn_flusher(&self, period: Duration) {
        let record = self.record.clone();
        let path = self.path.clone();
        let dirty = self.dirty_count.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notify.notified() => {}
                }
                if dirty.load(Ordering::SeqCst) == 0 {
                    continue;
                }
                let snapshot = record.read().await.clone();
                match write_atomic(&path, &snapshot).await {
                    Ok(()) => dirty.store(0, Ordering::SeqCst),
                    Err(e) => warn!("progress tracker flush failed: {e}"),
                }
            }
        });
    }

    async fn mark_dirty(&self) {
        let count = self.dirty_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.flush_batch_size {
            self.notify.notify_one();
        }
    }

    pub async fn create(&self, session_id: String, total_files: usize, total_chunks: usize) {
        let mut record = self.record.write().await;
        *record = ProgressRecord::new(session_id, total_files, total_chunks);
        drop(record);
        self.mark_dirty().await;
    }

    pub async fn init_file(&self, file: &str, total: usize) {
        let mut record = self.record.write().await;
        record.files.insert(
            file.to_string(),
            FileProgress {
                total,
                processed: 0,
                last_index: -1,
                status: FileStatus::Pending,
            },
        );
        record.last_updated_at = Utc::now();
        drop(record);
        self.mark_dirty().await;
    }

    pub async fn mark_processed(&self, file: &str, index: usize) {
        let mut record = self.record.write().await;
        record.current_file = Some(file.to_string());
        record.current_chunk_index = Some(index);
        record.processed_chunks += 1;
        record.last_updated_at = Utc::now();

        let entry = record
            .files
            .entry(file.to_string())
            .or_insert_with(|| FileProgress {
                total: index + 1,
                processed: 0,
                last_index: -1,
                status: FileStatus::Pending,
            });
        entry.processed += 1;
        entry.last_index = entry.last_index.max(index as i64);
        entry.status = if entry.processed >= entry.total {
            FileStatus::Completed
        } else {
            FileStatus::InProgress
        };

        drop(record);
        self.mark_dirty().await;
    }

    pub async fn mark_failed(&self, file: &str, index: usize, chunk_id: &str, error: &str) {
        let mut record = self.record.write().await;
        record.failed_chunks += 1;
        record.last_updated_at = Utc::now();
        record.failed_items.push(FailedItem {
            file: file.to_string(),
            chunk_index: index,
            chunk_id: chunk_id.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
        if let Some(entry) = record.files.get_mut(file) {
            if entry.status != FileStatus::Completed {
                entry.status = FileStatus::Failed;
            }
        }
        drop(record);
        self.mark_dirty().await;
    }

    pub async fn should_skip(&self, file: &str, index: usize) -> bool {
        let record = self.record.read().await;
        record
            .files
            .get(file)
            .map(|f| index as i64 <= f.last_index)
            .unwrap_or(false)
    }

    pub async fn resume_from(&self, file: &str) -> usize {
        let record = self.record.read().await;
        record
            .files
            .get(file)
            .map(|f| (f.last_index + 1).max(0) as usize)
            .unwrap_or(0)
    }

    pub async fn snapshot(&self) -> ProgressRecord {
        self.record.read().await.clone()
    }

    pub async fn clear(&self) {
        let mut record = self.record.write().await;
        *record = ProgressRecord::new(String::new(), 0, 0);
        drop(record);
        self.mark_dirty().await;
        if let Err(e) = self.flush().await {
            warn!("progress tracker flush after clear failed: {e}");
        }
    }

    pub async fn flush(&self) -> Result<(), WorkerError> {
        let snapshot = self.record.read().await.clone();
        write_atomic(&self.path, &snapshot)
            .await
            .map_err(|e| WorkerError::ProgressStoreIo(e.to_string()))?;
        self.dirty_count.store(0, Ordering::SeqCst);
        Ok(())
    }
}

async fn write_atomic(path: &Path, record: &ProgressRecord) -> std::io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(record)?;
    tokio::fs::write(&tmp_path, &body).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn resume_from_and_should_skip_track_last_index() {
        let dir = tempdir().unwrap();
        let tracker = ProgressTracker::load(dir.path(), 20, 3).await.unwrap();
        tracker.create("s1".to_string(), 1, 5).await;
        tracker.init_file("a.md", 5).await;

        assert_eq!(tracker.resume_from("a.md").await, 0);
        assert!(!tracker.should_skip("a.md", 0).await);

        tracker.mark_processed("a.md", 0).await;
        tracker.mark_processed("a.md", 1).await;

        assert!(tracker.should_skip("a.md", 0).await);
        assert!(tracker.should_skip("a.md", 1).await);
        assert!(!tracker.should_skip("a.md", 2).await);
        assert_eq!(tracker.resume_from("a.md").await, 2);
    }

    #[tokio::test]
    async fn mark_failed_records_failed_item() {
        let dir = tempdir().unwrap();
        let tracker = ProgressTracker::load(dir.path(), 20, 3).await.unwrap();
        tracker.create("s1".to_string(), 1, 2).await;
        tracker.init_file("a.md", 2).await;
        tracker.mark_failed("a.md", 0, "chunk-id", "embedding dimension mismatch").await;

        let snapshot = tracker.snapshot().await;
        assert_eq!(snapshot.failed_chunks, 1);
        assert_eq!(snapshot.failed_items.len(), 1);
        assert_eq!(snapshot.failed_items[0].chunk_id, "chunk-id");
    }

    #[tokio::test]
    async fn flush_persists_across_reload() {
        let dir = tempdir().unwrap();
        {
            let tracker = ProgressTracker::load(dir.path(), 20, 3).await.unwrap();
            tracker.create("s1".to_string(), 1, 1).await;
            tracker.init_file("a.md", 1).await;
            tracker.mark_processed("a.md", 0).await;
            tracker.flush().await.unwrap();
        }
        let reloaded = ProgressTracker::load(dir.path(), 20, 3).await.unwrap();
        assert_eq!(reloaded.resume_from("a.md").await, 1);
    }
}
