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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStateView {
    pub content_hash: String,
    pub last_ingested: DateTime<Utc>,
    pub chunk_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateData {
    files: HashMap<String, FileStateView>,
    posts: HashMap<String, String>,
}

#[derive(Debug, Default, Clone)]
pub struct StateDiff {
    pub to_add: Vec<String>,
    pub to_replace: Vec<String>,
    pub to_delete: Vec<String>,
}

/// Durable mapping from source-unit key to fingerprint, chunk ids, and
/// last-ingested timestamp. Writes are buffered in memory and flushed to
/// disk at the earlier of a write-count threshold or a timer interval;
/// the on-disk file is replaced atomically (write-to-temp, then rename).
pub struct StateStore {
    data: Arc<RwLock<StateData>>,
    path: PathBuf,
    dirty_count: Arc<AtomicUsize>,
    flush_batch_size: usize,
    notify: Arc<Notify>,
}

impl StateStore {
    pub async fn open(data_dir: &Path, flush_batch_size: usize, flush_interval_secs: u64) -> Result<Self, WorkerError> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| WorkerError::StateStoreIo(e.to_string()))?;
        let path = data_dir.join("state.json");

        let data = if path.exists() {
            let raw = tokio::fs::read(&path)
                .await
                .map_err(|e| WorkerError::StateStoreIo(e.to_string()))?;
            serde_json::from_slice(&raw).unwrap_or_default()
        } else {
            StateData::default()
        };

        let store = Self {
            data: Arc::new(RwLock::new(data)),
            path,
            dirty_count: Arc::new(AtomicUsize::new(0)),
            flush_batch_size: flush_batch_size.max(1),
            notify: Arc::new(Notify::new()),
        };

        store.spawn_flusher(Duration::from_secs(flush_interval_secs.max(1)));
        Ok(store)
    }

    fn spawn_flusher(&self, period: Duration) {
        let data = self.data.clone();
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
                let snapshot = data.read().await.clone();
                match write_atomic(&path, &snapshot).await {
                    Ok(()) => dirty.store(0, Ordering::SeqCst),
                    Err(e) => warn!("state store flush failed: {e}"),
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

    pub async fn get(&self, file_path: &str) -> Option<FileStateView> {
        self.data.read().await.files.get(file_path).cloned()
    }

    pub async fn list(&self) -> Vec<(String, FileStateView)> {
        self.data
            .read()
            .await
            .files
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn upsert(&self, file_path: &str, content_hash: &str, chunk_ids: Vec<String>) {
        let mut data = self.data.write().await;
        data.files.insert(
            file_path.to_string(),
            FileStateView {
                content_hash: content_hash.to_string(),
                last_ingested: Utc::now(),
                chunk_ids,
            },
        );
        drop(data);
        self.mark_dirty().await;
    }

    /// Removes a file's entry and returns the chunk ids it owned, so the
    /// caller can cascade the deletion to the vector index.
    pub async fn delete(&self, file_path: &str) -> Vec<String> {
        let mut data = self.data.write().await;
        let removed = data
            .files
            .remove(file_path)
            .map(|entry| entry.chunk_ids)
            .unwrap_or_default();
        drop(data);
        self.mark_dirty().await;
        removed
    }

    pub async fn get_post_fingerprint(&self, thread_id: &str, post_id: &str) -> Option<String> {
        self.data.read().await.posts.get(&post_key(thread_id, post_id)).cloned()
    }

    pub async fn upsert_post_fingerprint(&self, thread_id: &str, post_id: &str, fingerprint: &str) {
        let mut data = self.data.write().await;
        data.posts.insert(post_key(thread_id, post_id), fingerprint.to_string());
        drop(data);
        self.mark_dirty().await;
    }

    pub async fn delete_post(&self, thread_id: &str, post_id: &str) {
        let mut data = self.data.write().await;
        data.posts.remove(&post_key(thread_id, post_id));
        drop(data);
        self.mark_dirty().await;
    }

    pub async fn clear_all(&self) {
        let mut data = self.data.write().await;
        data.files.clear();
        data.posts.clear();
        drop(data);
        self.mark_dirty().await;
        if let Err(e) = self.flush().await {
            warn!("state store flush after clear_all failed: {e}");
        }
    }

    /// Diffs `current_hashes` (file path -> content hash from a fresh
    /// tree walk) against the stored state to compute what an
    /// incremental ingestion needs to add, replace, and delete.
    pub async fn diff(&self, current_hashes: &HashMap<String, String>) -> StateDiff {
        let data = self.data.read().await;
        let mut result = StateDiff::default();

        for (path, hash) in current_hashes {
            match data.files.get(path) {
                None => result.to_add.push(path.clone()),
                Some(entry) if &entry.content_hash != hash => result.to_replace.push(path.clone()),
                _ => {}
            }
        }
        for path in data.files.keys() {
            if !current_hashes.contains_key(path) {
                result.to_delete.push(path.clone());
            }
        }

        result
    }

    pub async fn flush(&self) -> Result<(), WorkerError> {
        let snapshot = self.data.read().await.clone();
        write_atomic(&self.path, &snapshot)
            .await
            .map_err(|e| WorkerError::StateStoreIo(e.to_string()))?;
        self.dirty_count.store(0, Ordering::SeqCst);
        Ok(())
    }
}

fn post_key(thread_id: &str, post_id: &str) -> String {
    format!("{thread_id}/{post_id}")
}

async fn write_atomic(path: &Path, data: &StateData) -> std::io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(data)?;
    tokio::fs::write(&tmp_path, &body).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), 20, 3).await.unwrap();
        store.upsert("a.md", "hash1", vec!["c1".to_string()]).await;
        let view = store.get("a.md").await.unwrap();
        assert_eq!(view.content_hash, "hash1");
        assert_eq!(view.chunk_ids, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn delete_returns_owned_chunk_ids() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), 20, 3).await.unwrap();
        store.upsert("a.md", "hash1", vec!["c1".to_string(), "c2".to_string()]).await;
        let removed = store.delete("a.md").await;
        assert_eq!(removed, vec!["c1".to_string(), "c2".to_string()]);
        assert!(store.get("a.md").await.is_none());
    }

    #[tokio::test]
    async fn flush_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = StateStore::open(dir.path(), 20, 3).await.unwrap();
            store.upsert("a.md", "hash1", vec!["c1".to_string()]).await;
            store.flush().await.unwrap();
        }
        let reopened = StateStore::open(dir.path(), 20, 3).await.unwrap();
        let view = reopened.get("a.md").await.unwrap();
        assert_eq!(view.content_hash, "hash1");
    }

    #[tokio::test]
    async fn diff_classifies_add_replace_delete() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), 20, 3).await.unwrap();
        store.upsert("a.md", "hash1", vec!["c1".to_string()]).await;
        store.upsert("b.md", "hash2", vec!["c2".to_string()]).await;

        let mut current = HashMap::new();
        current.insert("a.md".to_string(), "hash1".to_string()); // unchanged
        current.insert("b.md".to_string(), "hash2-new".to_string()); // changed
        current.insert("c.md".to_string(), "hash3".to_string()); // new

        let diff = store.diff(&current).await;
        assert_eq!(diff.to_add, vec!["c.md".to_string()]);
        assert_eq!(diff.to_replace, vec!["b.md".to_string()]);
        assert!(diff.to_delete.is_empty());
    }

    #[tokio::test]
    async fn diff_reports_removed_files() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), 20, 3).await.unwrap();
        store.upsert("a.md", "hash1", vec!["c1".to_string()]).await;

        let diff = store.diff(&HashMap::new()).await;
        assert_eq!(diff.to_delete, vec!["a.md".to_string()]);
    }
}
