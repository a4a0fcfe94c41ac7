use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

/// Per-conversation ordered, de-duplicated image list with a bounded cap;
/// storage mirrors `ConversationCache`'s lock-free `DashMap` pattern since
/// both are in-memory, per-conversation, high-churn state. `recency` tracks
/// conversation ids least-recently-used first; `DashMap` iteration order is
/// hash-based and unrelated to access order, so it can't stand in for this.
pub struct ConversationImageStore {
    lists: DashMap<String, VecDeque<String>>,
    recency: Mutex<VecDeque<String>>,
    max_images_per_conversation: usize,
    global_cap: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImagePage {
    pub images: Vec<String>,
    pub total: usize,
    pub has_more: bool,
}

impl ConversationImageStore {
    pub fn new(max_images_per_conversation: usize, global_cap: usize) -> Self {
        Self {
            lists: DashMap::new(),
            recency: Mutex::new(VecDeque::new()),
            max_images_per_conversation,
            global_cap,
        }
    }

    /// Moves `conversation_id` to the most-recently-used end of the
    /// recency queue, inserting it if this is its first touch.
    fn touch(&self, conversation_id: &str) {
        let mut order = self.recency.lock().unwrap();
        if let Some(pos) = order.iter().position(|id| id == conversation_id) {
            order.remove(pos);
        }
        order.push_back(conversation_id.to_string());
    }

    /// Appends `urls` to `conversation_id`'s list in relevance order,
    /// skipping ones already present. Evicts this conversation's oldest
    /// images past its own cap, then evicts the least-recently-used
    /// conversation's whole list if the store as a whole is over the
    /// global cap.
    pub fn record(&self, conversation_id: &str, urls: impl IntoIterator<Item = String>) {
        {
            let mut entry = self.lists.entry(conversation_id.to_string()).or_default();
            for url in urls {
                if !entry.contains(&url) {
                    entry.push_back(url);
                }
            }
            while entry.len() > self.max_images_per_conversation {
                entry.pop_front();
            }
        }
        self.touch(conversation_id);
        self.evict_if_over_global_cap();
    }

    /// Reads also count as a use: a conversation whose images are being
    /// paginated through is not a good eviction candidate even if nothing
    /// new has been recorded for it recently.
    pub fn list(&self, conversation_id: &str, offset: usize, limit: usize) -> ImagePage {
        let Some(entry) = self.lists.get(conversation_id) else {
            return ImagePage { images: Vec::new(), total: 0, has_more: false };
        };
        let total = entry.len();
        let images: Vec<String> = entry.iter().skip(offset).take(limit).cloned().collect();
        let has_more = offset + images.len() < total;
        drop(entry);
        self.touch(conversation_id);
        ImagePage { images, total, has_more }
    }

    /// Explicit eviction, e.g. when a conversation is deleted.
    pub fn clear(&self, conversation_id: &str) {
        self.lists.remove(conversation_id);
        let mut order = self.recency.lock().unwrap();
        if let Some(pos) = order.iter().position(|id| id == conversation_id) {
            order.remove(pos);
        }
    }

    fn evict_if_over_global_cap(&self) {
        let total: usize = self.lists.iter().map(|e| e.value().len()).sum();
        if total <= self.global_cap {
            return;
        }
        let oldest = self.recency.lock().unwrap().pop_front();
        if let Some(oldest) = oldest {
            debug!(conversation_id = %oldest, "global image cap exceeded, evicting least-recently-used conversation");
            self.lists.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupes_and_preserves_order() {
        let store = ConversationImageStore::new(100, 10_000);
        store.record("c1", vec!["a".to_string(), "b".to_string(), "a".to_string()]);
        let page = store.list("c1", 0, 10);
        assert_eq!(page.images, vec!["a", "b"]);
        assert_eq!(page.total, 2);
        assert!(!page.has_more);
    }

    #[test]
    fn paginates_with_offset_and_limit() {
        let store = ConversationImageStore::new(100, 10_000);
        store.record("c1", (0..5).map(|i| i.to_string()));
        let page = store.list("c1", 2, 2);
        assert_eq!(page.images, vec!["2", "3"]);
        assert!(page.has_more);
    }

    #[test]
    fn caps_images_per_conversation() {
        let store = ConversationImageStore::new(3, 10_000);
        store.record("c1", (0..5).map(|i| i.to_string()));
        let page = store.list("c1", 0, 10);
        assert_eq!(page.images, vec!["2", "3", "4"]);
    }

    #[test]
    fn clear_evicts_conversation() {
        let store = ConversationImageStore::new(100, 10_000);
        store.record("c1", vec!["a".to_string()]);
        store.clear("c1");
        assert_eq!(store.list("c1", 0, 10).total, 0);
    }

    #[test]
    fn global_cap_evicts_least_recently_used_conversation() {
        let store = ConversationImageStore::new(100, 2);
        store.record("c1", vec!["a".to_string()]);
        store.record("c2", vec!["b".to_string()]);
        // re-recording the same url is a no-op on content but still
        // touches c1, making c2 the least-recently-used entry
        store.record("c1", vec!["a".to_string()]);
        store.record("c3", vec!["c".to_string()]);

        assert_eq!(store.list("c2", 0, 10).total, 0);
        assert!(store.list("c1", 0, 10).total > 0);
        assert!(store.list("c3", 0, 10).total > 0);
    }

    #[test]
    fn reading_a_conversation_protects_it_from_eviction() {
        let store = ConversationImageStore::new(100, 2);
        store.record("c1", vec!["a".to_string()]);
        store.record("c2", vec!["b".to_string()]);
        // reading c1 makes it most-recently-used; c2 is now the LRU entry
        store.list("c1", 0, 10);
        store.record("c3", vec!["c".to_string()]);

        assert_eq!(store.list("c2", 0, 10).total, 0);
        assert!(store.list("c1", 0, 10).total > 0);
    }
}
