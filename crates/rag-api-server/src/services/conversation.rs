use std::collections::VecDeque;

use dashmap::DashMap;
use serde::Serialize;

/// At most this many retrieval turns are kept per conversation; older ones
/// fall off the front as new ones are recorded.
pub const MAX_RETAINED_MESSAGES: usize = 20;
/// Context for a follow-up query is built from only the most recent of
/// the retained turns.
pub const CONTEXT_WINDOW_MESSAGES: usize = 8;

/// `New -> Active(has id) -> Cleared(deleted by admin)`. A conversation id
/// that has never been seen is implicitly `New`; the store only ever holds
/// entries for `Active` and `Cleared` conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationLifecycle {
    New,
    Active,
    Cleared,
}

/// One retrieval turn: the query that was asked and the context that was
/// assembled for it. Chat-completion turns are outside this core, so a
/// "message" here is a retrieval record rather than a chat exchange.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedTurn {
    pub query: String,
    pub context: String,
}

struct ConversationRecord {
    lifecycle: ConversationLifecycle,
    messages: VecDeque<RetrievedTurn>,
}

impl ConversationRecord {
    fn new() -> Self {
        Self {
            lifecycle: ConversationLifecycle::Active,
            messages: VecDeque::new(),
        }
    }

    fn record(&mut self, turn: RetrievedTurn) {
        self.messages.push_back(turn);
        while self.messages.len() > MAX_RETAINED_MESSAGES {
            self.messages.pop_front();
        }
    }

    fn context_window(&self) -> Vec<RetrievedTurn> {
        let skip = self.messages.len().saturating_sub(CONTEXT_WINDOW_MESSAGES);
        self.messages.iter().skip(skip).cloned().collect()
    }
}

/// Tracks each conversation's lifecycle and retained retrieval turns.
/// Mirrors the teacher's `ConversationCache` shape (a `DashMap` keyed on
/// conversation/session id) stripped to what this retrieval-only core
/// actually needs: no chat history, planner state, or RAM-based admission
/// control, since there is no chat-completion call path here.
pub struct ConversationStore {
    conversations: DashMap<String, ConversationRecord>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            conversations: DashMap::new(),
        }
    }

    /// Appends a retrieval turn, moving the conversation to `Active` if
    /// this is its first turn. Enforces the retention cap.
    pub fn record_turn(&self, conversation_id: &str, query: impl Into<String>, context: impl Into<String>) {
        let mut entry = self
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(ConversationRecord::new);
        entry.lifecycle = ConversationLifecycle::Active;
        entry.record(RetrievedTurn {
            query: query.into(),
            context: context.into(),
        });
    }

    /// The last `CONTEXT_WINDOW_MESSAGES` retained turns, oldest first.
    pub fn context_window(&self, conversation_id: &str) -> Vec<RetrievedTurn> {
        self.conversations
            .get(conversation_id)
            .map(|e| e.context_window())
            .unwrap_or_default()
    }

    pub fn lifecycle(&self, conversation_id: &str) -> ConversationLifecycle {
        self.conversations
            .get(conversation_id)
            .map(|e| e.lifecycle)
            .unwrap_or(ConversationLifecycle::New)
    }

    /// Transitions to `Cleared` and drops retained turns. A conversation
    /// that was never seen becomes a `Cleared` entry directly, same as the
    /// teacher's `ConversationCache::remove` being safe to call on a
    /// missing session id.
    pub fn clear(&self, conversation_id: &str) {
        let mut entry = self
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(ConversationRecord::new);
        entry.lifecycle = ConversationLifecycle::Cleared;
        entry.messages.clear();
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_conversation_is_new() {
        let store = ConversationStore::new();
        assert_eq!(store.lifecycle("missing"), ConversationLifecycle::New);
        assert!(store.context_window("missing").is_empty());
    }

    #[test]
    fn first_turn_activates_conversation() {
        let store = ConversationStore::new();
        store.record_turn("c1", "how do I install this", "install docs...");
        assert_eq!(store.lifecycle("c1"), ConversationLifecycle::Active);
        assert_eq!(store.context_window("c1").len(), 1);
    }

    #[test]
    fn retains_at_most_twenty_turns() {
        let store = ConversationStore::new();
        for i in 0..25 {
            store.record_turn("c1", format!("query {i}"), format!("context {i}"));
        }
        // internal retention cap isn't observable directly; the context
        // window clamps to 8, so check the oldest surviving turn instead
        let window = store.context_window("c1");
        assert_eq!(window.len(), CONTEXT_WINDOW_MESSAGES);
        assert_eq!(window.first().unwrap().query, "query 17");
        assert_eq!(window.last().unwrap().query, "query 24");
    }

    #[test]
    fn clear_transitions_to_cleared_and_drops_messages() {
        let store = ConversationStore::new();
        store.record_turn("c1", "q", "ctx");
        store.clear("c1");
        assert_eq!(store.lifecycle("c1"), ConversationLifecycle::Cleared);
        assert!(store.context_window("c1").is_empty());
    }

    #[test]
    fn clear_on_unseen_conversation_leaves_it_cleared() {
        let store = ConversationStore::new();
        store.clear("never-seen");
        assert_eq!(store.lifecycle("never-seen"), ConversationLifecycle::Cleared);
    }
}
