use dashmap::DashMap;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use tracing::warn;

use crate::error::WorkerError;

/// Maps text to an integer token count consistent with the embedding
/// model family configured for the deployment. Pure with respect to its
/// input text; results may be memoized. Chunking is the only component
/// allowed to call `count` — everything downstream treats `tokenCount`
/// on a `Chunk` as authoritative and never re-tokenizes.
#[derive(Clone)]
pub struct TokenCounter {
    bpe: Arc<CoreBPE>,
    cache: Arc<DashMap<String, usize>>,
}

impl TokenCounter {
    /// `cl100k_base` backs the embedding/LLM tokenizer family this
    /// deployment is fixed to. If the configured embedding model belongs
    /// to a different family, counts are treated as estimates that bound
    /// chunk sizes rather than an exact count (see SPEC_FULL.md Open
    /// Questions).
    pub fn new() -> Result<Self, WorkerError> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| WorkerError::TokenizerInit(e.to_string()))?;
        Ok(Self {
            bpe: Arc::new(bpe),
            cache: Arc::new(DashMap::new()),
        })
    }

    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        if let Some(cached) = self.cache.get(text) {
            return *cached;
        }
        let n = self.bpe.encode_ordinary(text).len();
        if self.cache.len() > 100_000 {
            // Unbounded growth would defeat the point of a cache; drop it
            // and start fresh rather than evicting one entry at a time.
            warn!("token counter cache exceeded 100k entries, clearing");
            self.cache.clear();
        }
        self.cache.insert(text.to_string(), n);
        n
    }

    /// Counts the last `approx_tokens` worth of trailing lines of `text`,
    /// used by the markdown chunker to build overlap windows without a
    /// full re-tokenize of the whole chunk.
    pub fn count_lines_from_end(&self, lines: &[&str], approx_tokens: usize) -> usize {
        let mut total = 0;
        let mut idx = lines.len();
        while idx > 0 {
            idx -= 1;
            let n = self.count(lines[idx]);
            if total > 0 && total + n > approx_tokens {
                break;
            }
            total += n;
        }
        total
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new().expect("cl100k_base tokenizer assets are bundled with tiktoken-rs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_counts_zero() {
        let tc = TokenCounter::new().unwrap();
        assert_eq!(tc.count(""), 0);
    }

    #[test]
    fn is_deterministic_and_cached() {
        let tc = TokenCounter::new().unwrap();
        let text = "the quick brown fox jumps over the lazy dog";
        let a = tc.count(text);
        let b = tc.count(text);
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn longer_text_counts_more_tokens() {
        let tc = TokenCounter::new().unwrap();
        let short = tc.count("hello");
        let long = tc.count("hello hello hello hello hello hello hello");
        assert!(long > short);
    }
}
