use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::{chunk_id, Chunk, ChunkMetadata, ChunkType, ForumChunkMetadata, PostSourceUnit, TokenCounter};

static PARAGRAPH_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\n+").unwrap());
static LINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://").unwrap());

/// Splits on `.`, `?`, `!` terminators, keeping the terminator attached
/// to the preceding sentence. `regex` has no lookbehind, so this walks
/// the text by hand instead of a one-line split.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'?' | b'!') {
            let mut end = i + 1;
            while end < bytes.len() && bytes[end].is_ascii_whitespace() {
                end += 1;
            }
            let piece = text[start..i + 1].trim();
            if !piece.is_empty() {
                out.push(piece);
            }
            start = end;
            i = end;
            continue;
        }
        i += 1;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

const MIN_EFFECTIVE_TOKENS: usize = 100;
const HEADER_RESERVE: usize = 10;

#[derive(Debug, Clone)]
pub struct ForumChunkerConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub embed_quoted_content: bool,
    pub quoted_content_namespace: String,
}

/// Splits one forum post into one or more sub-chunks. Never merges posts
/// and never drops content: recursive paragraph → sentence → word-window
/// fallback guarantees every byte of `content` is covered by some chunk.
pub struct ForumChunker {
    tokenizer: TokenCounter,
    config: ForumChunkerConfig,
}

impl ForumChunker {
    pub fn new(tokenizer: TokenCounter, config: ForumChunkerConfig) -> Self {
        Self { tokenizer, config }
    }

    pub fn chunk(&self, post: &PostSourceUnit, embedding_model: &str) -> Vec<Chunk> {
        let header = self.header(post);
        let header_tokens = self.tokenizer.count(&header);
        let effective_max = self
            .config
            .max_tokens
            .saturating_sub(header_tokens)
            .saturating_sub(HEADER_RESERVE)
            .max(MIN_EFFECTIVE_TOKENS);

        let mut out = Vec::new();
        let mut sub_index = 0usize;

        let pieces = self.split_recursive(&post.content, effective_max);
        for piece in pieces {
            self.push_chunk(&header, &piece, post, embedding_model, ChunkType::Original, &mut sub_index, &mut out);
        }

        if self.config.embed_quoted_content {
            if let Some(quoted) = &post.quoted_content {
                if !quoted.trim().is_empty() {
                    let quote_header = format!(
                        "[Quoted in: {}]\n[Referenced by: {} | {}]\n\n",
                        post.thread_title,
                        post.username,
                        post.date.format("%Y-%m-%d")
                    );
                    for piece in self.split_recursive(quoted, effective_max) {
                        self.push_chunk(&quote_header, &piece, post, embedding_model, ChunkType::Quoted, &mut sub_index, &mut out);
                    }
                }
            }
        }

        out
    }

    fn header(&self, post: &PostSourceUnit) -> String {
        format!(
            "[Thread: {}]\n[User: {} | {}]\n\n",
            post.thread_title,
            post.username,
            post.date.format("%Y-%m-%d")
        )
    }

    fn push_chunk(
        &self,
        header: &str,
        body: &str,
        post: &PostSourceUnit,
        embedding_model: &str,
        chunk_type: ChunkType,
        sub_index: &mut usize,
        out: &mut Vec<Chunk>,
    ) {
        let namespace = match chunk_type {
            ChunkType::Original => "forum",
            ChunkType::Quoted => self.config.quoted_content_namespace.as_str(),
        };
        let content = format!("{header}{body}");
        let token_count = self.tokenizer.count(&content);
        let source_key = format!("{}/{}", post.thread_id, post.post_id);
        let id = chunk_id(namespace, &source_key, *sub_index, embedding_model);

        out.push(Chunk {
            id,
            content,
            token_count,
            metadata: ChunkMetadata::Forum(ForumChunkMetadata {
                thread_id: post.thread_id.clone(),
                post_id: post.post_id.clone(),
                sub_chunk_index: *sub_index,
                username: post.username.clone(),
                user_id: post.user_id.clone(),
                date: post.date,
                thread_title: post.thread_title.clone(),
                forum_category: post.forum_category.clone(),
                forum_path: post.forum_path.clone(),
                page: post.page,
                anchor: format!("post-{}", post.post_id),
                keywords: post.keywords.clone(),
                mentions: post.mentions.clone(),
                has_links: LINK_RE.is_match(body),
                has_images: !post.image_urls.is_empty(),
                images: post.image_urls.clone(),
                content_length: body.chars().count(),
                fingerprint: post.fingerprint.clone(),
                chunk_type,
            }),
        });
        *sub_index += 1;
    }

    fn split_recursive(&self, text: &str, max_tokens: usize) -> Vec<String> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        if self.tokenizer.count(text) <= max_tokens {
            return vec![text.to_string()];
        }

        let paragraphs: Vec<&str> = PARAGRAPH_SPLIT_RE
            .split(text)
            .filter(|p| !p.trim().is_empty())
            .collect();
        if paragraphs.len() > 1 {
            return self.pack(&paragraphs, max_tokens, "\n\n", |p| self.split_by_sentence(p, max_tokens));
        }

        self.split_by_sentence(text, max_tokens)
    }

    fn split_by_sentence(&self, text: &str, max_tokens: usize) -> Vec<String> {
        if self.tokenizer.count(text) <= max_tokens {
            return vec![text.to_string()];
        }
        let sentences = split_sentences(text);
        if sentences.len() > 1 {
            return self.pack(&sentences, max_tokens, " ", |s| self.split_by_word_window(s, max_tokens));
        }
        self.split_by_word_window(text, max_tokens)
    }

    /// Last-resort fallback: slides a word-level window of `max_tokens`
    /// with `overlapTokens` overlap. A single word too long to fit is
    /// emitted whole rather than dropped.
    fn split_by_word_window(&self, text: &str, max_tokens: usize) -> Vec<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut start = 0;
        while start < words.len() {
            let mut end = start;
            let mut buf = String::new();
            while end < words.len() {
                let candidate = if buf.is_empty() {
                    words[end].to_string()
                } else {
                    format!("{buf} {}", words[end])
                };
                if !buf.is_empty() && self.tokenizer.count(&candidate) > max_tokens {
                    break;
                }
                buf = candidate;
                end += 1;
            }
            if end == start {
                // single word alone exceeds max_tokens; emit it whole
                buf = words[end].to_string();
                end += 1;
            }
            out.push(buf);

            if end >= words.len() {
                break;
            }
            let overlap_words = self.words_for_overlap(&words[start..end]);
            start = end.saturating_sub(overlap_words).max(start + 1);
        }
        out
    }

    fn words_for_overlap(&self, window: &[&str]) -> usize {
        if self.config.overlap_tokens == 0 {
            return 0;
        }
        let mut total = 0;
        let mut count = 0;
        for word in window.iter().rev() {
            let n = self.tokenizer.count(word);
            if total > 0 && total + n > self.config.overlap_tokens {
                break;
            }
            total += n;
            count += 1;
        }
        count
    }

    fn pack<'a, F>(&self, units: &[&'a str], max_tokens: usize, separator: &str, recurse: F) -> Vec<String>
    where
        F: Fn(&str) -> Vec<String>,
    {
        let mut out = Vec::new();
        let mut buf = String::new();

        for &unit in units {
            let candidate = if buf.is_empty() {
                unit.to_string()
            } else {
                format!("{buf}{separator}{unit}")
            };
            if !buf.is_empty() && self.tokenizer.count(&candidate) > max_tokens {
                out.push(buf.clone());
                buf.clear();
            }

            if self.tokenizer.count(unit) > max_tokens {
                if !buf.is_empty() {
                    out.push(buf.clone());
                    buf.clear();
                }
                out.extend(recurse(unit));
                continue;
            }

            buf = if buf.is_empty() {
                unit.to_string()
            } else {
                format!("{buf}{separator}{unit}")
            };
        }

        if !buf.is_empty() {
            out.push(buf);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn post(content: &str) -> PostSourceUnit {
        PostSourceUnit {
            thread_id: "t1".to_string(),
            post_id: "p1".to_string(),
            username: "alice".to_string(),
            user_id: "u1".to_string(),
            date: Utc::now(),
            content: content.to_string(),
            content_full: content.to_string(),
            quoted_content: None,
            image_urls: vec![],
            keywords: vec![],
            mentions: vec![],
            fingerprint: "fp".to_string(),
            is_substantive: true,
            thread_title: "Install issues".to_string(),
            forum_category: "support".to_string(),
            forum_path: "forum/support/t1.json".to_string(),
            page: 1,
        }
    }

    fn chunker(max_tokens: usize, overlap: usize) -> ForumChunker {
        ForumChunker::new(
            TokenCounter::new().unwrap(),
            ForumChunkerConfig {
                max_tokens,
                overlap_tokens: overlap,
                embed_quoted_content: false,
                quoted_content_namespace: "forum-quote".to_string(),
            },
        )
    }

    #[test]
    fn short_post_yields_single_chunk() {
        let p = post("A short reply to the thread.");
        let c = chunker(800, 120);
        let chunks = c.chunk(&p, "m");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.starts_with("[Thread: Install issues]"));
    }

    #[test]
    fn long_post_splits_without_losing_content() {
        let body = "This sentence repeats. ".repeat(400);
        let p = post(&body);
        let c = chunker(200, 30);
        let chunks = c.chunk(&p, "m");
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.metadata_sub_index(), i);
        }
    }

    #[test]
    fn single_word_far_over_budget_is_not_dropped() {
        let p = post(&"x".repeat(5000));
        let c = chunker(50, 5);
        let chunks = c.chunk(&p, "m");
        assert!(!chunks.is_empty());
        let recovered: usize = chunks.iter().map(|c| c.content.matches('x').count()).sum();
        assert!(recovered >= 5000);
    }
}

#[cfg(test)]
impl Chunk {
    fn metadata_sub_index(&self) -> usize {
        match &self.metadata {
            ChunkMetadata::Forum(m) => m.sub_chunk_index,
            ChunkMetadata::Doc(_) => panic!("expected forum metadata"),
        }
    }
}
