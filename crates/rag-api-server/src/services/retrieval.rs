use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rag_embedding_worker::core::Payload;
use rag_embedding_worker::embedding::EmbedderClient;
use rag_embedding_worker::vector_index::{Filter, VectorIndex};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

static IMAGE_MARKDOWN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\((https?://[^\s)]+)\)").unwrap());

use crate::config::RetrievalConfig;
use crate::utils::error::ApiError;

/// One match surfaced by the vector index, normalized from whichever
/// payload variant it came from. Doc matches carry `thread_id: None` and
/// never enter grouping.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalMatch {
    pub chunk_id: String,
    pub score: f32,
    pub thread_id: Option<String>,
    pub post_id: Option<String>,
    pub username: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub source_title: String,
    pub content: String,
    pub anchor: Option<String>,
    pub keywords: Vec<String>,
    pub images: Vec<String>,
    pub sub_chunk_index: usize,
}

/// Per-thread bucket after grouping, sorted within by score and across
/// buckets by `avg_score` descending.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadGroup {
    pub thread_id: String,
    pub thread_title: String,
    pub posts: Vec<RetrievalMatch>,
    pub date_range: (DateTime<Utc>, DateTime<Utc>),
    pub unique_users: usize,
    pub avg_score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub groups: Vec<ThreadGroup>,
    pub ungrouped: Vec<RetrievalMatch>,
    pub context: String,
    pub images: Vec<String>,
}

/// Query embedding -> filtered k-NN -> optional time decay -> optional
/// thread grouping -> LLM-ready context. Depends only on the ingestion
/// core's `EmbedderClient`/`VectorIndex` traits, never on a concrete
/// transport or database driver.
pub struct RetrievalEngine {
    embedder: Arc<dyn EmbedderClient>,
    vector_index: Arc<dyn VectorIndex>,
    configured: bool,
}

impl RetrievalEngine {
    /// `configured` reflects whether the embedding provider has a key set;
    /// without one, every query fails the same way at the same point, so
    /// the check happens once up front instead of letting each request
    /// surface a confusing transport error from the provider.
    pub fn new(embedder: Arc<dyn EmbedderClient>, vector_index: Arc<dyn VectorIndex>, configured: bool) -> Self {
        Self {
            embedder,
            vector_index,
            configured,
        }
    }

    pub async fn retrieve(&self, query: &str, cfg: &RetrievalConfig) -> Result<RetrievalResult, ApiError> {
        if !self.configured {
            return Err(ApiError::NotConfigured(
                "embedding provider API key is not set".to_string(),
            ));
        }

        let embedded = self
            .embedder
            .embed_one(query)
            .await
            .map_err(|e| ApiError::EmbeddingError(e.to_string()))?;

        let filter = if cfg.forum_only {
            Some(Filter::eq("docType", "forum_post"))
        } else {
            None
        };

        let matches = self
            .vector_index
            .search(&embedded.vector, cfg.retrieval_count, filter)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        let mut materialized: Vec<RetrievalMatch> = matches
            .into_iter()
            .filter_map(|m| to_retrieval_match(m.id, m.score, m.payload))
            .collect();

        if cfg.time_decay_weighting {
            apply_time_decay(&mut materialized, cfg.time_decay_half_life_days);
            materialized.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        }

        let mut images: Vec<String> = Vec::new();
        let mut seen_images = std::collections::HashSet::new();
        for m in &materialized {
            for url in &m.images {
                if seen_images.insert(url.clone()) {
                    images.push(url.clone());
                }
            }
        }

        let (groups, ungrouped) = if cfg.group_by_thread_on_retrieval {
            let (threaded, rest) = split_threaded(materialized);
            (group_by_thread(threaded, cfg.max_posts_per_thread_in_context), rest)
        } else {
            (Vec::new(), materialized)
        };

        let context = format_context(&groups, &ungrouped);

        debug!(groups = groups.len(), ungrouped = ungrouped.len(), "retrieval complete");

        Ok(RetrievalResult { groups, ungrouped, context, images })
    }
}

fn to_retrieval_match(chunk_id: String, score: f32, payload: Payload) -> Option<RetrievalMatch> {
    match payload {
        Payload::Forum(p) => Some(RetrievalMatch {
            chunk_id,
            score,
            thread_id: Some(p.thread_id),
            post_id: Some(p.post_id),
            username: Some(p.username),
            date: Some(p.date),
            source_title: p.thread_title,
            content: p.content,
            anchor: Some(p.anchor),
            keywords: p.keywords,
            images: p.images,
            sub_chunk_index: p.sub_chunk_index,
        }),
        Payload::Doc(p) => Some(RetrievalMatch {
            chunk_id,
            score,
            thread_id: None,
            post_id: None,
            username: None,
            date: Some(p.last_modified),
            source_title: p.doc_title,
            content: p.content,
            anchor: None,
            keywords: Vec::new(),
            images: Vec::new(),
            sub_chunk_index: p.chunk_index,
        }),
    }
}

/// `0.5 + 0.5 * 0.5^(ageDays/halfLifeDays)`; a match with no date (should
/// not happen for forum/doc payloads, but matches the contract of a
/// best-effort score adjustment) is left unscaled.
fn apply_time_decay(matches: &mut [RetrievalMatch], half_life_days: f64) {
    let now = Utc::now();
    for m in matches.iter_mut() {
        let Some(date) = m.date else { continue };
        let age_days = (now - date).num_seconds().max(0) as f64 / 86400.0;
        let factor = 0.5 + 0.5 * 0.5f64.powf(age_days / half_life_days);
        m.score = (m.score as f64 * factor) as f32;
    }
}

fn split_threaded(matches: Vec<RetrievalMatch>) -> (Vec<RetrievalMatch>, Vec<RetrievalMatch>) {
    matches.into_iter().partition(|m| m.thread_id.is_some())
}

fn group_by_thread(matches: Vec<RetrievalMatch>, max_posts_per_thread: usize) -> Vec<ThreadGroup> {
    let mut buckets: HashMap<String, Vec<RetrievalMatch>> = HashMap::new();
    for m in matches {
        buckets.entry(m.thread_id.clone().unwrap_or_default()).or_default().push(m);
    }

    let mut groups: Vec<ThreadGroup> = buckets
        .into_iter()
        .filter_map(|(thread_id, mut posts)| {
            posts.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            posts.truncate(max_posts_per_thread);

            let first = posts.first()?;
            let thread_title = first.source_title.clone();
            let dates: Vec<DateTime<Utc>> = posts.iter().filter_map(|p| p.date).collect();
            let (min_date, max_date) = match (dates.iter().min(), dates.iter().max()) {
                (Some(min), Some(max)) => (*min, *max),
                _ => (Utc::now(), Utc::now()),
            };
            let unique_users = posts
                .iter()
                .filter_map(|p| p.username.as_deref())
                .collect::<std::collections::HashSet<_>>()
                .len();
            let avg_score = posts.iter().map(|p| p.score).sum::<f32>() / posts.len() as f32;

            Some(ThreadGroup {
                thread_id,
                thread_title,
                posts,
                date_range: (min_date, max_date),
                unique_users,
                avg_score,
            })
        })
        .collect();

    groups.sort_by(|a, b| b.avg_score.partial_cmp(&a.avg_score).unwrap_or(std::cmp::Ordering::Equal));
    groups
}

/// Preamble explaining the forum material, per-thread blocks formatted as
/// `**user** (date): content`, then any ungrouped (doc or mixed-mode)
/// matches appended as plain passages. Image URLs never appear in the
/// context text; callers get them via `RetrievalResult.images`.
fn format_context(groups: &[ThreadGroup], ungrouped: &[RetrievalMatch]) -> String {
    let mut out = String::new();

    if !groups.is_empty() {
        out.push_str("The following are excerpts from forum discussions relevant to the question.\n\n");
        for group in groups {
            out.push_str(&format!("## {}\n", group.thread_title));
            for post in &group.posts {
                let username = post.username.as_deref().unwrap_or("unknown");
                let date = post.date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();
                out.push_str(&format!("**{username}** ({date}): {}\n", strip_image_urls(&post.content)));
            }
            out.push_str("---\n\n");
        }
    }

    if !ungrouped.is_empty() {
        out.push_str("The following are excerpts from documentation relevant to the question.\n\n");
        for m in ungrouped {
            out.push_str(&format!("### {}\n{}\n\n", m.source_title, strip_image_urls(&m.content)));
        }
    }

    out
}

fn strip_image_urls(content: &str) -> String {
    IMAGE_MARKDOWN_RE.replace_all(content, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rag_embedding_worker::core::{ChunkType, ForumChunkPayload};

    fn forum_match(thread_id: &str, score: f32, username: &str, days_ago: i64) -> (String, f32, Payload) {
        let date = Utc::now() - chrono::Duration::days(days_ago);
        (
            format!("{thread_id}-{username}"),
            score,
            Payload::Forum(ForumChunkPayload {
                thread_id: thread_id.to_string(),
                post_id: username.to_string(),
                sub_chunk_index: 0,
                username: username.to_string(),
                user_id: username.to_string(),
                date,
                thread_title: format!("Thread {thread_id}"),
                forum_category: "general".to_string(),
                forum_path: format!("/t/{thread_id}"),
                page: 1,
                anchor: "#p1".to_string(),
                keywords: vec![],
                mentions: vec![],
                has_links: false,
                has_images: false,
                images: vec![],
                content_length: 10,
                fingerprint: "fp".to_string(),
                embedding_model: "test".to_string(),
                chunk_type: ChunkType::Original,
                content: "installation steps are documented here".to_string(),
            }),
        )
    }

    #[test]
    fn groups_and_sorts_by_avg_score() {
        let matches: Vec<RetrievalMatch> = vec![
            forum_match("t1", 0.9, "alice", 1),
            forum_match("t1", 0.8, "bob", 2),
            forum_match("t2", 0.5, "carol", 1),
        ]
        .into_iter()
        .filter_map(|(id, score, payload)| to_retrieval_match(id, score, payload))
        .collect();

        let groups = group_by_thread(matches, 10);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].thread_id, "t1");
        assert_eq!(groups[0].unique_users, 2);
        assert!(groups[0].avg_score > groups[1].avg_score);
    }

    #[test]
    fn truncates_to_max_posts_per_thread() {
        let matches: Vec<RetrievalMatch> = (0..5)
            .map(|i| forum_match("t1", 1.0 - i as f32 * 0.1, &format!("user{i}"), 1))
            .filter_map(|(id, score, payload)| to_retrieval_match(id, score, payload))
            .collect();

        let groups = group_by_thread(matches, 2);
        assert_eq!(groups[0].posts.len(), 2);
    }

    #[test]
    fn time_decay_favors_recent_posts() {
        let (id, score, payload) = forum_match("t1", 0.8, "alice", 400);
        let mut old = vec![to_retrieval_match(id, score, payload).unwrap()];
        apply_time_decay(&mut old, 365.0);
        assert!(old[0].score < 0.8);
        assert!(old[0].score > 0.4);
    }

    #[test]
    fn context_never_contains_raw_image_markdown() {
        let content = "see ![shot](https://example.com/a.png) for details";
        let stripped = strip_image_urls(content);
        assert!(!stripped.contains("example.com"));
    }
}
