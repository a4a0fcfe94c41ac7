use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of identity for change detection: either a documentation file
/// or a single forum post. Readers produce these; chunkers consume them.
#[derive(Debug, Clone)]
pub enum SourceUnit {
    Doc(DocSourceUnit),
    Post(PostSourceUnit),
}

impl SourceUnit {
    /// The key State Store entries and chunk ids are keyed on.
    pub fn source_key(&self) -> String {
        match self {
            SourceUnit::Doc(d) => d.file_path.clone(),
            SourceUnit::Post(p) => format!("{}/{}", p.thread_id, p.post_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocSourceUnit {
    pub file_path: String,
    pub title: String,
    pub category: String,
    pub url_path: String,
    pub body: String,
    pub last_modified: DateTime<Utc>,
    pub image_urls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PostSourceUnit {
    pub thread_id: String,
    pub post_id: String,
    pub username: String,
    pub user_id: String,
    pub date: DateTime<Utc>,
    pub content: String,
    pub content_full: String,
    pub quoted_content: Option<String>,
    pub image_urls: Vec<String>,
    pub keywords: Vec<String>,
    pub mentions: Vec<String>,
    pub fingerprint: String,
    pub is_substantive: bool,
    pub thread_title: String,
    pub forum_category: String,
    pub forum_path: String,
    pub page: u32,
}

/// A full forum thread as parsed from a JSON thread record: thread-level
/// defaults the reader stamps onto every post that lacks its own value.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForumThread {
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    pub posts: Vec<ForumPost>,
}

/// Raw post shape as it appears on disk, before thread-level defaults are
/// applied by the reader.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForumPost {
    #[serde(rename = "postId")]
    pub post_id: String,
    pub username: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub date: DateTime<Utc>,
    pub content: String,
    #[serde(rename = "contentFull", default)]
    pub content_full: Option<String>,
    #[serde(rename = "quotedContent", default)]
    pub quoted_content: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(rename = "isSubstantive", default = "default_true")]
    pub is_substantive: bool,
}

fn default_true() -> bool {
    true
}

/// How a chunk relates to the post it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Original,
    Quoted,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub token_count: usize,
    pub metadata: ChunkMetadata,
}

/// Everything downstream (vector index payload, progress reporting) needs
/// to know about where a chunk came from, independent of its text.
#[derive(Debug, Clone)]
pub enum ChunkMetadata {
    Doc(DocChunkMetadata),
    Forum(ForumChunkMetadata),
}

#[derive(Debug, Clone)]
pub struct DocChunkMetadata {
    pub source_file: String,
    pub doc_title: String,
    pub section_title: String,
    pub doc_category: String,
    pub url_path: String,
    pub chunk_index: usize,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ForumChunkMetadata {
    pub thread_id: String,
    pub post_id: String,
    pub sub_chunk_index: usize,
    pub username: String,
    pub user_id: String,
    pub date: DateTime<Utc>,
    pub thread_title: String,
    pub forum_category: String,
    pub forum_path: String,
    pub page: u32,
    pub anchor: String,
    pub keywords: Vec<String>,
    pub mentions: Vec<String>,
    pub has_links: bool,
    pub has_images: bool,
    pub images: Vec<String>,
    pub content_length: usize,
    pub fingerprint: String,
    pub chunk_type: ChunkType,
}

/// A chunk after the Embedder Client has produced its vector. Dimension
/// is validated by the pipeline before this type is ever constructed.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// The tagged payload actually stored on the vector index point, replacing
/// the dynamic "any" payload of the source system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "docType")]
pub enum Payload {
    #[serde(rename = "doc")]
    Doc(DocChunkPayload),
    #[serde(rename = "forum_post")]
    Forum(ForumChunkPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocChunkPayload {
    pub source_file: String,
    pub doc_title: String,
    pub section_title: String,
    pub doc_category: String,
    pub url_path: String,
    pub chunk_index: usize,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
    pub embedding_model: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForumChunkPayload {
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(rename = "postId")]
    pub post_id: String,
    #[serde(rename = "subChunkIndex")]
    pub sub_chunk_index: usize,
    pub username: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub date: DateTime<Utc>,
    #[serde(rename = "threadTitle")]
    pub thread_title: String,
    #[serde(rename = "forumCategory")]
    pub forum_category: String,
    #[serde(rename = "forumPath")]
    pub forum_path: String,
    pub page: u32,
    pub anchor: String,
    pub keywords: Vec<String>,
    pub mentions: Vec<String>,
    #[serde(rename = "hasLinks")]
    pub has_links: bool,
    #[serde(rename = "hasImages")]
    pub has_images: bool,
    pub images: Vec<String>,
    #[serde(rename = "contentLength")]
    pub content_length: usize,
    pub fingerprint: String,
    #[serde(rename = "embeddingModel")]
    pub embedding_model: String,
    #[serde(rename = "chunkType")]
    pub chunk_type: ChunkType,
    pub content: String,
}

impl Chunk {
    /// Builds the payload this chunk will be stored with on the vector
    /// index, stamping the embedding model used so the id-derivation
    /// scheme stays legible from the payload alone.
    pub fn to_payload(&self, embedding_model: &str) -> Payload {
        match &self.metadata {
            ChunkMetadata::Doc(m) => Payload::Doc(DocChunkPayload {
                source_file: m.source_file.clone(),
                doc_title: m.doc_title.clone(),
                section_title: m.section_title.clone(),
                doc_category: m.doc_category.clone(),
                url_path: m.url_path.clone(),
                chunk_index: m.chunk_index,
                content_hash: m.content_hash.clone(),
                last_modified: m.last_modified,
                embedding_model: embedding_model.to_string(),
                content: self.content.clone(),
            }),
            ChunkMetadata::Forum(m) => Payload::Forum(ForumChunkPayload {
                thread_id: m.thread_id.clone(),
                post_id: m.post_id.clone(),
                sub_chunk_index: m.sub_chunk_index,
                username: m.username.clone(),
                user_id: m.user_id.clone(),
                date: m.date,
                thread_title: m.thread_title.clone(),
                forum_category: m.forum_category.clone(),
                forum_path: m.forum_path.clone(),
                page: m.page,
                anchor: m.anchor.clone(),
                keywords: m.keywords.clone(),
                mentions: m.mentions.clone(),
                has_links: m.has_links,
                has_images: m.has_images,
                images: m.images.clone(),
                content_length: m.content_length,
                fingerprint: m.fingerprint.clone(),
                embedding_model: embedding_model.to_string(),
                chunk_type: m.chunk_type,
                content: self.content.clone(),
            }),
        }
    }
}
