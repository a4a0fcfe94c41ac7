pub mod fingerprint;
pub mod model;
pub mod tokenizer;

pub use fingerprint::{chunk_id, fingerprint};
pub use model::{
    Chunk, ChunkMetadata, ChunkType, DocChunkMetadata, DocChunkPayload, DocSourceUnit,
    EmbeddedChunk, ForumChunkMetadata, ForumChunkPayload, ForumPost, ForumThread, Payload,
    PostSourceUnit, SourceUnit,
};
pub use tokenizer::TokenCounter;
