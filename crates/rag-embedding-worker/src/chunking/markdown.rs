use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::core::{chunk_id, fingerprint, Chunk, ChunkMetadata, DocChunkMetadata, DocSourceUnit, TokenCounter};
use crate::error::WorkerError;

static HEADING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.+)$").unwrap());
static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*```").unwrap());

#[derive(Debug, Clone)]
pub struct MarkdownChunkerConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub absolute_max_tokens: usize,
    pub fail_fast_validation: bool,
}

struct Section<'a> {
    title: String,
    lines: Vec<&'a str>,
}

/// Splits a Markdown document into section-bounded chunks respecting a
/// token budget with trailing overlap. Fenced code blocks are treated as
/// atomic: a chunk boundary never lands inside one.
pub struct MarkdownChunker {
    tokenizer: TokenCounter,
    config: MarkdownChunkerConfig,
}

impl MarkdownChunker {
    pub fn new(tokenizer: TokenCounter, config: MarkdownChunkerConfig) -> Self {
        Self { tokenizer, config }
    }

    pub fn chunk(&self, doc: &DocSourceUnit, embedding_model: &str) -> Result<Vec<Chunk>, WorkerError> {
        let content_hash = fingerprint(&doc.body);
        let sections = split_sections(&doc.body);

        let mut chunks = Vec::new();
        let mut chunk_index = 0usize;

        for section in sections {
            self.chunk_section(&section, doc, embedding_model, &content_hash, &mut chunk_index, &mut chunks)?;
        }

        Ok(chunks)
    }

    fn chunk_section(
        &self,
        section: &Section<'_>,
        doc: &DocSourceUnit,
        embedding_model: &str,
        content_hash: &str,
        chunk_index: &mut usize,
        out: &mut Vec<Chunk>,
    ) -> Result<(), WorkerError> {
        let header = format!("# {}\n\n## {}\n\n", doc.title, section.title);
        let mut buffer: Vec<&str> = Vec::new();
        let mut in_fence = false;

        for &line in &section.lines {
            if FENCE_RE.is_match(line) {
                in_fence = !in_fence;
            }

            let candidate_tokens = self.tokenizer.count(&buffer.join("\n"))
                + self.tokenizer.count(line)
                + 1;

            let would_overflow = !buffer.is_empty() && candidate_tokens > self.config.max_tokens;
            if would_overflow && !in_fence {
                self.emit_chunk(&header, &buffer, doc, section, embedding_model, content_hash, chunk_index, out)?;
                buffer = self.overlap_tail(&buffer);
            }

            buffer.push(line);

            let is_blank_boundary = line.trim().is_empty()
                && !in_fence
                && self.tokenizer.count(&buffer.join("\n")) >= self.config.max_tokens;
            if is_blank_boundary {
                self.emit_chunk(&header, &buffer, doc, section, embedding_model, content_hash, chunk_index, out)?;
                buffer = self.overlap_tail(&buffer);
            }
        }

        if !buffer.iter().all(|l| l.trim().is_empty()) {
            self.emit_chunk(&header, &buffer, doc, section, embedding_model, content_hash, chunk_index, out)?;
        }

        Ok(())
    }

    fn overlap_tail<'a>(&self, buffer: &[&'a str]) -> Vec<&'a str> {
        if self.config.overlap_tokens == 0 || buffer.is_empty() {
            return Vec::new();
        }
        let mut total = 0;
        let mut start = buffer.len();
        while start > 0 {
            let candidate = buffer[start - 1];
            let n = self.tokenizer.count(candidate);
            if total > 0 && total + n > self.config.overlap_tokens {
                break;
            }
            total += n;
            start -= 1;
        }
        buffer[start..].to_vec()
    }

    fn emit_chunk(
        &self,
        header: &str,
        buffer: &[&str],
        doc: &DocSourceUnit,
        section: &Section<'_>,
        embedding_model: &str,
        content_hash: &str,
        chunk_index: &mut usize,
        out: &mut Vec<Chunk>,
    ) -> Result<(), WorkerError> {
        let body = buffer.join("\n").trim_end().to_string();
        if body.is_empty() {
            return Ok(());
        }
        let content = format!("{header}{body}");
        let token_count = self.tokenizer.count(&content);

        if token_count > self.config.absolute_max_tokens {
            let msg = format!(
                "chunk {} of {} ({} tokens) exceeds absoluteMaxTokens {}",
                *chunk_index, doc.file_path, token_count, self.config.absolute_max_tokens
            );
            if self.config.fail_fast_validation {
                return Err(WorkerError::ChunkBudgetExceeded {
                    actual: token_count,
                    limit: self.config.absolute_max_tokens,
                    context: format!("{}#{}", doc.file_path, *chunk_index),
                });
            }
            warn!("{msg}");
        }

        let id = chunk_id("doc", &doc.file_path, *chunk_index, embedding_model);
        out.push(Chunk {
            id,
            content,
            token_count,
            metadata: ChunkMetadata::Doc(DocChunkMetadata {
                source_file: doc.file_path.clone(),
                doc_title: doc.title.clone(),
                section_title: section.title.clone(),
                doc_category: doc.category.clone(),
                url_path: doc.url_path.clone(),
                chunk_index: *chunk_index,
                content_hash: content_hash.to_string(),
                last_modified: doc.last_modified,
            }),
        });
        *chunk_index += 1;
        Ok(())
    }
}

fn split_sections(body: &str) -> Vec<Section<'_>> {
    let mut sections = Vec::new();
    let mut current_title = "Introduction".to_string();
    let mut current_lines: Vec<&str> = Vec::new();
    let mut seen_heading = false;

    for line in body.lines() {
        if let Some(caps) = HEADING_RE.captures(line) {
            if seen_heading || !current_lines.iter().all(|l| l.trim().is_empty()) {
                sections.push(Section {
                    title: current_title.clone(),
                    lines: std::mem::take(&mut current_lines),
                });
            } else {
                current_lines.clear();
            }
            current_title = caps[2].trim().to_string();
            seen_heading = true;
            continue;
        }
        current_lines.push(line);
    }

    if !current_lines.is_empty() {
        sections.push(Section {
            title: current_title,
            lines: current_lines,
        });
    }

    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(body: &str) -> DocSourceUnit {
        DocSourceUnit {
            file_path: "intro.md".to_string(),
            title: "Intro".to_string(),
            category: "docs".to_string(),
            url_path: "intro".to_string(),
            body: body.to_string(),
            last_modified: Utc::now(),
            image_urls: vec![],
        }
    }

    fn chunker(max_tokens: usize, overlap: usize, absolute_max: usize) -> MarkdownChunker {
        MarkdownChunker::new(
            TokenCounter::new().unwrap(),
            MarkdownChunkerConfig {
                max_tokens,
                overlap_tokens: overlap,
                absolute_max_tokens: absolute_max,
                fail_fast_validation: false,
            },
        )
    }

    #[test]
    fn single_short_section_yields_one_chunk() {
        let d = doc("# Getting Started\n\nThis is a short body.");
        let c = chunker(500, 50, 1024);
        let chunks = c.chunk(&d, "m").unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.starts_with("# Intro\n\n## Getting Started\n\n"));
    }

    #[test]
    fn two_sections_under_budget_yield_two_chunks() {
        let section_body = "word ".repeat(300);
        let body = format!("# One\n\n{section_body}\n\n# Two\n\n{section_body}");
        let d = doc(&body);
        let c = chunker(500, 50, 10_000);
        let chunks = c.chunk(&d, "m").unwrap();
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn fenced_code_block_is_never_split() {
        let code = "```rust\n".to_string() + &"let x = 1;\n".repeat(200) + "```\n";
        let body = format!("# Code\n\n{code}");
        let d = doc(&body);
        let c = chunker(50, 10, 100_000);
        let chunks = c.chunk(&d, "m").unwrap();
        // the fence must appear whole inside whichever chunk contains it
        let has_open = chunks.iter().any(|c| c.content.contains("```rust"));
        let has_close = chunks.iter().any(|c| c.content.trim_end().ends_with("```"));
        assert!(has_open && has_close);
    }
}
