pub mod markdown_reader;
pub mod thread_reader;
pub mod walker;

use std::path::Path;

pub use markdown_reader::read_markdown;
pub use thread_reader::read_thread_json;
pub use walker::walk;

use crate::core::SourceUnit;
use crate::error::WorkerError;

/// Minimum content length below which a forum post carries no retrievable
/// signal; the chunker never sees these, they are filtered upstream.
const MIN_POST_CONTENT_LENGTH: usize = 10;

/// Walks `root` and normalizes every eligible file into a `SourceUnit`:
/// `.md`/`.mdx` become a single doc unit, `.json` thread records expand
/// into one unit per substantive post. Files that fail to parse are
/// logged and skipped rather than aborting the whole walk, since a single
/// malformed thread file should not block ingestion of the rest of the
/// tree.
pub fn read_all(root: &Path) -> Result<Vec<SourceUnit>, WorkerError> {
    let mut units = Vec::new();

    for file in walk(root) {
        let ext = file
            .absolute_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "md" | "mdx" => match read_markdown(&file.absolute_path, &file.relative_path) {
                Ok(doc) => units.push(SourceUnit::Doc(doc)),
                Err(e) => tracing::warn!(file = %file.relative_path, error = %e, "skipping unreadable markdown file"),
            },
            "json" => match read_thread_json(&file.absolute_path, &file.relative_path) {
                Ok(posts) => {
                    for post in posts {
                        if post.is_substantive && post.content.trim().chars().count() >= MIN_POST_CONTENT_LENGTH {
                            units.push(SourceUnit::Post(post));
                        }
                    }
                }
                Err(e) => tracing::warn!(file = %file.relative_path, error = %e, "skipping unreadable thread file"),
            },
            _ => {}
        }
    }

    Ok(units)
}
