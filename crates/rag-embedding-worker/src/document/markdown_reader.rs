use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::core::DocSourceUnit;
use crate::error::WorkerError;

static IMAGE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\((https?://[^\s)]+)\)").unwrap());
static HEADING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#\s+(.+)$").unwrap());

/// Parses a Markdown file into a `DocSourceUnit`. `relative_path` drives
/// `category` (its top-level directory) and `urlPath` (itself with the
/// extension stripped); `absolute_path` is only used to read the bytes
/// and stat `lastModified`.
pub fn read_markdown(absolute_path: &Path, relative_path: &str) -> Result<DocSourceUnit, WorkerError> {
    if !absolute_path.is_file() {
        return Err(WorkerError::FileNotFound(relative_path.to_string()));
    }

    let raw = fs::read_to_string(absolute_path)
        .map_err(|e| WorkerError::ParseError(format!("{relative_path}: {e}")))?;
    let metadata = fs::metadata(absolute_path)?;
    let last_modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    let (front_matter, body) = split_front_matter(&raw);

    let title = front_matter
        .get("title")
        .cloned()
        .or_else(|| first_heading(body))
        .unwrap_or_else(|| {
            Path::new(relative_path)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("Untitled")
                .to_string()
        });

    let category = Path::new(relative_path)
        .components()
        .next()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "root".to_string());

    let url_path = relative_path
        .rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .unwrap_or_else(|| relative_path.to_string());

    let image_urls: Vec<String> = IMAGE_URL_RE
        .captures_iter(body)
        .map(|c| c[1].to_string())
        .collect();

    debug!(file = relative_path, title = %title, "parsed markdown source unit");

    Ok(DocSourceUnit {
        file_path: relative_path.to_string(),
        title,
        category,
        url_path,
        body: body.to_string(),
        last_modified,
        image_urls,
    })
}

/// Splits a leading `---`-delimited front-matter block (simple `key:
/// value` pairs, one per line) from the document body. Returns an empty
/// map and the untouched input when no front-matter block is present.
fn split_front_matter(raw: &str) -> (std::collections::HashMap<String, String>, &str) {
    let mut map = std::collections::HashMap::new();
    let Some(rest) = raw.strip_prefix("---\n").or_else(|| raw.strip_prefix("---\r\n")) else {
        return (map, raw);
    };
    let Some(end) = rest.find("\n---") else {
        return (map, raw);
    };
    let block = &rest[..end];
    let body = rest[end..]
        .trim_start_matches("\n---")
        .trim_start_matches("\r\n")
        .trim_start_matches('\n');

    for line in block.lines() {
        if let Some((key, value)) = line.split_once(':') {
            map.insert(
                key.trim().to_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }

    (map, body)
}

fn first_heading(body: &str) -> Option<String> {
    HEADING_RE
        .captures(body)
        .map(|c| c[1].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn title_falls_back_to_first_heading() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "intro.md", "# Getting Started\n\nSome body.");
        let unit = read_markdown(&path, "docs/intro.md").unwrap();
        assert_eq!(unit.title, "Getting Started");
        assert_eq!(unit.category, "docs");
        assert_eq!(unit.url_path, "docs/intro");
    }

    #[test]
    fn front_matter_title_wins_over_heading() {
        let dir = tempdir().unwrap();
        let content = "---\ntitle: Custom Title\ndescription: desc\n---\n# Heading\n\nBody";
        let path = write(dir.path(), "a.md", content);
        let unit = read_markdown(&path, "guides/a.md").unwrap();
        assert_eq!(unit.title, "Custom Title");
        assert!(unit.body.contains("# Heading"));
    }

    #[test]
    fn collects_image_urls() {
        let dir = tempdir().unwrap();
        let content = "# T\n\n![alt](https://example.com/x.png) and ![y](http://a.b/c.jpg)";
        let path = write(dir.path(), "b.md", content);
        let unit = read_markdown(&path, "b.md").unwrap();
        assert_eq!(
            unit.image_urls,
            vec![
                "https://example.com/x.png".to_string(),
                "http://a.b/c.jpg".to_string()
            ]
        );
    }
}
