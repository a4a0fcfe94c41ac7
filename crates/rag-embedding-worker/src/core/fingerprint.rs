use sha2::{Digest, Sha256};

/// Content fingerprint used to detect change between ingestion runs.
/// Whitespace-insensitive: trailing/leading blank lines and indentation
/// drift must not trigger a re-embed of unchanged prose.
pub fn fingerprint(text: &str) -> String {
    let normalized: String = text
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    let normalized = normalized.trim();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic, content-addressed chunk id: stable across runs as long
/// as the source key, sub-chunk position and embedding model are
/// unchanged, so re-ingesting identical content upserts in place instead
/// of accumulating duplicate vectors.
///
/// `namespace` separates id spaces that would otherwise collide, e.g.
/// `"doc"` vs `"forum"` vs the `quoted_content_namespace` used for quoted
/// forum text embedded as its own chunk.
pub fn chunk_id(namespace: &str, source_key: &str, sub_index: usize, embedding_model: &str) -> String {
    let input = format!("{namespace}::{source_key}::{sub_index}::{embedding_model}");
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint("hello world");
        let b = fingerprint("hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_ignores_trailing_whitespace() {
        let a = fingerprint("hello world\n\n");
        let b = fingerprint("hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = fingerprint("hello world");
        let b = fingerprint("hello there");
        assert_ne!(a, b);
    }

    #[test]
    fn chunk_id_is_stable_and_scoped() {
        let a = chunk_id("doc", "docs/intro.md", 0, "text-embedding-3-small");
        let b = chunk_id("doc", "docs/intro.md", 0, "text-embedding-3-small");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        let diff_namespace = chunk_id("forum", "docs/intro.md", 0, "text-embedding-3-small");
        assert_ne!(a, diff_namespace);

        let diff_index = chunk_id("doc", "docs/intro.md", 1, "text-embedding-3-small");
        assert_ne!(a, diff_index);

        let diff_model = chunk_id("doc", "docs/intro.md", 0, "text-embedding-3-large");
        assert_ne!(a, diff_model);
    }
}
