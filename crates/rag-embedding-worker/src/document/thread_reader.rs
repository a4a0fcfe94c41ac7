use std::fs;
use std::path::Path;
use tracing::debug;

use crate::core::{fingerprint, ForumThread, PostSourceUnit};
use crate::error::WorkerError;

static IMAGE_URL_RE: once_cell::sync::Lazy<regex::Regex> =
    once_cell::sync::Lazy::new(|| regex::Regex::new(r"(https?://\S+\.(?:png|jpe?g|gif|webp))").unwrap());

/// Parses a thread JSON record and enriches every post with thread-level
/// defaults (`threadTitle`, `category`, `path`). Validates `threadId` and
/// `posts` are present — both are required by the on-disk schema, not
/// optional conveniences.
pub fn read_thread_json(absolute_path: &Path, relative_path: &str) -> Result<Vec<PostSourceUnit>, WorkerError> {
    let raw = fs::read_to_string(absolute_path)
        .map_err(|e| WorkerError::ParseError(format!("{relative_path}: {e}")))?;

    let thread: ForumThread = serde_json::from_str(&raw)
        .map_err(|e| WorkerError::ParseError(format!("{relative_path}: invalid thread JSON: {e}")))?;

    if thread.thread_id.trim().is_empty() {
        return Err(WorkerError::ParseError(format!(
            "{relative_path}: thread record missing threadId"
        )));
    }
    if thread.posts.is_empty() {
        return Err(WorkerError::ParseError(format!(
            "{relative_path}: thread record has no posts"
        )));
    }

    let thread_title = thread.title.clone().unwrap_or_else(|| thread.thread_id.clone());
    let forum_category = thread
        .category
        .clone()
        .or_else(|| {
            Path::new(relative_path)
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "forum".to_string());
    let forum_path = thread.path.clone().unwrap_or_else(|| relative_path.to_string());

    let posts = thread
        .posts
        .into_iter()
        .map(|post| {
            let content_full = post.content_full.unwrap_or_else(|| post.content.clone());
            let image_urls: Vec<String> = IMAGE_URL_RE
                .captures_iter(&content_full)
                .map(|c| c[1].to_string())
                .collect();

            PostSourceUnit {
                thread_id: thread.thread_id.clone(),
                post_id: post.post_id,
                username: post.username,
                user_id: post.user_id,
                date: post.date,
                content: post.content.clone(),
                content_full: content_full.clone(),
                quoted_content: post.quoted_content,
                image_urls,
                keywords: post.keywords,
                mentions: post.mentions,
                fingerprint: fingerprint(&content_full),
                is_substantive: post.is_substantive,
                thread_title: thread_title.clone(),
                forum_category: forum_category.clone(),
                forum_path: forum_path.clone(),
                page: post.page.unwrap_or(1),
            }
        })
        .collect::<Vec<_>>();

    debug!(
        file = relative_path,
        thread_id = %thread.thread_id,
        posts = posts.len(),
        "parsed thread source units"
    );

    Ok(posts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn enriches_posts_with_thread_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t1.json");
        fs::write(
            &path,
            r#"{
                "threadId": "t1",
                "title": "Install problems",
                "posts": [
                    {
                        "postId": "p1",
                        "username": "alice",
                        "userId": "u1",
                        "date": "2024-01-01T00:00:00Z",
                        "content": "Here is a screenshot https://cdn.example.com/a.png"
                    }
                ]
            }"#,
        )
        .unwrap();

        let posts = read_thread_json(&path, "forum/general/t1.json").unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].thread_title, "Install problems");
        assert_eq!(posts[0].forum_category, "forum");
        assert_eq!(posts[0].image_urls, vec!["https://cdn.example.com/a.png"]);
        assert!(!posts[0].fingerprint.is_empty());
    }

    #[test]
    fn rejects_missing_thread_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"threadId": "", "posts": []}"#).unwrap();
        assert!(read_thread_json(&path, "bad.json").is_err());
    }
}
