use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const SOURCE_EXTENSIONS: &[&str] = &["md", "mdx", "json"];
const EXCLUDED_DIRS: &[&str] = &["node_modules", ".git"];

/// A file discovered by [`walk`], ready to be handed to the Markdown or
/// thread-JSON reader depending on extension.
#[derive(Debug, Clone)]
pub struct WalkedFile {
    pub absolute_path: PathBuf,
    pub relative_path: String,
}

/// Walks `root` for files matching the configured extension set,
/// excluding dotfiles, underscore-prefixed names, and any path with a
/// `node_modules` or `.git` ancestor directory.
pub fn walk(root: &Path) -> Vec<WalkedFile> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| !is_excluded_dir(entry.path()))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| is_eligible_file(entry.path()))
        .filter_map(|entry| {
            let relative_path = entry
                .path()
                .strip_prefix(root)
                .ok()?
                .to_string_lossy()
                .replace('\\', "/");
            Some(WalkedFile {
                absolute_path: entry.path().to_path_buf(),
                relative_path,
            })
        })
        .collect()
}

fn is_excluded_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| EXCLUDED_DIRS.contains(&name))
        .unwrap_or(false)
}

fn is_eligible_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.starts_with('_') {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| SOURCE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn walks_eligible_files_only() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("intro.md"), "# Intro").unwrap();
        fs::write(dir.path().join("thread.json"), "{}").unwrap();
        fs::write(dir.path().join("ignore.txt"), "nope").unwrap();
        fs::write(dir.path().join(".hidden.md"), "nope").unwrap();
        fs::write(dir.path().join("_draft.md"), "nope").unwrap();

        let node_modules = dir.path().join("node_modules");
        fs::create_dir(&node_modules).unwrap();
        fs::write(node_modules.join("pkg.json"), "{}").unwrap();

        let mut names: Vec<String> = walk(dir.path())
            .into_iter()
            .map(|f| f.relative_path)
            .collect();
        names.sort();

        assert_eq!(names, vec!["intro.md".to_string(), "thread.json".to_string()]);
    }
}
