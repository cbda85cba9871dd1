use crate::backend::FileEntry;
use crate::error::{Error, Result};
use glob::Pattern;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::error;
use walkdir::WalkDir;

/// Marker embedded in the names of in-flight transfer files.
pub const TEMP_MARKER: &str = ".mvpart-";

/// Compiled ignore globs, matched against location-relative paths.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    pub fn new(globs: &[String]) -> Self {
        let patterns = globs
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!("Invalid glob pattern '{}': {}", glob, e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_ignored(&self, relative_path: &str) -> bool {
        is_temp_file(relative_path)
            || self
                .patterns
                .iter()
                .any(|pattern| pattern.matches(relative_path))
    }
}

pub fn is_temp_file(relative_path: &str) -> bool {
    relative_path
        .rsplit('/')
        .next()
        .is_some_and(|name| name.contains(TEMP_MARKER))
}

/// Location-relative path with `/` separators.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

pub fn mtime_secs(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Lazy depth-first walk of a local root. Ignored directories are pruned,
/// symlinks and empty files are skipped, and unreadable entries come out as
/// `Err` items so the caller can skip them and keep going.
pub fn walk_local(root: &Path, ignore: IgnoreSet) -> impl Iterator<Item = Result<FileEntry>> {
    let root = root.to_path_buf();
    let prune_root = root.clone();
    let prune = ignore.clone();

    WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            match relative_path(&prune_root, entry.path()) {
                Some(rel) => !prune.is_ignored(&rel),
                None => true,
            }
        })
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| root.display().to_string());
                    let source = err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                    return Some(Err(Error::file_access(path, source)));
                }
            };
            if !entry.file_type().is_file() {
                return None;
            }
            let rel = relative_path(&root, entry.path())?;
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    let source = err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("metadata unavailable"));
                    return Some(Err(Error::file_access(rel, source)));
                }
            };
            if metadata.len() == 0 {
                return None;
            }
            Some(Ok(FileEntry {
                path: rel,
                size: metadata.len(),
                mtime: mtime_secs(&metadata),
            }))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_walk_skips_ignored_temp_and_empty() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("photos/.cache")).unwrap();
        fs::write(root.join("photos/a.jpg"), b"aaaa").unwrap();
        fs::write(root.join("photos/.cache/thumb.jpg"), b"tttt").unwrap();
        fs::write(root.join("photos/.b.jpg.mvpart-1-0"), b"partial").unwrap();
        fs::write(root.join("photos/empty.jpg"), b"").unwrap();
        fs::write(root.join("notes.tmp"), b"scratch").unwrap();

        let ignore = IgnoreSet::new(&["**/.cache".to_string(), "*.tmp".to_string()]);
        let paths: Vec<String> = walk_local(root, ignore)
            .map(|e| e.unwrap().path)
            .collect();
        assert_eq!(paths, vec!["photos/a.jpg"]);
    }

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let root = Path::new("/srv/media");
        assert_eq!(
            relative_path(root, &root.join("a").join("b.png")).as_deref(),
            Some("a/b.png")
        );
        assert_eq!(relative_path(root, root), None);
    }
}
