//! Scanner module for discovering audio files in the media library.
//!
//! This module builds the nested folder/file tree served by the tree API,
//! aggregates library statistics, and computes the content hash used by the
//! change detector. Scanning never fails: unreadable subtrees degrade to
//! empty nodes so a permission problem in one folder cannot take down the
//! whole library view.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Node kind in the media tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Dir,
    File,
}

/// A node in the media tree: either a folder with children or a playable file.
///
/// Serializes to the wire shape consumed by the tree API: directories carry
/// `children` and no `size`, files carry `size` and no `children`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<MediaNode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl MediaNode {
    /// An empty directory node.
    pub fn dir(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: NodeKind::Dir,
            children: Some(Vec::new()),
            size: None,
        }
    }

    /// A playable file node with its size in raw bytes.
    pub fn file(name: impl Into<String>, path: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: NodeKind::File,
            children: None,
            size: Some(size),
        }
    }
}

/// Checks if a file has an allowed audio extension (case-insensitive).
///
/// Extensions in `allowed_exts` carry a leading dot, e.g. `.mp3`.
pub fn is_allowed_file(path: &Path, allowed_exts: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            allowed_exts.iter().any(|e| e == &ext_lower)
        })
        .unwrap_or(false)
}

/// Recursively builds the folder/file tree rooted at `path`.
///
/// - Entries whose names start with `.` are skipped
/// - Symlinks are skipped entirely
/// - Already-visited directories (by canonical path) are not re-entered
/// - Ordering: subdirectories first, then files, case-insensitive by name
/// - Unreadable directories yield their node with no children
pub fn build_tree(path: &Path, rel: &str, allowed_exts: &[String]) -> MediaNode {
    let mut seen = HashSet::new();
    build_tree_inner(path, rel, allowed_exts, &mut seen)
}

fn build_tree_inner(
    path: &Path,
    rel: &str,
    allowed_exts: &[String],
    seen: &mut HashSet<PathBuf>,
) -> MediaNode {
    let name = if rel.is_empty() {
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("sounds")
            .to_string()
    } else {
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string()
    };
    let mut node = MediaNode::dir(name, rel);

    let real_path = match path.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot resolve folder, skipping");
            return node;
        }
    };
    if !seen.insert(real_path) {
        warn!(path = %path.display(), "skipping already-seen folder");
        return node;
    }

    let read = match fs::read_dir(path) {
        Ok(read) => read,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "error reading folder");
            return node;
        }
    };

    let mut entries: Vec<PathBuf> = read
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| !n.starts_with('.'))
                .unwrap_or(false)
        })
        .collect();
    entries.sort_by_key(|p| {
        let name_lower = p
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase();
        (p.is_file(), name_lower)
    });

    let mut children = Vec::new();
    for entry in entries {
        let entry_name = entry
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let rel_child = if rel.is_empty() {
            entry_name.clone()
        } else {
            format!("{}/{}", rel, entry_name)
        }
        .replace('\\', "/");

        let is_symlink = entry
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_symlink {
            debug!(path = %entry.display(), "skipping symlink");
            continue;
        }

        if entry.is_dir() {
            children.push(build_tree_inner(&entry, &rel_child, allowed_exts, seen));
        } else if entry.is_file() && is_allowed_file(&entry, allowed_exts) {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            children.push(MediaNode::file(entry_name, rel_child, size));
        }
    }

    node.children = Some(children);
    node
}

/// Walks the library and returns `(folders, files, bytes)` where `files` and
/// `bytes` count only allowed audio files. Sizes are raw byte counts.
pub fn collect_stats(root: &Path, allowed_exts: &[String]) -> (u64, u64, u64) {
    let mut folders = 0u64;
    let mut files = 0u64;
    let mut bytes = 0u64;

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_dir() {
            // The root itself is not counted as a folder
            if entry.depth() > 0 {
                folders += 1;
            }
        } else if entry.file_type().is_file() && is_allowed_file(entry.path(), allowed_exts) {
            files += 1;
            if let Ok(meta) = entry.metadata() {
                bytes += meta.len();
            }
        }
    }

    (folders, files, bytes)
}

/// Flat list of every playable file as a posix-style path relative to `root`.
pub fn all_playables(root: &Path, allowed_exts: &[String]) -> Vec<String> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_allowed_file(e.path(), allowed_exts))
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect()
}

/// Content hash of the library: SHA-256 over each allowed file's name and
/// mtime in nanoseconds, walked in sorted order. Two scans of an unchanged
/// library produce the same hash; any rename, add, delete or rewrite of an
/// allowed file changes it.
pub fn compute_library_hash(root: &Path, allowed_exts: &[String]) -> String {
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() || !is_allowed_file(entry.path(), allowed_exts) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            hasher.update(name.as_bytes());
        }
        if let Ok(meta) = entry.metadata() {
            if let Ok(modified) = meta.modified() {
                if let Ok(nanos) = modified.duration_since(UNIX_EPOCH) {
                    hasher.update(nanos.as_nanos().to_string().as_bytes());
                }
            }
        }
    }

    format!("{:x}", hasher.finalize())
}
