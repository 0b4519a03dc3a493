//! Library context: cache building, change detection and the watcher loop.
//!
//! `Library` owns everything the cached views of the media tree need: the
//! configured roots, the disk cache, and the last observed content hash. A
//! single tokio mutex guards both the hash and the rebuild pipeline, so at
//! most one rebuild runs at a time and the hash can never drift from the
//! cache contents it describes.

use crate::cache::DiskCache;
use crate::scan;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::info;
use wavebox_config::Config;

/// Cache key for the full media tree.
pub const TREE_KEY: &str = "tree_root";
/// Cache key for aggregate library statistics.
pub const STATS_KEY: &str = "stats";
/// Cache key for the flat playable-file list.
pub const FILES_KEY: &str = "files";

/// Aggregate statistics for the whole library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryStats {
    pub folders: u64,
    pub files: u64,
    pub bytes: u64,
    pub human_size: String,
    pub updated_at: u64,
}

/// Formats a byte count as a short human-readable size, e.g. `3.4 MB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut num = bytes as f64;
    let mut i = 0;
    while num >= 1024.0 && i < UNITS.len() - 1 {
        num /= 1024.0;
        i += 1;
    }
    format!("{:.1} {}", num, UNITS[i])
}

/// Process-scoped library context shared across request handlers and the
/// background watcher.
pub struct Library {
    media_root: PathBuf,
    allowed_exts: Vec<String>,
    cache: DiskCache,
    watch_interval: Duration,
    /// Last observed library hash. The mutex doubles as the rebuild lock.
    last_hash: Mutex<String>,
    watcher_started: AtomicBool,
}

impl Library {
    pub fn new(config: &Config) -> Self {
        Self {
            media_root: PathBuf::from(&config.library.media_root),
            allowed_exts: config.library.allowed_exts.clone(),
            cache: DiskCache::new(
                &config.cache.dir,
                Duration::from_secs(config.cache.ttl_secs),
            ),
            watch_interval: Duration::from_secs(config.cache.watch_interval_secs),
            last_hash: Mutex::new(String::new()),
            watcher_started: AtomicBool::new(false),
        }
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    pub fn allowed_exts(&self) -> &[String] {
        &self.allowed_exts
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    /// Last observed library hash, empty before the first rebuild.
    pub async fn last_hash(&self) -> String {
        self.last_hash.lock().await.clone()
    }

    /// Rebuilds the cached tree, stats and file list.
    ///
    /// Without `force`, a rebuild only happens when the library hash differs
    /// from the last observed one. The hash is updated only after a completed
    /// scan, so an interrupted build leaves the previous state intact.
    pub async fn rebuild(&self, force: bool) {
        let mut last_hash = self.last_hash.lock().await;
        self.rebuild_locked(&mut last_hash, force);
    }

    fn rebuild_locked(&self, last_hash: &mut String, force: bool) {
        let start = Instant::now();
        let cur_hash = scan::compute_library_hash(&self.media_root, &self.allowed_exts);
        if !force && cur_hash == *last_hash {
            info!("library unchanged, cache still valid");
            return;
        }

        info!(root = %self.media_root.display(), "scanning media tree");
        let tree = scan::build_tree(&self.media_root, "", &self.allowed_exts);
        let top_level = tree.children.as_ref().map(|c| c.len()).unwrap_or(0);
        self.cache.set(TREE_KEY, &tree);

        let (folders, files, bytes) = scan::collect_stats(&self.media_root, &self.allowed_exts);
        let stats = LibraryStats {
            folders,
            files,
            bytes,
            human_size: human_size(bytes),
            updated_at: unix_now(),
        };
        self.cache.set(STATS_KEY, &stats);

        let playables = scan::all_playables(&self.media_root, &self.allowed_exts);
        let playable_count = playables.len();
        self.cache.set(FILES_KEY, &playables);

        *last_hash = cur_hash;
        info!(
            top_level,
            files, folders, playable_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "library cache rebuilt"
        );
    }

    /// Blocking rebuild for request paths that hit a cache miss.
    ///
    /// Takes the rebuild lock, so a rebuild already in flight is waited for
    /// rather than duplicated; if that rebuild left fresh stats behind, the
    /// forced rescan is skipped.
    pub async fn ensure_built(&self) {
        let mut last_hash = self.last_hash.lock().await;
        if self.cache.get::<LibraryStats>(STATS_KEY).is_some()
            && self.cache.get::<Vec<String>>(FILES_KEY).is_some()
        {
            return;
        }
        self.rebuild_locked(&mut last_hash, true);
    }

    /// Starts the initial build plus the change watcher. Safe to call more
    /// than once; only the first call spawns tasks.
    pub fn start_background(self: &Arc<Self>) {
        if self.watcher_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("launching background cache builder and watcher");

        let library = self.clone();
        tokio::spawn(async move {
            library.rebuild(false).await;
        });

        let library = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(library.watch_interval).await;
                let new_hash =
                    scan::compute_library_hash(&library.media_root, &library.allowed_exts);
                let changed = { *library.last_hash.lock().await != new_hash };
                if changed {
                    info!("media changed, rebuilding cache");
                    library.rebuild(true).await;
                }
            }
        });
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::TempDir;
    use wavebox_config::Config;

    fn test_config(media: &TempDir, cache: &TempDir) -> Config {
        let mut config = Config::default();
        config.library.media_root = media.path().to_string_lossy().into_owned();
        config.cache.dir = cache.path().to_string_lossy().into_owned();
        config
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0.0 B");
        assert_eq!(human_size(512), "512.0 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[tokio::test]
    async fn test_rebuild_populates_cache() {
        let media = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        fs::create_dir(media.path().join("vo")).unwrap();
        let mut f = File::create(media.path().join("vo/line.mp3")).unwrap();
        f.write_all(&[0u8; 64]).unwrap();

        let library = Library::new(&test_config(&media, &cache_dir));
        library.rebuild(false).await;

        let stats: LibraryStats = library.cache().get(STATS_KEY).unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.folders, 1);
        assert_eq!(stats.bytes, 64);

        let files: Vec<String> = library.cache().get(FILES_KEY).unwrap();
        assert_eq!(files, vec!["vo/line.mp3".to_string()]);

        assert!(!library.last_hash().await.is_empty());
    }

    #[tokio::test]
    async fn test_unforced_rebuild_skips_when_unchanged() {
        let media = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        File::create(media.path().join("a.mp3")).unwrap();

        let library = Library::new(&test_config(&media, &cache_dir));
        library.rebuild(false).await;

        // Drop a cache key; an unforced rebuild with an unchanged library
        // must not recreate it
        assert!(library.cache().delete(STATS_KEY));
        library.rebuild(false).await;
        assert!(!library.cache().contains(STATS_KEY));

        // A forced rebuild does
        library.rebuild(true).await;
        assert!(library.cache().contains(STATS_KEY));
    }

    #[tokio::test]
    async fn test_rebuild_detects_new_files() {
        let media = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        File::create(media.path().join("a.mp3")).unwrap();

        let library = Library::new(&test_config(&media, &cache_dir));
        library.rebuild(false).await;
        let first_hash = library.last_hash().await;

        File::create(media.path().join("b.mp3")).unwrap();
        library.rebuild(false).await;

        assert_ne!(library.last_hash().await, first_hash);
        let files: Vec<String> = library.cache().get(FILES_KEY).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_built_fills_missing_cache() {
        let media = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        File::create(media.path().join("a.mp3")).unwrap();

        let library = Library::new(&test_config(&media, &cache_dir));
        assert!(library.cache().get::<LibraryStats>(STATS_KEY).is_none());

        library.ensure_built().await;
        assert!(library.cache().get::<LibraryStats>(STATS_KEY).is_some());
        assert!(library.cache().get::<Vec<String>>(FILES_KEY).is_some());
    }

    #[tokio::test]
    async fn test_start_background_is_idempotent() {
        let media = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        File::create(media.path().join("a.mp3")).unwrap();

        let library = Arc::new(Library::new(&test_config(&media, &cache_dir)));
        library.start_background();
        library.start_background();

        assert!(library.watcher_started.load(Ordering::SeqCst));
    }
}
