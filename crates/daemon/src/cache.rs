//! Disk-backed JSON cache with mtime-based freshness.
//!
//! Entries live as individual `<key>.json` files under the cache directory.
//! Freshness is derived from the file's modification time, so a `set` always
//! renews the TTL. Cache failures are logged and swallowed: a broken cache
//! degrades to a miss, never to a request error.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Keys longer than this are truncated and suffixed with a hash.
const MAX_KEY_LEN: usize = 160;
const TRUNCATED_KEY_LEN: usize = 140;

/// Disk-backed JSON cache rooted at a directory.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
    ttl: Duration,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Maps an arbitrary key to a safe file stem.
    ///
    /// Path separators become `_`, `..` collapses to `.`, and keys longer
    /// than 160 characters become the first 140 characters plus a 16-hex-char
    /// SHA-256 suffix. Deterministic: equal keys always map to the same stem.
    pub fn sanitize_key(key: &str) -> String {
        let key = key.replace(['/', '\\'], "_").replace("..", ".");
        if key.chars().count() > MAX_KEY_LEN {
            let digest = Sha256::digest(key.as_bytes());
            let hex = format!("{:x}", digest);
            let head: String = key.chars().take(TRUNCATED_KEY_LEN).collect();
            format!("{}-{}", head, &hex[..16])
        } else {
            key
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::sanitize_key(key)))
    }

    /// Fetches a fresh entry, or `None` on absence, staleness, or any
    /// read/parse failure.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.path_for(key);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return None,
        };

        // An unreadable mtime or one in the future counts as fresh
        if let Ok(modified) = meta.modified() {
            if let Ok(age) = modified.elapsed() {
                if age >= self.ttl {
                    return None;
                }
            }
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(key, error = %e, "cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "cache entry is not valid JSON");
                None
            }
        }
    }

    /// Stores an entry, overwriting any previous value. Errors are logged
    /// and swallowed.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        let path = self.path_for(key);
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "cache serialization failed");
                return;
            }
        };
        if let Err(e) = fs::write(&path, json) {
            warn!(key, error = %e, "cache write failed");
        }
    }

    /// Removes a single entry. Returns whether a file was deleted.
    pub fn delete(&self, key: &str) -> bool {
        fs::remove_file(self.path_for(key)).is_ok()
    }

    /// Removes every `.json` entry in the cache directory and returns the
    /// number deleted.
    pub fn clear_all(&self) -> usize {
        let read = match fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(_) => return 0,
        };
        let mut n = 0;
        for entry in read.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && fs::remove_file(&path).is_ok()
            {
                n += 1;
            }
        }
        n
    }

    /// Whether an entry file exists on disk, regardless of freshness.
    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    const ONE_HOUR: Duration = Duration::from_secs(3600);

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        count: u32,
        label: String,
    }

    #[test]
    fn test_set_get_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskCache::new(temp_dir.path(), ONE_HOUR);

        let value = Entry {
            count: 7,
            label: "stats".to_string(),
        };
        cache.set("stats", &value);

        let loaded: Option<Entry> = cache.get("stats");
        assert_eq!(loaded, Some(value));
    }

    #[test]
    fn test_get_missing_key_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskCache::new(temp_dir.path(), ONE_HOUR);

        let loaded: Option<Entry> = cache.get("nope");
        assert_eq!(loaded, None);
    }

    #[test]
    fn test_zero_ttl_entries_are_stale() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskCache::new(temp_dir.path(), Duration::ZERO);

        cache.set("k", &42u32);
        assert!(cache.contains("k"), "entry file should exist");

        let loaded: Option<u32> = cache.get("k");
        assert_eq!(loaded, None, "zero TTL means every entry is expired");
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskCache::new(temp_dir.path(), ONE_HOUR);

        fs::write(temp_dir.path().join("bad.json"), "{not json").unwrap();

        let loaded: Option<u32> = cache.get("bad");
        assert_eq!(loaded, None);
    }

    #[test]
    fn test_delete_and_clear_all() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskCache::new(temp_dir.path(), ONE_HOUR);

        cache.set("a", &1u32);
        cache.set("b", &2u32);
        // A non-entry file survives clear_all
        fs::write(temp_dir.path().join("notes.txt"), "keep").unwrap();

        assert!(cache.delete("a"));
        assert!(!cache.delete("a")); // already gone

        assert_eq!(cache.clear_all(), 1);
        assert!(temp_dir.path().join("notes.txt").exists());
        let loaded: Option<u32> = cache.get("b");
        assert_eq!(loaded, None);
    }

    #[test]
    fn test_set_renews_freshness() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskCache::new(temp_dir.path(), ONE_HOUR);

        cache.set("k", &1u32);
        cache.set("k", &2u32);

        let loaded: Option<u32> = cache.get("k");
        assert_eq!(loaded, Some(2));
    }

    #[test]
    fn test_sanitize_key_examples() {
        assert_eq!(DiskCache::sanitize_key("tree_root"), "tree_root");
        assert_eq!(DiskCache::sanitize_key("tree_vo/astro"), "tree_vo_astro");
        assert_eq!(DiskCache::sanitize_key("a\\b"), "a_b");
        assert_eq!(DiskCache::sanitize_key("up..down"), "up.down");
    }

    // *For any* key, sanitization is deterministic, free of path separators,
    // and bounded in length.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_sanitize_key_is_safe(key in ".{0,300}") {
            let a = DiskCache::sanitize_key(&key);
            let b = DiskCache::sanitize_key(&key);

            prop_assert_eq!(&a, &b, "sanitization must be deterministic");
            prop_assert!(!a.contains('/'), "no forward slashes: {:?}", a);
            prop_assert!(!a.contains('\\'), "no backslashes: {:?}", a);
            // Truncated keys are 140 chars + '-' + 16 hex chars
            prop_assert!(a.chars().count() <= MAX_KEY_LEN.max(TRUNCATED_KEY_LEN + 17));
        }

        #[test]
        fn prop_long_keys_stay_distinct(
            prefix in "[a-z]{200}",
            suffix_a in "[a-z]{10}",
            suffix_b in "[a-z]{10}",
        ) {
            prop_assume!(suffix_a != suffix_b);

            let key_a = format!("{}{}", prefix, suffix_a);
            let key_b = format!("{}{}", prefix, suffix_b);

            // Same 140-char head, different hash suffix
            prop_assert_ne!(
                DiskCache::sanitize_key(&key_a),
                DiskCache::sanitize_key(&key_b)
            );
        }
    }
}
