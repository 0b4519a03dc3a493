//! Recording intake: submission, review and the persistent upload log.
//!
//! Uploaded takes land under the recordings root as mp3 files; everything
//! else about an upload lives in a single JSON log next to them. One tokio
//! mutex serializes the whole submit critical section as well as every
//! read-modify-write of the log, so two concurrent submits for the same
//! canonical path resolve to exactly one winner.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use wavebox_config::Config;

/// File name of the upload log inside the recordings root.
pub const UPLOAD_LOG_NAME: &str = "_uploads.json";

/// Input containers accepted for submission.
const ALLOWED_INPUT_EXTS: [&str; 3] = ["webm", "wav", "mp3"];

#[derive(Debug, Error, PartialEq)]
pub enum UploadError {
    #[error("Invalid path")]
    Traversal,
    #[error("Recording already exists")]
    Conflict,
    #[error("Unsupported file type")]
    Unsupported,
    #[error("Upload not found")]
    NotFound,
    #[error("Conversion failed")]
    Conversion,
    #[error("Storage failed")]
    Storage,
}

/// Review state of a submitted recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Accepted,
}

/// Status reported for an arbitrary recording path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    Missing,
    Pending,
    Accepted,
}

/// One entry in the upload log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,
    pub user: String,
    pub requested_path: String,
    pub stored_path: String,
    pub filename: String,
    pub submitted_at: u64,
    pub accepted_at: Option<u64>,
    pub status: UploadStatus,
}

/// Normalizes a requested recording path to its canonical stored form.
///
/// Lowercased, backslashes become forward slashes, and the final component
/// always carries an `.mp3` extension. Absolute paths and `..` segments are
/// rejected outright.
pub fn canonical_stored_rel(requested: &str) -> Result<String, UploadError> {
    let normalized = requested.trim().to_lowercase().replace('\\', "/");
    let path = Path::new(&normalized);
    if path.is_absolute() {
        return Err(UploadError::Traversal);
    }

    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(UploadError::Traversal),
        }
    }

    let last = parts.pop().ok_or(UploadError::Traversal)?;
    let stem = Path::new(&last)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or(UploadError::Traversal)?;
    parts.push(format!("{}.mp3", stem));
    Ok(parts.join("/"))
}

/// ffmpeg argument list that converts an uploaded take to the stored mp3.
pub fn build_convert_args(
    input: &Path,
    output: &Path,
    bitrate: &str,
    sample_rate_hz: u32,
) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-vn".to_string(),
        "-ac".to_string(),
        "2".to_string(),
        "-ar".to_string(),
        sample_rate_hz.to_string(),
        "-b:a".to_string(),
        bitrate.to_string(),
        "-f".to_string(),
        "mp3".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Store for submitted recordings and their review log.
pub struct UploadStore {
    recordings_root: PathBuf,
    log_path: PathBuf,
    ffmpeg_path: String,
    upload_bitrate: String,
    upload_sample_rate_hz: u32,
    /// Guards the log file and the whole submit critical section.
    lock: Mutex<()>,
}

impl UploadStore {
    pub fn new(config: &Config) -> Self {
        let recordings_root = PathBuf::from(&config.recordings.root);
        let log_path = recordings_root.join(UPLOAD_LOG_NAME);
        Self {
            recordings_root,
            log_path,
            ffmpeg_path: config.transcode.ffmpeg_path.clone(),
            upload_bitrate: config.recordings.upload_bitrate.clone(),
            upload_sample_rate_hz: config.recordings.upload_sample_rate_hz,
            lock: Mutex::new(()),
        }
    }

    pub fn recordings_root(&self) -> &Path {
        &self.recordings_root
    }

    /// Submits a new take for the given library path.
    ///
    /// The stored file is written under the recordings root at the canonical
    /// path; non-mp3 input goes through an ffmpeg conversion. The temp input
    /// is removed whether or not conversion succeeds.
    pub async fn submit(
        &self,
        requested_path: &str,
        bytes: &[u8],
        original_filename: &str,
        user: &str,
    ) -> Result<UploadRecord, UploadError> {
        let stored_rel = canonical_stored_rel(requested_path)?;

        let ext = Path::new(original_filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .ok_or(UploadError::Unsupported)?;
        if !ALLOWED_INPUT_EXTS.contains(&ext.as_str()) {
            return Err(UploadError::Unsupported);
        }

        let _guard = self.lock.lock().await;

        let stored_abs = self.recordings_root.join(&stored_rel);
        if stored_abs.exists() {
            return Err(UploadError::Conflict);
        }

        let parent = stored_abs.parent().ok_or(UploadError::Traversal)?;
        fs::create_dir_all(parent).map_err(|e| {
            warn!(path = %parent.display(), error = %e, "recording directory create failed");
            UploadError::Storage
        })?;

        let temp_name = Path::new(original_filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin");
        let temp_path = parent.join(format!("__temp__{}", temp_name));
        fs::write(&temp_path, bytes).map_err(|e| {
            warn!(path = %temp_path.display(), error = %e, "temp upload write failed");
            UploadError::Storage
        })?;

        let result = if ext == "mp3" {
            fs::rename(&temp_path, &stored_abs).map_err(|e| {
                warn!(path = %stored_abs.display(), error = %e, "recording move failed");
                UploadError::Storage
            })
        } else {
            self.convert_to_mp3(&temp_path, &stored_abs).await
        };
        // Conversion leaves the temp input behind; the mp3 rename consumes it
        if temp_path.exists() {
            let _ = fs::remove_file(&temp_path);
        }
        result?;

        let record = UploadRecord {
            id: Uuid::new_v4().to_string(),
            user: user.to_string(),
            requested_path: requested_path.to_string(),
            stored_path: stored_rel.clone(),
            filename: original_filename.to_string(),
            submitted_at: unix_now(),
            accepted_at: None,
            status: UploadStatus::Pending,
        };

        let mut log = self.load_log();
        log.insert(record.id.clone(), record.clone());
        self.save_log(&log)?;

        info!(id = %record.id, path = %stored_rel, user, "recording submitted");
        Ok(record)
    }

    async fn convert_to_mp3(&self, input: &Path, output: &Path) -> Result<(), UploadError> {
        let args = build_convert_args(
            input,
            output,
            &self.upload_bitrate,
            self.upload_sample_rate_hz,
        );
        let status = tokio::process::Command::new(&self.ffmpeg_path)
            .args(&args)
            .status()
            .await
            .map_err(|e| {
                warn!(error = %e, "ffmpeg launch failed for upload conversion");
                UploadError::Conversion
            })?;
        if !status.success() {
            warn!(%status, output = %output.display(), "upload conversion failed");
            // A failed run can leave a partial output behind
            let _ = fs::remove_file(output);
            return Err(UploadError::Conversion);
        }
        Ok(())
    }

    /// Marks a pending upload as accepted. The stored file stays in place.
    pub async fn accept(&self, id: &str) -> Result<UploadRecord, UploadError> {
        let _guard = self.lock.lock().await;
        let mut log = self.load_log();
        let record = log.get_mut(id).ok_or(UploadError::NotFound)?;
        if !self.recordings_root.join(&record.stored_path).is_file() {
            return Err(UploadError::NotFound);
        }
        record.status = UploadStatus::Accepted;
        record.accepted_at = Some(unix_now());
        let updated = record.clone();
        self.save_log(&log)?;
        info!(id, path = %updated.stored_path, "recording accepted");
        Ok(updated)
    }

    /// Removes an upload entirely: the stored file (best effort) and its
    /// log entry.
    pub async fn reject(&self, id: &str) -> Result<String, UploadError> {
        let _guard = self.lock.lock().await;
        let mut log = self.load_log();
        let record = log.remove(id).ok_or(UploadError::NotFound)?;
        let stored_abs = self.recordings_root.join(&record.stored_path);
        if let Err(e) = fs::remove_file(&stored_abs) {
            warn!(path = %stored_abs.display(), error = %e, "stored recording delete failed");
        }
        self.save_log(&log)?;
        info!(id, path = %record.stored_path, "recording rejected");
        Ok(record.id)
    }

    /// Reports the review status of the recording at a library path.
    ///
    /// Disk is authoritative for existence: a stored file with no log entry
    /// still reports `Pending`.
    pub async fn check_status(&self, requested_path: &str) -> Result<RecordingStatus, UploadError> {
        let stored_rel = canonical_stored_rel(requested_path)?;
        let _guard = self.lock.lock().await;
        if !self.recordings_root.join(&stored_rel).is_file() {
            return Ok(RecordingStatus::Missing);
        }
        let log = self.load_log();
        let status = log
            .values()
            .find(|r| r.stored_path == stored_rel)
            .map(|r| match r.status {
                UploadStatus::Pending => RecordingStatus::Pending,
                UploadStatus::Accepted => RecordingStatus::Accepted,
            })
            .unwrap_or(RecordingStatus::Pending);
        Ok(status)
    }

    /// Pending-entry count, for the cache-status snapshot.
    pub async fn pending_count(&self) -> usize {
        let _guard = self.lock.lock().await;
        self.load_log()
            .values()
            .filter(|r| r.status == UploadStatus::Pending)
            .count()
    }

    fn load_log(&self) -> BTreeMap<String, UploadRecord> {
        let content = match fs::read_to_string(&self.log_path) {
            Ok(content) => content,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_str(&content) {
            Ok(log) => log,
            Err(e) => {
                warn!(error = %e, "upload log is not valid JSON, starting empty");
                BTreeMap::new()
            }
        }
    }

    fn save_log(&self, log: &BTreeMap<String, UploadRecord>) -> Result<(), UploadError> {
        let json = serde_json::to_string_pretty(log).map_err(|e| {
            warn!(error = %e, "upload log serialization failed");
            UploadError::Storage
        })?;
        if let Some(parent) = self.log_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::write(&self.log_path, json).map_err(|e| {
            warn!(error = %e, "upload log write failed");
            UploadError::Storage
        })
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
    use std::sync::Arc;
    use tempfile::TempDir;
    use wavebox_config::Config;

    fn test_store(root: &TempDir) -> UploadStore {
        let mut config = Config::default();
        config.recordings.root = root.path().to_string_lossy().into_owned();
        UploadStore::new(&config)
    }

    #[test]
    fn test_canonical_stored_rel() {
        assert_eq!(
            canonical_stored_rel("VO/Astro/Line_01.webm").unwrap(),
            "vo/astro/line_01.mp3"
        );
        assert_eq!(
            canonical_stored_rel("vo\\astro\\take.wav").unwrap(),
            "vo/astro/take.mp3"
        );
        assert_eq!(canonical_stored_rel("take").unwrap(), "take.mp3");
        assert_eq!(canonical_stored_rel("./vo/take.mp3").unwrap(), "vo/take.mp3");

        assert_eq!(canonical_stored_rel(""), Err(UploadError::Traversal));
        assert_eq!(
            canonical_stored_rel("../escape.mp3"),
            Err(UploadError::Traversal)
        );
        assert_eq!(
            canonical_stored_rel("vo/../../escape.mp3"),
            Err(UploadError::Traversal)
        );
        assert_eq!(
            canonical_stored_rel("/etc/passwd"),
            Err(UploadError::Traversal)
        );
    }

    #[test]
    fn test_build_convert_args() {
        let args = build_convert_args(
            Path::new("/tmp/__temp__take.webm"),
            Path::new("/rec/vo/take.mp3"),
            "192k",
            44_100,
        );
        assert_eq!(args[0], "-y");
        assert_eq!(args[1], "-i");
        assert_eq!(args[2], "/tmp/__temp__take.webm");
        assert!(args.windows(2).any(|w| w == ["-ac", "2"]));
        assert!(args.windows(2).any(|w| w == ["-ar", "44100"]));
        assert!(args.windows(2).any(|w| w == ["-b:a", "192k"]));
        assert!(args.windows(2).any(|w| w == ["-f", "mp3"]));
        assert_eq!(args.last().map(String::as_str), Some("/rec/vo/take.mp3"));
    }

    #[tokio::test]
    async fn test_submit_mp3_round_trip() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root);

        let record = store
            .submit("VO/Astro/line_01", b"mp3-bytes", "take.mp3", "alice")
            .await
            .unwrap();

        assert_eq!(record.stored_path, "vo/astro/line_01.mp3");
        assert_eq!(record.user, "alice");
        assert_eq!(record.status, UploadStatus::Pending);
        assert!(record.accepted_at.is_none());
        assert!(!record.id.is_empty());

        let stored = root.path().join("vo/astro/line_01.mp3");
        assert_eq!(fs::read(&stored).unwrap(), b"mp3-bytes");
        // No temp input left behind
        assert!(!root.path().join("vo/astro/__temp__take.mp3").exists());

        assert_eq!(
            store.check_status("vo/astro/line_01").await.unwrap(),
            RecordingStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_duplicate_submit_conflicts() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root);

        store
            .submit("vo/take", b"first", "take.mp3", "alice")
            .await
            .unwrap();
        let second = store.submit("vo/take", b"second", "take.mp3", "bob").await;

        assert_eq!(second, Err(UploadError::Conflict));
        // Loser never overwrites the stored file
        assert_eq!(fs::read(root.path().join("vo/take.mp3")).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_concurrent_submits_have_one_winner() {
        let root = TempDir::new().unwrap();
        let store = Arc::new(test_store(&root));

        let (a, b) = tokio::join!(
            store.submit("vo/take", b"a", "take.mp3", "alice"),
            store.submit("vo/take", b"b", "take.mp3", "bob"),
        );

        assert!(a.is_ok() != b.is_ok(), "exactly one submit must win");
        assert_eq!(
            a.err().or(b.err()),
            Some(UploadError::Conflict),
            "the loser must see a conflict"
        );
    }

    #[tokio::test]
    async fn test_submit_rejects_traversal_and_unsupported() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root);

        assert_eq!(
            store
                .submit("../escape", b"x", "take.mp3", "alice")
                .await
                .err(),
            Some(UploadError::Traversal)
        );
        assert_eq!(
            store.submit("vo/take", b"x", "take.flac", "alice").await.err(),
            Some(UploadError::Unsupported)
        );
        assert_eq!(
            store.submit("vo/take", b"x", "noext", "alice").await.err(),
            Some(UploadError::Unsupported)
        );
    }

    #[tokio::test]
    async fn test_accept_round_trip() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root);

        let record = store
            .submit("vo/take", b"x", "take.mp3", "alice")
            .await
            .unwrap();
        let accepted = store.accept(&record.id).await.unwrap();

        assert_eq!(accepted.status, UploadStatus::Accepted);
        assert!(accepted.accepted_at.is_some());
        assert_eq!(
            store.check_status("vo/take").await.unwrap(),
            RecordingStatus::Accepted
        );
    }

    #[tokio::test]
    async fn test_accept_missing_record_or_file() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root);

        assert_eq!(store.accept("no-such-id").await.err(), Some(UploadError::NotFound));

        let record = store
            .submit("vo/take", b"x", "take.mp3", "alice")
            .await
            .unwrap();
        fs::remove_file(root.path().join("vo/take.mp3")).unwrap();
        assert_eq!(store.accept(&record.id).await.err(), Some(UploadError::NotFound));
    }

    #[tokio::test]
    async fn test_reject_removes_file_and_record() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root);

        let record = store
            .submit("vo/take", b"x", "take.mp3", "alice")
            .await
            .unwrap();
        let removed = store.reject(&record.id).await.unwrap();

        assert_eq!(removed, record.id);
        assert!(!root.path().join("vo/take.mp3").exists());
        assert_eq!(
            store.check_status("vo/take").await.unwrap(),
            RecordingStatus::Missing
        );
        // Rejection leaves no tombstone; the path is free for resubmission
        assert!(store
            .submit("vo/take", b"again", "take.mp3", "bob")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_reject_unknown_id() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root);
        assert_eq!(store.reject("nope").await.err(), Some(UploadError::NotFound));
    }

    #[tokio::test]
    async fn test_untracked_file_reports_pending() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root);

        fs::create_dir_all(root.path().join("vo")).unwrap();
        fs::write(root.path().join("vo/manual.mp3"), b"x").unwrap();

        assert_eq!(
            store.check_status("vo/manual").await.unwrap(),
            RecordingStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_log_survives_store_restart() {
        let root = TempDir::new().unwrap();
        let record = {
            let store = test_store(&root);
            store
                .submit("vo/take", b"x", "take.mp3", "alice")
                .await
                .unwrap()
        };

        let store = test_store(&root);
        let accepted = store.accept(&record.id).await.unwrap();
        assert_eq!(accepted.status, UploadStatus::Accepted);
        assert_eq!(store.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_corrupt_log_starts_empty() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join(UPLOAD_LOG_NAME), "{broken").unwrap();

        let store = test_store(&root);
        assert_eq!(store.pending_count().await, 0);
        // Submitting still works and rewrites a valid log
        store
            .submit("vo/take", b"x", "take.mp3", "alice")
            .await
            .unwrap();
        assert_eq!(store.pending_count().await, 1);
    }
}
