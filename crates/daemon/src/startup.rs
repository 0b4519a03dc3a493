//! Startup checks for the wavebox daemon.
//!
//! Preflight work before serving: the media, cache and recordings
//! directories are created, and the configured ffmpeg binary is probed.
//! A missing encoder is a warning, not a failure; streaming degrades to
//! direct serving until one appears.

use std::fs;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};
use wavebox_config::Config;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Cannot create directory '{dir}': {source}")]
    CreateDir {
        dir: String,
        source: std::io::Error,
    },
}

/// Parse an ffmpeg version string and extract the major version number.
///
/// Handles various ffmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .trim()
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;
    major_str.parse().ok()
}

/// Probes the ffmpeg binary with `-version`.
///
/// Returns the parsed major version on success, `None` when the binary is
/// missing, fails to run, or prints something unparseable.
pub fn probe_ffmpeg(ffmpeg_path: &str) -> Option<u32> {
    let output = Command::new(ffmpeg_path).arg("-version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    parse_ffmpeg_version(&String::from_utf8_lossy(&output.stdout))
}

/// Run all startup checks in order:
/// 1. Create the media root, cache and recordings directories
/// 2. Probe ffmpeg when transcoding is enabled (warn-only)
pub fn run_startup_checks(config: &Config) -> Result<(), StartupError> {
    for dir in [
        &config.library.media_root,
        &config.cache.dir,
        &config.recordings.root,
    ] {
        fs::create_dir_all(dir).map_err(|source| StartupError::CreateDir {
            dir: dir.clone(),
            source,
        })?;
    }

    if config.transcode.enabled {
        match probe_ffmpeg(&config.transcode.ffmpeg_path) {
            Some(major) => info!(major, path = %config.transcode.ffmpeg_path, "ffmpeg available"),
            None => warn!(
                path = %config.transcode.ffmpeg_path,
                "ffmpeg unavailable, streaming will fall back to direct serving"
            ),
        }
    }

    Ok(())
}
