//! Transcoding gateway: ffmpeg command construction and incremental
//! streaming of encoder output.
//!
//! The encoder writes to stdout and the response body is fed chunk by chunk,
//! so playback starts before the transcode finishes. The child process is
//! spawned with `kill_on_drop`, which reaps it when the client disconnects
//! mid-stream. Completed outputs can optionally be persisted in a
//! content-addressed cache and replayed without re-encoding.

use axum::body::{Body, Bytes};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::UNIX_EPOCH;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{info, warn};

/// EBU R128 two-pass-free loudness normalization chain.
const LOUDNORM_FILTER: &str = "loudnorm=I=-16:LRA=11:TP=-1.5";

/// Read size for encoder stdout, and the response chunk granularity.
const STREAM_CHUNK: usize = 64 * 1024;

/// Outputs larger than this stream through without being persisted.
const MAX_CACHEABLE_BYTES: usize = 32 * 1024 * 1024;

/// Target container/codec for a transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Mp3,
    Opus,
}

impl TargetFormat {
    /// mp3 sources stay mp3; everything else goes to opus-in-ogg.
    pub fn for_source(src: &Path) -> Self {
        let is_mp3 = src
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("mp3"))
            .unwrap_or(false);
        if is_mp3 {
            TargetFormat::Mp3
        } else {
            TargetFormat::Opus
        }
    }

    pub fn codec(self) -> &'static str {
        match self {
            TargetFormat::Mp3 => "libmp3lame",
            TargetFormat::Opus => "libopus",
        }
    }

    pub fn container(self) -> &'static str {
        match self {
            TargetFormat::Mp3 => "mp3",
            TargetFormat::Opus => "ogg",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            TargetFormat::Mp3 => "audio/mpeg",
            TargetFormat::Opus => "audio/ogg",
        }
    }
}

/// Parameters for one streaming transcode
#[derive(Debug, Clone)]
pub struct TranscodeParams {
    /// Resolved source file
    pub src: PathBuf,
    /// Apply loudness normalization
    pub normalize: bool,
    /// Output format
    pub target: TargetFormat,
    /// Encoder bitrate, e.g. `96k`
    pub bitrate: String,
    /// Output sample rate in Hz; 0 disables resampling
    pub sample_rate_hz: u32,
}

/// Build the ffmpeg argument list for a streaming transcode
///
/// The pipeline drops video streams, downmixes to stereo, resamples,
/// optionally normalizes loudness, and writes the encoded container to
/// stdout:
/// `-v error -nostdin -i <src> -vn -ac 2 -af <filters> -c:a <codec>
/// -b:a <bitrate> -f <fmt> pipe:1`
pub fn build_ffmpeg_args(params: &TranscodeParams) -> Vec<String> {
    let mut filters = Vec::new();
    if params.sample_rate_hz > 0 {
        filters.push(format!("aresample={}", params.sample_rate_hz));
    }
    if params.normalize {
        filters.push(LOUDNORM_FILTER.to_string());
    }
    let af = if filters.is_empty() {
        "anull".to_string()
    } else {
        filters.join(",")
    };

    vec![
        "-v".to_string(),
        "error".to_string(),
        "-nostdin".to_string(),
        "-i".to_string(),
        params.src.to_string_lossy().into_owned(),
        "-vn".to_string(),
        "-ac".to_string(),
        "2".to_string(),
        "-af".to_string(),
        af,
        "-c:a".to_string(),
        params.target.codec().to_string(),
        "-b:a".to_string(),
        params.bitrate.clone(),
        "-f".to_string(),
        params.target.container().to_string(),
        "pipe:1".to_string(),
    ]
}

/// A running encoder with its stdout pipe.
pub struct TranscodeStream {
    child: Child,
    stdout: ChildStdout,
}

/// Spawns ffmpeg for the given transcode.
///
/// The child is configured with `kill_on_drop`, so dropping the returned
/// stream (e.g. on client disconnect) terminates the encoder.
pub fn spawn_stream(
    ffmpeg_path: &str,
    params: &TranscodeParams,
) -> std::io::Result<TranscodeStream> {
    let mut child = Command::new(ffmpeg_path)
        .args(build_ffmpeg_args(params))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let stdout = child.stdout.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "encoder stdout not piped")
    })?;
    Ok(TranscodeStream { child, stdout })
}

/// Content-addressed cache of completed transcode outputs.
#[derive(Debug, Clone)]
pub struct TranscodeCache {
    dir: PathBuf,
}

impl TranscodeCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: cache_dir.join("transcodes"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache key for a transcode: SHA-256 over the source path, its mtime,
    /// and every encoding parameter. `None` when the source cannot be
    /// statted, which simply disables caching for the request.
    pub fn key(params: &TranscodeParams) -> Option<String> {
        let mtime_nanos = fs::metadata(&params.src)
            .and_then(|m| m.modified())
            .ok()?
            .duration_since(UNIX_EPOCH)
            .ok()?
            .as_nanos();

        let mut hasher = Sha256::new();
        hasher.update(params.src.to_string_lossy().as_bytes());
        hasher.update(mtime_nanos.to_string().as_bytes());
        hasher.update(params.target.codec().as_bytes());
        hasher.update(params.bitrate.as_bytes());
        hasher.update(params.sample_rate_hz.to_string().as_bytes());
        hasher.update([params.normalize as u8]);
        Some(format!("{:x}", hasher.finalize()))
    }

    fn path_for(&self, key: &str, target: TargetFormat) -> PathBuf {
        self.dir.join(format!("{}.{}", key, target.container()))
    }

    /// Path of a previously persisted output, if present.
    pub fn lookup(&self, key: &str, target: TargetFormat) -> Option<PathBuf> {
        let path = self.path_for(key, target);
        path.is_file().then_some(path)
    }

    /// Persists a completed output. Errors are logged and swallowed; the
    /// cache is an optimization, never a correctness requirement.
    pub fn store(&self, key: &str, target: TargetFormat, data: &[u8]) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!(error = %e, "cannot create transcode cache dir");
            return;
        }
        let path = self.path_for(key, target);
        if let Err(e) = fs::write(&path, data) {
            warn!(path = %path.display(), error = %e, "transcode cache write failed");
        } else {
            info!(path = %path.display(), bytes = data.len(), "transcode output cached");
        }
    }
}

/// Turns a running encoder into a streaming response body.
///
/// When `persist` is set, output bytes are buffered alongside the stream and
/// written to the cache after the encoder exits cleanly. Oversized outputs
/// stop buffering but keep streaming.
pub fn stream_body(
    stream: TranscodeStream,
    persist: Option<(TranscodeCache, String, TargetFormat)>,
) -> Body {
    let body_stream = async_stream::stream! {
        let mut child = stream.child;
        let mut stdout = stream.stdout;
        let mut buf = vec![0u8; STREAM_CHUNK];
        let mut collected: Option<Vec<u8>> = persist.as_ref().map(|_| Vec::new());

        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(data) = collected.as_mut() {
                        if data.len() + n <= MAX_CACHEABLE_BYTES {
                            data.extend_from_slice(&buf[..n]);
                        } else {
                            collected = None;
                        }
                    }
                    yield Ok::<_, std::io::Error>(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    warn!(error = %e, "encoder stream read failed");
                    break;
                }
            }
        }

        match child.wait().await {
            Ok(status) if status.success() => {
                if let (Some((cache, key, target)), Some(data)) = (persist, collected) {
                    cache.store(&key, target, &data);
                }
            }
            Ok(status) => {
                warn!(?status, "encoder exited with failure");
            }
            Err(e) => {
                warn!(error = %e, "could not collect encoder exit status");
            }
        }
    };
    Body::from_stream(body_stream)
}
