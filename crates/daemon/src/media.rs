//! Direct media serving: safe path resolution, conditional requests and
//! byte-range streaming.

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::scan::is_allowed_file;

const RANGE_CHUNK: usize = 64 * 1024;

/// Error type for media path resolution
#[derive(Debug, Error, PartialEq)]
pub enum MediaError {
    /// Requested path escapes the media root
    #[error("Forbidden")]
    Traversal,
    /// File missing or not a playable type
    #[error("Not found")]
    NotFound,
}

/// Resolves a client-supplied relative path against the media root.
///
/// Rejects absolute paths and `..` components outright, then canonicalizes
/// and verifies the result still lives under the root, so symlinks cannot be
/// used to escape it. The file must exist and carry an allowed extension.
pub fn resolve_media_path(
    root: &Path,
    rel: &str,
    allowed_exts: &[String],
) -> Result<PathBuf, MediaError> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute()
        || rel_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        warn!(path = rel, "blocked traversal attempt");
        return Err(MediaError::Traversal);
    }

    let root = root.canonicalize().map_err(|_| MediaError::NotFound)?;
    let full = root
        .join(rel_path)
        .canonicalize()
        .map_err(|_| MediaError::NotFound)?;
    if !full.starts_with(&root) {
        warn!(path = rel, "blocked path escaping media root");
        return Err(MediaError::Traversal);
    }
    if !full.is_file() || !is_allowed_file(&full, allowed_exts) {
        return Err(MediaError::NotFound);
    }
    Ok(full)
}

/// MIME type for a playable file, by extension.
pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("m4a") => "audio/mp4",
        Some("flac") => "audio/flac",
        Some("aac") => "audio/aac",
        _ => "application/octet-stream",
    }
}

fn http_date(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Serves a resolved media file directly.
///
/// Honors `If-Modified-Since` (304 when not newer) and single `bytes=`
/// ranges (206, or 416 when the start lies past the end of file). Bodies are
/// streamed, never buffered whole.
pub async fn serve_direct(path: &Path, headers: &HeaderMap) -> Response {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(_) => return (StatusCode::NOT_FOUND, "Not found").into_response(),
    };
    let file_size = meta.len();
    let modified = meta.modified().ok();
    let last_modified = modified.map(http_date);

    // Conditional request: compare at whole-second precision, as the header
    // format cannot carry more
    if let (Some(modified), Some(ims)) = (
        modified,
        headers
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok()),
    ) {
        let modified_dt: DateTime<Utc> = modified.into();
        if modified_dt.timestamp() <= ims.timestamp() {
            let mut resp = StatusCode::NOT_MODIFIED.into_response();
            if let Some(lm) = &last_modified {
                if let Ok(value) = lm.parse() {
                    resp.headers_mut().insert(header::LAST_MODIFIED, value);
                }
            }
            return resp;
        }
    }

    let content_type = content_type_for(path);

    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        return serve_range(path, range, file_size, content_type, last_modified).await;
    }

    let file = match File::open(path).await {
        Ok(file) => file,
        Err(_) => return (StatusCode::NOT_FOUND, "Not found").into_response(),
    };
    let body = Body::from_stream(ReaderStream::new(file));

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, file_size.to_string())
        .header(header::ACCEPT_RANGES, "bytes");
    if let Some(lm) = last_modified {
        builder = builder.header(header::LAST_MODIFIED, lm);
    }
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn serve_range(
    path: &Path,
    range: &str,
    file_size: u64,
    content_type: &'static str,
    last_modified: Option<String>,
) -> Response {
    let Some(start_end) = range.strip_prefix("bytes=") else {
        return range_not_satisfiable(file_size);
    };
    let parts: Vec<&str> = start_end.split('-').collect();
    if parts.len() != 2 {
        return range_not_satisfiable(file_size);
    }
    let start: u64 = parts[0].parse().unwrap_or(0);
    if start >= file_size {
        return range_not_satisfiable(file_size);
    }
    let end: u64 = parts[1]
        .parse()
        .unwrap_or(file_size.saturating_sub(1))
        .min(file_size.saturating_sub(1));
    if end < start {
        return range_not_satisfiable(file_size);
    }
    let content_length = end - start + 1;

    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(_) => return (StatusCode::NOT_FOUND, "Not found").into_response(),
    };
    if file.seek(SeekFrom::Start(start)).await.is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Seek failed").into_response();
    }

    let stream = async_stream::stream! {
        let mut remaining = content_length;
        let mut buf = vec![0u8; RANGE_CHUNK];
        while remaining > 0 {
            let chunk_len = remaining.min(buf.len() as u64) as usize;
            match file.read_exact(&mut buf[..chunk_len]).await {
                Ok(_) => {
                    yield Ok::<_, std::io::Error>(
                        axum::body::Bytes::copy_from_slice(&buf[..chunk_len]),
                    );
                    remaining -= chunk_len as u64;
                }
                Err(e) => {
                    warn!(error = %e, "range read failed mid-stream");
                    break;
                }
            }
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, content_length.to_string())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, file_size),
        );
    if let Some(lm) = last_modified {
        builder = builder.header(header::LAST_MODIFIED, lm);
    }
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn range_not_satisfiable(file_size: u64) -> Response {
    Response::builder()
        .status(StatusCode::RANGE_NOT_SATISFIABLE)
        .header(header::CONTENT_RANGE, format!("bytes */{}", file_size))
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::RANGE_NOT_SATISFIABLE.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::fs::{self, File as StdFile};
    use std::io::Write;
    use tempfile::TempDir;

    fn exts() -> Vec<String> {
        [".mp3", ".wav", ".ogg"].iter().map(|s| s.to_string()).collect()
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        resp.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[test]
    fn test_resolve_rejects_parent_components() {
        let temp_dir = TempDir::new().unwrap();
        let result = resolve_media_path(temp_dir.path(), "../etc/passwd", &exts());
        assert_eq!(result, Err(MediaError::Traversal));

        let result = resolve_media_path(temp_dir.path(), "vo/../../secret.mp3", &exts());
        assert_eq!(result, Err(MediaError::Traversal));
    }

    #[test]
    fn test_resolve_rejects_absolute_paths() {
        let temp_dir = TempDir::new().unwrap();
        let result = resolve_media_path(temp_dir.path(), "/etc/passwd", &exts());
        assert_eq!(result, Err(MediaError::Traversal));
    }

    #[test]
    fn test_resolve_missing_and_disallowed_are_not_found() {
        let temp_dir = TempDir::new().unwrap();
        StdFile::create(temp_dir.path().join("notes.txt")).unwrap();

        assert_eq!(
            resolve_media_path(temp_dir.path(), "ghost.mp3", &exts()),
            Err(MediaError::NotFound)
        );
        assert_eq!(
            resolve_media_path(temp_dir.path(), "notes.txt", &exts()),
            Err(MediaError::NotFound)
        );
    }

    #[test]
    fn test_resolve_allows_nested_audio() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("vo/astro")).unwrap();
        StdFile::create(temp_dir.path().join("vo/astro/line.mp3")).unwrap();

        let resolved = resolve_media_path(temp_dir.path(), "vo/astro/line.mp3", &exts()).unwrap();
        assert!(resolved.ends_with("vo/astro/line.mp3"));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        StdFile::create(outside.path().join("secret.mp3")).unwrap();

        let root = TempDir::new().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.mp3"),
            root.path().join("link.mp3"),
        )
        .unwrap();

        let result = resolve_media_path(root.path(), "link.mp3", &exts());
        assert_eq!(result, Err(MediaError::Traversal));
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a.mp3")), "audio/mpeg");
        assert_eq!(content_type_for(Path::new("a.OGG")), "audio/ogg");
        assert_eq!(content_type_for(Path::new("a.flac")), "audio/flac");
        assert_eq!(content_type_for(Path::new("a.bin")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_serve_full_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.mp3");
        let mut f = StdFile::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();

        let resp = serve_direct(&path, &HeaderMap::new()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "10");
        assert_eq!(resp.headers()[header::ACCEPT_RANGES], "bytes");
        assert!(resp.headers().contains_key(header::LAST_MODIFIED));
        assert_eq!(body_bytes(resp).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_serve_byte_range() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.mp3");
        let mut f = StdFile::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, "bytes=2-5".parse().unwrap());

        let resp = serve_direct(&path, &headers).await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "4");
        assert_eq!(body_bytes(resp).await, b"2345");
    }

    #[tokio::test]
    async fn test_serve_open_ended_range() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.mp3");
        let mut f = StdFile::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, "bytes=7-".parse().unwrap());

        let resp = serve_direct(&path, &headers).await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes 7-9/10");
        assert_eq!(body_bytes(resp).await, b"789");
    }

    #[tokio::test]
    async fn test_serve_unsatisfiable_range() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.mp3");
        let mut f = StdFile::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, "bytes=50-60".parse().unwrap());

        let resp = serve_direct(&path, &headers).await;
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes */10");
    }

    #[tokio::test]
    async fn test_if_modified_since_yields_304() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.mp3");
        StdFile::create(&path).unwrap().write_all(b"data").unwrap();

        // Ask with the file's own Last-Modified; nothing newer to send
        let first = serve_direct(&path, &HeaderMap::new()).await;
        let last_modified = first.headers()[header::LAST_MODIFIED].clone();

        let mut headers = HeaderMap::new();
        headers.insert(header::IF_MODIFIED_SINCE, last_modified);

        let resp = serve_direct(&path, &headers).await;
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn test_stale_if_modified_since_yields_200() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.mp3");
        StdFile::create(&path).unwrap().write_all(b"data").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::IF_MODIFIED_SINCE,
            "Mon, 01 Jan 2001 00:00:00 GMT".parse().unwrap(),
        );

        let resp = serve_direct(&path, &headers).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
