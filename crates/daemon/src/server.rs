//! HTTP surface of the daemon: library browsing, streaming and the
//! recording review endpoints.
//!
//! Every failure serializes as `{"ok": false, "error": "..."}` with the
//! status code carrying the category. Caller identity is the opaque
//! `X-User-Id` header; privileged endpoints compare it against the
//! configured owner id, and an empty owner id disables them outright.

use axum::body::Body;
use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::seq::IndexedRandom;
use serde::Deserialize;
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::library::{Library, LibraryStats, FILES_KEY, STATS_KEY, TREE_KEY};
use crate::media::{self, MediaError};
use crate::scan::{self, MediaNode};
use crate::transcode::{self, TargetFormat, TranscodeCache, TranscodeParams};
use crate::uploads::{self, RecordingStatus, UploadError, UploadStore};
use wavebox_config::Config;

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared state behind every request handler.
pub struct AppState {
    pub config: Config,
    pub library: Arc<Library>,
    pub uploads: Arc<UploadStore>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let library = Arc::new(Library::new(&config));
        let uploads = Arc::new(UploadStore::new(&config));
        Self {
            config,
            library,
            uploads,
        }
    }
}

/// Creates the axum router with all daemon endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/tree", get(api_tree))
        .route("/api/stats", get(api_stats))
        .route("/api/random", get(api_random))
        .route("/api/cache-status", get(api_cache_status))
        .route("/api/cache/clear", post(api_cache_clear))
        .route("/api/cache/evict", post(api_cache_evict))
        .route("/api/upload", post(api_upload))
        .route("/api/accept", post(api_accept))
        .route("/api/reject", post(api_reject))
        .route("/api/exists", get(api_exists))
        .route("/media/*path", get(serve_media))
        .route("/stream/*path", get(serve_stream))
        .with_state(state)
}

/// Runs the HTTP server until it shuts down or fails to bind.
pub async fn run_server(state: Arc<AppState>, bind_addr: &str) -> Result<(), ServerError> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "http server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "ok": false, "error": message }))).into_response()
}

fn caller_id(headers: &HeaderMap) -> String {
    headers
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

/// Owner gate for review endpoints. An empty configured owner id means
/// nobody passes.
fn require_owner(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let owner_id = &state.config.server.owner_id;
    let caller = headers
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if owner_id.is_empty() || caller != owner_id {
        return Err(error_json(StatusCode::FORBIDDEN, "Forbidden"));
    }
    Ok(())
}

fn media_error_response(e: MediaError) -> Response {
    match e {
        MediaError::Traversal => error_json(StatusCode::FORBIDDEN, "Forbidden"),
        MediaError::NotFound => error_json(StatusCode::NOT_FOUND, "Not found"),
    }
}

fn upload_error_response(e: UploadError) -> Response {
    let status = match e {
        UploadError::Traversal => StatusCode::FORBIDDEN,
        UploadError::Conflict => StatusCode::CONFLICT,
        UploadError::Unsupported => StatusCode::BAD_REQUEST,
        UploadError::NotFound => StatusCode::NOT_FOUND,
        UploadError::Conversion | UploadError::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_json(status, &e.to_string())
}

/// Resolves a subtree path for the tree API. Unlike file resolution this
/// accepts directories; existence is checked by the caller.
fn resolve_subtree(root: &Path, rel: &str) -> Result<PathBuf, MediaError> {
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
    Ok(full)
}

#[derive(Deserialize)]
struct TreeQuery {
    #[serde(default)]
    path: String,
}

async fn api_tree(State(state): State<Arc<AppState>>, Query(q): Query<TreeQuery>) -> Response {
    let rel = q.path.trim_matches('/').to_string();
    let key = if rel.is_empty() {
        TREE_KEY.to_string()
    } else {
        format!("tree_{}", rel)
    };

    if let Some(node) = state.library.cache().get::<MediaNode>(&key) {
        return Json(node).into_response();
    }

    let node = if rel.is_empty() {
        scan::build_tree(state.library.media_root(), "", state.library.allowed_exts())
    } else {
        match resolve_subtree(state.library.media_root(), &rel) {
            Err(MediaError::Traversal) => MediaNode::dir("invalid", rel.as_str()),
            Err(MediaError::NotFound) => MediaNode::dir("missing", rel.as_str()),
            Ok(dir) if !dir.is_dir() => MediaNode::dir("missing", rel.as_str()),
            Ok(dir) => scan::build_tree(&dir, &rel, state.library.allowed_exts()),
        }
    };
    state.library.cache().set(&key, &node);
    Json(node).into_response()
}

async fn api_stats(State(state): State<Arc<AppState>>) -> Response {
    if let Some(stats) = state.library.cache().get::<LibraryStats>(STATS_KEY) {
        return Json(stats).into_response();
    }
    state.library.ensure_built().await;
    match state.library.cache().get::<LibraryStats>(STATS_KEY) {
        Some(stats) => Json(stats).into_response(),
        None => error_json(StatusCode::INTERNAL_SERVER_ERROR, "Cache unavailable"),
    }
}

async fn api_random(State(state): State<Arc<AppState>>) -> Response {
    let mut files = state.library.cache().get::<Vec<String>>(FILES_KEY);
    if files.is_none() {
        state.library.ensure_built().await;
        files = state.library.cache().get::<Vec<String>>(FILES_KEY);
    }
    match files.unwrap_or_default().choose(&mut rand::rng()) {
        Some(path) => Json(json!({ "ok": true, "path": path })).into_response(),
        None => error_json(StatusCode::NOT_FOUND, "No files"),
    }
}

async fn api_cache_status(State(state): State<Arc<AppState>>) -> Response {
    let cache = state.library.cache();
    Json(json!({
        "last_hash": state.library.last_hash().await,
        "tree_cached": cache.contains(TREE_KEY),
        "stats_cached": cache.contains(STATS_KEY),
        "files_cached": cache.contains(FILES_KEY),
        "pending_uploads": state.uploads.pending_count().await,
        "media_root": state.library.media_root().display().to_string(),
        "cache_dir": cache.dir().display().to_string(),
    }))
    .into_response()
}

async fn api_cache_clear(State(state): State<Arc<AppState>>) -> Response {
    let cleared = state.library.cache().clear_all();
    info!(cleared, "cache cleared by operator");
    Json(json!({ "ok": true, "cleared": cleared })).into_response()
}

#[derive(Deserialize)]
struct EvictBody {
    key: Option<String>,
}

async fn api_cache_evict(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EvictBody>,
) -> Response {
    let Some(key) = body.key.filter(|k| !k.is_empty()) else {
        return error_json(StatusCode::BAD_REQUEST, "Missing key");
    };
    let removed = state.library.cache().delete(&key);
    Json(json!({ "ok": true, "removed": removed })).into_response()
}

async fn serve_media(
    State(state): State<Arc<AppState>>,
    UrlPath(rel): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    match media::resolve_media_path(state.library.media_root(), &rel, state.library.allowed_exts())
    {
        Ok(path) => media::serve_direct(&path, &headers).await,
        Err(e) => media_error_response(e),
    }
}

#[derive(Deserialize)]
struct StreamQuery {
    #[serde(default)]
    normalize: String,
}

async fn serve_stream(
    State(state): State<Arc<AppState>>,
    UrlPath(rel): UrlPath<String>,
    Query(q): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let src = match media::resolve_media_path(
        state.library.media_root(),
        &rel,
        state.library.allowed_exts(),
    ) {
        Ok(path) => path,
        Err(e) => return media_error_response(e),
    };

    let normalize = q.normalize == "1";
    let gateway = &state.config.transcode;
    if !gateway.enabled {
        return media::serve_direct(&src, &headers).await;
    }

    let target = TargetFormat::for_source(&src);
    // An mp3 source with no processing requested needs no encoder at all
    if target == TargetFormat::Mp3 && !normalize {
        return media::serve_direct(&src, &headers).await;
    }

    let params = TranscodeParams {
        src: src.clone(),
        normalize,
        target,
        bitrate: gateway.bitrate.clone(),
        sample_rate_hz: gateway.sample_rate_hz,
    };

    let cache = TranscodeCache::new(Path::new(&state.config.cache.dir));
    let key = gateway
        .cache_outputs
        .then(|| TranscodeCache::key(&params))
        .flatten();
    if let Some(key) = &key {
        if let Some(cached) = cache.lookup(key, target) {
            return transcoded_file_response(&cached, target, normalize).await;
        }
    }

    let stream = match transcode::spawn_stream(&gateway.ffmpeg_path, &params) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, path = %src.display(), "encoder unavailable, serving source directly");
            return media::serve_direct(&src, &headers).await;
        }
    };

    let persist = key.map(|k| (cache, k, target));
    let body = transcode::stream_body(stream, persist);
    transcoded_response(body, target, normalize)
}

/// Replays a previously cached transcode output.
async fn transcoded_file_response(path: &Path, target: TargetFormat, normalize: bool) -> Response {
    match tokio::fs::File::open(path).await {
        Ok(file) => transcoded_response(Body::from_stream(ReaderStream::new(file)), target, normalize),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cached transcode unreadable");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Cache unavailable")
        }
    }
}

fn transcoded_response(body: Body, target: TargetFormat, normalize: bool) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, target.mime())
        .header("X-Transcoded", "1");
    if normalize {
        builder = builder.header("X-Normalized", "1");
    }
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn api_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let user = caller_id(&headers);
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename = String::new();
    let mut requested_path: Option<String> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        match field.name() {
            Some("file") => {
                filename = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(bytes) => file_bytes = Some(bytes.to_vec()),
                    Err(e) => {
                        warn!(error = %e, "upload body read failed");
                        return error_json(StatusCode::BAD_REQUEST, "Malformed upload");
                    }
                }
            }
            Some("path") => requested_path = field.text().await.ok(),
            _ => {}
        }
    }

    let (Some(bytes), Some(path)) = (file_bytes, requested_path) else {
        return error_json(StatusCode::BAD_REQUEST, "Missing file or path");
    };

    match state.uploads.submit(&path, &bytes, &filename, &user).await {
        Ok(entry) => Json(json!({ "ok": true, "entry": entry })).into_response(),
        Err(e) => upload_error_response(e),
    }
}

#[derive(Deserialize)]
struct IdBody {
    id: Option<String>,
}

async fn api_accept(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IdBody>,
) -> Response {
    if let Err(resp) = require_owner(&state, &headers) {
        return resp;
    }
    let Some(id) = body.id.filter(|i| !i.is_empty()) else {
        return error_json(StatusCode::BAD_REQUEST, "Missing id");
    };
    match state.uploads.accept(&id).await {
        Ok(entry) => Json(json!({ "ok": true, "entry": entry })).into_response(),
        Err(e) => upload_error_response(e),
    }
}

async fn api_reject(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IdBody>,
) -> Response {
    if let Err(resp) = require_owner(&state, &headers) {
        return resp;
    }
    let Some(id) = body.id.filter(|i| !i.is_empty()) else {
        return error_json(StatusCode::BAD_REQUEST, "Missing id");
    };
    match state.uploads.reject(&id).await {
        Ok(removed) => Json(json!({ "ok": true, "removed": removed })).into_response(),
        Err(e) => upload_error_response(e),
    }
}

#[derive(Deserialize)]
struct ExistsQuery {
    path: Option<String>,
}

async fn api_exists(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ExistsQuery>,
) -> Response {
    let Some(path) = q.path.filter(|p| !p.is_empty()) else {
        return error_json(StatusCode::BAD_REQUEST, "Missing path");
    };
    let canonical = match uploads::canonical_stored_rel(&path) {
        Ok(canonical) => canonical,
        Err(e) => return upload_error_response(e),
    };
    match state.uploads.check_status(&path).await {
        Ok(status) => Json(json!({
            "ok": true,
            "exists": status != RecordingStatus::Missing,
            "status": status,
            "path": canonical,
        }))
        .into_response(),
        Err(e) => upload_error_response(e),
    }
}
