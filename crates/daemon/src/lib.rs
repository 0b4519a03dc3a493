//! Wavebox Daemon
//!
//! Background service that indexes a media library, serves and transcodes
//! audio over HTTP, and manages the recording review workflow.

pub mod cache;
pub mod daemon;
pub mod library;
pub mod media;
pub mod scan;
pub mod server;
pub mod startup;
pub mod transcode;
pub mod uploads;

pub use wavebox_config as config;
pub use wavebox_config::Config;

pub use cache::DiskCache;
pub use daemon::{Daemon, DaemonError};
pub use library::{human_size, Library, LibraryStats};
pub use media::{content_type_for, resolve_media_path, serve_direct, MediaError};
pub use scan::{build_tree, is_allowed_file, MediaNode, NodeKind};
pub use server::{create_router, run_server, AppState, ServerError};
pub use startup::{parse_ffmpeg_version, probe_ffmpeg, run_startup_checks, StartupError};
pub use transcode::{
    build_ffmpeg_args, spawn_stream, TargetFormat, TranscodeCache, TranscodeParams,
    TranscodeStream,
};
pub use uploads::{RecordingStatus, UploadError, UploadRecord, UploadStatus, UploadStore};
