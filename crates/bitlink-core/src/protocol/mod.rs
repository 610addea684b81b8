//! Chunked request/reply download protocol.

pub mod constants;
pub mod download;

pub use download::{ControlWrite, DownloadEngine, DownloadError, DownloadState, ReplyOutcome};
