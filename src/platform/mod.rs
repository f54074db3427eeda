#![forbid(unsafe_code)]

//! Contract the refresh engine needs from the media platform.
//!
//! Implementations are blocking: the engine runs them on
//! `tokio::task::spawn_blocking` and bounds every request (a listing page or a
//! metadata batch) with its own timeout, so nothing here needs to know about
//! the async runtime.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod memory;
pub mod youtube;

pub use memory::MemoryPlatform;
pub use youtube::YoutubeClient;

/// Maximum number of ids the YouTube Data API accepts per `videos.list` call.
pub const DEFAULT_BATCH_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("{0} not found on platform")]
    NotFound(String),

    #[error("platform returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("could not decode platform response: {0}")]
    Decode(String),

    #[error("platform call timed out after {0:?}")]
    Timeout(Duration),

    #[error("batch of {size} ids exceeds the platform limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("platform task failed: {0}")]
    Task(String),
}

/// Video metadata as reported by the platform, before it gets a workflow state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVideo {
    pub id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub title: String,
    pub description: String,
    pub published: DateTime<Utc>,
    pub duration: i64,
    pub views: i64,
    pub thumbnail: String,
}

/// Result of a metadata fetch. Records the platform sent back without the
/// required fields land in `malformed` instead of failing the whole batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoBatch {
    pub videos: Vec<RemoteVideo>,
    pub malformed: Vec<String>,
}

/// Lazily paginated upload listing, newest first.
pub type UploadIter<'a> = Box<dyn Iterator<Item = Result<String, PlatformError>> + 'a>;

pub trait PlatformClient: Send + Sync + 'static {
    /// Turns a user name or `@handle` into a channel id.
    fn resolve_handle(&self, handle: &str) -> Result<String, PlatformError>;

    /// Current display name of a channel.
    fn channel_name(&self, channel_id: &str) -> Result<String, PlatformError>;

    /// Uploaded video ids, newest first. Pages are fetched on demand; dropping
    /// the iterator stops pagination.
    fn list_uploads<'a>(&'a self, channel_id: &str) -> Result<UploadIter<'a>, PlatformError>;

    /// Metadata for at most [`PlatformClient::batch_limit`] ids. Callers chunk
    /// larger sets themselves.
    fn fetch_video_metadata(&self, video_ids: &[String]) -> Result<VideoBatch, PlatformError>;

    fn batch_limit(&self) -> usize {
        DEFAULT_BATCH_LIMIT
    }
}
