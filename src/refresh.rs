#![forbid(unsafe_code)]

//! Channel refresh engine.
//!
//! A refresh reconciles the platform's upload listing of one channel with the
//! videos already stored for it:
//!
//! * the listing is consumed newest-first and, unless forced, stops at the
//!   first id that is already known, so routine refreshes only touch new
//!   uploads;
//! * unseen ids are fetched in platform-sized batches and stored in a single
//!   transaction with the channel's automark as their initial state;
//! * existing videos are never rewritten, which keeps a second refresh with
//!   nothing new free of store mutations.
//!
//! Platform failures are contained per channel and reported through
//! [`RefreshOutcome::Failure`]. Store failures propagate as errors.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Automark, Channel, Video, VideoState, is_channel_id, validate_channel_id};
use crate::platform::{PlatformClient, PlatformError, RemoteVideo, VideoBatch};
use crate::store::Database;

pub const DEFAULT_PLATFORM_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Success,
    Failure { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshResult {
    pub channel_id: String,
    pub videos_added: usize,
    #[serde(flatten)]
    pub outcome: RefreshOutcome,
}

impl RefreshResult {
    fn success(channel_id: &str, videos_added: usize) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            videos_added,
            outcome: RefreshOutcome::Success,
        }
    }

    fn failure(channel_id: &str, reason: String) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            videos_added: 0,
            outcome: RefreshOutcome::Failure { reason },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RefreshOutcome::Success)
    }
}

/// Splits a failed reconciliation into the part that is contained per channel
/// and the part that must reach the caller.
enum ReconcileError {
    Platform(PlatformError),
    Store(Error),
}

impl From<PlatformError> for ReconcileError {
    fn from(err: PlatformError) -> Self {
        Self::Platform(err)
    }
}

impl From<Error> for ReconcileError {
    fn from(err: Error) -> Self {
        Self::Store(err)
    }
}

/// Cheap to clone; clones share the database, the platform client and the
/// per-channel locks.
#[derive(Clone)]
pub struct RefreshEngine {
    db: Arc<Database>,
    platform: Arc<dyn PlatformClient>,
    platform_timeout: Duration,
    channel_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RefreshEngine {
    pub fn new(db: Arc<Database>, platform: Arc<dyn PlatformClient>) -> Self {
        Self {
            db,
            platform,
            platform_timeout: DEFAULT_PLATFORM_TIMEOUT,
            channel_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Upper bound for a single platform request: one listing page, one
    /// metadata batch or one channel lookup. Long walks are not capped as a
    /// whole.
    pub fn with_platform_timeout(mut self, timeout: Duration) -> Self {
        self.platform_timeout = timeout;
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Reconciles one channel. Unknown channels are `NotFound`; platform
    /// trouble is reported inside the returned result.
    pub async fn refresh_channel(&self, channel_id: &str, force: bool) -> Result<RefreshResult> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;
        let Some(channel) = self.db.find_channel(channel_id).await? else {
            self.channel_locks.lock().remove(channel_id);
            return Err(Error::NotFound(format!("channel {channel_id}")));
        };

        match self.reconcile(&channel, force).await {
            Ok(videos_added) => {
                info!(channel_id, videos_added, force, "channel refreshed");
                Ok(RefreshResult::success(channel_id, videos_added))
            }
            Err(ReconcileError::Platform(err)) => {
                warn!(channel_id, error = %err, "channel refresh failed");
                Ok(RefreshResult::failure(channel_id, err.to_string()))
            }
            Err(ReconcileError::Store(err)) => Err(err),
        }
    }

    /// Refreshes every stored channel in turn. With `skip_failures` a failing
    /// channel is recorded and the loop carries on; without it the first
    /// failure aborts the remaining channels.
    pub async fn refresh_all(&self, force: bool, skip_failures: bool) -> Result<Vec<RefreshResult>> {
        let channels = self.db.list_channels().await?;
        let mut results = Vec::with_capacity(channels.len());

        for channel in channels {
            let result = match self.refresh_channel(&channel.id, force).await {
                Ok(result) => result,
                // Deleted while the loop was running.
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if let RefreshOutcome::Failure { reason } = &result.outcome
                && !skip_failures
            {
                return Err(Error::RefreshAborted {
                    channel_id: result.channel_id,
                    reason: reason.clone(),
                });
            }
            results.push(result);
        }

        let failed = results.iter().filter(|result| !result.is_success()).count();
        let added: usize = results.iter().map(|result| result.videos_added).sum();
        info!(
            channels = results.len(),
            failed, videos_added = added, force, "refresh of all channels finished"
        );
        Ok(results)
    }

    /// Adds a channel by id or by user name/handle. An existing channel is
    /// returned unchanged. With `fetch_videos` a forced refresh runs before
    /// returning; its failure is logged and does not undo the add.
    pub async fn add_channel(&self, id_or_handle: &str, fetch_videos: bool) -> Result<Channel> {
        let input = id_or_handle.trim();
        if input.is_empty() {
            return Err(Error::InvalidChannelId(String::new()));
        }

        let channel_id = if is_channel_id(input) {
            input.to_string()
        } else {
            let handle = input.to_string();
            let resolved = self
                .call_platform(move |platform| platform.resolve_handle(&handle))
                .await
                .map_err(lookup_error)?;
            debug!(handle = input, channel_id = %resolved, "resolved channel handle");
            resolved
        };
        validate_channel_id(&channel_id)?;

        if let Some(existing) = self.db.find_channel(&channel_id).await? {
            return Ok(existing);
        }

        let lookup_id = channel_id.clone();
        let name = self
            .call_platform(move |platform| platform.channel_name(&lookup_id))
            .await
            .map_err(lookup_error)?;
        let channel = self.db.get_or_create_channel(&channel_id, &name).await?;
        info!(channel_id = %channel.id, name = %channel.name, "channel added");

        if !fetch_videos {
            return Ok(channel);
        }
        let result = self.refresh_channel(&channel_id, true).await?;
        if let RefreshOutcome::Failure { reason } = &result.outcome {
            warn!(channel_id = %channel_id, %reason, "initial refresh of new channel failed");
        }
        self.db.get_channel(&channel_id).await
    }

    /// Stores a single video outside of channel reconciliation. The owning
    /// channel is created when unknown; a video that already exists is
    /// returned as stored.
    pub async fn insert_video(&self, video_id: &str) -> Result<Video> {
        let video_id = video_id.trim();
        if video_id.is_empty() {
            return Err(Error::NotFound("video with empty id".into()));
        }
        if let Some(existing) = self.db.find_video(video_id).await? {
            return Ok(existing);
        }

        let ids = vec![video_id.to_string()];
        let batch = self
            .call_platform(move |platform| platform.fetch_video_metadata(&ids))
            .await
            .map_err(lookup_error)?;
        log_malformed(None, &batch);
        let remote = batch
            .videos
            .into_iter()
            .find(|video| video.id == video_id)
            .ok_or_else(|| Error::NotFound(format!("video {video_id}")))?;

        self.db
            .get_or_create_channel(&remote.channel_id, &remote.channel_name)
            .await?;
        let video = stored_video(&remote, &remote.channel_id, VideoState::default());
        self.db.insert_videos(&[video]).await?;
        info!(video_id, channel_id = %remote.channel_id, "video inserted");
        self.db.get_video(video_id).await
    }

    /// Deletes the channel and its videos once no refresh of it is running.
    pub async fn delete_channel(&self, channel_id: &str) -> Result<u64> {
        let lock = self.channel_lock(channel_id);
        let removed = {
            let _guard = lock.lock().await;
            self.db.delete_channel(channel_id).await?
        };
        self.channel_locks.lock().remove(channel_id);
        info!(channel_id, videos_removed = removed, "channel deleted");
        Ok(removed)
    }

    pub async fn set_state(&self, video_id: &str, state: &str) -> Result<Video> {
        let state: VideoState = state.parse()?;
        self.db.set_state(video_id, state).await?;
        self.db.get_video(video_id).await
    }

    pub async fn set_automark(&self, channel_id: &str, automark: &str) -> Result<Channel> {
        let automark: Automark = automark.parse()?;
        self.db.set_automark(channel_id, automark).await?;
        self.db.get_channel(channel_id).await
    }

    pub async fn set_queuefile_extension(
        &self,
        channel_id: &str,
        extension: &str,
    ) -> Result<Channel> {
        self.db
            .set_queuefile_extension(channel_id, Some(extension))
            .await?;
        self.db.get_channel(channel_id).await
    }

    async fn reconcile(&self, channel: &Channel, force: bool) -> Result<usize, ReconcileError> {
        let known = self.db.known_video_ids(&channel.id).await?;

        let unseen = self.collect_unseen(&channel.id, &known, force).await?;
        if unseen.is_empty() {
            return Ok(0);
        }
        debug!(channel_id = %channel.id, unseen = unseen.len(), "fetching metadata");

        let batch = self.fetch_in_batches(&unseen).await?;
        log_malformed(Some(&channel.id), &batch);

        let state = channel.automark.initial_state();
        let videos: Vec<Video> = batch
            .videos
            .iter()
            .map(|remote| stored_video(remote, &channel.id, state))
            .collect();
        let added = self.db.insert_videos(&videos).await?;

        if let Some(newest) = batch.videos.first()
            && !newest.channel_name.is_empty()
            && newest.channel_name != channel.name
        {
            info!(
                channel_id = %channel.id,
                old = %channel.name,
                new = %newest.channel_name,
                "channel renamed on platform"
            );
            self.db
                .set_channel_name(&channel.id, &newest.channel_name)
                .await?;
        }

        Ok(added)
    }

    /// Walks the listing newest-first. Without `force` the walk ends at the
    /// first known id; with it the whole listing is read and known ids are
    /// skipped.
    ///
    /// The iterator lives on a blocking task and advances one id per request,
    /// so no page is fetched past the point where the walk stops. Each request
    /// gets its own timeout, which bounds every page fetch while a long
    /// history can still be walked in full.
    async fn collect_unseen(
        &self,
        channel_id: &str,
        known: &HashSet<String>,
        force: bool,
    ) -> Result<Vec<String>, PlatformError> {
        let (want_tx, mut want_rx) = tokio::sync::mpsc::channel::<()>(1);
        let (item_tx, mut item_rx) =
            tokio::sync::mpsc::channel::<Option<Result<String, PlatformError>>>(1);
        let platform = Arc::clone(&self.platform);
        let listing_id = channel_id.to_string();
        let walker = tokio::task::spawn_blocking(move || {
            let mut uploads = match platform.list_uploads(&listing_id) {
                Ok(uploads) => uploads,
                Err(err) => {
                    let _ = item_tx.blocking_send(Some(Err(err)));
                    return;
                }
            };
            while want_rx.blocking_recv().is_some() {
                let item = uploads.next();
                let last = !matches!(item, Some(Ok(_)));
                if item_tx.blocking_send(item).is_err() || last {
                    return;
                }
            }
        });

        let mut unseen = Vec::new();
        let mut queued = HashSet::new();
        loop {
            // A closed request channel means the walker already sent its
            // final item.
            let _ = want_tx.send(()).await;
            let video_id = match tokio::time::timeout(self.platform_timeout, item_rx.recv()).await {
                Ok(Some(Some(item))) => item?,
                Ok(Some(None)) => break,
                Ok(None) => {
                    walker
                        .await
                        .map_err(|err| PlatformError::Task(err.to_string()))?;
                    break;
                }
                Err(_) => return Err(PlatformError::Timeout(self.platform_timeout)),
            };
            if known.contains(&video_id) {
                if force {
                    continue;
                }
                break;
            }
            if queued.insert(video_id.clone()) {
                unseen.push(video_id);
            }
        }
        Ok(unseen)
    }

    /// One platform call, with its own timeout, per batch.
    async fn fetch_in_batches(&self, video_ids: &[String]) -> Result<VideoBatch, PlatformError> {
        let mut combined = VideoBatch::default();
        for chunk in video_ids.chunks(self.platform.batch_limit().max(1)) {
            let ids = chunk.to_vec();
            let batch = self
                .call_platform(move |platform| platform.fetch_video_metadata(&ids))
                .await?;
            combined.videos.extend(batch.videos);
            combined.malformed.extend(batch.malformed);
        }
        Ok(combined)
    }

    /// Runs a blocking platform call off the async runtime, bounded by the
    /// engine's timeout. No store lock is held while it runs.
    async fn call_platform<T, F>(&self, call: F) -> Result<T, PlatformError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PlatformClient) -> Result<T, PlatformError> + Send + 'static,
    {
        let platform = Arc::clone(&self.platform);
        let task = tokio::task::spawn_blocking(move || call(platform.as_ref()));
        match tokio::time::timeout(self.platform_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(PlatformError::Task(join_err.to_string())),
            Err(_) => Err(PlatformError::Timeout(self.platform_timeout)),
        }
    }

    fn channel_lock(&self, channel_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.channel_locks
            .lock()
            .entry(channel_id.to_string())
            .or_default()
            .clone()
    }
}

fn stored_video(remote: &RemoteVideo, channel_id: &str, state: VideoState) -> Video {
    Video {
        id: remote.id.clone(),
        channel_id: channel_id.to_string(),
        title: remote.title.clone(),
        description: remote.description.clone(),
        author_name: remote.channel_name.clone(),
        published: remote.published,
        duration: remote.duration,
        views: remote.views,
        thumbnail: remote.thumbnail.clone(),
        state,
    }
}

fn log_malformed(channel_id: Option<&str>, batch: &VideoBatch) {
    if !batch.malformed.is_empty() {
        warn!(
            channel_id = channel_id.unwrap_or("-"),
            count = batch.malformed.len(),
            video_ids = ?batch.malformed,
            "dropped malformed video records"
        );
    }
}

fn lookup_error(err: PlatformError) -> Error {
    match err {
        PlatformError::NotFound(what) => Error::NotFound(what),
        other => Error::Platform(other),
    }
}
