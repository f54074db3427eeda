#![forbid(unsafe_code)]

//! In-process platform used by the test suites and for offline runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    DEFAULT_BATCH_LIMIT, PlatformClient, PlatformError, RemoteVideo, UploadIter, VideoBatch,
};

const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Default)]
struct MemoryChannel {
    name: String,
    /// Newest first.
    uploads: Vec<RemoteVideo>,
}

#[derive(Debug, Default)]
struct MemoryState {
    channels: HashMap<String, MemoryChannel>,
    handles: HashMap<String, String>,
    failing: HashSet<String>,
    malformed: HashSet<String>,
    page_delay: Duration,
}

/// Thread-safe fake that serves uploads from memory and counts how much of
/// the listing was consumed.
#[derive(Debug)]
pub struct MemoryPlatform {
    state: Mutex<MemoryState>,
    page_size: usize,
    pages_served: AtomicUsize,
    metadata_calls: AtomicUsize,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            page_size: page_size.max(1),
            pages_served: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
        }
    }

    pub fn add_channel(&self, channel_id: &str, name: &str) {
        let mut state = self.state.lock();
        state
            .channels
            .entry(channel_id.to_string())
            .or_default()
            .name = name.to_string();
    }

    pub fn add_handle(&self, handle: &str, channel_id: &str) {
        self.state
            .lock()
            .handles
            .insert(handle.to_string(), channel_id.to_string());
    }

    /// Publishes a new upload; it becomes the newest entry of the listing.
    pub fn publish(&self, video: RemoteVideo) {
        let mut state = self.state.lock();
        let channel = state.channels.entry(video.channel_id.clone()).or_default();
        if channel.name.is_empty() {
            channel.name = video.channel_name.clone();
        }
        channel.uploads.insert(0, video);
    }

    pub fn rename_channel(&self, channel_id: &str, name: &str) {
        let mut state = self.state.lock();
        if let Some(channel) = state.channels.get_mut(channel_id) {
            channel.name = name.to_string();
            for video in &mut channel.uploads {
                video.channel_name = name.to_string();
            }
        }
    }

    /// Every call touching this channel fails with a transport error.
    pub fn fail_channel(&self, channel_id: &str) {
        self.state.lock().failing.insert(channel_id.to_string());
    }

    pub fn heal_channel(&self, channel_id: &str) {
        self.state.lock().failing.remove(channel_id);
    }

    /// The metadata of this video will come back without required fields.
    pub fn mark_malformed(&self, video_id: &str) {
        self.state.lock().malformed.insert(video_id.to_string());
    }

    /// Every listing page takes this long to arrive.
    pub fn set_page_delay(&self, delay: Duration) {
        self.state.lock().page_delay = delay;
    }

    pub fn pages_served(&self) -> usize {
        self.pages_served.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self, state: &MemoryState, channel_id: &str) -> Result<(), PlatformError> {
        if state.failing.contains(channel_id) {
            return Err(PlatformError::Transport(format!(
                "connection reset while talking about {channel_id}"
            )));
        }
        Ok(())
    }
}

impl PlatformClient for MemoryPlatform {
    fn resolve_handle(&self, handle: &str) -> Result<String, PlatformError> {
        let state = self.state.lock();
        let key = handle.trim().trim_start_matches('@');
        state
            .handles
            .iter()
            .find(|(known, _)| known.trim_start_matches('@').eq_ignore_ascii_case(key))
            .map(|(_, channel_id)| channel_id.clone())
            .ok_or_else(|| PlatformError::NotFound(handle.to_string()))
    }

    fn channel_name(&self, channel_id: &str) -> Result<String, PlatformError> {
        let state = self.state.lock();
        self.check_available(&state, channel_id)?;
        state
            .channels
            .get(channel_id)
            .map(|channel| channel.name.clone())
            .ok_or_else(|| PlatformError::NotFound(channel_id.to_string()))
    }

    fn list_uploads<'a>(&'a self, channel_id: &str) -> Result<UploadIter<'a>, PlatformError> {
        let state = self.state.lock();
        self.check_available(&state, channel_id)?;
        let ids: Vec<String> = state
            .channels
            .get(channel_id)
            .map(|channel| channel.uploads.iter().map(|video| video.id.clone()).collect())
            .ok_or_else(|| PlatformError::NotFound(channel_id.to_string()))?;
        let page_delay = state.page_delay;
        Ok(Box::new(MemoryPages {
            platform: self,
            ids,
            page_delay,
            cursor: 0,
            served_until: 0,
        }))
    }

    fn fetch_video_metadata(&self, video_ids: &[String]) -> Result<VideoBatch, PlatformError> {
        if video_ids.len() > DEFAULT_BATCH_LIMIT {
            return Err(PlatformError::BatchTooLarge {
                size: video_ids.len(),
                limit: DEFAULT_BATCH_LIMIT,
            });
        }
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let mut batch = VideoBatch::default();
        for video_id in video_ids {
            let Some(video) = state
                .channels
                .values()
                .flat_map(|channel| channel.uploads.iter())
                .find(|video| &video.id == video_id)
            else {
                continue;
            };
            self.check_available(&state, &video.channel_id)?;
            if state.malformed.contains(video_id) {
                batch.malformed.push(video_id.clone());
            } else {
                batch.videos.push(video.clone());
            }
        }
        Ok(batch)
    }
}

/// Serves a snapshot of the listing in pages, counting each page boundary
/// crossed so tests can assert how much of the history was read.
struct MemoryPages<'a> {
    platform: &'a MemoryPlatform,
    ids: Vec<String>,
    page_delay: Duration,
    cursor: usize,
    served_until: usize,
}

impl Iterator for MemoryPages<'_> {
    type Item = Result<String, PlatformError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.ids.len() {
            return None;
        }
        if self.cursor == self.served_until {
            if !self.page_delay.is_zero() {
                std::thread::sleep(self.page_delay);
            }
            self.platform.pages_served.fetch_add(1, Ordering::SeqCst);
            self.served_until = (self.cursor + self.platform.page_size).min(self.ids.len());
        }
        let id = self.ids[self.cursor].clone();
        self.cursor += 1;
        Some(Ok(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn remote(id: &str, channel_id: &str) -> RemoteVideo {
        RemoteVideo {
            id: id.into(),
            channel_id: channel_id.into(),
            channel_name: "Chan".into(),
            title: format!("Video {id}"),
            description: String::new(),
            published: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            duration: 60,
            views: 1,
            thumbnail: "thumb.jpg".into(),
        }
    }

    #[test]
    fn listing_is_newest_first_and_paged_lazily() {
        let platform = MemoryPlatform::with_page_size(2);
        for id in ["a", "b", "c", "d", "e"] {
            platform.publish(remote(id, "UCchan"));
        }

        let first_three: Vec<String> = platform
            .list_uploads("UCchan")
            .unwrap()
            .take(3)
            .map(Result::unwrap)
            .collect();
        assert_eq!(first_three, vec!["e", "d", "c"]);
        assert_eq!(platform.pages_served(), 2);
    }

    #[test]
    fn failing_channel_reports_transport_error() {
        let platform = MemoryPlatform::new();
        platform.publish(remote("a", "UCchan"));
        platform.fail_channel("UCchan");
        assert!(matches!(
            platform.list_uploads("UCchan").err(),
            Some(PlatformError::Transport(_))
        ));
        platform.heal_channel("UCchan");
        assert!(platform.list_uploads("UCchan").is_ok());
    }

    #[test]
    fn handles_resolve_with_or_without_at_sign() {
        let platform = MemoryPlatform::new();
        platform.add_handle("SomeUser", "UCresolved");
        assert_eq!(platform.resolve_handle("someuser").unwrap(), "UCresolved");
        assert_eq!(platform.resolve_handle("@SomeUser").unwrap(), "UCresolved");
        assert!(matches!(
            platform.resolve_handle("nobody"),
            Err(PlatformError::NotFound(_))
        ));
    }

    #[test]
    fn malformed_videos_are_reported_separately() {
        let platform = MemoryPlatform::new();
        platform.publish(remote("good", "UCchan"));
        platform.publish(remote("bad", "UCchan"));
        platform.mark_malformed("bad");
        let batch = platform
            .fetch_video_metadata(&["good".into(), "bad".into()])
            .unwrap();
        assert_eq!(batch.videos.len(), 1);
        assert_eq!(batch.malformed, vec!["bad".to_string()]);
    }
}
