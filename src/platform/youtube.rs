#![forbid(unsafe_code)]

//! YouTube Data API v3 client.
//!
//! Uses the uploads playlist (`playlistItems.list`, one quota unit per page)
//! plus `videos.list` for metadata instead of `search.list`.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    DEFAULT_BATCH_LIMIT, PlatformClient, PlatformError, RemoteVideo, UploadIter, VideoBatch,
};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const PAGE_SIZE: &str = "50";
const UNTITLED: &str = "[untitled]";

#[derive(Debug, Deserialize)]
struct ChannelListResponse {
    #[serde(default)]
    items: Vec<ChannelItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelItem {
    id: String,
    snippet: Option<ChannelSnippet>,
    content_details: Option<ChannelContentDetails>,
}

#[derive(Debug, Deserialize)]
struct ChannelSnippet {
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelContentDetails {
    related_playlists: RelatedPlaylists,
}

#[derive(Debug, Deserialize)]
struct RelatedPlaylists {
    uploads: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsResponse {
    next_page_token: Option<String>,
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    content_details: PlaylistItemContentDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemContentDetails {
    video_id: String,
    video_published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

/// Every field is optional so one incomplete record can be reported as
/// malformed without rejecting the whole response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    id: Option<String>,
    snippet: Option<VideoSnippet>,
    content_details: Option<VideoContentDetails>,
    statistics: Option<VideoStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    published_at: Option<String>,
    channel_id: Option<String>,
    channel_title: Option<String>,
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    thumbnails: BTreeMap<String, Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
    width: Option<u64>,
    height: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct VideoContentDetails {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
}

impl VideoItem {
    fn into_remote(self) -> Option<RemoteVideo> {
        let snippet = self.snippet?;
        let published = parse_published(snippet.published_at.as_deref()?)?;
        let duration = parse_iso8601_duration(self.content_details?.duration.as_deref()?)?;
        let views = self.statistics?.view_count?.parse::<i64>().ok()?;
        let thumbnail = best_thumbnail(&snippet.thumbnails)?;
        let title = match snippet.title? {
            title if title.trim().is_empty() => UNTITLED.to_string(),
            title => title,
        };

        Some(RemoteVideo {
            id: self.id?,
            channel_id: snippet.channel_id?,
            channel_name: snippet.channel_title?,
            title,
            description: snippet.description.unwrap_or_default(),
            published,
            duration,
            views,
            thumbnail,
        })
    }
}

/// Blocking client; every request goes through one `ureq` agent with a fixed
/// timeout.
#[derive(Debug, Clone)]
pub struct YoutubeClient {
    agent: ureq::Agent,
    api_key: String,
    base_url: String,
}

impl YoutubeClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Self {
        Self::with_base_url(api_key, timeout, DEFAULT_API_BASE)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        timeout: Duration,
        base_url: impl Into<String>,
    ) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T, PlatformError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let mut request = self.agent.get(&url).query("key", &self.api_key);
        for (key, value) in query {
            request = request.query(key, value);
        }
        debug!(endpoint, "youtube api request");

        match request.call() {
            Ok(response) => response
                .into_json::<T>()
                .map_err(|err| PlatformError::Decode(err.to_string())),
            Err(ureq::Error::Status(status, response)) => Err(PlatformError::Http {
                status,
                message: response.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(transport)) => {
                Err(PlatformError::Transport(transport.to_string()))
            }
        }
    }

    fn first_channel(
        &self,
        part: &str,
        lookup: (&str, &str),
    ) -> Result<ChannelItem, PlatformError> {
        let response: ChannelListResponse =
            self.get_json("channels", &[("part", part), lookup])?;
        response
            .items
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::NotFound(lookup.1.to_string()))
    }

    fn uploads_playlist(&self, channel_id: &str) -> Result<String, PlatformError> {
        let channel = self.first_channel("contentDetails", ("id", channel_id))?;
        channel
            .content_details
            .and_then(|details| details.related_playlists.uploads)
            .ok_or_else(|| PlatformError::NotFound(format!("uploads playlist of {channel_id}")))
    }

    fn playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistItemsResponse, PlatformError> {
        let mut query = vec![
            ("part", "contentDetails"),
            ("maxResults", PAGE_SIZE),
            ("playlistId", playlist_id),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        self.get_json("playlistItems", &query)
    }
}

impl PlatformClient for YoutubeClient {
    fn resolve_handle(&self, handle: &str) -> Result<String, PlatformError> {
        let handle = handle.trim();
        let lookup = if handle.starts_with('@') {
            ("forHandle", handle)
        } else {
            ("forUsername", handle)
        };
        Ok(self.first_channel("id", lookup)?.id)
    }

    fn channel_name(&self, channel_id: &str) -> Result<String, PlatformError> {
        let channel = self.first_channel("snippet", ("id", channel_id))?;
        channel
            .snippet
            .map(|snippet| snippet.title)
            .ok_or_else(|| PlatformError::Decode(format!("channel {channel_id} has no snippet")))
    }

    fn list_uploads<'a>(&'a self, channel_id: &str) -> Result<UploadIter<'a>, PlatformError> {
        let playlist_id = self.uploads_playlist(channel_id)?;
        Ok(Box::new(PlaylistPages {
            client: self,
            playlist_id,
            page_token: None,
            buffer: VecDeque::new(),
            finished: false,
        }))
    }

    fn fetch_video_metadata(&self, video_ids: &[String]) -> Result<VideoBatch, PlatformError> {
        if video_ids.is_empty() {
            return Ok(VideoBatch::default());
        }
        if video_ids.len() > DEFAULT_BATCH_LIMIT {
            return Err(PlatformError::BatchTooLarge {
                size: video_ids.len(),
                limit: DEFAULT_BATCH_LIMIT,
            });
        }
        let ids = video_ids.join(",");
        let response: VideoListResponse = self.get_json(
            "videos",
            &[("part", "id,contentDetails,snippet,statistics"), ("id", &ids)],
        )?;
        Ok(parse_video_items(response.items))
    }
}

/// Walks the uploads playlist one page at a time. Only the current page is
/// buffered.
struct PlaylistPages<'a> {
    client: &'a YoutubeClient,
    playlist_id: String,
    page_token: Option<String>,
    buffer: VecDeque<String>,
    finished: bool,
}

impl Iterator for PlaylistPages<'_> {
    type Item = Result<String, PlatformError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(video_id) = self.buffer.pop_front() {
                return Some(Ok(video_id));
            }
            if self.finished {
                return None;
            }
            match self
                .client
                .playlist_page(&self.playlist_id, self.page_token.as_deref())
            {
                Ok(page) => {
                    self.page_token = page.next_page_token;
                    self.finished = self.page_token.is_none();
                    self.buffer.extend(newest_first(page.items));
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Playlist order follows insertion, so premieres and scheduled uploads can
/// sit out of place. Each page is re-sorted by publish date; undated items
/// keep their relative order at the end.
fn newest_first(items: Vec<PlaylistItem>) -> Vec<String> {
    let mut dated: Vec<(Option<DateTime<Utc>>, String)> = items
        .into_iter()
        .map(|item| {
            let details = item.content_details;
            let published = details
                .video_published_at
                .as_deref()
                .and_then(parse_published);
            (published, details.video_id)
        })
        .collect();
    dated.sort_by(|(left, _), (right, _)| match (left, right) {
        (Some(left), Some(right)) => right.cmp(left),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    dated.into_iter().map(|(_, video_id)| video_id).collect()
}

fn parse_video_items(items: Vec<serde_json::Value>) -> VideoBatch {
    let mut batch = VideoBatch::default();
    for item in items {
        let label = item
            .get("id")
            .and_then(|id| id.as_str())
            .unwrap_or("<missing id>")
            .to_string();
        match serde_json::from_value::<VideoItem>(item)
            .ok()
            .and_then(VideoItem::into_remote)
        {
            Some(video) => batch.videos.push(video),
            None => batch.malformed.push(label),
        }
    }
    batch
}

fn parse_published(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Older responses omit the offset: `2016-10-01T21:00:01.000`.
    let without_fraction = value.split('.').next().unwrap_or(value);
    NaiveDateTime::parse_from_str(without_fraction.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parses the `P#DT#H#M#S` subset YouTube emits into seconds.
pub fn parse_iso8601_duration(value: &str) -> Option<i64> {
    let rest = value.strip_prefix('P')?;
    let mut total = 0i64;
    let mut number = String::new();
    let mut in_time = false;
    let mut saw_component = false;

    for ch in rest.chars() {
        match ch {
            'T' if number.is_empty() => in_time = true,
            '0'..='9' => number.push(ch),
            unit => {
                let amount: i64 = number.parse().ok()?;
                number.clear();
                let factor = match (in_time, unit) {
                    (false, 'W') => 7 * 86_400,
                    (false, 'D') => 86_400,
                    (true, 'H') => 3_600,
                    (true, 'M') => 60,
                    (true, 'S') => 1,
                    _ => return None,
                };
                total = total.checked_add(amount.checked_mul(factor)?)?;
                saw_component = true;
            }
        }
    }

    (number.is_empty() && saw_component).then_some(total)
}

fn best_thumbnail(thumbnails: &BTreeMap<String, Thumbnail>) -> Option<String> {
    thumbnails
        .values()
        .max_by_key(|thumb| {
            thumb
                .width
                .unwrap_or(0)
                .saturating_mul(thumb.height.unwrap_or(0))
        })
        .map(|thumb| thumb.url.clone())
}
