#![forbid(unsafe_code)]

//! Records shared by the store, the refresh engine and the API layer.
//!
//! Workflow states are a closed enumeration. Every write boundary parses
//! user-supplied strings through [`VideoState::from_str`] or
//! [`Automark::from_str`] so nothing outside the enumeration reaches the DB.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Exact length of a platform channel id (`UC` + 22 characters).
pub const CHANNEL_ID_LEN: usize = 24;
pub const CHANNEL_ID_PREFIX: &str = "UC";

/// Moderation/processing status of a single video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoState {
    /// Unsorted. Assigned when no automark applies.
    #[default]
    Pending,
    Downloaded,
    Ignore,
}

impl VideoState {
    pub const ALL: [VideoState; 3] = [
        VideoState::Pending,
        VideoState::Downloaded,
        VideoState::Ignore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for VideoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoState {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        VideoState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| Error::InvalidState(value.to_string()))
    }
}

/// Per-channel rule applied to every video discovered during a refresh.
///
/// `None` is the "no automatic action" sentinel; such videos start out as
/// [`VideoState::Pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Automark {
    #[default]
    None,
    Mark(VideoState),
}

impl Automark {
    pub const NONE_LABEL: &'static str = "none";

    /// State a newly discovered video receives on creation.
    pub fn initial_state(self) -> VideoState {
        match self {
            Self::None => VideoState::default(),
            Self::Mark(state) => state,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => Self::NONE_LABEL,
            Self::Mark(state) => state.as_str(),
        }
    }
}

impl fmt::Display for Automark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Automark {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().eq_ignore_ascii_case(Self::NONE_LABEL) {
            return Ok(Self::None);
        }
        value.parse::<VideoState>().map(Self::Mark)
    }
}

impl Serialize for Automark {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Automark {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Returns true when `value` has the fixed platform id shape.
pub fn is_channel_id(value: &str) -> bool {
    value.len() == CHANNEL_ID_LEN
        && value.starts_with(CHANNEL_ID_PREFIX)
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
}

pub fn validate_channel_id(value: &str) -> Result<(), Error> {
    if is_channel_id(value) {
        Ok(())
    } else {
        Err(Error::InvalidChannelId(value.to_string()))
    }
}

/// Row stored in the `channels` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub automark: Automark,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queuefile_extension: Option<String>,
}

/// Row stored in the `videos` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub channel_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub author_name: String,
    pub published: DateTime<Utc>,
    pub duration: i64,
    pub views: i64,
    pub thumbnail: String,
    pub state: VideoState,
}
