#![forbid(unsafe_code)]

//! Error taxonomy shared by the store and the refresh engine.

use thiserror::Error;

use crate::platform::PlatformError;

#[derive(Debug, Error)]
pub enum Error {
    /// Channel, video or handle could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid channel id: {0:?}")]
    InvalidChannelId(String),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    /// First failing channel of a `refresh_all` that does not skip failures.
    #[error("refresh aborted at channel {channel_id}: {reason}")]
    RefreshAborted { channel_id: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] libsql::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Static label used in logs and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::InvalidChannelId(_) => "invalid_channel_id",
            Self::Platform(_) => "platform_failure",
            Self::RefreshAborted { .. } => "refresh_aborted",
            Self::Database(_) => "database",
            Self::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
