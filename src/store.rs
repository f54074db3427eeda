#![forbid(unsafe_code)]

//! Persistence layer for channels and videos.
//!
//! Everything lives in one SQLite-compatible database opened through libsql.
//! Writes are funnelled through a single async gate and every multi-row write
//! runs in its own transaction, so a video is either stored together with its
//! state or not at all.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, params};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Automark, Channel, Video, VideoState, validate_channel_id};

/// File name of the database inside the data root.
pub const DATABASE_FILE: &str = "tubewatch.db";

const VIDEO_COLUMNS: &str = "id, channel_id, title, description, author_name, published, \
                             duration, views, thumbnail, state";

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            automark TEXT NOT NULL DEFAULT 'none',
            queuefile_extension TEXT
        );

        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            author_name TEXT NOT NULL,
            published INTEGER NOT NULL,
            duration INTEGER NOT NULL,
            views INTEGER NOT NULL,
            thumbnail TEXT NOT NULL,
            state TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel_id);
        CREATE INDEX IF NOT EXISTS idx_videos_state ON videos(state);
        CREATE INDEX IF NOT EXISTS idx_videos_published ON videos(published);
        "#,
    )
    .await?;
    Ok(())
}

/// Sort order for [`VideoQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoOrder {
    /// Newest first.
    #[default]
    Published,
    Views,
    Duration,
    Title,
    Random,
}

impl VideoOrder {
    /// Lenient parser for query strings; unknown values yield `None`.
    pub fn from_param(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "published" | "newest" => Some(Self::Published),
            "views" => Some(Self::Views),
            "duration" => Some(Self::Duration),
            "title" => Some(Self::Title),
            "random" => Some(Self::Random),
            _ => None,
        }
    }

    fn order_clause(self) -> &'static str {
        match self {
            Self::Published => "published DESC, rowid DESC",
            Self::Views => "views DESC, published DESC",
            Self::Duration => "duration DESC, published DESC",
            Self::Title => "title COLLATE NOCASE ASC, published DESC",
            Self::Random => "RANDOM()",
        }
    }
}

/// Read-side filter over the videos table.
#[derive(Debug, Clone, Default)]
pub struct VideoQuery {
    pub channel_id: Option<String>,
    pub state: Option<VideoState>,
    /// Whitespace separated terms, all of which must appear in the title.
    pub search: Option<String>,
    pub orderby: Option<VideoOrder>,
    pub limit: Option<usize>,
}

impl VideoQuery {
    fn search_terms(&self) -> Vec<String> {
        self.search
            .as_deref()
            .unwrap_or_default()
            .to_lowercase()
            .replace('+', " ")
            .split_whitespace()
            .map(str::to_owned)
            .collect()
    }
}

/// Handle to the channel/video database.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
    write_gate: Mutex<()>,
}

impl Database {
    /// Opens (and if necessary creates) the database and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening database {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;

        Ok(Self {
            conn,
            write_gate: Mutex::new(()),
        })
    }

    // Channels

    /// Inserts `channel` unless its id already exists. Returns whether a row
    /// was created.
    pub async fn create_channel(&self, channel: &Channel) -> Result<bool> {
        validate_channel_id(&channel.id)?;
        let _guard = self.write_gate.lock().await;
        let inserted = self
            .conn
            .execute(
                r#"
                INSERT INTO channels (id, name, automark, queuefile_extension)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO NOTHING
                "#,
                params![
                    channel.id.as_str(),
                    channel.name.as_str(),
                    channel.automark.as_str(),
                    channel.queuefile_extension.as_deref(),
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    /// Returns the stored channel, creating it with `name` and no automark
    /// when it is unknown.
    pub async fn get_or_create_channel(&self, channel_id: &str, name: &str) -> Result<Channel> {
        let created = self
            .create_channel(&Channel {
                id: channel_id.to_string(),
                name: name.to_string(),
                automark: Automark::None,
                queuefile_extension: None,
            })
            .await?;
        if created {
            debug!(channel_id, name, "channel created on first reference");
        }
        self.get_channel(channel_id).await
    }

    pub async fn find_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, name, automark, queuefile_extension
                FROM channels
                WHERE id = ?1
                "#,
                [channel_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_channel(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Channel> {
        self.find_channel(channel_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel {channel_id}")))
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, name, automark, queuefile_extension
                FROM channels
                ORDER BY name COLLATE NOCASE ASC, id ASC
                "#,
                params![],
            )
            .await?;
        let mut channels = Vec::new();
        while let Some(row) = rows.next().await? {
            channels.push(row_to_channel(&row)?);
        }
        Ok(channels)
    }

    /// Deletes a channel together with all of its videos. Returns the number
    /// of videos removed.
    pub async fn delete_channel(&self, channel_id: &str) -> Result<u64> {
        let _guard = self.write_gate.lock().await;
        let tx = self.conn.transaction().await?;
        let videos = tx
            .execute("DELETE FROM videos WHERE channel_id = ?1", params![channel_id])
            .await?;
        let channels = tx
            .execute("DELETE FROM channels WHERE id = ?1", params![channel_id])
            .await?;
        if channels == 0 {
            tx.rollback().await?;
            return Err(Error::NotFound(format!("channel {channel_id}")));
        }
        tx.commit().await?;
        Ok(videos)
    }

    pub async fn set_channel_name(&self, channel_id: &str, name: &str) -> Result<()> {
        self.update_channel("UPDATE channels SET name = ?2 WHERE id = ?1", channel_id, Some(name))
            .await
    }

    pub async fn set_automark(&self, channel_id: &str, automark: Automark) -> Result<()> {
        self.update_channel(
            "UPDATE channels SET automark = ?2 WHERE id = ?1",
            channel_id,
            Some(automark.as_str()),
        )
        .await
    }

    /// Stores the opaque queuefile extension; blank input clears it.
    pub async fn set_queuefile_extension(
        &self,
        channel_id: &str,
        extension: Option<&str>,
    ) -> Result<()> {
        let extension = extension.map(str::trim).filter(|value| !value.is_empty());
        self.update_channel(
            "UPDATE channels SET queuefile_extension = ?2 WHERE id = ?1",
            channel_id,
            extension,
        )
        .await
    }

    async fn update_channel(&self, sql: &str, channel_id: &str, value: Option<&str>) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        let changed = self.conn.execute(sql, params![channel_id, value]).await?;
        if changed == 0 {
            return Err(Error::NotFound(format!("channel {channel_id}")));
        }
        Ok(())
    }

    // Videos

    /// Inserts every video whose id is not stored yet, in one transaction.
    /// Existing rows are left untouched. Returns the number of rows created.
    pub async fn insert_videos(&self, videos: &[Video]) -> Result<usize> {
        if videos.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_gate.lock().await;
        let tx = self.conn.transaction().await?;
        match insert_video_rows(&tx, videos).await {
            Ok(inserted) => {
                tx.commit().await?;
                Ok(inserted)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    pub async fn find_video(&self, video_id: &str) -> Result<Option<Video>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = ?1"),
                [video_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_video(&self, video_id: &str) -> Result<Video> {
        self.find_video(video_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("video {video_id}")))
    }

    /// Ids of every stored video that belongs to `channel_id`.
    pub async fn known_video_ids(&self, channel_id: &str) -> Result<HashSet<String>> {
        let mut rows = self
            .conn
            .query("SELECT id FROM videos WHERE channel_id = ?1", [channel_id])
            .await?;
        let mut ids = HashSet::new();
        while let Some(row) = rows.next().await? {
            ids.insert(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    pub async fn set_state(&self, video_id: &str, state: VideoState) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE videos SET state = ?2 WHERE id = ?1",
                params![video_id, state.as_str()],
            )
            .await?;
        if changed == 0 {
            return Err(Error::NotFound(format!("video {video_id}")));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn count_videos(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM videos", params![])
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| Error::NotFound("video count".into()))?;
        Ok(row.get::<i64>(0)?.max(0) as u64)
    }

    /// Rows modified through this connection since it was opened.
    #[cfg(test)]
    pub(crate) async fn total_changes(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT total_changes()", params![])
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| Error::NotFound("total_changes".into()))?;
        Ok(row.get::<i64>(0)?)
    }

    /// Filters by channel and state in SQL, then applies the title search
    /// and the limit.
    pub async fn query_videos(&self, query: &VideoQuery) -> Result<Vec<Video>> {
        let order = query.orderby.unwrap_or_default().order_clause();
        let mut rows = self
            .conn
            .query(
                &format!(
                    r#"
                    SELECT {VIDEO_COLUMNS}
                    FROM videos
                    WHERE (?1 IS NULL OR channel_id = ?1)
                      AND (?2 IS NULL OR state = ?2)
                    ORDER BY {order}
                    "#
                ),
                params![
                    query.channel_id.as_deref(),
                    query.state.map(VideoState::as_str),
                ],
            )
            .await?;

        let terms = query.search_terms();
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut videos = Vec::new();
        while videos.len() < limit {
            let Some(row) = rows.next().await? else {
                break;
            };
            let video = row_to_video(&row)?;
            let title = video.title.to_lowercase();
            if terms.iter().all(|term| title.contains(term.as_str())) {
                videos.push(video);
            }
        }
        Ok(videos)
    }
}

async fn insert_video_rows(conn: &Connection, videos: &[Video]) -> Result<usize> {
    let mut inserted = 0;
    for video in videos {
        let changed = conn
            .execute(
                &format!(
                    r#"
                    INSERT INTO videos ({VIDEO_COLUMNS})
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    ON CONFLICT(id) DO NOTHING
                    "#
                ),
                params![
                    video.id.as_str(),
                    video.channel_id.as_str(),
                    video.title.as_str(),
                    video.description.as_str(),
                    video.author_name.as_str(),
                    video.published.timestamp(),
                    video.duration,
                    video.views,
                    video.thumbnail.as_str(),
                    video.state.as_str(),
                ],
            )
            .await?;
        inserted += changed as usize;
    }
    Ok(inserted)
}

fn row_to_channel(row: &Row) -> Result<Channel> {
    let automark: String = row.get(2)?;
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        automark: Automark::from_str(&automark)?,
        queuefile_extension: row.get(3)?,
    })
}

/// Column order must match [`VIDEO_COLUMNS`].
fn row_to_video(row: &Row) -> Result<Video> {
    let published: i64 = row.get(5)?;
    let state: String = row.get(9)?;
    Ok(Video {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        author_name: row.get(4)?,
        published: DateTime::<Utc>::from_timestamp(published, 0).unwrap_or_default(),
        duration: row.get(6)?,
        views: row.get(7)?,
        thumbnail: row.get(8)?,
        state: VideoState::from_str(&state)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const CHANNEL: &str = "UCaaaaaaaaaaaaaaaaaaaaaa";
    const OTHER: &str = "UCbbbbbbbbbbbbbbbbbbbbbb";

    fn sample_video(id: &str, channel_id: &str, day: u32) -> Video {
        Video {
            id: id.to_owned(),
            channel_id: channel_id.to_owned(),
            title: format!("Video {id}"),
            description: "desc".into(),
            author_name: "Author".into(),
            published: Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap(),
            duration: 60 * day as i64,
            views: 100 - day as i64,
            thumbnail: "https://i.ytimg.com/thumb.jpg".into(),
            state: VideoState::Pending,
        }
    }

    fn sample_channel(id: &str, name: &str) -> Channel {
        Channel {
            id: id.into(),
            name: name.into(),
            automark: Automark::None,
            queuefile_extension: None,
        }
    }

    async fn create_store() -> anyhow::Result<(tempfile::TempDir, Database, PathBuf)> {
        let dir = tempdir()?;
        let path = dir.path().join("data").join(DATABASE_FILE);
        let db = Database::open(&path).await?;
        db.create_channel(&sample_channel(CHANNEL, "Alpha")).await?;
        Ok((dir, db, path))
    }

    #[tokio::test]
    async fn opens_store_and_creates_schema() -> anyhow::Result<()> {
        let (_temp, db, path) = create_store().await?;
        assert!(path.exists(), "database file should be created");

        let mut rows = db.conn.query("PRAGMA journal_mode", params![]).await?;
        let journal: String = rows.next().await?.expect("journal row").get(0)?;
        assert_eq!(journal.to_lowercase(), "wal");

        let mut rows = db.conn.query("PRAGMA foreign_keys", params![]).await?;
        let flag: i64 = rows.next().await?.expect("foreign_keys row").get(0)?;
        assert_eq!(flag, 1);

        for table in ["channels", "videos"] {
            let mut rows = db
                .conn
                .query(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                )
                .await?;
            assert!(rows.next().await?.is_some(), "missing table {table}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn create_channel_rejects_malformed_ids() -> anyhow::Result<()> {
        let (_temp, db, _path) = create_store().await?;
        let err = db
            .create_channel(&sample_channel("SomeUser", "Nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChannelId(_)));
        assert_eq!(db.list_channels().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn get_or_create_keeps_existing_configuration() -> anyhow::Result<()> {
        let (_temp, db, _path) = create_store().await?;
        db.set_automark(CHANNEL, Automark::Mark(VideoState::Ignore))
            .await?;

        let existing = db.get_or_create_channel(CHANNEL, "Renamed").await?;
        assert_eq!(existing.name, "Alpha");
        assert_eq!(existing.automark, Automark::Mark(VideoState::Ignore));

        let created = db.get_or_create_channel(OTHER, "Beta").await?;
        assert_eq!(created.name, "Beta");
        assert_eq!(created.automark, Automark::None);
        Ok(())
    }

    #[tokio::test]
    async fn insert_videos_never_overwrites_existing_rows() -> anyhow::Result<()> {
        let (_temp, db, _path) = create_store().await?;
        let first = sample_video("v1", CHANNEL, 1);
        assert_eq!(db.insert_videos(&[first.clone()]).await?, 1);
        db.set_state("v1", VideoState::Downloaded).await?;

        let mut again = first.clone();
        again.state = VideoState::Ignore;
        again.title = "changed".into();
        let inserted = db
            .insert_videos(&[again, sample_video("v2", CHANNEL, 2)])
            .await?;
        assert_eq!(inserted, 1);

        let stored = db.get_video("v1").await?;
        assert_eq!(stored.state, VideoState::Downloaded);
        assert_eq!(stored.title, "Video v1");
        assert_eq!(db.count_videos().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn insert_videos_is_all_or_nothing() -> anyhow::Result<()> {
        let (_temp, db, _path) = create_store().await?;
        // Unknown channel violates the foreign key on the second row.
        let batch = [
            sample_video("ok", CHANNEL, 1),
            sample_video("orphan", OTHER, 2),
        ];
        assert!(db.insert_videos(&batch).await.is_err());
        assert!(db.find_video("ok").await?.is_none());
        assert_eq!(db.count_videos().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn set_state_on_missing_video_is_not_found() -> anyhow::Result<()> {
        let (_temp, db, _path) = create_store().await?;
        let err = db.set_state("ghost", VideoState::Ignore).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn delete_channel_cascades_to_videos() -> anyhow::Result<()> {
        let (_temp, db, _path) = create_store().await?;
        db.create_channel(&sample_channel(OTHER, "Beta")).await?;
        db.insert_videos(&[
            sample_video("a1", CHANNEL, 1),
            sample_video("a2", CHANNEL, 2),
            sample_video("b1", OTHER, 3),
        ])
        .await?;

        assert_eq!(db.delete_channel(CHANNEL).await?, 2);
        assert!(db.find_channel(CHANNEL).await?.is_none());
        assert!(db.find_video("a1").await?.is_none());
        assert!(db.find_video("b1").await?.is_some());

        let err = db.delete_channel(CHANNEL).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn queuefile_extension_blank_clears_value() -> anyhow::Result<()> {
        let (_temp, db, _path) = create_store().await?;
        db.set_queuefile_extension(CHANNEL, Some("ytqueue")).await?;
        assert_eq!(
            db.get_channel(CHANNEL).await?.queuefile_extension.as_deref(),
            Some("ytqueue")
        );
        db.set_queuefile_extension(CHANNEL, Some("   ")).await?;
        assert!(db.get_channel(CHANNEL).await?.queuefile_extension.is_none());

        let err = db
            .set_queuefile_extension(OTHER, Some("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn query_filters_by_channel_and_state() -> anyhow::Result<()> {
        let (_temp, db, _path) = create_store().await?;
        db.create_channel(&sample_channel(OTHER, "Beta")).await?;
        db.insert_videos(&[
            sample_video("a1", CHANNEL, 1),
            sample_video("a2", CHANNEL, 2),
            sample_video("b1", OTHER, 3),
        ])
        .await?;
        db.set_state("a2", VideoState::Ignore).await?;

        let by_channel = db
            .query_videos(&VideoQuery {
                channel_id: Some(CHANNEL.into()),
                ..VideoQuery::default()
            })
            .await?;
        let ids: Vec<_> = by_channel.iter().map(|video| video.id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a1"]);

        let pending = db
            .query_videos(&VideoQuery {
                state: Some(VideoState::Pending),
                ..VideoQuery::default()
            })
            .await?;
        let ids: Vec<_> = pending.iter().map(|video| video.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "a1"]);
        Ok(())
    }

    #[tokio::test]
    async fn query_search_ordering_and_limit() -> anyhow::Result<()> {
        let (_temp, db, _path) = create_store().await?;
        let mut cats = sample_video("cats", CHANNEL, 1);
        cats.title = "Funny Cats compilation".into();
        let mut dogs = sample_video("dogs", CHANNEL, 2);
        dogs.title = "Funny dogs".into();
        let mut more_cats = sample_video("cats2", CHANNEL, 3);
        more_cats.title = "Cats being funny again".into();
        db.insert_videos(&[cats, dogs, more_cats]).await?;

        let found = db
            .query_videos(&VideoQuery {
                search: Some("funny+CATS".into()),
                ..VideoQuery::default()
            })
            .await?;
        let ids: Vec<_> = found.iter().map(|video| video.id.as_str()).collect();
        assert_eq!(ids, vec!["cats2", "cats"]);

        let by_views = db
            .query_videos(&VideoQuery {
                orderby: Some(VideoOrder::Views),
                limit: Some(1),
                ..VideoQuery::default()
            })
            .await?;
        assert_eq!(by_views.len(), 1);
        assert_eq!(by_views[0].id, "cats");

        let limited_search = db
            .query_videos(&VideoQuery {
                search: Some("funny".into()),
                orderby: Some(VideoOrder::Title),
                limit: Some(2),
                ..VideoQuery::default()
            })
            .await?;
        let ids: Vec<_> = limited_search.iter().map(|video| video.id.as_str()).collect();
        assert_eq!(ids, vec!["cats2", "cats"]);
        Ok(())
    }

    #[test]
    fn video_order_parsing_is_lenient() {
        assert_eq!(VideoOrder::from_param("Views"), Some(VideoOrder::Views));
        assert_eq!(VideoOrder::from_param("random"), Some(VideoOrder::Random));
        assert_eq!(VideoOrder::from_param("sideways"), None);
    }
}
