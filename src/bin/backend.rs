#![forbid(unsafe_code)]

//! Axum backend exposing the channel catalogue as a small JSON API.
//!
//! Reads go straight to the database. Refreshes, channel adds and single video
//! inserts go through the refresh engine, which is the only part that talks to
//! the video platform. When `REFRESH_INTERVAL_SECS` is set a background task
//! refreshes every channel on that cadence.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::{signal, time::MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tubewatch::{
    Error,
    config::{RuntimeOverrides, resolve_runtime_config},
    model::{Channel, Video, VideoState},
    platform::YoutubeClient,
    refresh::{RefreshEngine, RefreshResult},
    store::{Database, VideoOrder, VideoQuery},
};

#[derive(Debug, Parser)]
#[command(name = "backend", about = "JSON API over the tubewatch channel catalogue")]
struct BackendArgs {
    /// Directory holding the database (overrides DATA_ROOT)
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Listen address (overrides TUBEWATCH_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides TUBEWATCH_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// YouTube Data API key (overrides YOUTUBE_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Seconds between scheduled refreshes, 0 disables them
    #[arg(long)]
    refresh_interval: Option<u64>,

    /// Alternate .env file
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            data_root: self.data_root,
            api_key: self.api_key,
            host: self.host,
            port: self.port,
            refresh_interval_secs: self.refresh_interval,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    engine: RefreshEngine,
}

impl AppState {
    fn database(&self) -> &Database {
        self.engine.database()
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidState(_) | Error::InvalidChannelId(_) => StatusCode::BAD_REQUEST,
            Error::Platform(_) | Error::RefreshAborted { .. } => StatusCode::BAD_GATEWAY,
            Error::Database(_) | Error::Serialization(_) => {
                error!(kind = err.kind(), error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = resolve_runtime_config(BackendArgs::parse().into_overrides())?;
    let api_key = config.require_api_key()?;

    let db = Database::open(&config.database_path())
        .await
        .with_context(|| format!("opening {}", config.database_path().display()))?;
    let platform = YoutubeClient::new(api_key, config.request_timeout);
    let engine = RefreshEngine::new(Arc::new(db), Arc::new(platform));

    if let Some(interval) = config.refresh_interval {
        tokio::spawn(scheduled_refresh(engine.clone(), interval));
    }

    let app = router(AppState { engine });

    let host = config
        .host
        .parse()
        .with_context(|| format!("invalid listen host {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/channels", get(list_channels).post(add_channel))
        .route("/api/channels/{id}", get(get_channel).delete(delete_channel))
        .route("/api/channels/{id}/refresh", post(refresh_channel))
        .route("/api/channels/{id}/automark", post(set_automark))
        .route(
            "/api/channels/{id}/queuefile_extension",
            post(set_queuefile_extension),
        )
        .route("/api/refresh_all", post(refresh_all))
        .route("/api/videos", get(list_videos).post(insert_video))
        .route("/api/videos/{id}", get(get_video))
        .route("/api/videos/{id}/state", post(set_video_state))
        .route("/api/states", get(list_states))
        .fallback(|| async {
            ApiError {
                status: StatusCode::NOT_FOUND,
                message: "endpoint not found".into(),
            }
        })
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn scheduled_refresh(engine: RefreshEngine, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; start counting from now.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match engine.refresh_all(false, true).await {
            Ok(results) => {
                let failed = results.iter().filter(|result| !result.is_success()).count();
                info!(channels = results.len(), failed, "scheduled refresh done");
            }
            Err(err) => error!(error = %err, "scheduled refresh failed"),
        }
    }
}

// Channels

#[derive(Debug, Deserialize)]
struct AddChannelRequest {
    channel_id: String,
    #[serde(default)]
    fetch_videos: bool,
}

/// Optional body; a bodiless POST refreshes without `force`.
#[derive(Debug, Default, Deserialize)]
struct RefreshRequest {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct StateRequest {
    state: String,
}

#[derive(Debug, Deserialize)]
struct ExtensionRequest {
    #[serde(default)]
    extension: String,
}

#[derive(Debug, Serialize)]
struct DeletedChannel {
    channel_id: String,
    videos_removed: u64,
}

async fn list_channels(State(state): State<AppState>) -> ApiResult<Json<Vec<Channel>>> {
    Ok(Json(state.database().list_channels().await?))
}

async fn add_channel(
    State(state): State<AppState>,
    Json(request): Json<AddChannelRequest>,
) -> ApiResult<Json<Channel>> {
    let channel = state
        .engine
        .add_channel(&request.channel_id, request.fetch_videos)
        .await?;
    Ok(Json(channel))
}

async fn get_channel(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Channel>> {
    Ok(Json(state.database().get_channel(&id).await?))
}

async fn delete_channel(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DeletedChannel>> {
    let videos_removed = state.engine.delete_channel(&id).await?;
    Ok(Json(DeletedChannel {
        channel_id: id,
        videos_removed,
    }))
}

async fn refresh_channel(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    request: Option<Json<RefreshRequest>>,
) -> ApiResult<Json<RefreshResult>> {
    let force = request.is_some_and(|Json(request)| request.force);
    Ok(Json(state.engine.refresh_channel(&id, force).await?))
}

async fn set_automark(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(request): Json<StateRequest>,
) -> ApiResult<Json<Channel>> {
    Ok(Json(state.engine.set_automark(&id, &request.state).await?))
}

async fn set_queuefile_extension(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(request): Json<ExtensionRequest>,
) -> ApiResult<Json<Channel>> {
    let channel = state
        .engine
        .set_queuefile_extension(&id, &request.extension)
        .await?;
    Ok(Json(channel))
}

async fn refresh_all(
    State(state): State<AppState>,
    request: Option<Json<RefreshRequest>>,
) -> ApiResult<Json<Vec<RefreshResult>>> {
    let force = request.is_some_and(|Json(request)| request.force);
    Ok(Json(state.engine.refresh_all(force, true).await?))
}

// Videos

/// Raw query string parameters. `limit` stays a string so that garbage can
/// be ignored instead of rejected.
#[derive(Debug, Default, Deserialize)]
struct VideoListParams {
    channel: Option<String>,
    state: Option<String>,
    q: Option<String>,
    orderby: Option<String>,
    limit: Option<String>,
}

impl VideoListParams {
    fn into_query(self) -> ApiResult<VideoQuery> {
        let state = match non_empty(self.state) {
            Some(value) => Some(value.parse::<VideoState>()?),
            None => None,
        };
        Ok(VideoQuery {
            channel_id: non_empty(self.channel),
            state,
            search: non_empty(self.q),
            orderby: self.orderby.as_deref().and_then(VideoOrder::from_param),
            limit: self
                .limit
                .as_deref()
                .and_then(|value| value.trim().parse::<usize>().ok()),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Deserialize)]
struct InsertVideoRequest {
    video_id: String,
}

async fn list_videos(
    State(state): State<AppState>,
    Query(params): Query<VideoListParams>,
) -> ApiResult<Json<Vec<Video>>> {
    let query = params.into_query()?;
    Ok(Json(state.database().query_videos(&query).await?))
}

async fn insert_video(
    State(state): State<AppState>,
    Json(request): Json<InsertVideoRequest>,
) -> ApiResult<Json<Video>> {
    if request.video_id.trim().is_empty() {
        return Err(ApiError::bad_request("video_id must not be empty"));
    }
    Ok(Json(state.engine.insert_video(&request.video_id).await?))
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Video>> {
    Ok(Json(state.database().get_video(&id).await?))
}

async fn set_video_state(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(request): Json<StateRequest>,
) -> ApiResult<Json<Video>> {
    Ok(Json(state.engine.set_state(&id, &request.state).await?))
}

async fn list_states() -> Json<Vec<VideoState>> {
    Json(VideoState::ALL.to_vec())
}
