#![forbid(unsafe_code)]

//! Cron-style refresher: pulls new uploads for every stored channel (or the
//! ones named with `--channel`) and prints one line per channel. Exits with a
//! non-zero status when any channel failed.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tubewatch::{
    Error,
    config::{RuntimeOverrides, resolve_runtime_config},
    platform::YoutubeClient,
    refresh::{RefreshEngine, RefreshOutcome, RefreshResult},
    store::Database,
};

#[derive(Debug, Parser)]
#[command(name = "refresh_channels", about = "Fetch new uploads for tracked channels")]
struct RefreshArgs {
    /// Channel id to refresh; repeat for several. Defaults to every channel.
    #[arg(long = "channel", value_name = "ID")]
    channels: Vec<String>,

    /// Walk the full upload history instead of stopping at the first known video
    #[arg(long)]
    force: bool,

    /// Stop at the first failing channel
    #[arg(long)]
    fail_fast: bool,

    /// Directory holding the database (overrides DATA_ROOT)
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// YouTube Data API key (overrides YOUTUBE_API_KEY)
    #[arg(long)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let args = RefreshArgs::parse();
    let config = resolve_runtime_config(RuntimeOverrides {
        data_root: args.data_root.clone(),
        api_key: args.api_key.clone(),
        ..RuntimeOverrides::default()
    })?;
    let api_key = config.require_api_key()?;

    let db = Database::open(&config.database_path())
        .await
        .with_context(|| format!("opening {}", config.database_path().display()))?;
    let platform = YoutubeClient::new(api_key, config.request_timeout);
    let engine = RefreshEngine::new(Arc::new(db), Arc::new(platform));

    let results = run(&engine, &args).await?;
    let failed = results.iter().filter(|result| !result.is_success()).count();
    let added: usize = results.iter().map(|result| result.videos_added).sum();
    println!(
        "Refreshed {} channel(s): {} new video(s), {} failure(s).",
        results.len(),
        added,
        failed
    );
    if failed > 0 {
        bail!("{failed} channel(s) failed to refresh");
    }
    Ok(())
}

/// Refreshes the selected channels, printing a line for each. A fail-fast run
/// returns an error at the first failing channel.
async fn run(engine: &RefreshEngine, args: &RefreshArgs) -> Result<Vec<RefreshResult>> {
    if args.channels.is_empty() {
        let results = match engine.refresh_all(args.force, !args.fail_fast).await {
            Ok(results) => results,
            Err(Error::RefreshAborted { channel_id, reason }) => {
                println!("{channel_id}: FAILED ({reason})");
                bail!("aborted after {channel_id} failed");
            }
            Err(err) => return Err(err.into()),
        };
        for result in &results {
            println!("{}", describe(result));
        }
        return Ok(results);
    }

    let mut results = Vec::with_capacity(args.channels.len());
    for (index, channel_id) in args.channels.iter().enumerate() {
        let result = engine
            .refresh_channel(channel_id, args.force)
            .await
            .with_context(|| format!("refreshing {channel_id}"))?;
        println!("[{}/{}] {}", index + 1, args.channels.len(), describe(&result));
        if args.fail_fast && !result.is_success() {
            bail!("aborted after {channel_id} failed");
        }
        results.push(result);
    }
    Ok(results)
}

fn describe(result: &RefreshResult) -> String {
    match &result.outcome {
        RefreshOutcome::Success => {
            format!("{}: {} new video(s)", result.channel_id, result.videos_added)
        }
        RefreshOutcome::Failure { reason } => format!("{}: FAILED ({reason})", result.channel_id),
    }
}
