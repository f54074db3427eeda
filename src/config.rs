#![forbid(unsafe_code)]

//! Runtime settings resolved from CLI overrides, the process environment and
//! a `.env` file, in that order of precedence.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::store::DATABASE_FILE;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_root: PathBuf,
    pub api_key: Option<String>,
    pub host: String,
    pub port: u16,
    /// `None` disables the scheduled refresh.
    pub refresh_interval: Option<Duration>,
    pub request_timeout: Duration,
}

impl RuntimeConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_root.join(DATABASE_FILE)
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("YOUTUBE_API_KEY not set"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub api_key: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub refresh_interval_secs: Option<u64>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config(&file_vars, env_var_string, overrides)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_root = overrides
        .data_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup("DATA_ROOT"))
        .ok_or_else(|| anyhow!("DATA_ROOT not set"))?;
    let api_key = non_blank(overrides.api_key).or_else(|| lookup("YOUTUBE_API_KEY"));
    let host = non_blank(overrides.host)
        .or_else(|| lookup("TUBEWATCH_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("TUBEWATCH_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let refresh_interval_secs = match overrides.refresh_interval_secs {
        Some(secs) => secs,
        None => match lookup("REFRESH_INTERVAL_SECS") {
            Some(value) => value
                .parse::<u64>()
                .with_context(|| format!("REFRESH_INTERVAL_SECS is not a number: {value}"))?,
            None => 0,
        },
    };
    let request_timeout_secs = lookup("REQUEST_TIMEOUT_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

    Ok(RuntimeConfig {
        data_root: PathBuf::from(data_root),
        api_key,
        host,
        port,
        refresh_interval: (refresh_interval_secs > 0)
            .then(|| Duration::from_secs(refresh_interval_secs)),
        request_timeout: Duration::from_secs(request_timeout_secs),
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| non_blank(file_vars.get(key).cloned()))
}

/// Reads `KEY=value` pairs from a dotenv-style file. A missing file yields no
/// values; lines without `=` and `#` comments are skipped.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err).with_context(|| format!("Reading {}", path.display())),
    };
    Ok(content
        .lines()
        .filter_map(parse_env_line)
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect())
}

fn parse_env_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then(|| (key, unquote(value.trim())))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}
