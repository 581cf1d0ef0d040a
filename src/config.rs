use std::env;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_PREFIX: &str = "$";
const DEFAULT_YTDLP: &str = "yt-dlp";
const DEFAULT_UNSUPPORTED: &str = "open.spotify.com";
const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_START_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DISCORD_TOKEN is missing; put it in the environment or a .env file")]
    MissingToken,
    #[error("{key} must be a whole number of seconds, got `{value}`")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must be greater than zero")]
    ZeroTimeout { key: &'static str },
}

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub command_prefix: String,
    pub ytdlp_program: String,
    pub unsupported_markers: Vec<String>,
    pub resolve_timeout: Duration,
    pub connect_timeout: Duration,
    pub start_timeout: Duration,
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |key: &str| lookup(key).map(|value| value.trim().to_string()).filter(|value| !value.is_empty());

        let discord_token = read("DISCORD_TOKEN").ok_or(ConfigError::MissingToken)?;

        let unsupported_markers = read("UNSUPPORTED_SOURCES")
            .unwrap_or_else(|| DEFAULT_UNSUPPORTED.to_string())
            .split(',')
            .map(str::trim)
            .filter(|marker| !marker.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            discord_token,
            command_prefix: read("COMMAND_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            ytdlp_program: read("YTDLP_PATH").unwrap_or_else(|| DEFAULT_YTDLP.to_string()),
            unsupported_markers,
            resolve_timeout: seconds(
                "RESOLVE_TIMEOUT_SECS",
                read("RESOLVE_TIMEOUT_SECS"),
                DEFAULT_RESOLVE_TIMEOUT_SECS,
            )?,
            connect_timeout: seconds(
                "CONNECT_TIMEOUT_SECS",
                read("CONNECT_TIMEOUT_SECS"),
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )?,
            start_timeout: seconds(
                "START_TIMEOUT_SECS",
                read("START_TIMEOUT_SECS"),
                DEFAULT_START_TIMEOUT_SECS,
            )?,
        })
    }

    /// Everything but the token, for the startup log.
    pub fn summary(&self) -> String {
        format!(
            "prefix `{}`, resolver `{}`, unsupported sources [{}], resolve timeout {}s, connect timeout {}s, start timeout {}s",
            self.command_prefix,
            self.ytdlp_program,
            self.unsupported_markers.join(", "),
            self.resolve_timeout.as_secs(),
            self.connect_timeout.as_secs(),
            self.start_timeout.as_secs(),
        )
    }
}

fn seconds(key: &'static str, value: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    let seconds = match value {
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidNumber { key, value })?,
        None => default,
    };

    if seconds == 0 {
        return Err(ConfigError::ZeroTimeout { key });
    }

    Ok(Duration::from_secs(seconds))
}
