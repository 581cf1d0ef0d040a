use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serenity::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::ResolutionError;
use crate::models::Track;

const UNKNOWN_TRACK_TITLE: &str = "audio";

/// Turns free text or a link into a playable track.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<Track, ResolutionError>;
}

/// Rejects queries that can never be resolved, before anything is fetched.
pub fn screen_query<'a>(query: &'a str, unsupported: &[String]) -> Result<&'a str, ResolutionError> {
    if let Some(marker) = unsupported.iter().find(|marker| query.contains(marker.as_str())) {
        return Err(ResolutionError::UnsupportedSource {
            marker: marker.clone(),
        });
    }

    match query.trim() {
        "" => Err(ResolutionError::EmptyQuery),
        query => Ok(query),
    }
}

pub async fn resolve_query(
    resolver: &dyn TrackResolver,
    query: &str,
    unsupported: &[String],
    limit: Duration,
) -> Result<Track, ResolutionError> {
    let query = screen_query(query, unsupported)?;

    timeout(limit, resolver.resolve(query))
        .await
        .map_err(|_| ResolutionError::TimedOut(limit))?
}

/// Resolves through the `yt-dlp` executable, picking the top search hit for plain text.
pub struct YtDlpResolver {
    program: String,
}

impl YtDlpResolver {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<Track, ResolutionError> {
        info!("Resolving {query}");

        let output = Command::new(&self.program)
            .args([
                "-j",
                "--no-playlist",
                "--quiet",
                "-f",
                "bestaudio/best",
                "--default-search",
                "ytsearch1",
                "--",
                query,
            ])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|why| ResolutionError::Extractor(format!("{} failed to start: {why}", self.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", self.program, stderr.trim());
        }

        track_from_output(output.status.success(), &stdout, &stderr, query)
    }
}

/// Interprets a finished yt-dlp run. A failed exit surfaces its stderr to the user.
fn track_from_output(succeeded: bool, stdout: &str, stderr: &str, query: &str) -> Result<Track, ResolutionError> {
    if !succeeded {
        let details = match stderr.trim() {
            "" => "yt-dlp exited with an error".to_string(),
            details => details.to_string(),
        };
        return Err(ResolutionError::Extractor(details));
    }

    if stdout.trim().is_empty() {
        return Err(ResolutionError::NotFound {
            query: query.to_string(),
        });
    }

    track_from_info(stdout, query)
}

#[derive(Deserialize)]
struct VideoInfo {
    url: Option<String>,
    title: Option<String>,
    webpage_url: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    entries: Vec<VideoInfo>,
}

/// Builds a track from `yt-dlp -j` output: one JSON document per line, first one wins.
fn track_from_info(output: &str, query: &str) -> Result<Track, ResolutionError> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| ResolutionError::NotFound {
            query: query.to_string(),
        })?;

    let mut info: VideoInfo = serde_json::from_str(line)
        .map_err(|why| ResolutionError::Extractor(format!("unreadable yt-dlp output: {why}")))?;

    // Search results come wrapped in a playlist.
    if info.url.is_none() && !info.entries.is_empty() {
        info = info.entries.swap_remove(0);
    }

    let stream_url = info
        .url
        .ok_or_else(|| ResolutionError::Extractor("no stream url in yt-dlp output".to_string()))?;

    let duration = info
        .duration
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64);

    Ok(Track {
        title: info.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
        stream_url,
        page_url: info.webpage_url.unwrap_or_else(|| query.to_string()),
        duration,
    })
}
