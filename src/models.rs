use std::fmt;
use std::time::Duration;

/// A resolved, playable audio reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    pub title: String,
    pub stream_url: String,
    pub page_url: String,
    pub duration: Option<Duration>,
}

impl Track {
    pub fn duration_label(&self) -> Option<String> {
        self.duration.map(format_duration)
    }
}

pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let display_seconds = seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:0>2}:{display_seconds:0>2}")
    } else {
        format!("{minutes}:{display_seconds:0>2}")
    }
}

/// What happened to a track handed to `enqueue`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The guild was idle and the track is rendering now.
    Started { title: String },
    /// Something is already playing; the track waits at `position` (1-based).
    Queued { title: String, position: usize },
    /// The guild was idle but the sink refused the track.
    NotStarted { title: String },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub now_playing: Option<String>,
    pub pending: Vec<PendingTrack>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTrack {
    pub title: String,
    pub duration: Option<Duration>,
}

impl From<&Track> for PendingTrack {
    fn from(track: &Track) -> Self {
        Self {
            title: track.title.clone(),
            duration: track.duration,
        }
    }
}

/// Identifies one hand-off of a track to the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderId(pub u64);

impl fmt::Display for RenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a render came to an end, as reported by the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderOutcome {
    Finished,
    Stopped,
}
