use std::time::Duration;

use thiserror::Error;

/// A query could not be turned into a playable track.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Oh no! Links from `{marker}` can’t be streamed. :( Please paste the song name (e.g., `artist - title`) or a YouTube link.")]
    UnsupportedSource { marker: String },
    #[error("Tell me what to play! Paste a song name or a link.")]
    EmptyQuery,
    #[error("nothing found for `{query}`")]
    NotFound { query: String },
    #[error("extractor failed: {0}")]
    Extractor(String),
    #[error("gave up resolving after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// The audio sink refused or lost a render.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("not connected to a voice channel")]
    NotConnected,
    #[error("could not open audio source: {0}")]
    Source(String),
    #[error("track control failed: {0}")]
    Control(String),
    #[error("audio source took longer than {}s to open", .0.as_secs())]
    TimedOut(Duration),
}

/// A command was issued where it makes no sense. The message is the chat reply.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UserStateError {
    #[error("This only works inside a server!")]
    NotInGuild,
    #[error("Please join a voice channel first! >:O")]
    NotInVoiceChannel,
    #[error("I’m not in a voice channel! >:U")]
    BotNotInVoiceChannel,
    #[error("Nothing is playing...? :/")]
    NothingPlaying,
    #[error("Nothing is playing?! >:/")]
    NothingToPause,
    #[error("Nothing to resume...? :P")]
    NothingToResume,
}

#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    UserState(#[from] UserStateError),
    #[error("could not join the voice channel: {0}")]
    JoinFailed(String),
    #[error("joining the voice channel took longer than {}s", .0.as_secs())]
    JoinTimedOut(Duration),
    #[error("playback loop is not running")]
    PlaybackUnavailable,
}

impl BotError {
    /// Text shown in chat when a command fails.
    pub fn reply_text(&self) -> String {
        match self {
            BotError::UserState(why) => why.to_string(),
            BotError::Resolution(why @ ResolutionError::UnsupportedSource { .. })
            | BotError::Resolution(why @ ResolutionError::EmptyQuery) => why.to_string(),
            BotError::Resolution(why) => format!("Couldn’t load that: `{why}` >:("),
            BotError::JoinFailed(_) | BotError::JoinTimedOut(_) => {
                format!("I couldn’t get into your voice channel: {self} :(")
            }
            BotError::Sink(_) | BotError::PlaybackUnavailable => {
                format!("Something went wrong on my side: {self} :(")
            }
        }
    }
}
