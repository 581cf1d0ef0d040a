use std::sync::Arc;

use serenity::async_trait;
use serenity::model::id::GuildId;
use songbird::tracks::{PlayMode, TrackHandle};
use songbird::{Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::error::SinkError;
use crate::models::{RenderId, RenderOutcome, Track};
use crate::player::PlaybackRequest;

/// Renders tracks into a guild's voice connection.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Starts rendering `track`. The sink must call `notifier` exactly when the render ends.
    async fn play(
        &self,
        guild_id: GuildId,
        track: &Track,
        notifier: CompletionNotifier,
    ) -> Result<Box<dyn RenderHandle>, SinkError>;
}

/// Control over one running render.
pub trait RenderHandle: Send + Sync {
    fn pause(&self) -> Result<(), SinkError>;
    fn resume(&self) -> Result<(), SinkError>;
    fn stop(&self) -> Result<(), SinkError>;
}

/// Posts the end of a render back onto the playback loop's inbox.
///
/// The sink usually fires this from its own driver task, so it never touches
/// guild state itself.
#[derive(Clone, Debug)]
pub struct CompletionNotifier {
    guild_id: GuildId,
    render_id: RenderId,
    inbox: UnboundedSender<PlaybackRequest>,
}

impl CompletionNotifier {
    pub(crate) fn new(
        guild_id: GuildId,
        render_id: RenderId,
        inbox: UnboundedSender<PlaybackRequest>,
    ) -> Self {
        Self {
            guild_id,
            render_id,
            inbox,
        }
    }

    pub fn render_id(&self) -> RenderId {
        self.render_id
    }

    pub fn notify(&self, outcome: RenderOutcome) {
        let request = PlaybackRequest::RenderEnded {
            guild_id: self.guild_id,
            render_id: self.render_id,
            outcome,
        };

        if self.inbox.send(request).is_err() {
            debug!(guild_id = self.guild_id.0, render_id = %self.render_id, "Playback loop gone, dropping render end");
        }
    }
}

pub struct SongbirdSink {
    manager: Arc<Songbird>,
}

impl SongbirdSink {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl AudioSink for SongbirdSink {
    async fn play(
        &self,
        guild_id: GuildId,
        track: &Track,
        notifier: CompletionNotifier,
    ) -> Result<Box<dyn RenderHandle>, SinkError> {
        let handler_lock = self.manager.get(guild_id).ok_or(SinkError::NotConnected)?;

        if handler_lock.lock().await.current_connection().is_none() {
            return Err(SinkError::NotConnected);
        }

        let source = songbird::input::ffmpeg(&track.stream_url)
            .await
            .map_err(|why| SinkError::Source(why.to_string()))?;

        let mut handler = handler_lock.lock().await;
        handler.stop(); // Just in case something was playing before
        let track_handle = handler.play_source(source);

        track_handle
            .add_event(Event::Track(TrackEvent::End), TrackEndNotifier { notifier })
            .map_err(|why| SinkError::Control(why.to_string()))?;

        Ok(Box::new(track_handle))
    }
}

impl RenderHandle for TrackHandle {
    fn pause(&self) -> Result<(), SinkError> {
        TrackHandle::pause(self).map_err(|why| SinkError::Control(why.to_string()))
    }

    fn resume(&self) -> Result<(), SinkError> {
        self.play().map_err(|why| SinkError::Control(why.to_string()))
    }

    fn stop(&self) -> Result<(), SinkError> {
        TrackHandle::stop(self).map_err(|why| SinkError::Control(why.to_string()))
    }
}

struct TrackEndNotifier {
    notifier: CompletionNotifier,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let outcome = match ctx {
            EventContext::Track(tracks)
                if tracks.iter().any(|(state, _)| state.playing == PlayMode::Stop) =>
            {
                RenderOutcome::Stopped
            }
            _ => RenderOutcome::Finished,
        };

        info!(render_id = %self.notifier.render_id(), ?outcome, "End notifier triggered");
        self.notifier.notify(outcome);

        None
    }
}
