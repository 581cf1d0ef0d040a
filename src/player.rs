//! The playback control loop.
//!
//! Every guild's queue and now-playing state lives inside [`PlaybackLoop`] and is only
//! touched from the task running [`PlaybackLoop::run`]. Commands and sink completion
//! events reach it as [`PlaybackRequest`]s through one inbox, which is drained serially.

use std::sync::Arc;
use std::time::Duration;

use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use crate::announce::Announcer;
use crate::error::{BotError, SinkError, UserStateError};
use crate::models::{EnqueueOutcome, QueueSnapshot, RenderId, RenderOutcome, Track};
use crate::registry::{ActiveRender, GuildRegistry};
use crate::sink::{AudioSink, CompletionNotifier};

#[derive(Debug)]
pub enum PlaybackRequest {
    Enqueue {
        guild_id: GuildId,
        channel_id: ChannelId,
        track: Track,
        reply: oneshot::Sender<EnqueueOutcome>,
    },
    Skip {
        guild_id: GuildId,
        reply: oneshot::Sender<Result<String, UserStateError>>,
    },
    Stop {
        guild_id: GuildId,
        reply: oneshot::Sender<usize>,
    },
    Pause {
        guild_id: GuildId,
        reply: oneshot::Sender<Result<String, BotError>>,
    },
    Resume {
        guild_id: GuildId,
        reply: oneshot::Sender<Result<String, BotError>>,
    },
    NowPlaying {
        guild_id: GuildId,
        reply: oneshot::Sender<Option<String>>,
    },
    Queue {
        guild_id: GuildId,
        reply: oneshot::Sender<QueueSnapshot>,
    },
    Forget {
        guild_id: GuildId,
        reply: oneshot::Sender<()>,
    },
    RenderEnded {
        guild_id: GuildId,
        render_id: RenderId,
        outcome: RenderOutcome,
    },
    Shutdown,
}

/// Cloneable front door to the playback loop, handed to every command.
#[derive(Clone, Debug)]
pub struct PlaybackHandle {
    inbox: UnboundedSender<PlaybackRequest>,
}

impl PlaybackHandle {
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        track: Track,
    ) -> Result<EnqueueOutcome, BotError> {
        self.request(|reply| PlaybackRequest::Enqueue {
            guild_id,
            channel_id,
            track,
            reply,
        })
        .await
    }

    pub async fn skip(&self, guild_id: GuildId) -> Result<String, BotError> {
        Ok(self
            .request(|reply| PlaybackRequest::Skip { guild_id, reply })
            .await??)
    }

    pub async fn stop(&self, guild_id: GuildId) -> Result<usize, BotError> {
        self.request(|reply| PlaybackRequest::Stop { guild_id, reply })
            .await
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<String, BotError> {
        self.request(|reply| PlaybackRequest::Pause { guild_id, reply })
            .await?
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<String, BotError> {
        self.request(|reply| PlaybackRequest::Resume { guild_id, reply })
            .await?
    }

    pub async fn now_playing(&self, guild_id: GuildId) -> Result<Option<String>, BotError> {
        self.request(|reply| PlaybackRequest::NowPlaying { guild_id, reply })
            .await
    }

    pub async fn queue(&self, guild_id: GuildId) -> Result<QueueSnapshot, BotError> {
        self.request(|reply| PlaybackRequest::Queue { guild_id, reply })
            .await
    }

    pub async fn forget(&self, guild_id: GuildId) -> Result<(), BotError> {
        self.request(|reply| PlaybackRequest::Forget { guild_id, reply })
            .await
    }

    pub fn shutdown(&self) {
        if self.inbox.send(PlaybackRequest::Shutdown).is_err() {
            debug!("Playback loop already stopped");
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PlaybackRequest,
    ) -> Result<T, BotError> {
        let (reply, response) = oneshot::channel();

        self.inbox
            .send(build(reply))
            .map_err(|_| BotError::PlaybackUnavailable)?;

        response.await.map_err(|_| BotError::PlaybackUnavailable)
    }
}

pub struct PlaybackLoop {
    guilds: GuildRegistry,
    sink: Arc<dyn AudioSink>,
    announcer: Arc<dyn Announcer>,
    inbox: UnboundedReceiver<PlaybackRequest>,
    notifications: UnboundedSender<PlaybackRequest>,
    last_render: u64,
    start_timeout: Duration,
}

impl PlaybackLoop {
    /// `start_timeout` bounds how long the sink may take to open a track. The loop serves
    /// every guild, so a stuck source must not hold it.
    pub fn new(
        sink: Arc<dyn AudioSink>,
        announcer: Arc<dyn Announcer>,
        start_timeout: Duration,
    ) -> (Self, PlaybackHandle) {
        let (sender, inbox) = mpsc::unbounded_channel();

        let playback = Self {
            guilds: GuildRegistry::new(),
            sink,
            announcer,
            inbox,
            notifications: sender.clone(),
            last_render: 0,
            start_timeout,
        };

        (playback, PlaybackHandle { inbox: sender })
    }

    /// Starts the loop on its own task.
    pub fn spawn(
        sink: Arc<dyn AudioSink>,
        announcer: Arc<dyn Announcer>,
        start_timeout: Duration,
    ) -> (PlaybackHandle, JoinHandle<()>) {
        let (playback, handle) = Self::new(sink, announcer, start_timeout);
        let task = tokio::spawn(playback.run().instrument(info_span!("playback")));

        (handle, task)
    }

    pub async fn run(mut self) {
        info!("Playback loop started");

        while let Some(request) = self.inbox.recv().await {
            if matches!(request, PlaybackRequest::Shutdown) {
                break;
            }

            self.handle(request).await;
        }

        for (guild_id, mut guild) in self.guilds.drain() {
            if let Some(render) = guild.take_active() {
                stop_render(guild_id, &render);
            }
        }

        info!("Playback loop stopped");
    }

    async fn handle(&mut self, request: PlaybackRequest) {
        // A dropped receiver only means the command gave up waiting.
        match request {
            PlaybackRequest::Enqueue {
                guild_id,
                channel_id,
                track,
                reply,
            } => {
                let _ = reply.send(self.enqueue(guild_id, channel_id, track).await);
            }
            PlaybackRequest::Skip { guild_id, reply } => {
                let _ = reply.send(self.skip(guild_id).await);
            }
            PlaybackRequest::Stop { guild_id, reply } => {
                let _ = reply.send(self.stop(guild_id));
            }
            PlaybackRequest::Pause { guild_id, reply } => {
                let _ = reply.send(self.pause(guild_id));
            }
            PlaybackRequest::Resume { guild_id, reply } => {
                let _ = reply.send(self.resume(guild_id));
            }
            PlaybackRequest::NowPlaying { guild_id, reply } => {
                let _ = reply.send(self.guilds.now_playing(guild_id).map(str::to_string));
            }
            PlaybackRequest::Queue { guild_id, reply } => {
                let _ = reply.send(self.guilds.snapshot(guild_id));
            }
            PlaybackRequest::Forget { guild_id, reply } => {
                self.forget(guild_id);
                let _ = reply.send(());
            }
            PlaybackRequest::RenderEnded {
                guild_id,
                render_id,
                outcome,
            } => self.render_ended(guild_id, render_id, outcome).await,
            PlaybackRequest::Shutdown => {}
        }
    }

    pub async fn enqueue(
        &mut self,
        guild_id: GuildId,
        channel_id: ChannelId,
        track: Track,
    ) -> EnqueueOutcome {
        let title = track.title.clone();
        let guild = self.guilds.get_or_create(guild_id);
        guild.set_announce_channel(channel_id);
        let was_idle = guild.is_idle();

        let position = self.guilds.enqueue(guild_id, track);
        info!(guild_id = guild_id.0, %title, position, "Track enqueued");

        if !was_idle {
            return EnqueueOutcome::Queued { title, position };
        }

        match self.advance(guild_id).await {
            Some(started) => EnqueueOutcome::Started {
                title: started.title,
            },
            None => EnqueueOutcome::NotStarted { title },
        }
    }

    /// Stops the active render and moves straight on to the next queued track.
    pub async fn skip(&mut self, guild_id: GuildId) -> Result<String, UserStateError> {
        let render = self
            .end_active(guild_id)
            .ok_or(UserStateError::NothingPlaying)?;
        stop_render(guild_id, &render.0);
        info!(guild_id = guild_id.0, title = %render.1, "Skipping");

        self.advance(guild_id).await;

        Ok(render.1)
    }

    /// Stops the active render and drops everything pending. Returns how many tracks were dropped.
    pub fn stop(&mut self, guild_id: GuildId) -> usize {
        if let Some((render, _)) = self.end_active(guild_id) {
            stop_render(guild_id, &render);
        }

        let dropped = self.guilds.clear(guild_id);
        info!(guild_id = guild_id.0, dropped, "Stopped and cleared the queue");

        dropped
    }

    pub fn pause(&mut self, guild_id: GuildId) -> Result<String, BotError> {
        let title = self.guilds.now_playing(guild_id).map(str::to_string);
        let render = self
            .guilds
            .get_mut(guild_id)
            .and_then(|guild| guild.active_mut())
            .filter(|render| !render.paused)
            .ok_or(UserStateError::NothingToPause)?;

        render.handle.pause()?;
        render.paused = true;

        Ok(title.unwrap_or_default())
    }

    pub fn resume(&mut self, guild_id: GuildId) -> Result<String, BotError> {
        let title = self.guilds.now_playing(guild_id).map(str::to_string);
        let render = self
            .guilds
            .get_mut(guild_id)
            .and_then(|guild| guild.active_mut())
            .filter(|render| render.paused)
            .ok_or(UserStateError::NothingToResume)?;

        render.handle.resume()?;
        render.paused = false;

        Ok(title.unwrap_or_default())
    }

    /// Tears down all state for a guild the bot left.
    pub fn forget(&mut self, guild_id: GuildId) {
        if let Some(mut guild) = self.guilds.remove(guild_id) {
            if let Some(render) = guild.take_active() {
                stop_render(guild_id, &render);
            }
            info!(guild_id = guild_id.0, "Dropped playback state");
        }
    }

    pub async fn render_ended(
        &mut self,
        guild_id: GuildId,
        render_id: RenderId,
        outcome: RenderOutcome,
    ) {
        let is_current = self
            .guilds
            .get(guild_id)
            .and_then(|guild| guild.active())
            .map_or(false, |render| render.id == render_id);

        if !is_current {
            debug!(guild_id = guild_id.0, %render_id, "Ignoring end of a render that is no longer active");
            return;
        }

        let pending = self.guilds.pending_len(guild_id);

        match outcome {
            RenderOutcome::Finished => info!(guild_id = guild_id.0, %render_id, pending, "Track finished"),
            RenderOutcome::Stopped => {
                info!(guild_id = guild_id.0, %render_id, pending, "Track stopped by the voice driver")
            }
        }

        self.end_active(guild_id);
        self.advance(guild_id).await;
    }

    /// Dequeues until the sink accepts a track or the queue runs dry.
    ///
    /// A rejected track is dropped and the following one is tried; nothing is retried.
    async fn advance(&mut self, guild_id: GuildId) -> Option<Track> {
        while let Some(track) = self.guilds.dequeue_next(guild_id) {
            self.last_render += 1;
            let render_id = RenderId(self.last_render);
            let notifier =
                CompletionNotifier::new(guild_id, render_id, self.notifications.clone());

            let started = timeout(self.start_timeout, self.sink.play(guild_id, &track, notifier))
                .await
                .unwrap_or(Err(SinkError::TimedOut(self.start_timeout)));

            let handle = match started {
                Ok(handle) => handle,
                Err(why) => {
                    warn!(guild_id = guild_id.0, title = %track.title, error = %why, "Sink rejected track, moving on");
                    continue;
                }
            };

            info!(guild_id = guild_id.0, %render_id, title = %track.title, "Now playing");

            let guild = self.guilds.get_or_create(guild_id);
            guild.start(ActiveRender {
                id: render_id,
                handle,
                paused: false,
            });
            let channel = guild.announce_channel();
            self.guilds.set_now_playing(guild_id, track.title.clone());

            if let Some(channel_id) = channel {
                self.announcer.announce(channel_id, now_playing_text(&track));
            }

            return Some(track);
        }

        debug!(guild_id = guild_id.0, "Queue is empty, going idle");

        None
    }

    /// Detaches the active render (if any) and clears now-playing with it.
    fn end_active(&mut self, guild_id: GuildId) -> Option<(ActiveRender, String)> {
        let title = self.guilds.now_playing(guild_id).unwrap_or_default().to_string();
        self.guilds.clear_now_playing(guild_id);

        self.guilds
            .get_mut(guild_id)?
            .take_active()
            .map(|render| (render, title))
    }
}

fn stop_render(guild_id: GuildId, render: &ActiveRender) {
    if let Err(why) = render.handle.stop() {
        warn!(guild_id = guild_id.0, render_id = %render.id, error = %why, "Could not stop render");
    }
}

pub fn now_playing_text(track: &Track) -> String {
    match track.duration_label() {
        Some(duration) => format!(
            "▶️ Now playing: **{}** `{duration}`\n{}",
            track.title, track.page_url
        ),
        None => format!("▶️ Now playing: **{}**\n{}", track.title, track.page_url),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serenity::async_trait;

    use super::*;
    use crate::sink::RenderHandle;

    const GUILD: GuildId = GuildId(42);
    const CHANNEL: ChannelId = ChannelId(7);
    const START_TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RenderLog {
        paused: bool,
        stopped: bool,
    }

    struct FakeHandle(Arc<Mutex<RenderLog>>);

    impl RenderHandle for FakeHandle {
        fn pause(&self) -> Result<(), SinkError> {
            self.0.lock().unwrap().paused = true;
            Ok(())
        }

        fn resume(&self) -> Result<(), SinkError> {
            self.0.lock().unwrap().paused = false;
            Ok(())
        }

        fn stop(&self) -> Result<(), SinkError> {
            self.0.lock().unwrap().stopped = true;
            Ok(())
        }
    }

    struct Render {
        title: String,
        notifier: CompletionNotifier,
        log: Arc<Mutex<RenderLog>>,
    }

    #[derive(Default)]
    struct FakeSink {
        renders: Mutex<Vec<Render>>,
        reject: Mutex<Vec<String>>,
        hang_in: Option<GuildId>,
    }

    impl FakeSink {
        fn rejecting(titles: &[&str]) -> Self {
            Self {
                reject: Mutex::new(titles.iter().map(|t| t.to_string()).collect()),
                ..Self::default()
            }
        }

        fn titles(&self) -> Vec<String> {
            self.renders
                .lock()
                .unwrap()
                .iter()
                .map(|render| render.title.clone())
                .collect()
        }

        fn last_render_id(&self) -> RenderId {
            self.renders.lock().unwrap().last().unwrap().notifier.render_id()
        }

        fn log(&self, index: usize) -> Arc<Mutex<RenderLog>> {
            Arc::clone(&self.renders.lock().unwrap()[index].log)
        }

        fn notifier(&self, index: usize) -> CompletionNotifier {
            self.renders.lock().unwrap()[index].notifier.clone()
        }
    }

    #[async_trait]
    impl AudioSink for FakeSink {
        async fn play(
            &self,
            guild_id: GuildId,
            track: &Track,
            notifier: CompletionNotifier,
        ) -> Result<Box<dyn RenderHandle>, SinkError> {
            if self.hang_in == Some(guild_id) {
                std::future::pending::<()>().await;
            }

            if self.reject.lock().unwrap().contains(&track.title) {
                return Err(SinkError::NotConnected);
            }

            let log = Arc::new(Mutex::new(RenderLog::default()));
            self.renders.lock().unwrap().push(Render {
                title: track.title.clone(),
                notifier,
                log: Arc::clone(&log),
            });

            Ok(Box::new(FakeHandle(log)))
        }
    }

    #[derive(Default)]
    struct FakeAnnouncer {
        said: Mutex<Vec<(ChannelId, String)>>,
    }

    impl Announcer for FakeAnnouncer {
        fn announce(&self, channel_id: ChannelId, text: String) {
            self.said.lock().unwrap().push((channel_id, text));
        }
    }

    fn track(title: &str) -> Track {
        Track {
            title: title.to_string(),
            stream_url: format!("https://cdn.example/{title}"),
            page_url: format!("https://example.com/{title}"),
            duration: None,
        }
    }

    fn playback(sink: FakeSink) -> (PlaybackLoop, Arc<FakeSink>, Arc<FakeAnnouncer>) {
        let sink = Arc::new(sink);
        let announcer = Arc::new(FakeAnnouncer::default());
        let (playback, _handle) = PlaybackLoop::new(sink.clone(), announcer.clone(), START_TIMEOUT);

        (playback, sink, announcer)
    }

    #[tokio::test]
    async fn first_play_starts_and_later_plays_queue_in_order() {
        let (mut playback, sink, announcer) = playback(FakeSink::default());

        let first = playback.enqueue(GUILD, CHANNEL, track("song A")).await;
        let second = playback.enqueue(GUILD, CHANNEL, track("song B")).await;
        let third = playback.enqueue(GUILD, CHANNEL, track("song C")).await;

        assert_eq!(
            first,
            EnqueueOutcome::Started {
                title: "song A".to_string(),
            }
        );
        assert_eq!(
            second,
            EnqueueOutcome::Queued {
                title: "song B".to_string(),
                position: 1
            }
        );
        assert_eq!(
            third,
            EnqueueOutcome::Queued {
                title: "song C".to_string(),
                position: 2
            }
        );
        assert_eq!(sink.titles(), ["song A"]);
        assert_eq!(playback.guilds.now_playing(GUILD), Some("song A"));

        let said = announcer.said.lock().unwrap();
        assert_eq!(said.len(), 1);
        assert_eq!(said[0].0, CHANNEL);
        assert!(said[0].1.contains("song A"));
    }

    #[tokio::test]
    async fn completion_advances_to_the_next_track() {
        let (mut playback, sink, _) = playback(FakeSink::default());
        playback.enqueue(GUILD, CHANNEL, track("song A")).await;
        playback.enqueue(GUILD, CHANNEL, track("song B")).await;
        assert_eq!(playback.guilds.pending_len(GUILD), 1);

        playback
            .render_ended(GUILD, sink.last_render_id(), RenderOutcome::Finished)
            .await;

        assert_eq!(sink.titles(), ["song A", "song B"]);
        assert_eq!(playback.guilds.now_playing(GUILD), Some("song B"));
        assert_eq!(playback.guilds.pending_len(GUILD), 0);
    }

    #[tokio::test]
    async fn completion_with_empty_queue_goes_idle() {
        let (mut playback, sink, _) = playback(FakeSink::default());
        playback.enqueue(GUILD, CHANNEL, track("song A")).await;

        playback
            .render_ended(GUILD, sink.last_render_id(), RenderOutcome::Finished)
            .await;

        assert_eq!(playback.guilds.now_playing(GUILD), None);
        assert!(playback.guilds.get(GUILD).unwrap().is_idle());

        let next = playback.enqueue(GUILD, CHANNEL, track("song B")).await;
        assert!(matches!(next, EnqueueOutcome::Started { .. }));
    }

    #[tokio::test]
    async fn stale_completion_is_ignored() {
        let (mut playback, sink, _) = playback(FakeSink::default());
        playback.enqueue(GUILD, CHANNEL, track("song A")).await;
        let first_render = sink.last_render_id();
        playback.enqueue(GUILD, CHANNEL, track("song B")).await;
        playback.enqueue(GUILD, CHANNEL, track("song C")).await;

        playback.skip(GUILD).await.unwrap();
        playback
            .render_ended(GUILD, first_render, RenderOutcome::Stopped)
            .await;

        assert_eq!(sink.titles(), ["song A", "song B"]);
        assert_eq!(playback.guilds.now_playing(GUILD), Some("song B"));
        assert_eq!(playback.guilds.pending_len(GUILD), 1);
    }

    #[tokio::test]
    async fn skip_moves_to_next_or_idles() {
        let (mut playback, sink, _) = playback(FakeSink::default());
        playback.enqueue(GUILD, CHANNEL, track("song A")).await;
        playback.enqueue(GUILD, CHANNEL, track("song B")).await;

        assert_eq!(playback.skip(GUILD).await, Ok("song A".to_string()));
        assert!(sink.log(0).lock().unwrap().stopped);
        assert_eq!(playback.guilds.now_playing(GUILD), Some("song B"));

        assert_eq!(playback.skip(GUILD).await, Ok("song B".to_string()));
        assert_eq!(playback.guilds.now_playing(GUILD), None);
        assert!(playback.guilds.get(GUILD).unwrap().is_idle());
    }

    #[tokio::test]
    async fn skip_while_idle_is_a_user_error() {
        let (mut playback, _, _) = playback(FakeSink::default());

        assert_eq!(
            playback.skip(GUILD).await,
            Err(UserStateError::NothingPlaying)
        );
    }

    #[tokio::test]
    async fn stop_clears_queue_and_now_playing() {
        let (mut playback, sink, _) = playback(FakeSink::default());
        for title in ["song B", "song C", "song D"] {
            playback.enqueue(GUILD, CHANNEL, track(title)).await;
        }

        assert_eq!(playback.stop(GUILD), 2);

        assert!(sink.log(0).lock().unwrap().stopped);
        assert_eq!(playback.guilds.pending_len(GUILD), 0);
        assert_eq!(playback.guilds.now_playing(GUILD), None);

        playback
            .render_ended(GUILD, sink.last_render_id(), RenderOutcome::Stopped)
            .await;
        assert_eq!(sink.titles(), ["song B"]);
    }

    #[tokio::test]
    async fn stop_on_untouched_guild_is_harmless() {
        let (mut playback, _, _) = playback(FakeSink::default());

        assert_eq!(playback.stop(GUILD), 0);
        assert_eq!(playback.guilds.now_playing(GUILD), None);
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_the_render() {
        let (mut playback, sink, _) = playback(FakeSink::default());

        assert!(matches!(
            playback.pause(GUILD),
            Err(BotError::UserState(UserStateError::NothingToPause))
        ));

        playback.enqueue(GUILD, CHANNEL, track("song A")).await;

        assert!(matches!(
            playback.resume(GUILD),
            Err(BotError::UserState(UserStateError::NothingToResume))
        ));
        assert_eq!(playback.pause(GUILD).unwrap(), "song A");
        assert!(sink.log(0).lock().unwrap().paused);
        assert!(matches!(
            playback.pause(GUILD),
            Err(BotError::UserState(UserStateError::NothingToPause))
        ));

        let queued = playback.enqueue(GUILD, CHANNEL, track("song B")).await;
        assert!(matches!(queued, EnqueueOutcome::Queued { .. }));

        assert_eq!(playback.resume(GUILD).unwrap(), "song A");
        assert!(!sink.log(0).lock().unwrap().paused);
    }

    #[tokio::test]
    async fn rejected_track_falls_through_to_the_next() {
        let (mut playback, sink, _) = playback(FakeSink::rejecting(&["song B"]));
        for title in ["song A", "song B", "song C"] {
            playback.enqueue(GUILD, CHANNEL, track(title)).await;
        }

        playback
            .render_ended(GUILD, sink.last_render_id(), RenderOutcome::Finished)
            .await;

        assert_eq!(sink.titles(), ["song A", "song C"]);
        assert_eq!(playback.guilds.now_playing(GUILD), Some("song C"));
        assert_eq!(playback.guilds.pending_len(GUILD), 0);
    }

    #[tokio::test]
    async fn rejected_only_track_leaves_guild_idle() {
        let (mut playback, _, announcer) = playback(FakeSink::rejecting(&["song A"]));

        let outcome = playback.enqueue(GUILD, CHANNEL, track("song A")).await;

        assert_eq!(
            outcome,
            EnqueueOutcome::NotStarted {
                title: "song A".to_string()
            }
        );
        assert_eq!(playback.guilds.now_playing(GUILD), None);
        assert_eq!(playback.guilds.pending_len(GUILD), 0);
        assert!(announcer.said.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn guilds_are_independent() {
        let (mut playback, _, _) = playback(FakeSink::default());
        let other = GuildId(43);

        playback.enqueue(GUILD, CHANNEL, track("song A")).await;
        let outcome = playback.enqueue(other, CHANNEL, track("song X")).await;

        assert!(matches!(outcome, EnqueueOutcome::Started { .. }));
        assert_eq!(playback.stop(GUILD), 0);
        assert_eq!(playback.guilds.now_playing(other), Some("song X"));
    }

    #[tokio::test]
    async fn forget_drops_the_guild() {
        let (mut playback, sink, _) = playback(FakeSink::default());
        playback.enqueue(GUILD, CHANNEL, track("song A")).await;
        playback.enqueue(GUILD, CHANNEL, track("song B")).await;

        playback.forget(GUILD);

        assert!(sink.log(0).lock().unwrap().stopped);
        assert!(playback.guilds.get(GUILD).is_none());
        assert_eq!(playback.guilds.now_playing(GUILD), None);
    }

    #[tokio::test]
    async fn spawned_loop_advances_on_completion_from_another_task() {
        let sink = Arc::new(FakeSink::default());
        let announcer = Arc::new(FakeAnnouncer::default());
        let (handle, task) = PlaybackLoop::spawn(sink.clone(), announcer.clone(), START_TIMEOUT);

        handle.enqueue(GUILD, CHANNEL, track("song A")).await.unwrap();
        let queued = handle.enqueue(GUILD, CHANNEL, track("song B")).await.unwrap();
        assert!(matches!(queued, EnqueueOutcome::Queued { position: 1, .. }));
        assert_eq!(sink.titles(), ["song A"]);

        // The voice driver reports completions from its own thread.
        let notifier = sink.notifier(0);
        std::thread::spawn(move || notifier.notify(RenderOutcome::Finished))
            .join()
            .unwrap();

        let mut waited = Duration::ZERO;
        while announcer.said.lock().unwrap().len() < 2 && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }

        assert_eq!(sink.titles(), ["song A", "song B"]);
        let snapshot = handle.queue(GUILD).await.unwrap();
        assert_eq!(snapshot.now_playing.as_deref(), Some("song B"));
        assert!(snapshot.pending.is_empty());

        handle.shutdown();
        task.await.unwrap();
        assert!(matches!(
            handle.now_playing(GUILD).await,
            Err(BotError::PlaybackUnavailable)
        ));
    }

    #[tokio::test]
    async fn handle_reports_user_errors() {
        let (handle, _task) = PlaybackLoop::spawn(
            Arc::new(FakeSink::default()),
            Arc::new(FakeAnnouncer::default()),
            START_TIMEOUT,
        );

        assert!(matches!(
            handle.skip(GUILD).await,
            Err(BotError::UserState(UserStateError::NothingPlaying))
        ));
        assert_eq!(handle.now_playing(GUILD).await.unwrap(), None);
        assert_eq!(handle.stop(GUILD).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn hung_source_does_not_hold_other_guilds() {
        let stuck = GuildId(1);
        let other = GuildId(2);
        let sink = Arc::new(FakeSink {
            hang_in: Some(stuck),
            ..FakeSink::default()
        });
        let (handle, _task) = PlaybackLoop::spawn(
            sink.clone(),
            Arc::new(FakeAnnouncer::default()),
            Duration::from_millis(100),
        );

        let stuck_handle = handle.clone();
        let stuck_play =
            tokio::spawn(async move { stuck_handle.enqueue(stuck, CHANNEL, track("dead stream")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let answered = tokio::time::timeout(Duration::from_secs(5), async {
            handle.enqueue(other, CHANNEL, track("song X")).await.unwrap();
            handle.now_playing(other).await.unwrap()
        })
        .await
        .unwrap();

        assert_eq!(answered.as_deref(), Some("song X"));
        assert_eq!(
            stuck_play.await.unwrap().unwrap(),
            EnqueueOutcome::NotStarted {
                title: "dead stream".to_string()
            }
        );
        assert_eq!(handle.now_playing(stuck).await.unwrap(), None);
        assert_eq!(sink.titles(), ["song X"]);
    }

    #[test]
    fn announcement_includes_duration_when_known() {
        let mut song = track("song A");
        song.duration = Some(Duration::from_secs(185));

        assert_eq!(
            now_playing_text(&song),
            "▶️ Now playing: **song A** `3:05`\nhttps://example.com/song A"
        );
    }
}
