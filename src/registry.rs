use std::collections::{HashMap, VecDeque};

use serenity::model::id::{ChannelId, GuildId};
use tracing::debug;

use crate::models::{PendingTrack, QueueSnapshot, RenderId, Track};
use crate::sink::RenderHandle;

/// The track currently handed to the sink for a guild.
pub struct ActiveRender {
    pub id: RenderId,
    pub handle: Box<dyn RenderHandle>,
    pub paused: bool,
}

/// Playback state of a single guild.
#[derive(Default)]
pub struct GuildPlayback {
    queue: VecDeque<Track>,
    now_playing: Option<String>,
    active: Option<ActiveRender>,
    announce_channel: Option<ChannelId>,
}

impl GuildPlayback {
    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn active(&self) -> Option<&ActiveRender> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveRender> {
        self.active.as_mut()
    }

    pub fn start(&mut self, render: ActiveRender) {
        self.active = Some(render);
    }

    pub fn take_active(&mut self) -> Option<ActiveRender> {
        self.active.take()
    }

    pub fn announce_channel(&self) -> Option<ChannelId> {
        self.announce_channel
    }

    pub fn set_announce_channel(&mut self, channel_id: ChannelId) {
        self.announce_channel = Some(channel_id);
    }
}

/// Per-guild queues and now-playing titles, created lazily on first use.
#[derive(Default)]
pub struct GuildRegistry {
    guilds: HashMap<GuildId, GuildPlayback>,
}

impl GuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, guild_id: GuildId) -> &mut GuildPlayback {
        self.guilds.entry(guild_id).or_insert_with(|| {
            debug!(guild_id = guild_id.0, "Creating playback state");
            GuildPlayback::default()
        })
    }

    pub fn get(&self, guild_id: GuildId) -> Option<&GuildPlayback> {
        self.guilds.get(&guild_id)
    }

    pub fn get_mut(&mut self, guild_id: GuildId) -> Option<&mut GuildPlayback> {
        self.guilds.get_mut(&guild_id)
    }

    /// Appends to the tail of the guild's queue and returns the new queue length.
    pub fn enqueue(&mut self, guild_id: GuildId, track: Track) -> usize {
        let queue = &mut self.get_or_create(guild_id).queue;
        queue.push_back(track);
        queue.len()
    }

    pub fn dequeue_next(&mut self, guild_id: GuildId) -> Option<Track> {
        self.guilds
            .get_mut(&guild_id)
            .and_then(|guild| guild.queue.pop_front())
    }

    /// Empties the pending queue, leaving the active render alone. Returns how many were dropped.
    pub fn clear(&mut self, guild_id: GuildId) -> usize {
        match self.guilds.get_mut(&guild_id) {
            Some(guild) => {
                let count = guild.queue.len();
                guild.queue.clear();
                count
            }
            None => 0,
        }
    }

    pub fn pending_len(&self, guild_id: GuildId) -> usize {
        self.get(guild_id).map_or(0, |guild| guild.queue.len())
    }

    pub fn set_now_playing(&mut self, guild_id: GuildId, title: String) {
        self.get_or_create(guild_id).now_playing = Some(title);
    }

    pub fn now_playing(&self, guild_id: GuildId) -> Option<&str> {
        self.get(guild_id)?.now_playing.as_deref()
    }

    pub fn clear_now_playing(&mut self, guild_id: GuildId) {
        if let Some(guild) = self.guilds.get_mut(&guild_id) {
            guild.now_playing = None;
        }
    }

    pub fn snapshot(&self, guild_id: GuildId) -> QueueSnapshot {
        match self.get(guild_id) {
            Some(guild) => QueueSnapshot {
                now_playing: guild.now_playing.clone(),
                pending: guild.queue.iter().map(PendingTrack::from).collect(),
            },
            None => QueueSnapshot::default(),
        }
    }

    pub fn remove(&mut self, guild_id: GuildId) -> Option<GuildPlayback> {
        self.guilds.remove(&guild_id)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (GuildId, GuildPlayback)> + '_ {
        self.guilds.drain()
    }
}
