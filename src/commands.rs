use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serenity::client::Context;
use serenity::framework::standard::macros::{command, group};
use serenity::framework::standard::{Args, CommandError, CommandResult};
use serenity::model::channel::Message;
use serenity::model::channel::ReactionType::Unicode;
use serenity::model::id::{ChannelId, GuildId};
use serenity::prelude::{Mentionable, TypeMapKey};
use songbird::Songbird;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::announce::check_msg;
use crate::error::{BotError, UserStateError};
use crate::models::{format_duration, EnqueueOutcome, QueueSnapshot};
use crate::player::PlaybackHandle;
use crate::resolver::{resolve_query, screen_query, TrackResolver};

const MAX_LISTED_TRACKS: usize = 20;
const LOADING_EMOJI: &str = "⏳";

/// Everything a command needs, stored once in the client's type map.
pub struct BotContext {
    pub playback: PlaybackHandle,
    pub resolver: Arc<dyn TrackResolver>,
    pub voice: Arc<Songbird>,
    pub prefix: String,
    pub unsupported_markers: Vec<String>,
    pub resolve_timeout: Duration,
    pub connect_timeout: Duration,
    pub play_order: PlayOrder,
}

impl TypeMapKey for BotContext {
    type Value = Arc<BotContext>;
}

/// Hands out turns per guild so `play` calls reach the queue in the order they were issued,
/// however long each one takes to resolve. Waiters are served first come, first served.
#[derive(Default)]
pub struct PlayOrder {
    turns: Mutex<HashMap<GuildId, Arc<Mutex<()>>>>,
}

impl PlayOrder {
    async fn wait_turn(&self, guild_id: GuildId) -> OwnedMutexGuard<()> {
        let turn = Arc::clone(self.turns.lock().await.entry(guild_id).or_default());

        turn.lock_owned().await
    }

    /// Runs `play` once every earlier call for the same guild has finished.
    pub async fn run<F: Future>(&self, guild_id: GuildId, play: F) -> F::Output {
        let _turn = self.wait_turn(guild_id).await;

        play.await
    }
}

#[group]
#[commands(join, leave, play, skip, stop, pause, resume, nowplaying, queue, hello, help)]
pub struct General;

#[command]
#[only_in(guilds)]
async fn join(ctx: &Context, msg: &Message) -> CommandResult {
    let bot = bot_context(ctx).await?;

    let result = connect(ctx, msg, &bot)
        .await
        .map(|channel_id| Some(format!("Joined {}", channel_id.mention())));

    respond(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn leave(ctx: &Context, msg: &Message) -> CommandResult {
    let bot = bot_context(ctx).await?;

    respond(ctx, msg, leave_channel(msg, &bot).await).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let bot = bot_context(ctx).await?;

    let result = play_query(ctx, msg, &bot, args.message()).await;

    respond(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn skip(ctx: &Context, msg: &Message) -> CommandResult {
    let bot = bot_context(ctx).await?;

    let result = match guild_id(msg) {
        Ok(guild_id) => bot
            .playback
            .skip(guild_id)
            .await
            .map(|title| Some(format!("Skipped **{title}**! :O"))),
        Err(why) => Err(why),
    };

    respond(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn stop(ctx: &Context, msg: &Message) -> CommandResult {
    let bot = bot_context(ctx).await?;

    respond(ctx, msg, stop_playback(msg, &bot).await).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn pause(ctx: &Context, msg: &Message) -> CommandResult {
    let bot = bot_context(ctx).await?;

    let result = match guild_id(msg) {
        Ok(guild_id) => bot
            .playback
            .pause(guild_id)
            .await
            .map(|_| Some("Paused! :O".to_string())),
        Err(why) => Err(why),
    };

    respond(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn resume(ctx: &Context, msg: &Message) -> CommandResult {
    let bot = bot_context(ctx).await?;

    let result = match guild_id(msg) {
        Ok(guild_id) => bot
            .playback
            .resume(guild_id)
            .await
            .map(|_| Some("Resumed! :3".to_string())),
        Err(why) => Err(why),
    };

    respond(ctx, msg, result).await;

    Ok(())
}

#[command]
#[aliases(np)]
#[only_in(guilds)]
async fn nowplaying(ctx: &Context, msg: &Message) -> CommandResult {
    let bot = bot_context(ctx).await?;

    let result = match guild_id(msg) {
        Ok(guild_id) => bot
            .playback
            .now_playing(guild_id)
            .await
            .map(|title| Some(now_playing_reply(title.as_deref()))),
        Err(why) => Err(why),
    };

    respond(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn queue(ctx: &Context, msg: &Message) -> CommandResult {
    let bot = bot_context(ctx).await?;

    let result = match guild_id(msg) {
        Ok(guild_id) => bot
            .playback
            .queue(guild_id)
            .await
            .map(|snapshot| Some(queue_reply(&snapshot))),
        Err(why) => Err(why),
    };

    respond(ctx, msg, result).await;

    Ok(())
}

#[command]
async fn hello(ctx: &Context, msg: &Message) -> CommandResult {
    check_msg(msg.channel_id.say(&ctx.http, "Hello :O) !").await);

    Ok(())
}

#[command]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    let bot = bot_context(ctx).await?;

    check_msg(msg.channel_id.say(&ctx.http, help_text(&bot.prefix)).await);

    Ok(())
}

async fn bot_context(ctx: &Context) -> Result<Arc<BotContext>, CommandError> {
    let data = ctx.data.read().await;

    data.get::<BotContext>()
        .cloned()
        .ok_or_else(|| CommandError::from("Bot context was not initialised"))
}

/// Sends the outcome of a command to the channel it came from.
async fn respond(ctx: &Context, msg: &Message, result: Result<Option<String>, BotError>) {
    let text = match result {
        Ok(Some(text)) => text,
        Ok(None) => return,
        Err(why) => {
            match &why {
                BotError::UserState(_) | BotError::Resolution(_) => debug!("Command refused: {why}"),
                _ => warn!("Command failed: {why}"),
            }
            why.reply_text()
        }
    };

    check_msg(msg.channel_id.say(&ctx.http, text).await);
}

fn guild_id(msg: &Message) -> Result<GuildId, BotError> {
    Ok(msg.guild_id.ok_or(UserStateError::NotInGuild)?)
}

/// Joins the author's voice channel unless the bot is already connected in this guild.
async fn connect(ctx: &Context, msg: &Message, bot: &BotContext) -> Result<ChannelId, BotError> {
    let guild = msg.guild(&ctx.cache).ok_or(UserStateError::NotInGuild)?;

    let connect_to = guild
        .voice_states
        .get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or(UserStateError::NotInVoiceChannel)?;

    if let Some(handler_lock) = bot.voice.get(guild.id) {
        if let Some(current) = handler_lock.lock().await.current_channel() {
            return Ok(ChannelId(current.0));
        }
    }

    let (handler_lock, joined) = match timeout(bot.connect_timeout, bot.voice.join(guild.id, connect_to)).await {
        Ok(joined) => joined,
        Err(_) => {
            if let Err(why) = bot.voice.remove(guild.id).await {
                debug!("Cleanup after join timeout failed: {why:?}");
            }
            return Err(BotError::JoinTimedOut(bot.connect_timeout));
        }
    };

    joined.map_err(|why| BotError::JoinFailed(why.to_string()))?;
    info!(guild_id = guild.id.0, channel_id = connect_to.0, "Joined voice channel");

    let mut handler = handler_lock.lock().await;

    if handler.is_deaf() {
        debug!("Already deafened");
    } else if let Err(why) = handler.deafen(true).await {
        info!("Deafen failed due to {why:?}");
    }

    Ok(connect_to)
}

async fn leave_channel(msg: &Message, bot: &BotContext) -> Result<Option<String>, BotError> {
    let guild_id = guild_id(msg)?;

    if bot.voice.get(guild_id).is_none() {
        return Err(UserStateError::BotNotInVoiceChannel.into());
    }

    bot.playback.forget(guild_id).await?;

    if let Err(why) = bot.voice.remove(guild_id).await {
        warn!(guild_id = guild_id.0, "Leaving voice failed: {why:?}");
    }

    Ok(Some("Left the channel and cleared the queue! :)".to_string()))
}

async fn play_query(
    ctx: &Context,
    msg: &Message,
    bot: &BotContext,
    query: &str,
) -> Result<Option<String>, BotError> {
    let guild_id = guild_id(msg)?;
    let query = screen_query(query, &bot.unsupported_markers)?;

    bot.play_order
        .run(guild_id, connect_and_queue(ctx, msg, bot, guild_id, query))
        .await
}

async fn connect_and_queue(
    ctx: &Context,
    msg: &Message,
    bot: &BotContext,
    guild_id: GuildId,
    query: &str,
) -> Result<Option<String>, BotError> {
    connect(ctx, msg, bot).await?;

    info!(guild_id = guild_id.0, "User input is {query}");

    let loading_emoji = Unicode(LOADING_EMOJI.to_string());
    if let Err(why) = msg.react(&ctx.http, loading_emoji.clone()).await {
        debug!("Could not react: {why:?}");
    }

    let resolved = resolve_query(
        bot.resolver.as_ref(),
        query,
        &bot.unsupported_markers,
        bot.resolve_timeout,
    )
    .await;

    if let Err(why) = msg
        .channel_id
        .delete_reaction(&ctx.http, msg.id, Some(ctx.cache.current_user_id()), loading_emoji)
        .await
    {
        debug!("Could not remove reaction: {why:?}");
    }

    let outcome = bot.playback.enqueue(guild_id, msg.channel_id, resolved?).await?;

    Ok(enqueue_reply(&outcome))
}

async fn stop_playback(msg: &Message, bot: &BotContext) -> Result<Option<String>, BotError> {
    let guild_id = guild_id(msg)?;

    bot.playback.stop(guild_id).await?;

    if bot.voice.get(guild_id).is_none() {
        return Err(UserStateError::BotNotInVoiceChannel.into());
    }

    Ok(Some("Stopped and cleared the queue! :)".to_string()))
}

/// Reply for `play`. A started track is announced by the playback loop instead.
fn enqueue_reply(outcome: &EnqueueOutcome) -> Option<String> {
    match outcome {
        EnqueueOutcome::Started { title } => {
            debug!("{title} started right away");
            None
        }
        EnqueueOutcome::Queued { title, position } => {
            Some(format!("Queued: **{title}** :D (#{position} in line)"))
        }
        EnqueueOutcome::NotStarted { title } => {
            Some(format!("Couldn’t start **{title}**, am I still connected? :("))
        }
    }
}

fn now_playing_reply(title: Option<&str>) -> String {
    match title {
        Some(title) => format!("Now playing: **{title}**"),
        None => "Nothing is playing!! >:O".to_string(),
    }
}

fn queue_reply(snapshot: &QueueSnapshot) -> String {
    let mut reply = String::new();

    if let Some(title) = &snapshot.now_playing {
        reply.push_str(&format!("Now playing: **{title}**\n"));
    }

    if snapshot.pending.is_empty() {
        reply.push_str("The queue is empty!");
        return reply;
    }

    let songs_formatted = snapshot
        .pending
        .iter()
        .take(MAX_LISTED_TRACKS)
        .enumerate()
        .map(|(index, track)| match track.duration {
            Some(duration) => format!("{} - {} ({})", index + 1, track.title, format_duration(duration)),
            None => format!("{} - {}", index + 1, track.title),
        })
        .collect::<Vec<_>>()
        .join("\n");

    reply.push_str(&format!("**Queue**:\n```{songs_formatted}```"));

    if snapshot.pending.len() > MAX_LISTED_TRACKS {
        reply.push_str(&format!(
            "...and {} more",
            snapshot.pending.len() - MAX_LISTED_TRACKS
        ));
    }

    reply
}

fn help_text(prefix: &str) -> String {
    format!(
        r#"
**Commands:**
    **{prefix}join** - Joins your voice channel.
    **{prefix}leave** - Leaves the voice channel and clears the queue.
    **{prefix}play [URL|Title]** - Plays (or adds to the queue) a track given a link or a title.
    **{prefix}skip** - Skips the current track.
    **{prefix}stop** - Stops the current track and clears the queue.
    **{prefix}pause** - Pauses the current track.
    **{prefix}resume** - Resumes the paused track.
    **{prefix}nowplaying** (or **{prefix}np**) - Shows what is playing.
    **{prefix}queue** - Shows the queue of tracks.
    "#
    )
}
