use std::sync::Arc;

use anyhow::Context as _;
use dotenvy::dotenv;
use serenity::{
    async_trait,
    client::{Client, Context, EventHandler},
    framework::StandardFramework,
    model::{channel::Message, gateway::Ready, prelude::VoiceState},
    prelude::{GatewayIntents, Mentionable},
};
use songbird::{SerenityInit, Songbird};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::announce::{check_msg, ChannelAnnouncer};
use crate::commands::{BotContext, PlayOrder, GENERAL_GROUP};
use crate::config::Config;
use crate::player::PlaybackLoop;
use crate::resolver::YtDlpResolver;
use crate::sink::SongbirdSink;

mod announce;
mod commands;
mod config;
mod error;
mod models;
mod player;
mod registry;
mod resolver;
mod sink;

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        match msg.mentions_me(&ctx).await {
            Ok(true) => check_msg(
                msg.channel_id
                    .say(&ctx.http, format!("Hi {}, I am here! >:3", msg.author.mention()))
                    .await,
            ),
            Ok(false) => {}
            Err(why) => debug!("Could not check mentions: {why:?}"),
        }
    }

    async fn ready(&self, _: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);
    }

    async fn voice_state_update(&self, ctx: Context, _: Option<VoiceState>, new: VoiceState) {
        if new.channel_id.is_some() || new.user_id != ctx.cache.current_user_id() {
            return;
        }

        if let Some(guild_id) = new.guild_id {
            info!("Bot left voice in guild {}", guild_id.0);

            let bot = ctx.data.read().await.get::<BotContext>().cloned();

            if let Some(bot) = bot {
                if let Err(why) = bot.playback.forget(guild_id).await {
                    warn!("Could not clear playback state: {why}");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(why) = dotenv() {
        info!("No .env file loaded: {why}");
    }

    let config = Config::from_env().context("Invalid configuration")?;
    info!("Starting with {}", config.summary());

    let framework = StandardFramework::new()
        .configure(|c| c.prefix(config.command_prefix.as_str()))
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let voice = Songbird::serenity();

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(Handler)
        .framework(framework)
        .register_songbird_with(Arc::clone(&voice))
        .await
        .context("Err creating client")?;

    let (playback, playback_task) = PlaybackLoop::spawn(
        Arc::new(SongbirdSink::new(Arc::clone(&voice))),
        Arc::new(ChannelAnnouncer::new(Arc::clone(&client.cache_and_http.http))),
        config.start_timeout,
    );

    {
        let mut data = client.data.write().await;

        data.insert::<BotContext>(Arc::new(BotContext {
            playback: playback.clone(),
            resolver: Arc::new(YtDlpResolver::new(config.ytdlp_program.clone())),
            voice,
            prefix: config.command_prefix.clone(),
            unsupported_markers: config.unsupported_markers.clone(),
            resolve_timeout: config.resolve_timeout,
            connect_timeout: config.connect_timeout,
            play_order: PlayOrder::default(),
        }));
    }

    let shard_manager = Arc::clone(&client.shard_manager);

    tokio::spawn(async move {
        let _ = client.start().await.map_err(|why| info!("Client ended: {why:?}"));
    });

    tokio::signal::ctrl_c().await.context("Control-C interruption failed!")?;

    info!("Received Ctrl-C, shutting down.");

    playback.shutdown();
    shard_manager.lock().await.shutdown_all().await;

    if let Err(why) = playback_task.await {
        warn!("Playback loop ended abnormally: {why}");
    }

    Ok(())
}
