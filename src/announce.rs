use std::sync::Arc;

use serenity::http::Http;
use serenity::model::channel::Message;
use serenity::model::id::ChannelId;
use serenity::Result as SerenityResult;
use tracing::info;

/// Where the playback loop reports what it starts.
pub trait Announcer: Send + Sync {
    /// Must not block; the playback loop calls this inline.
    fn announce(&self, channel_id: ChannelId, text: String);
}

pub struct ChannelAnnouncer {
    http: Arc<Http>,
}

impl ChannelAnnouncer {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

impl Announcer for ChannelAnnouncer {
    fn announce(&self, channel_id: ChannelId, text: String) {
        let http = Arc::clone(&self.http);

        tokio::spawn(async move {
            check_msg(channel_id.say(&http, text).await);
        });
    }
}

/// Checks that a message successfully sent; if not, then logs why.
pub fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        info!("Error sending message: {why:?}");
    }
}
