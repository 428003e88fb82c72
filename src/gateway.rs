//! Gateway Client (C1, spec §4.1).
//!
//! The only module in this crate that names a `serenity` type. Everything downstream of
//! here — topology sync, the forwarder matcher, the scheduler — talks in platform-opaque
//! strings and the small [`GatewayEvent`]/[`MessageSink`] contracts defined here and in
//! [`crate::forwarder`]. The event handler itself does no I/O beyond pushing onto the
//! channel, matching the "straight-line function, no promises/tasks beyond what the
//! platform library already provides" shape this codebase's own `Handler` used.

use std::env;
use std::sync::Arc;

use log::{error, info, warn};
use serenity::{
    async_trait,
    cache::Cache,
    client::bridge::gateway::{GatewayIntents, ShardManager},
    http::Http,
    model::{
        channel::ChannelType,
        gateway::Ready as GatewayReady,
        guild::{Guild, GuildUnavailable},
        id::{ChannelId, GuildId},
    },
    prelude::{Context, EventHandler, TypeMapKey},
    Client,
};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::config::{gateway_backoff_max, gateway_backoff_min};
use crate::forwarder::{InboundMessage, MessageSink};
use crate::repository::ChannelKind;

/// Pushed from the event handler to whoever is driving the runtime (C6). `Ready` is the
/// signal to kick off `SyncAll` → `Load` → scheduler start (§4.6); everything after that is
/// routed to C3 or C4.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Ready { identity_name: String, identity_id: String },
    GuildCreate(String),
    GuildDelete(String),
    MessageCreate(InboundMessage),
}

struct EventSender;

impl TypeMapKey for EventSender {
    type Value = mpsc::UnboundedSender<GatewayEvent>;
}

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: GatewayReady) {
        info!("gateway ready as {}#{}", ready.user.name, ready.user.discriminator);

        let tx = sender(&ctx).await;
        let _ = tx.send(GatewayEvent::Ready {
            identity_name: ready.user.name.clone(),
            identity_id: ready.user.id.to_string(),
        });
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, _is_new: bool) {
        let tx = sender(&ctx).await;
        let _ = tx.send(GatewayEvent::GuildCreate(guild.id.to_string()));
    }

    async fn guild_delete(&self, ctx: Context, incomplete: GuildUnavailable, _guild: Option<Guild>) {
        let tx = sender(&ctx).await;
        let _ = tx.send(GatewayEvent::GuildDelete(incomplete.id.to_string()));
    }

    async fn message(&self, ctx: Context, message: serenity::model::channel::Message) {
        let (is_thread, parent_id) = match ctx.cache.channel(message.channel_id) {
            Some(serenity::model::channel::Channel::Guild(channel)) => (
                matches!(
                    channel.kind,
                    ChannelType::PublicThread | ChannelType::PrivateThread | ChannelType::NewsThread
                ),
                channel.parent_id.map(|id| id.to_string()),
            ),
            _ => (false, None),
        };

        let inbound = InboundMessage {
            content: message.content.clone(),
            author_is_bot: message.author.bot,
            in_guild: message.guild_id.is_some(),
            channel_platform_id: message.channel_id.to_string(),
            is_thread,
            parent_channel_platform_id: parent_id,
        };

        let tx = sender(&ctx).await;
        let _ = tx.send(GatewayEvent::MessageCreate(inbound));
    }
}

async fn sender(ctx: &Context) -> mpsc::UnboundedSender<GatewayEvent> {
    ctx.data.read().await.get::<EventSender>().cloned().expect("event sender missing from context")
}

/// Read-side view used by C6.Status and the API status projection.
#[derive(Debug, Clone, Default)]
pub struct GatewayStatus {
    pub online: bool,
    pub identity_name: Option<String>,
    pub identity_id: Option<String>,
    pub server_count: usize,
}

#[derive(Debug, Clone)]
pub struct GuildInfo {
    pub name: String,
    pub icon_url: Option<String>,
    pub member_count: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub platform_id: String,
    pub name: String,
    /// `None` for channel kinds C3 does not mirror (voice, category, ...).
    pub kind: Option<ChannelKind>,
}

/// Owns the authenticated session. `Start`/`Stop` are the only lifecycle operations;
/// `send_to_channel`/`fetch_*` are read/write primitives consumed by C3, C4 and C5.
pub struct GatewayClient {
    status: RwLock<GatewayStatus>,
    shard_manager: RwLock<Option<Arc<Mutex<ShardManager>>>>,
    http: RwLock<Option<Arc<Http>>>,
    cache: RwLock<Option<Arc<Cache>>>,
}

impl Default for GatewayClient {
    fn default() -> Self {
        Self {
            status: RwLock::new(GatewayStatus::default()),
            shard_manager: RwLock::new(None),
            http: RwLock::new(None),
            cache: RwLock::new(None),
        }
    }
}

impl GatewayClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects and returns the event stream. Missing token degrades gracefully: logs a
    /// warning, leaves `Status().online = false`, and returns `None` rather than panicking
    /// (§4.1 failure semantics).
    pub async fn start(&self) -> Option<mpsc::UnboundedReceiver<GatewayEvent>> {
        let token = match env::var("DISCORD_BOT_TOKEN") {
            Ok(t) if !t.is_empty() => t,
            _ => {
                warn!("DISCORD_BOT_TOKEN not set; gateway client staying offline");
                return None;
            }
        };

        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let mut client = match Client::builder(&token).intents(intents).event_handler(Handler).await {
            Ok(client) => client,
            Err(e) => {
                error!("failed to authenticate gateway client: {}", e);
                return None;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut data = client.data.write().await;
            data.insert::<EventSender>(tx);
        }

        *self.shard_manager.write().await = Some(client.shard_manager.clone());
        *self.http.write().await = Some(client.cache_and_http.http.clone());
        *self.cache.write().await = Some(client.cache_and_http.cache.clone());

        let backoff_min = gateway_backoff_min();
        let backoff_max = gateway_backoff_max();

        // serenity reconnects within a single `start()` call on its own; this loop only
        // covers the case where the session exits entirely (auth revoked mid-flight, etc.)
        // and needs a fresh one, backing off the same way the rest of this crate's
        // reconnecting workers do.
        tokio::spawn(async move {
            let mut backoff = backoff_min;
            loop {
                match client.start().await {
                    Ok(()) => break,
                    Err(e) => {
                        error!("gateway session ended: {}; retrying in {:?}", e, backoff);
                        tokio::time::sleep(backoff).await;
                        backoff = std::cmp::min(backoff * 2, backoff_max);
                    }
                }
            }
        });

        Some(rx)
    }

    /// Called by the supervisor once it has observed `GatewayEvent::Ready`.
    pub async fn mark_online(&self, identity_name: String, identity_id: String) {
        let mut status = self.status.write().await;
        status.online = true;
        status.identity_name = Some(identity_name);
        status.identity_id = Some(identity_id);
    }

    pub async fn stop(&self) {
        let shard_manager = self.shard_manager.write().await.take();
        if let Some(shard_manager) = shard_manager {
            shard_manager.lock().await.shutdown_all().await;
        }
        self.http.write().await.take();
        self.cache.write().await.take();
        self.status.write().await.online = false;
    }

    /// Guilds the session currently has cached, as platform IDs. Used by the supervisor to
    /// drive `SyncAll` once `Ready` fires.
    pub async fn current_guild_ids(&self) -> Vec<String> {
        match &*self.cache.read().await {
            Some(cache) => cache.guilds().into_iter().map(|id| id.to_string()).collect(),
            None => Vec::new(),
        }
    }

    pub async fn status(&self) -> GatewayStatus {
        let mut status = self.status.read().await.clone();
        if let Some(cache) = &*self.cache.read().await {
            status.server_count = cache.guilds().len();
        }
        status
    }

    pub async fn fetch_guild(&self, platform_guild_id: &str) -> Result<GuildInfo, String> {
        let id: u64 = platform_guild_id.parse().map_err(|_| "invalid guild id".to_string())?;
        let cache = self.cache.read().await.clone().ok_or_else(|| "gateway offline".to_string())?;
        let guild = cache.guild(GuildId(id)).ok_or_else(|| "guild not in cache".to_string())?;

        Ok(GuildInfo {
            name: guild.name.clone(),
            icon_url: guild.icon_url(),
            member_count: u32::try_from(guild.member_count).ok(),
        })
    }

    pub async fn fetch_channels(&self, platform_guild_id: &str) -> Result<Vec<ChannelInfo>, String> {
        let id: u64 = platform_guild_id.parse().map_err(|_| "invalid guild id".to_string())?;
        let http = self.http.read().await.clone().ok_or_else(|| "gateway offline".to_string())?;

        let channels = GuildId(id).channels(&http).await.map_err(|e| e.to_string())?;

        Ok(channels
            .into_values()
            .map(|channel| ChannelInfo {
                platform_id: channel.id.to_string(),
                name: channel.name.clone(),
                kind: match channel.kind {
                    ChannelType::Text => Some(ChannelKind::Text),
                    ChannelType::News => Some(ChannelKind::Announcement),
                    _ => None,
                },
            })
            .collect())
    }

    pub async fn fetch_active_threads(&self, platform_guild_id: &str) -> Result<Vec<ChannelInfo>, String> {
        let id: u64 = platform_guild_id.parse().map_err(|_| "invalid guild id".to_string())?;
        let http = self.http.read().await.clone().ok_or_else(|| "gateway offline".to_string())?;

        let active = http.get_guild_active_threads(id).await.map_err(|e| e.to_string())?;

        Ok(active
            .threads
            .into_iter()
            .map(|thread| ChannelInfo {
                platform_id: thread.id.to_string(),
                name: thread.name.clone(),
                kind: Some(ChannelKind::Text),
            })
            .collect())
    }
}

#[async_trait]
impl MessageSink for GatewayClient {
    async fn send_to_channel(&self, platform_channel_id: &str, content: &str) -> Result<(), String> {
        let http = self.http.read().await.clone().ok_or_else(|| "channel not found/accessible".to_string())?;
        let id: u64 = platform_channel_id.parse().map_err(|_| "channel not found/accessible".to_string())?;

        // `ChannelId::say` resolves to the right send endpoint whether the ID names a
        // channel or a thread — both are addressable the same way over the REST API.
        ChannelId(id).say(&http, content).await.map(|_| ()).map_err(|e| classify_send_error(&e))
    }
}

/// Collapses the "channel/thread is gone or we lost access" family of Discord errors
/// (unknown channel, missing access, missing permissions) onto the literal error string
/// the scheduler and forwarder logs are expected to carry; anything else is passed through.
fn classify_send_error(err: &serenity::Error) -> String {
    if let serenity::Error::Http(http_err) = err {
        if let serenity::http::error::Error::UnsuccessfulRequest(response) = http_err.as_ref() {
            let code = response.error.code;
            // 10003 Unknown Channel, 50001 Missing Access, 50013 Missing Permissions
            if matches!(code, 10003 | 50001 | 50013) {
                return "channel not found/accessible".to_string();
            }
        }
    }
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_token_stays_offline() {
        env::remove_var("DISCORD_BOT_TOKEN");

        let gateway = GatewayClient::new();
        let rx = gateway.start().await;

        assert!(rx.is_none());
        assert!(!gateway.status().await.online);
    }
}
