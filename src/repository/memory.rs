//! An in-memory [`Repository`] used by the test suites for C3, C4 and C5 (spec §10). Lets
//! the scheduler and topology synchronizer be exercised without a live MySQL instance.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serenity::async_trait;

use crate::error::RepositoryError;

use super::model::*;
use super::Repository;

type Result<T> = std::result::Result<T, RepositoryError>;

#[derive(Debug, Clone)]
struct StoredNotification {
    id: u64,
    title: Option<String>,
    message: String,
    repeat_type: RepeatType,
    end_date: Option<DateTime<Utc>>,
    mentions_everyone: bool,
    next_scheduled: Option<DateTime<Utc>>,
    last_sent: Option<DateTime<Utc>>,
    is_active: bool,
    channel_platform_id: String,
    timezone: String,
}

#[derive(Debug, Clone)]
struct StoredForwarder {
    id: u64,
    name: String,
    source_channel_platform_id: String,
    source_thread_id: Option<String>,
    destination_channel_platform_id: String,
    destination_thread_id: Option<String>,
    keywords: Vec<String>,
    match_type: MatchType,
    is_active: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    servers: HashMap<u64, Server>,
    channels: HashMap<u64, Channel>,
    notifications: HashMap<u64, StoredNotification>,
    notification_logs: Vec<NewNotificationLog>,
    forwarders: HashMap<u64, StoredForwarder>,
    forwarder_logs: Vec<NewForwarderLog>,
    settings: BotSettings,
}

impl State {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Test-only in-memory store. Not concurrency-optimized (a single [`Mutex`] guards all
/// tables) — that is fine, it only ever backs single-threaded test bodies.
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self { state: Mutex::new(State::default()) }
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: insert a notification row directly, bypassing the (external) create path.
    pub fn seed_notification(&self, n: SeedNotification) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.alloc_id();
        state.notifications.insert(
            id,
            StoredNotification {
                id,
                title: n.title,
                message: n.message,
                repeat_type: n.repeat_type,
                end_date: n.end_date,
                mentions_everyone: n.mentions_everyone,
                next_scheduled: n.next_scheduled,
                last_sent: None,
                is_active: n.is_active,
                channel_platform_id: n.channel_platform_id,
                timezone: n.timezone,
            },
        );
        id
    }

    /// Test helper: insert a forwarder row directly.
    pub fn seed_forwarder(&self, f: SeedForwarder) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.alloc_id();
        state.forwarders.insert(
            id,
            StoredForwarder {
                id,
                name: f.name,
                source_channel_platform_id: f.source_channel_platform_id,
                source_thread_id: f.source_thread_id,
                destination_channel_platform_id: f.destination_channel_platform_id,
                destination_thread_id: f.destination_thread_id,
                keywords: f.keywords,
                match_type: f.match_type,
                is_active: f.is_active,
            },
        );
        id
    }

    pub fn set_settings(&self, settings: BotSettings) {
        self.state.lock().unwrap().settings = settings;
    }

    pub fn notification_logs(&self) -> Vec<NewNotificationLog> {
        self.state.lock().unwrap().notification_logs.clone()
    }

    pub fn forwarder_logs(&self) -> Vec<NewForwarderLog> {
        self.state.lock().unwrap().forwarder_logs.clone()
    }

    pub fn notification(&self, id: u64) -> Option<SeedNotification> {
        self.state.lock().unwrap().notifications.get(&id).map(|n| SeedNotification {
            title: n.title.clone(),
            message: n.message.clone(),
            repeat_type: n.repeat_type,
            end_date: n.end_date,
            mentions_everyone: n.mentions_everyone,
            next_scheduled: n.next_scheduled,
            is_active: n.is_active,
            channel_platform_id: n.channel_platform_id.clone(),
            timezone: n.timezone.clone(),
        })
    }
}

/// Plain-data shape for [`InMemoryRepository::seed_notification`].
#[derive(Debug, Clone)]
pub struct SeedNotification {
    pub title: Option<String>,
    pub message: String,
    pub repeat_type: RepeatType,
    pub end_date: Option<DateTime<Utc>>,
    pub mentions_everyone: bool,
    pub next_scheduled: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub channel_platform_id: String,
    pub timezone: String,
}

/// Plain-data shape for [`InMemoryRepository::seed_forwarder`].
#[derive(Debug, Clone)]
pub struct SeedForwarder {
    pub name: String,
    pub source_channel_platform_id: String,
    pub source_thread_id: Option<String>,
    pub destination_channel_platform_id: String,
    pub destination_thread_id: Option<String>,
    pub keywords: Vec<String>,
    pub match_type: MatchType,
    pub is_active: bool,
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_server_by_platform_id(&self, platform_id: &str) -> Result<Option<Server>> {
        Ok(self.state.lock().unwrap().servers.values().find(|s| s.platform_id == platform_id).cloned())
    }

    async fn create_server(&self, upsert: &ServerUpsert) -> Result<Server> {
        let mut state = self.state.lock().unwrap();
        if state.servers.values().any(|s| s.platform_id == upsert.platform_id) {
            return Err(RepositoryError::UniqueViolation);
        }
        let id = state.alloc_id();
        let server = Server {
            id,
            platform_id: upsert.platform_id.clone(),
            name: upsert.name.clone(),
            icon_url: upsert.icon_url.clone(),
            member_count: upsert.member_count,
            is_connected: true,
        };
        state.servers.insert(id, server.clone());
        Ok(server)
    }

    async fn update_server(&self, id: u64, upsert: &ServerUpsert, is_connected: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let server = state.servers.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        server.name = upsert.name.clone();
        server.icon_url = upsert.icon_url.clone();
        server.member_count = upsert.member_count;
        server.is_connected = is_connected;
        Ok(())
    }

    async fn set_server_connected(&self, platform_id: &str, is_connected: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let server = state
            .servers
            .values_mut()
            .find(|s| s.platform_id == platform_id)
            .ok_or(RepositoryError::NotFound)?;
        server.is_connected = is_connected;
        Ok(())
    }

    async fn get_channels_by_server(&self, server_id: u64) -> Result<Vec<Channel>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .channels
            .values()
            .filter(|c| c.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn get_channel_by_platform_id(&self, platform_id: &str) -> Result<Option<Channel>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .channels
            .values()
            .find(|c| c.platform_id == platform_id)
            .cloned())
    }

    async fn create_channel(&self, upsert: &ChannelUpsert) -> Result<Channel> {
        let mut state = self.state.lock().unwrap();
        if state.channels.values().any(|c| c.platform_id == upsert.platform_id) {
            return Err(RepositoryError::UniqueViolation);
        }
        let id = state.alloc_id();
        let channel = Channel {
            id,
            platform_id: upsert.platform_id.clone(),
            server_id: upsert.server_id,
            name: upsert.name.clone(),
            kind: upsert.kind,
        };
        state.channels.insert(id, channel.clone());
        Ok(channel)
    }

    async fn update_channel(&self, id: u64, upsert: &ChannelUpsert) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let channel = state.channels.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        channel.name = upsert.name.clone();
        channel.kind = upsert.kind;
        Ok(())
    }

    async fn delete_channel(&self, id: u64) -> Result<()> {
        self.state.lock().unwrap().channels.remove(&id);
        Ok(())
    }

    async fn get_due_notifications(&self, now: DateTime<Utc>) -> Result<Vec<DueNotification>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .notifications
            .values()
            .filter(|n| n.is_active && n.next_scheduled.map_or(false, |ns| ns <= now))
            .map(|n| DueNotification {
                id: n.id,
                title: n.title.clone(),
                message: n.message.clone(),
                repeat_type: n.repeat_type,
                end_date: n.end_date,
                mentions_everyone: n.mentions_everyone,
                next_scheduled: n.next_scheduled.expect("filtered above"),
                channel_platform_id: n.channel_platform_id.clone(),
                timezone: n.timezone.clone(),
            })
            .collect())
    }

    async fn update_notification(&self, id: u64, patch: &NotificationPatch) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let n = state.notifications.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        n.last_sent = patch.last_sent;
        n.next_scheduled = patch.next_scheduled;
        n.is_active = patch.is_active;
        Ok(())
    }

    async fn create_notification_log(&self, log: &NewNotificationLog) -> Result<()> {
        self.state.lock().unwrap().notification_logs.push(log.clone());
        Ok(())
    }

    async fn get_active_forwarders(&self) -> Result<Vec<ActiveForwarder>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .forwarders
            .values()
            .filter(|f| f.is_active)
            .map(|f| ActiveForwarder {
                id: f.id,
                name: f.name.clone(),
                source_channel_platform_id: f.source_channel_platform_id.clone(),
                source_thread_id: f.source_thread_id.clone(),
                destination_channel_platform_id: f.destination_channel_platform_id.clone(),
                destination_thread_id: f.destination_thread_id.clone(),
                keywords: f.keywords.clone(),
                match_type: f.match_type,
            })
            .collect())
    }

    async fn create_forwarder_log(&self, log: &NewForwarderLog) -> Result<()> {
        self.state.lock().unwrap().forwarder_logs.push(NewForwarderLog {
            original_message: truncate_original_message(&log.original_message),
            ..log.clone()
        });
        Ok(())
    }

    async fn get_bot_settings(&self) -> Result<BotSettings> {
        Ok(self.state.lock().unwrap().settings.clone())
    }
}
