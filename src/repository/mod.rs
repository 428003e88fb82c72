//! The narrow persistence contract consumed by every other component (C2, spec §4.2).
//!
//! Nothing above this module names `sqlx` or SQL — only the domain types in [`model`] and
//! the [`Repository`] trait itself. [`mysql::MySqlRepository`] is the reference implementation
//! backed by the MySQL database already used by this codebase; [`memory::InMemoryRepository`]
//! is a second implementation that exists purely so C3/C4/C5 can be tested without a live
//! database or gateway connection.

pub mod model;
pub mod mysql;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use model::*;

use chrono::{DateTime, Utc};
use serenity::async_trait;

use crate::error::RepositoryError;

type Result<T> = std::result::Result<T, RepositoryError>;

#[async_trait]
pub trait Repository: Send + Sync {
    // --- Servers / Channels (owned exclusively by C3) ---

    async fn get_server_by_platform_id(&self, platform_id: &str) -> Result<Option<Server>>;
    async fn create_server(&self, upsert: &ServerUpsert) -> Result<Server>;
    async fn update_server(&self, id: u64, upsert: &ServerUpsert, is_connected: bool) -> Result<()>;
    /// Marks a server disconnected without touching its channels (GuildDelete, §4.3).
    async fn set_server_connected(&self, platform_id: &str, is_connected: bool) -> Result<()>;

    async fn get_channels_by_server(&self, server_id: u64) -> Result<Vec<Channel>>;
    async fn get_channel_by_platform_id(&self, platform_id: &str) -> Result<Option<Channel>>;
    async fn create_channel(&self, upsert: &ChannelUpsert) -> Result<Channel>;
    async fn update_channel(&self, id: u64, upsert: &ChannelUpsert) -> Result<()>;
    async fn delete_channel(&self, id: u64) -> Result<()>;

    // --- Notifications (owned by external API callers; core mutates only the schedule state) ---

    /// All `isActive ∧ nextScheduled ≤ now` rows, server+channel joined. Order is not
    /// significant to the scheduler (spec §4.5 step 2).
    async fn get_due_notifications(&self, now: DateTime<Utc>) -> Result<Vec<DueNotification>>;
    async fn update_notification(&self, id: u64, patch: &NotificationPatch) -> Result<()>;
    async fn create_notification_log(&self, log: &NewNotificationLog) -> Result<()>;

    // --- Forwarders (owned by external API callers) ---

    async fn get_active_forwarders(&self) -> Result<Vec<ActiveForwarder>>;
    async fn create_forwarder_log(&self, log: &NewForwarderLog) -> Result<()>;

    // --- Settings ---

    async fn get_bot_settings(&self) -> Result<BotSettings>;
}
