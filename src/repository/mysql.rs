//! The reference [`Repository`] implementation, backed by the MySQL database this codebase
//! has always used, reached through the same [`MySqlPool`] handle the existing models share.
//!
//! Queries are issued with the runtime `sqlx::query_as` API (bind parameters, `FromRow` structs)
//! rather than the compile-time `sqlx::query!`/`query_as!` macros used elsewhere in this
//! codebase: the repository contract is meant to be swappable (§4.2, "any store satisfying it
//! is acceptable"), so nothing here should require a live `DATABASE_URL` just to type-check.

use chrono::{DateTime, NaiveDateTime, Utc};
use serenity::async_trait;
use sqlx::mysql::MySqlPool;
use sqlx::FromRow;

use crate::error::{classify_sqlx_error, RepositoryError};

use super::model::*;
use super::Repository;

type Result<T> = std::result::Result<T, RepositoryError>;

fn naive_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_utc(naive, Utc)
}

fn utc_to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
    dt.naive_utc()
}

pub struct MySqlRepository {
    pool: MySqlPool,
}

impl MySqlRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct ServerRow {
    id: u64,
    platform_id: String,
    name: String,
    icon_url: Option<String>,
    member_count: Option<u32>,
    is_connected: bool,
}

impl From<ServerRow> for Server {
    fn from(r: ServerRow) -> Self {
        Server {
            id: r.id,
            platform_id: r.platform_id,
            name: r.name,
            icon_url: r.icon_url,
            member_count: r.member_count,
            is_connected: r.is_connected,
        }
    }
}

#[derive(FromRow)]
struct ChannelRow {
    id: u64,
    platform_id: String,
    server_id: u64,
    name: String,
    kind: String,
}

impl ChannelRow {
    fn into_channel(self) -> Channel {
        Channel {
            id: self.id,
            platform_id: self.platform_id,
            server_id: self.server_id,
            name: self.name,
            kind: ChannelKind::from_str(&self.kind).unwrap_or(ChannelKind::Text),
        }
    }
}

#[derive(FromRow)]
struct DueNotificationRow {
    id: u64,
    title: Option<String>,
    message: String,
    repeat_type: String,
    end_date: Option<NaiveDateTime>,
    mentions_everyone: bool,
    next_scheduled: NaiveDateTime,
    channel_platform_id: String,
    timezone: String,
}

impl DueNotificationRow {
    fn into_due(self) -> DueNotification {
        DueNotification {
            id: self.id,
            title: self.title,
            message: self.message,
            repeat_type: RepeatType::from_str(&self.repeat_type).unwrap_or(RepeatType::Once),
            end_date: self.end_date.map(naive_to_utc),
            mentions_everyone: self.mentions_everyone,
            next_scheduled: naive_to_utc(self.next_scheduled),
            channel_platform_id: self.channel_platform_id,
            timezone: self.timezone,
        }
    }
}

#[derive(FromRow)]
struct ActiveForwarderRow {
    id: u64,
    name: String,
    source_channel_platform_id: String,
    source_thread_id: Option<String>,
    destination_channel_platform_id: String,
    destination_thread_id: Option<String>,
    keywords: String,
    match_type: String,
}

impl ActiveForwarderRow {
    fn into_forwarder(self) -> ActiveForwarder {
        ActiveForwarder {
            id: self.id,
            name: self.name,
            source_channel_platform_id: self.source_channel_platform_id,
            source_thread_id: self.source_thread_id,
            destination_channel_platform_id: self.destination_channel_platform_id,
            destination_thread_id: self.destination_thread_id,
            keywords: self.keywords.split('\u{1f}').map(str::to_owned).collect(),
            match_type: MatchType::from_str(&self.match_type).unwrap_or(MatchType::Contains),
        }
    }
}

#[derive(FromRow)]
struct BotSettingsRow {
    default_timezone: String,
    max_messages_per_minute: u32,
    enable_analytics: bool,
    auto_cleanup_days: u32,
    working_days: String,
}

impl BotSettingsRow {
    fn into_settings(self) -> BotSettings {
        BotSettings {
            default_timezone: self.default_timezone,
            max_messages_per_minute: self.max_messages_per_minute,
            enable_analytics: self.enable_analytics,
            auto_cleanup_days: self.auto_cleanup_days,
            working_days: self
                .working_days
                .split(',')
                .filter_map(|s| s.trim().parse::<u8>().ok())
                .collect(),
        }
    }
}

#[async_trait]
impl Repository for MySqlRepository {
    async fn get_server_by_platform_id(&self, platform_id: &str) -> Result<Option<Server>> {
        let row = sqlx::query_as::<_, ServerRow>(
            "SELECT id, platform_id, name, icon_url, member_count, is_connected \
             FROM servers WHERE platform_id = ?",
        )
        .bind(platform_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        Ok(row.map(Server::from))
    }

    async fn create_server(&self, upsert: &ServerUpsert) -> Result<Server> {
        sqlx::query(
            "INSERT INTO servers (platform_id, name, icon_url, member_count, is_connected) \
             VALUES (?, ?, ?, ?, TRUE)",
        )
        .bind(&upsert.platform_id)
        .bind(&upsert.name)
        .bind(&upsert.icon_url)
        .bind(upsert.member_count)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        self.get_server_by_platform_id(&upsert.platform_id)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    async fn update_server(&self, id: u64, upsert: &ServerUpsert, is_connected: bool) -> Result<()> {
        sqlx::query(
            "UPDATE servers SET name = ?, icon_url = ?, member_count = ?, is_connected = ? \
             WHERE id = ?",
        )
        .bind(&upsert.name)
        .bind(&upsert.icon_url)
        .bind(upsert.member_count)
        .bind(is_connected)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        Ok(())
    }

    async fn set_server_connected(&self, platform_id: &str, is_connected: bool) -> Result<()> {
        sqlx::query("UPDATE servers SET is_connected = ? WHERE platform_id = ?")
            .bind(is_connected)
            .bind(platform_id)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;

        Ok(())
    }

    async fn get_channels_by_server(&self, server_id: u64) -> Result<Vec<Channel>> {
        let rows = sqlx::query_as::<_, ChannelRow>(
            "SELECT id, platform_id, server_id, name, kind FROM channels WHERE server_id = ?",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        Ok(rows.into_iter().map(ChannelRow::into_channel).collect())
    }

    async fn get_channel_by_platform_id(&self, platform_id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query_as::<_, ChannelRow>(
            "SELECT id, platform_id, server_id, name, kind FROM channels WHERE platform_id = ?",
        )
        .bind(platform_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        Ok(row.map(ChannelRow::into_channel))
    }

    async fn create_channel(&self, upsert: &ChannelUpsert) -> Result<Channel> {
        sqlx::query(
            "INSERT INTO channels (platform_id, server_id, name, kind) VALUES (?, ?, ?, ?)",
        )
        .bind(&upsert.platform_id)
        .bind(upsert.server_id)
        .bind(&upsert.name)
        .bind(upsert.kind.as_str())
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        self.get_channel_by_platform_id(&upsert.platform_id)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    async fn update_channel(&self, id: u64, upsert: &ChannelUpsert) -> Result<()> {
        sqlx::query("UPDATE channels SET name = ?, kind = ? WHERE id = ?")
            .bind(&upsert.name)
            .bind(upsert.kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;

        Ok(())
    }

    async fn delete_channel(&self, id: u64) -> Result<()> {
        sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;

        Ok(())
    }

    async fn get_due_notifications(&self, now: DateTime<Utc>) -> Result<Vec<DueNotification>> {
        let rows = sqlx::query_as::<_, DueNotificationRow>(
            "SELECT n.id, n.title, n.message, n.repeat_type, n.end_date, \
                    n.mentions_everyone, n.next_scheduled, c.platform_id AS channel_platform_id, \
                    n.timezone \
             FROM notifications n \
             INNER JOIN channels c ON c.id = n.channel_id \
             INNER JOIN servers s ON s.id = n.server_id \
             WHERE n.is_active = TRUE AND n.next_scheduled <= ?",
        )
        .bind(utc_to_naive(now))
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        Ok(rows.into_iter().map(DueNotificationRow::into_due).collect())
    }

    async fn update_notification(&self, id: u64, patch: &NotificationPatch) -> Result<()> {
        sqlx::query(
            "UPDATE notifications SET last_sent = ?, next_scheduled = ?, is_active = ? \
             WHERE id = ?",
        )
        .bind(patch.last_sent.map(utc_to_naive))
        .bind(patch.next_scheduled.map(utc_to_naive))
        .bind(patch.is_active)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        Ok(())
    }

    async fn create_notification_log(&self, log: &NewNotificationLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO notification_logs (notification_id, sent_at, status, error) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(log.notification_id)
        .bind(utc_to_naive(log.sent_at))
        .bind(log.status.as_str())
        .bind(&log.error)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        Ok(())
    }

    async fn get_active_forwarders(&self) -> Result<Vec<ActiveForwarder>> {
        let rows = sqlx::query_as::<_, ActiveForwarderRow>(
            "SELECT f.id, f.name, sc.platform_id AS source_channel_platform_id, \
                    f.source_thread_id, dc.platform_id AS destination_channel_platform_id, \
                    f.destination_thread_id, f.keywords, f.match_type \
             FROM forwarders f \
             INNER JOIN channels sc ON sc.id = f.source_channel_id \
             INNER JOIN channels dc ON dc.id = f.destination_channel_id \
             WHERE f.is_active = TRUE",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        Ok(rows.into_iter().map(ActiveForwarderRow::into_forwarder).collect())
    }

    async fn create_forwarder_log(&self, log: &NewForwarderLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO forwarder_logs \
                (forwarder_id, forwarded_at, original_message, matched_keyword, status, error) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(log.forwarder_id)
        .bind(utc_to_naive(log.forwarded_at))
        .bind(truncate_original_message(&log.original_message))
        .bind(&log.matched_keyword)
        .bind(log.status.as_str())
        .bind(&log.error)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        Ok(())
    }

    async fn get_bot_settings(&self) -> Result<BotSettings> {
        let row = sqlx::query_as::<_, BotSettingsRow>(
            "SELECT default_timezone, max_messages_per_minute, enable_analytics, \
                    auto_cleanup_days, working_days FROM bot_settings LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        Ok(row.map(BotSettingsRow::into_settings).unwrap_or_default())
    }
}
