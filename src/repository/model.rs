use std::collections::HashSet;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Text,
    Announcement,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Text => "text",
            ChannelKind::Announcement => "announcement",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ChannelKind::Text),
            "announcement" => Some(ChannelKind::Announcement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatType {
    Once,
    Daily,
    Weekly,
    Monthly,
    WorkingDays,
}

impl RepeatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepeatType::Once => "once",
            RepeatType::Daily => "daily",
            RepeatType::Weekly => "weekly",
            RepeatType::Monthly => "monthly",
            RepeatType::WorkingDays => "working_days",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "once" => Some(RepeatType::Once),
            "daily" => Some(RepeatType::Daily),
            "weekly" => Some(RepeatType::Weekly),
            "monthly" => Some(RepeatType::Monthly),
            "working_days" => Some(RepeatType::WorkingDays),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Contains,
    Exact,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Contains => "contains",
            MatchType::Exact => "exact",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "contains" => Some(MatchType::Contains),
            "exact" => Some(MatchType::Exact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Success,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Failed => "failed",
        }
    }
}

/// A guild/server the bot has seen, mirrored from the platform by the topology synchronizer.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: u64,
    pub platform_id: String,
    pub name: String,
    pub icon_url: Option<String>,
    pub member_count: Option<u32>,
    pub is_connected: bool,
}

/// Fields the topology synchronizer upserts when it sees a guild.
#[derive(Debug, Clone)]
pub struct ServerUpsert {
    pub platform_id: String,
    pub name: String,
    pub icon_url: Option<String>,
    pub member_count: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: u64,
    pub platform_id: String,
    pub server_id: u64,
    pub name: String,
    pub kind: ChannelKind,
}

/// Fields the topology synchronizer upserts for a text-like channel.
#[derive(Debug, Clone)]
pub struct ChannelUpsert {
    pub platform_id: String,
    pub server_id: u64,
    pub name: String,
    pub kind: ChannelKind,
}

/// A notification row joined with its destination server/channel, as returned by
/// `getDueNotifications`. Only the fields the scheduler needs are carried.
#[derive(Debug, Clone)]
pub struct DueNotification {
    pub id: u64,
    pub title: Option<String>,
    pub message: String,
    pub repeat_type: RepeatType,
    pub end_date: Option<DateTime<Utc>>,
    pub mentions_everyone: bool,
    pub next_scheduled: DateTime<Utc>,
    pub channel_platform_id: String,
    /// Carried through as a label only; the scheduler's arithmetic operates on absolute
    /// UTC instants and never resolves this against DST.
    pub timezone: String,
}

/// The mutable fields the scheduler is allowed to write back.
#[derive(Debug, Clone, Default)]
pub struct NotificationPatch {
    pub last_sent: Option<DateTime<Utc>>,
    pub next_scheduled: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct NewNotificationLog {
    pub notification_id: u64,
    pub sent_at: DateTime<Utc>,
    pub status: LogStatus,
    pub error: Option<String>,
}

/// An active forwarder joined with its source/destination server+channel, as returned by
/// `getActiveForwarders`.
#[derive(Debug, Clone)]
pub struct ActiveForwarder {
    pub id: u64,
    pub name: String,
    pub source_channel_platform_id: String,
    pub source_thread_id: Option<String>,
    pub destination_channel_platform_id: String,
    pub destination_thread_id: Option<String>,
    pub keywords: Vec<String>,
    pub match_type: MatchType,
}

#[derive(Debug, Clone)]
pub struct NewForwarderLog {
    pub forwarder_id: u64,
    pub forwarded_at: DateTime<Utc>,
    pub original_message: String,
    pub matched_keyword: Option<String>,
    pub status: LogStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BotSettings {
    pub default_timezone: String,
    pub max_messages_per_minute: u32,
    pub enable_analytics: bool,
    pub auto_cleanup_days: u32,
    pub working_days: HashSet<u8>,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            default_timezone: "UTC".to_string(),
            max_messages_per_minute: 20,
            enable_analytics: false,
            auto_cleanup_days: 30,
            working_days: [1u8, 2, 3, 4, 5].into_iter().collect(),
        }
    }
}

/// `originalMessage` is truncated to 500 code units before being persisted, per the spec.
pub fn truncate_original_message(content: &str) -> String {
    content.chars().take(500).collect()
}
