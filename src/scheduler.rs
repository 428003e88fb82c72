//! Notification Scheduler (C5, spec §4.5).
//!
//! A single-producer tick loop: one `tokio::time::interval` with a one-minute period and
//! `MissedTickBehavior::Delay` so that a tick which overruns its period never causes a
//! second tick to queue up behind it — the "no overlapping ticks" back-pressure the rest of
//! this codebase's periodic tasks rely on.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use log::{debug, error};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::notification_tick_interval;
use crate::forwarder::MessageSink;
use crate::repository::{DueNotification, LogStatus, NewNotificationLog, NotificationPatch, RepeatType, Repository};

pub struct Scheduler {
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self { stop_tx: Mutex::new(None), join: Mutex::new(None) }
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the tick loop. A no-op if already running.
    pub async fn start(&self, repo: Arc<dyn Repository>, sink: Arc<dyn MessageSink>) {
        if self.join.lock().await.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        *self.stop_tx.lock().await = Some(stop_tx);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(notification_tick_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_tick(repo.as_ref(), sink.as_ref(), Utc::now()).await;
                    }
                    _ = &mut stop_rx => {
                        debug!("notification scheduler received stop signal");
                        break;
                    }
                }
            }
        });

        *self.join.lock().await = Some(handle);
    }

    /// Cancels the timer synchronously, then waits for the in-flight tick (if any) to
    /// finish (§5 Cancellation).
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().await.take() {
            let _ = tx.send(());
        }
        let handle = self.join.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// One scheduler activation: refresh settings, fetch the due set, process each row in
/// sequence. A settings/fetch failure is logged to the process log (not a notification
/// log row) and the tick ends early; it does not crash the loop.
pub async fn run_tick(repo: &dyn Repository, sink: &dyn MessageSink, now: DateTime<Utc>) {
    let settings = match repo.get_bot_settings().await {
        Ok(settings) => settings,
        Err(e) => {
            error!("scheduler tick: failed to read bot settings: {}", e);
            return;
        }
    };

    let due = match repo.get_due_notifications(now).await {
        Ok(rows) => rows,
        Err(e) => {
            error!("scheduler tick: failed to fetch due notifications: {}", e);
            return;
        }
    };

    for row in &due {
        process_due_row(repo, sink, row, now, &settings.working_days).await;
    }
}

async fn process_due_row(
    repo: &dyn Repository,
    sink: &dyn MessageSink,
    row: &DueNotification,
    now: DateTime<Utc>,
    working_days: &HashSet<u8>,
) {
    if row.repeat_type == RepeatType::WorkingDays && !working_days.contains(&weekday_number(now)) {
        let next_day = next_working_day_after(now.date_naive(), working_days);
        let next_scheduled = at_same_clock_time(next_day, row.next_scheduled);

        let patch = NotificationPatch { last_sent: None, next_scheduled: Some(next_scheduled), is_active: true };
        if let Err(e) = repo.update_notification(row.id, &patch).await {
            error!("scheduler: failed to persist working-day skip for notification {}: {}", row.id, e);
        }
        return;
    }

    let send_result = sink.send_to_channel(&row.channel_platform_id, &compose_body(row)).await;

    let (status, error_text) = match &send_result {
        Ok(()) => (LogStatus::Success, None),
        Err(e) => (LogStatus::Failed, Some(e.clone())),
    };

    let log = NewNotificationLog { notification_id: row.id, sent_at: now, status, error: error_text };
    if let Err(e) = repo.create_notification_log(&log).await {
        error!("scheduler: failed to persist notification log for {}: {}", row.id, e);
    }

    let base = std::cmp::max(row.next_scheduled, now);
    let next = advance(row.repeat_type, base, working_days);

    let patch = match next {
        Some(next) if row.end_date.map_or(true, |end| next <= end) => {
            NotificationPatch { last_sent: Some(now), next_scheduled: Some(next), is_active: true }
        }
        _ => NotificationPatch { last_sent: Some(now), next_scheduled: None, is_active: false },
    };

    if let Err(e) = repo.update_notification(row.id, &patch).await {
        error!("scheduler: failed to persist recurrence update for notification {}: {}", row.id, e);
    }
}

fn compose_body(row: &DueNotification) -> String {
    if row.mentions_everyone {
        format!("@everyone {}", row.message)
    } else {
        row.message.clone()
    }
}

fn weekday_number(dt: DateTime<Utc>) -> u8 {
    dt.weekday().num_days_from_sunday() as u8
}

/// Soonest calendar day strictly after `after` whose weekday is in `working_days`, searched
/// up to a week ahead; falls back to `after + 1 day` if `working_days` is empty.
fn next_working_day_after(after: NaiveDate, working_days: &HashSet<u8>) -> NaiveDate {
    if working_days.is_empty() {
        return after + Duration::days(1);
    }

    for offset in 1..=7 {
        let candidate = after + Duration::days(offset);
        if working_days.contains(&(candidate.weekday().num_days_from_sunday() as u8)) {
            return candidate;
        }
    }

    after + Duration::days(1)
}

fn at_same_clock_time(date: NaiveDate, clock_source: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(clock_source.time()))
}

fn advance(repeat_type: RepeatType, base: DateTime<Utc>, working_days: &HashSet<u8>) -> Option<DateTime<Utc>> {
    match repeat_type {
        RepeatType::Once => None,
        RepeatType::Daily => Some(base + Duration::days(1)),
        RepeatType::Weekly => Some(base + Duration::days(7)),
        RepeatType::Monthly => Some(add_one_month_clamped(base)),
        RepeatType::WorkingDays => {
            let next_date = next_working_day_after(base.date_naive(), working_days);
            Some(at_same_clock_time(next_date, base))
        }
    }
}

fn add_one_month_clamped(dt: DateTime<Utc>) -> DateTime<Utc> {
    let naive = dt.naive_utc();
    let (year, month) = (naive.year(), naive.month());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let day = naive.day().min(last_day_of_month(next_year, next_month));
    let next_date = NaiveDate::from_ymd_opt(next_year, next_month, day).expect("clamped day is always valid");
    Utc.from_utc_datetime(&next_date.and_time(naive.time()))
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("valid date");
    (first_of_next - Duration::days(1)).day()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::{InMemoryRepository, SeedNotification};
    use std::sync::Mutex as StdMutex;

    struct FakeSink {
        sent: StdMutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl FakeSink {
        fn new(fail: bool) -> Self {
            Self { sent: StdMutex::new(Vec::new()), fail }
        }
    }

    #[serenity::async_trait]
    impl MessageSink for FakeSink {
        async fn send_to_channel(&self, platform_channel_id: &str, content: &str) -> Result<(), String> {
            if self.fail {
                return Err("channel not found/accessible".to_string());
            }
            self.sent.lock().unwrap().push((platform_channel_id.to_string(), content.to_string()));
            Ok(())
        }
    }

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn working_days() -> HashSet<u8> {
        [1u8, 2, 3, 4, 5].into_iter().collect()
    }

    #[tokio::test]
    async fn s1_daily_fires_and_advances() {
        let repo = InMemoryRepository::new();
        repo.set_settings(crate::repository::BotSettings { working_days: working_days(), ..Default::default() });
        let id = repo.seed_notification(SeedNotification {
            title: None,
            message: "standup".to_string(),
            repeat_type: RepeatType::Daily,
            end_date: None,
            mentions_everyone: false,
            next_scheduled: Some(dt(2025, 1, 1, 9, 0)),
            is_active: true,
            channel_platform_id: "chan-1".to_string(),
            timezone: "UTC".to_string(),
        });

        let sink = FakeSink::new(false);
        run_tick(&repo, &sink, dt(2025, 1, 1, 9, 0)).await;

        let logs = repo.notification_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Success);

        let stored = repo.notification(id).unwrap();
        assert!(stored.is_active);
        assert_eq!(stored.next_scheduled, Some(dt(2025, 1, 2, 9, 0)));
    }

    #[tokio::test]
    async fn s2_once_terminates() {
        let repo = InMemoryRepository::new();
        repo.set_settings(crate::repository::BotSettings { working_days: working_days(), ..Default::default() });
        let id = repo.seed_notification(SeedNotification {
            title: None,
            message: "one-off".to_string(),
            repeat_type: RepeatType::Once,
            end_date: None,
            mentions_everyone: false,
            next_scheduled: Some(dt(2025, 1, 1, 10, 0)),
            is_active: true,
            channel_platform_id: "chan-1".to_string(),
            timezone: "UTC".to_string(),
        });

        let sink = FakeSink::new(false);
        run_tick(&repo, &sink, dt(2025, 1, 1, 10, 0)).await;

        let stored = repo.notification(id).unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.next_scheduled, None);
    }

    #[tokio::test]
    async fn s3_working_days_skip_saturday() {
        let repo = InMemoryRepository::new();
        repo.set_settings(crate::repository::BotSettings { working_days: working_days(), ..Default::default() });
        // 2025-01-04 is a Saturday.
        let id = repo.seed_notification(SeedNotification {
            title: None,
            message: "standup".to_string(),
            repeat_type: RepeatType::WorkingDays,
            end_date: None,
            mentions_everyone: false,
            next_scheduled: Some(dt(2025, 1, 4, 8, 0)),
            is_active: true,
            channel_platform_id: "chan-1".to_string(),
            timezone: "UTC".to_string(),
        });

        let sink = FakeSink::new(false);
        run_tick(&repo, &sink, dt(2025, 1, 4, 8, 0)).await;

        assert!(repo.notification_logs().is_empty());
        assert!(sink.sent.lock().unwrap().is_empty());

        let stored = repo.notification(id).unwrap();
        assert!(stored.is_active);
        // 2025-01-06 is the following Monday.
        assert_eq!(stored.next_scheduled, Some(dt(2025, 1, 6, 8, 0)));
    }

    #[tokio::test]
    async fn s4_end_date_terminates() {
        let repo = InMemoryRepository::new();
        repo.set_settings(crate::repository::BotSettings { working_days: working_days(), ..Default::default() });
        let id = repo.seed_notification(SeedNotification {
            title: None,
            message: "weekly check-in".to_string(),
            repeat_type: RepeatType::Weekly,
            end_date: Some(dt(2025, 1, 10, 0, 0)),
            mentions_everyone: false,
            next_scheduled: Some(dt(2025, 1, 8, 0, 0)),
            is_active: true,
            channel_platform_id: "chan-1".to_string(),
            timezone: "UTC".to_string(),
        });

        let sink = FakeSink::new(false);
        run_tick(&repo, &sink, dt(2025, 1, 8, 0, 0)).await;

        let logs = repo.notification_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Success);

        let stored = repo.notification(id).unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.next_scheduled, None);
    }

    #[tokio::test]
    async fn failed_send_still_advances_schedule() {
        let repo = InMemoryRepository::new();
        repo.set_settings(crate::repository::BotSettings { working_days: working_days(), ..Default::default() });
        let id = repo.seed_notification(SeedNotification {
            title: None,
            message: "reminder".to_string(),
            repeat_type: RepeatType::Once,
            end_date: None,
            mentions_everyone: false,
            next_scheduled: Some(dt(2025, 1, 1, 10, 0)),
            is_active: true,
            channel_platform_id: "deleted-channel".to_string(),
            timezone: "UTC".to_string(),
        });

        let sink = FakeSink::new(true);
        run_tick(&repo, &sink, dt(2025, 1, 1, 10, 0)).await;

        let logs = repo.notification_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Failed);
        assert_eq!(logs[0].error.as_deref(), Some("channel not found/accessible"));

        let stored = repo.notification(id).unwrap();
        assert!(!stored.is_active, "a failed `once` notification still deactivates");
    }

    #[tokio::test]
    async fn mentions_everyone_prefixes_body() {
        let repo = InMemoryRepository::new();
        repo.set_settings(crate::repository::BotSettings { working_days: working_days(), ..Default::default() });
        repo.seed_notification(SeedNotification {
            title: None,
            message: "server maintenance tonight".to_string(),
            repeat_type: RepeatType::Once,
            end_date: None,
            mentions_everyone: true,
            next_scheduled: Some(dt(2025, 1, 1, 10, 0)),
            is_active: true,
            channel_platform_id: "chan-1".to_string(),
            timezone: "UTC".to_string(),
        });

        let sink = FakeSink::new(false);
        run_tick(&repo, &sink, dt(2025, 1, 1, 10, 0)).await;

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0].1, "@everyone server maintenance tonight");
    }
}
