//! Forwarder Cache & Matcher (C4, spec §4.4).
//!
//! Holds an in-memory index of active forwarders keyed by source location and evaluates
//! inbound messages against it. The index is rebuilt off to the side and installed with a
//! single pointer swap (`tokio::sync::RwLock<Arc<_>>`) so that no reader ever observes a
//! partially-rebuilt map — the same "immutable snapshot behind a lock just long enough to
//! swap a pointer" shape the rest of this codebase uses for its per-guild caches.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use serenity::async_trait;

use crate::repository::{ActiveForwarder, LogStatus, NewForwarderLog, Repository};

lazy_static! {
    static ref NON_WORD: Regex = Regex::new(r"[^\w]+").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LocationKey {
    Channel(String),
    Thread(String),
}

/// The platform-side shape of an inbound message, already flattened out of whatever
/// gateway event type carried it (§4.1 `MessageCreate`).
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub content: String,
    pub author_is_bot: bool,
    pub in_guild: bool,
    pub channel_platform_id: String,
    pub is_thread: bool,
    pub parent_channel_platform_id: Option<String>,
}

/// The slice of C1's contract the matcher needs to deliver a forwarded message: just
/// `SendToChannel`, addressed by platform channel/thread id.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_to_channel(&self, platform_channel_id: &str, content: &str) -> Result<(), String>;
}

pub struct ForwarderCache {
    map: tokio::sync::RwLock<Arc<HashMap<LocationKey, Vec<Arc<ActiveForwarder>>>>>,
}

impl Default for ForwarderCache {
    fn default() -> Self {
        Self { map: tokio::sync::RwLock::new(Arc::new(HashMap::new())) }
    }
}

impl ForwarderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the cache from `getActiveForwarders()` and installs it atomically.
    /// Triggered at `Ready` and on every `ReloadForwarders()` call (spec §4.4, §4.6).
    pub async fn load(&self, repo: &dyn Repository) -> Result<usize, crate::error::RepositoryError> {
        let forwarders = repo.get_active_forwarders().await?;
        let mut built: HashMap<LocationKey, Vec<Arc<ActiveForwarder>>> = HashMap::new();
        let rule_count = forwarders.len();

        for forwarder in forwarders {
            let forwarder = Arc::new(forwarder);

            let key = match &forwarder.source_thread_id {
                Some(thread_id) => LocationKey::Thread(thread_id.clone()),
                None => LocationKey::Channel(forwarder.source_channel_platform_id.clone()),
            };

            built.entry(key).or_default().push(Arc::clone(&forwarder));

            // A thread-scoped forwarder must not leak into the parent channel's rule set:
            // ensure a (possibly empty) entry exists for the channel itself.
            if forwarder.source_thread_id.is_some() {
                built
                    .entry(LocationKey::Channel(forwarder.source_channel_platform_id.clone()))
                    .or_default();
            }
        }

        *self.map.write().await = Arc::new(built);

        debug!("forwarder cache reloaded with {} active rule(s)", rule_count);
        Ok(rule_count)
    }

    async fn candidates_for(&self, msg: &InboundMessage) -> Vec<Arc<ActiveForwarder>> {
        let snapshot = Arc::clone(&*self.map.read().await);

        if msg.is_thread {
            let mut rules = snapshot
                .get(&LocationKey::Thread(msg.channel_platform_id.clone()))
                .cloned()
                .unwrap_or_default();

            if let Some(parent) = &msg.parent_channel_platform_id {
                if let Some(parent_rules) = snapshot.get(&LocationKey::Channel(parent.clone())) {
                    rules.extend(parent_rules.iter().cloned());
                }
            }

            rules
        } else {
            snapshot
                .get(&LocationKey::Channel(msg.channel_platform_id.clone()))
                .cloned()
                .unwrap_or_default()
        }
    }
}

/// Splits `content` into lowercase word tokens, collapsing every run of non-word
/// characters into a single separator (spec §4.4, `exact` match normalization).
fn normalize_tokens(content: &str) -> Vec<String> {
    NON_WORD
        .replace_all(&content.to_lowercase(), " ")
        .split_whitespace()
        .map(str::to_owned)
        .collect()
}

fn contains_contiguous(haystack: &[String], needle: &[String]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Applies a single forwarder's keyword list to `content`, in order, returning the first
/// keyword that matches (spec §4.4, property 7: keyword ordering).
fn first_matching_keyword(forwarder: &ActiveForwarder, content: &str) -> Option<String> {
    use crate::repository::MatchType;

    let lower_content = content.to_lowercase();
    let content_tokens = match forwarder.match_type {
        MatchType::Exact => Some(normalize_tokens(content)),
        MatchType::Contains => None,
    };

    for keyword in &forwarder.keywords {
        let matched = match forwarder.match_type {
            MatchType::Contains => lower_content.contains(&keyword.to_lowercase()),
            MatchType::Exact => {
                let keyword_tokens = normalize_tokens(keyword);
                contains_contiguous(content_tokens.as_ref().unwrap(), &keyword_tokens)
            }
        };

        if matched {
            return Some(keyword.clone());
        }
    }

    None
}

/// Evaluates one inbound message against the current cache and forwards every rule that
/// matches. Bot authors and DMs are dropped before any cache lookup (spec §4.4).
pub async fn handle_message(
    cache: &ForwarderCache,
    repo: &dyn Repository,
    sink: &dyn MessageSink,
    msg: &InboundMessage,
) {
    if msg.author_is_bot || !msg.in_guild {
        return;
    }

    let candidates = cache.candidates_for(msg).await;

    for forwarder in candidates {
        if let Some(keyword) = first_matching_keyword(&forwarder, &msg.content) {
            forward_one(repo, sink, &forwarder, &msg.content, keyword).await;
        }
    }
}

async fn forward_one(
    repo: &dyn Repository,
    sink: &dyn MessageSink,
    forwarder: &ActiveForwarder,
    content: &str,
    matched_keyword: String,
) {
    let destination = forwarder
        .destination_thread_id
        .clone()
        .unwrap_or_else(|| forwarder.destination_channel_platform_id.clone());

    let body = format!("**Forwarded Message**\n-----\n{}", content);

    let (status, error) = match sink.send_to_channel(&destination, &body).await {
        Ok(()) => {
            debug!("forwarder '{}' matched '{}', forwarded to {}", forwarder.name, matched_keyword, destination);
            (LogStatus::Success, None)
        }
        Err(e) => {
            warn!("forwarder '{}' failed to send to {}: {}", forwarder.name, destination, e);
            (LogStatus::Failed, Some(e))
        }
    };

    let log = NewForwarderLog {
        forwarder_id: forwarder.id,
        forwarded_at: Utc::now(),
        original_message: content.to_owned(),
        matched_keyword: Some(matched_keyword),
        status,
        error,
    };

    if let Err(e) = repo.create_forwarder_log(&log).await {
        warn!("failed to persist forwarder log for forwarder {}: {}", forwarder.id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::{InMemoryRepository, SeedForwarder};
    use crate::repository::MatchType;
    use std::sync::Mutex;

    struct RecordingSink {
        sent: Mutex<Vec<(String, String)>>,
        fail_next: bool,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()), fail_next: false }
        }
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send_to_channel(&self, platform_channel_id: &str, content: &str) -> Result<(), String> {
            if self.fail_next {
                return Err("channel not found/accessible".to_string());
            }
            self.sent.lock().unwrap().push((platform_channel_id.to_string(), content.to_string()));
            Ok(())
        }
    }

    fn msg(content: &str) -> InboundMessage {
        InboundMessage {
            content: content.to_string(),
            author_is_bot: false,
            in_guild: true,
            channel_platform_id: "chan-1".to_string(),
            is_thread: false,
            parent_channel_platform_id: None,
        }
    }

    #[tokio::test]
    async fn contains_match_forwards_and_logs_first_keyword() {
        let repo = InMemoryRepository::new();
        repo.seed_forwarder(SeedForwarder {
            name: "urgent-relay".to_string(),
            source_channel_platform_id: "chan-1".to_string(),
            source_thread_id: None,
            destination_channel_platform_id: "chan-2".to_string(),
            destination_thread_id: None,
            keywords: vec!["urgent".to_string(), "alert".to_string()],
            match_type: MatchType::Contains,
            is_active: true,
        });

        let cache = ForwarderCache::new();
        cache.load(&repo).await.unwrap();

        let sink = RecordingSink::new();
        handle_message(&cache, &repo, &sink, &msg("This is URGENT today.")).await;

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "chan-2");
        assert!(sent[0].1.starts_with("**Forwarded Message**\n-----\n"));

        let logs = repo.forwarder_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].matched_keyword.as_deref(), Some("urgent"));
        assert_eq!(logs[0].status, LogStatus::Success);
    }

    #[tokio::test]
    async fn exact_match_ignores_punctuation() {
        let repo = InMemoryRepository::new();
        repo.seed_forwarder(SeedForwarder {
            name: "alert-relay".to_string(),
            source_channel_platform_id: "chan-1".to_string(),
            source_thread_id: None,
            destination_channel_platform_id: "chan-2".to_string(),
            destination_thread_id: None,
            keywords: vec!["alert".to_string()],
            match_type: MatchType::Exact,
            is_active: true,
        });

        let cache = ForwarderCache::new();
        cache.load(&repo).await.unwrap();

        let sink = RecordingSink::new();
        handle_message(&cache, &repo, &sink, &msg("ALERT! please read.")).await;

        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bot_author_never_forwards() {
        let repo = InMemoryRepository::new();
        repo.seed_forwarder(SeedForwarder {
            name: "urgent-relay".to_string(),
            source_channel_platform_id: "chan-1".to_string(),
            source_thread_id: None,
            destination_channel_platform_id: "chan-2".to_string(),
            destination_thread_id: None,
            keywords: vec!["urgent".to_string()],
            match_type: MatchType::Contains,
            is_active: true,
        });

        let cache = ForwarderCache::new();
        cache.load(&repo).await.unwrap();

        let sink = RecordingSink::new();
        let mut bot_msg = msg("This is URGENT today.");
        bot_msg.author_is_bot = true;
        handle_message(&cache, &repo, &sink, &bot_msg).await;

        assert!(sink.sent.lock().unwrap().is_empty());
        assert!(repo.forwarder_logs().is_empty());
    }

    #[tokio::test]
    async fn thread_message_sees_thread_and_parent_rules_but_not_sibling_channel_rules() {
        let repo = InMemoryRepository::new();
        repo.seed_forwarder(SeedForwarder {
            name: "thread-only".to_string(),
            source_channel_platform_id: "chan-1".to_string(),
            source_thread_id: Some("thread-1".to_string()),
            destination_channel_platform_id: "chan-2".to_string(),
            destination_thread_id: None,
            keywords: vec!["ping".to_string()],
            match_type: MatchType::Contains,
            is_active: true,
        });

        let cache = ForwarderCache::new();
        cache.load(&repo).await.unwrap();

        let sink = RecordingSink::new();
        // A message in the parent channel (not the thread) must not match the thread-only rule.
        handle_message(&cache, &repo, &sink, &msg("ping")).await;
        assert!(sink.sent.lock().unwrap().is_empty());

        let mut thread_msg = msg("ping");
        thread_msg.is_thread = true;
        thread_msg.channel_platform_id = "thread-1".to_string();
        thread_msg.parent_channel_platform_id = Some("chan-1".to_string());
        handle_message(&cache, &repo, &sink, &thread_msg).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_failure_logs_failed_status() {
        let repo = InMemoryRepository::new();
        repo.seed_forwarder(SeedForwarder {
            name: "urgent-relay".to_string(),
            source_channel_platform_id: "chan-1".to_string(),
            source_thread_id: None,
            destination_channel_platform_id: "chan-2".to_string(),
            destination_thread_id: None,
            keywords: vec!["urgent".to_string()],
            match_type: MatchType::Contains,
            is_active: true,
        });

        let cache = ForwarderCache::new();
        cache.load(&repo).await.unwrap();

        let mut sink = RecordingSink::new();
        sink.fail_next = true;
        handle_message(&cache, &repo, &sink, &msg("urgent!")).await;

        let logs = repo.forwarder_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Failed);
        assert!(logs[0].error.is_some());
    }
}
