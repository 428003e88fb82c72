//! Topology Synchronizer (C3, spec §4.3).
//!
//! Reconciles the platform's live guild/channel graph with the repository. Depends on C1
//! only through the narrow [`TopologySource`] contract so that `SyncServer`/`SyncChannels`
//! can be exercised against an in-memory fake instead of a live gateway session.

use std::collections::HashSet;

use log::{debug, warn};
use serenity::async_trait;

use crate::gateway::{ChannelInfo, GatewayClient, GuildInfo};
use crate::repository::{ChannelUpsert, Repository, ServerUpsert};

/// The slice of C1 that topology sync needs: resolve a guild's own fields, list its
/// mirrored-kind channels, and list its active threads (threads are not returned by the
/// guild channel listing itself, so they are fetched separately and mirrored the same way).
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn fetch_guild(&self, platform_guild_id: &str) -> Result<GuildInfo, String>;
    async fn fetch_channels(&self, platform_guild_id: &str) -> Result<Vec<ChannelInfo>, String>;
    async fn fetch_active_threads(&self, platform_guild_id: &str) -> Result<Vec<ChannelInfo>, String>;
}

#[async_trait]
impl TopologySource for GatewayClient {
    async fn fetch_guild(&self, platform_guild_id: &str) -> Result<GuildInfo, String> {
        GatewayClient::fetch_guild(self, platform_guild_id).await
    }

    async fn fetch_channels(&self, platform_guild_id: &str) -> Result<Vec<ChannelInfo>, String> {
        GatewayClient::fetch_channels(self, platform_guild_id).await
    }

    async fn fetch_active_threads(&self, platform_guild_id: &str) -> Result<Vec<ChannelInfo>, String> {
        GatewayClient::fetch_active_threads(self, platform_guild_id).await
    }
}

/// For each guild the session currently sees, call [`sync_server`]. A single guild's
/// failure (gateway fetch error, repository error) is logged and does not stop the rest.
pub async fn sync_all(source: &dyn TopologySource, repo: &dyn Repository, platform_guild_ids: &[String]) {
    for platform_guild_id in platform_guild_ids {
        if let Err(e) = sync_server(source, repo, platform_guild_id).await {
            warn!("failed to sync guild {}: {}", platform_guild_id, e);
        }
    }
}

/// Upserts the `Server` row for `platform_guild_id`, marks it connected, then syncs its
/// channels.
pub async fn sync_server(
    source: &dyn TopologySource,
    repo: &dyn Repository,
    platform_guild_id: &str,
) -> Result<(), String> {
    let guild = source.fetch_guild(platform_guild_id).await?;

    let upsert = ServerUpsert {
        platform_id: platform_guild_id.to_string(),
        name: guild.name,
        icon_url: guild.icon_url,
        member_count: guild.member_count,
    };

    let existing = repo.get_server_by_platform_id(platform_guild_id).await.map_err(|e| e.to_string())?;

    let server_id = match existing {
        Some(server) => {
            repo.update_server(server.id, &upsert, true).await.map_err(|e| e.to_string())?;
            server.id
        }
        None => match repo.create_server(&upsert).await {
            Ok(server) => server.id,
            Err(e) if e.is_unique_violation() => {
                // Raced with another sync of the same guild (e.g. rapid GuildCreate replay).
                let server = repo
                    .get_server_by_platform_id(platform_guild_id)
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| "server row vanished after unique violation".to_string())?;
                repo.update_server(server.id, &upsert, true).await.map_err(|e| e.to_string())?;
                server.id
            }
            Err(e) => return Err(e.to_string()),
        },
    };

    sync_channels(source, repo, server_id, platform_guild_id).await
}

/// Upserts every text-like channel in the guild by `platformId` — including active threads,
/// mirrored the same way so that a thread a forwarder targets as its destination resolves to
/// a known channel row — then deletes local channels whose `platformId` no longer appears
/// among the fetched set.
pub async fn sync_channels(
    source: &dyn TopologySource,
    repo: &dyn Repository,
    server_id: u64,
    platform_guild_id: &str,
) -> Result<(), String> {
    let mut remote_channels = source.fetch_channels(platform_guild_id).await?;
    remote_channels.extend(source.fetch_active_threads(platform_guild_id).await?);
    let local_channels = repo.get_channels_by_server(server_id).await.map_err(|e| e.to_string())?;

    let mut surviving = HashSet::new();

    for remote in remote_channels {
        let kind = match remote.kind {
            Some(kind) => kind,
            None => continue,
        };

        surviving.insert(remote.platform_id.clone());

        let upsert = ChannelUpsert {
            platform_id: remote.platform_id.clone(),
            server_id,
            name: remote.name,
            kind,
        };

        match local_channels.iter().find(|c| c.platform_id == remote.platform_id) {
            Some(existing) => {
                repo.update_channel(existing.id, &upsert).await.map_err(|e| e.to_string())?;
            }
            None => match repo.create_channel(&upsert).await {
                Ok(_) => {}
                Err(e) if e.is_unique_violation() => {
                    debug!("channel {} already present, skipping create", remote.platform_id);
                }
                Err(e) => return Err(e.to_string()),
            },
        }
    }

    for local in &local_channels {
        if !surviving.contains(&local.platform_id) {
            repo.delete_channel(local.id).await.map_err(|e| e.to_string())?;
        }
    }

    Ok(())
}

/// `GuildDelete` reaction: mark disconnected, leave channels (and anything referencing
/// them) alone.
pub async fn handle_guild_delete(repo: &dyn Repository, platform_guild_id: &str) {
    if let Err(e) = repo.set_server_connected(platform_guild_id, false).await {
        warn!("failed to mark server {} disconnected: {}", platform_guild_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryRepository;
    use crate::repository::ChannelKind;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeSource {
        guilds: HashMap<String, GuildInfo>,
        channels: Mutex<HashMap<String, Vec<ChannelInfo>>>,
    }

    #[async_trait]
    impl TopologySource for FakeSource {
        async fn fetch_guild(&self, platform_guild_id: &str) -> Result<GuildInfo, String> {
            self.guilds.get(platform_guild_id).cloned().ok_or_else(|| "guild not found".to_string())
        }

        async fn fetch_channels(&self, platform_guild_id: &str) -> Result<Vec<ChannelInfo>, String> {
            Ok(self.channels.lock().unwrap().get(platform_guild_id).cloned().unwrap_or_default())
        }

        async fn fetch_active_threads(&self, _platform_guild_id: &str) -> Result<Vec<ChannelInfo>, String> {
            Ok(Vec::new())
        }
    }

    fn channel(id: &str, name: &str, kind: Option<ChannelKind>) -> ChannelInfo {
        ChannelInfo { platform_id: id.to_string(), name: name.to_string(), kind }
    }

    #[tokio::test]
    async fn sync_server_twice_is_idempotent() {
        let mut guilds = HashMap::new();
        guilds.insert(
            "guild-1".to_string(),
            GuildInfo { name: "My Server".to_string(), icon_url: None, member_count: Some(42) },
        );
        let mut channels = HashMap::new();
        channels.insert(
            "guild-1".to_string(),
            vec![
                channel("chan-1", "general", Some(ChannelKind::Text)),
                channel("chan-2", "announcements", Some(ChannelKind::Announcement)),
                channel("voice-1", "Voice", None),
            ],
        );
        let source = FakeSource { guilds, channels: Mutex::new(channels) };
        let repo = InMemoryRepository::new();

        sync_server(&source, &repo, "guild-1").await.unwrap();
        sync_server(&source, &repo, "guild-1").await.unwrap();

        let server = repo.get_server_by_platform_id("guild-1").await.unwrap().unwrap();
        let channels = repo.get_channels_by_server(server.id).await.unwrap();

        assert_eq!(channels.len(), 2);
        let mut ids: Vec<&str> = channels.iter().map(|c| c.platform_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["chan-1", "chan-2"]);
        assert!(server.is_connected);
    }

    #[tokio::test]
    async fn removed_channel_is_deleted_on_resync() {
        let mut guilds = HashMap::new();
        guilds.insert(
            "guild-1".to_string(),
            GuildInfo { name: "My Server".to_string(), icon_url: None, member_count: None },
        );
        let mut channels = HashMap::new();
        channels.insert(
            "guild-1".to_string(),
            vec![channel("chan-1", "general", Some(ChannelKind::Text)), channel("chan-2", "temp", Some(ChannelKind::Text))],
        );
        let source = FakeSource { guilds, channels: Mutex::new(channels) };
        let repo = InMemoryRepository::new();

        sync_server(&source, &repo, "guild-1").await.unwrap();

        source.channels.lock().unwrap().insert(
            "guild-1".to_string(),
            vec![channel("chan-1", "general", Some(ChannelKind::Text))],
        );

        sync_server(&source, &repo, "guild-1").await.unwrap();

        let server = repo.get_server_by_platform_id("guild-1").await.unwrap().unwrap();
        let channels = repo.get_channels_by_server(server.id).await.unwrap();

        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].platform_id, "chan-1");
    }

    #[tokio::test]
    async fn guild_delete_marks_disconnected_without_touching_channels() {
        let mut guilds = HashMap::new();
        guilds.insert(
            "guild-1".to_string(),
            GuildInfo { name: "My Server".to_string(), icon_url: None, member_count: None },
        );
        let mut channels = HashMap::new();
        channels.insert("guild-1".to_string(), vec![channel("chan-1", "general", Some(ChannelKind::Text))]);
        let source = FakeSource { guilds, channels: Mutex::new(channels) };
        let repo = InMemoryRepository::new();

        sync_server(&source, &repo, "guild-1").await.unwrap();
        handle_guild_delete(&repo, "guild-1").await;

        let server = repo.get_server_by_platform_id("guild-1").await.unwrap().unwrap();
        assert!(!server.is_connected);
        assert_eq!(repo.get_channels_by_server(server.id).await.unwrap().len(), 1);
    }
}
