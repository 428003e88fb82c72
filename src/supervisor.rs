//! Runtime Supervisor (C6, spec §4.6).
//!
//! Owns C1..C5 as a composite lifecycle and runs the event dispatch loop described in §2's
//! control-flow summary: boot C1, on `Ready` run `SyncAll` → `Load` → scheduler start, then
//! route every subsequent event to C3 or C4 for the life of the process.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio::sync::Mutex;

use crate::forwarder::{self, ForwarderCache};
use crate::gateway::{GatewayClient, GatewayEvent};
use crate::repository::Repository;
use crate::scheduler::Scheduler;
use crate::topology;

/// Pure projection exposed to the API layer (§4.6, §6).
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub online: bool,
    pub identity_name: Option<String>,
    pub identity_id: Option<String>,
    pub server_count: usize,
}

pub struct Supervisor {
    gateway: Arc<GatewayClient>,
    repo: Arc<dyn Repository>,
    forwarder_cache: Arc<ForwarderCache>,
    scheduler: Arc<Scheduler>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            gateway: Arc::new(GatewayClient::new()),
            repo,
            forwarder_cache: Arc::new(ForwarderCache::new()),
            scheduler: Arc::new(Scheduler::new()),
            dispatch: Mutex::new(None),
        }
    }

    /// Brings up C1 and, once connected, spawns the loop that reacts to its events. A
    /// missing token leaves the runtime entirely inert (§4.1 failure semantics) — `start`
    /// returns having done nothing else.
    pub async fn start(&self) {
        let mut events = match self.gateway.start().await {
            Some(events) => events,
            None => {
                warn!("runtime supervisor staying inert: gateway did not start");
                return;
            }
        };

        let gateway = self.gateway.clone();
        let repo = self.repo.clone();
        let forwarder_cache = self.forwarder_cache.clone();
        let scheduler = self.scheduler.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    GatewayEvent::Ready { identity_name, identity_id } => {
                        info!("runtime ready as {} ({})", identity_name, identity_id);
                        gateway.mark_online(identity_name.clone(), identity_id.clone()).await;

                        let guild_ids = gateway.current_guild_ids().await;
                        topology::sync_all(gateway.as_ref(), repo.as_ref(), &guild_ids).await;

                        match forwarder_cache.load(repo.as_ref()).await {
                            Ok(count) => info!("forwarder cache loaded with {} rule(s)", count),
                            Err(e) => error!("initial forwarder cache load failed: {}", e),
                        }

                        scheduler.start(repo.clone(), gateway.clone()).await;
                    }
                    GatewayEvent::GuildCreate(platform_guild_id) => {
                        if let Err(e) = topology::sync_server(gateway.as_ref(), repo.as_ref(), &platform_guild_id).await
                        {
                            warn!("failed to sync guild {}: {}", platform_guild_id, e);
                        }
                    }
                    GatewayEvent::GuildDelete(platform_guild_id) => {
                        topology::handle_guild_delete(repo.as_ref(), &platform_guild_id).await;
                    }
                    GatewayEvent::MessageCreate(message) => {
                        forwarder::handle_message(
                            forwarder_cache.as_ref(),
                            repo.as_ref(),
                            gateway.as_ref(),
                            &message,
                        )
                        .await;
                    }
                }
            }
        });

        *self.dispatch.lock().await = Some(handle);
    }

    /// Stops the scheduler timer first, then tears down C1 (§4.6, §5 cancellation order).
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.gateway.stop().await;

        if let Some(handle) = self.dispatch.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn status(&self) -> RuntimeStatus {
        let status = self.gateway.status().await;
        RuntimeStatus {
            online: status.online,
            identity_name: status.identity_name,
            identity_id: status.identity_id,
            server_count: status.server_count,
        }
    }

    /// Non-blocking request for C4 to rebuild its cache; safe to call at any time.
    pub fn reload_forwarders(&self) {
        let repo = self.repo.clone();
        let forwarder_cache = self.forwarder_cache.clone();
        tokio::spawn(async move {
            match forwarder_cache.load(repo.as_ref()).await {
                Ok(count) => info!("forwarder cache reloaded with {} rule(s)", count),
                Err(e) => error!("forwarder cache reload failed: {}", e),
            }
        });
    }
}
