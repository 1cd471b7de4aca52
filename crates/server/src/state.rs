//! Application state: the identity -> actor registry.
//!
//! The registry only maps identities to actor handles. Connections live
//! inside the actors; nothing here is shared across identities.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use platewise_protocol::now_millis;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::db::StoreError;
use crate::scheduler::ScheduledTaskStore;
use crate::session_actor::{ActorDeps, SessionActorHandle};

pub struct SessionRegistry {
    deps: ActorDeps,
    actors: DashMap<String, SessionActorHandle>,
    next_connection_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(deps: ActorDeps) -> Self {
        Self {
            deps,
            actors: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Handle for `identity`, spawning its actor on first contact. A handle
    /// whose actor has exited is replaced.
    pub fn get_or_spawn(&self, identity: &str) -> SessionActorHandle {
        if let Some(actor) = self.actors.get(identity) {
            if actor.is_alive() {
                return actor.clone();
            }
        }
        let mut entry = self
            .actors
            .entry(identity.to_string())
            .or_insert_with(|| SessionActorHandle::spawn(identity, self.deps.clone()));
        if !entry.is_alive() {
            warn!(
                component = "registry",
                event = "registry.actor_respawned",
                identity = %identity,
                "Session actor had exited; spawning a new one"
            );
            *entry = SessionActorHandle::spawn(identity, self.deps.clone());
        }
        entry.clone()
    }

    /// Drop actors with no connection and no queued task that have been
    /// quiet for `idle_for`, plus any whose loop has exited.
    pub fn evict_idle(&self, idle_for: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(idle_for.as_millis() as u64);
        let mut evicted = 0;
        self.actors.retain(|_, actor| {
            let drop_it = actor.is_evictable(cutoff);
            evicted += usize::from(drop_it);
            !drop_it
        });
        if evicted > 0 {
            debug!(
                component = "registry",
                event = "registry.evicted",
                evicted,
                remaining = self.actors.len(),
                "Evicted idle session actors"
            );
        }
        evicted
    }

    /// Periodically evict idle actors until the registry is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, idle_for: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let every = (idle_for / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.evict_idle(idle_for);
            }
        })
    }

    #[allow(dead_code)]
    pub fn get(&self, identity: &str) -> Option<SessionActorHandle> {
        self.actors.get(identity).map(|a| a.clone())
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawn an actor for every identity with queued tasks so their alarms
    /// are armed again after a restart.
    pub async fn rehydrate(&self) -> Result<usize, StoreError> {
        let identities = ScheduledTaskStore::identities_with_queued_tasks(&self.deps.db).await?;
        for identity in &identities {
            self.get_or_spawn(identity);
        }
        info!(
            component = "registry",
            event = "registry.rehydrated",
            identities = identities.len(),
            "Rehydrated actors with queued tasks"
        );
        Ok(identities.len())
    }
}
