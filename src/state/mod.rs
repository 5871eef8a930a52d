mod actor;
pub mod artifact;
pub mod events;
pub mod participant;
mod realtime;
pub mod session;
pub mod session_machine;
pub mod timer;
pub mod trigger;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::{
    sync::{RwLock, watch},
    time::timeout,
};
use futures::future::BoxFuture;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::RuntimeConfig,
    dao::{gateway::PlayGateway, storage::StorageResult},
    error::ServiceError,
};

pub use self::actor::{SessionActor, SessionGuard};
pub use self::realtime::{ChannelRegistry, RealtimeHub, RealtimeMessage};
use self::session::LiveSession;

/// Cheaply clonable handle on the application state.
pub type SharedState = Arc<AppState>;

/// Session and participant a bearer token resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEntry {
    /// Session the participant belongs to.
    pub session_id: Uuid,
    /// Participant holding the token.
    pub participant_id: Uuid,
}

/// Central application state: gateway handle, session actors and realtime channels.
pub struct AppState {
    gateway: RwLock<Option<Arc<dyn PlayGateway>>>,
    degraded: watch::Sender<bool>,
    sessions: DashMap<Uuid, Arc<SessionActor>>,
    tokens: DashMap<String, TokenEntry>,
    channels: ChannelRegistry,
    config: RuntimeConfig,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a gateway is installed.
    pub fn new(config: RuntimeConfig) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            gateway: RwLock::new(None),
            degraded: degraded_tx,
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            channels: ChannelRegistry::new(config.broadcast_capacity),
            config,
        })
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Open realtime channels.
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Obtain a handle to the current gateway, if one is installed.
    pub async fn gateway(&self) -> Option<Arc<dyn PlayGateway>> {
        let guard = self.gateway.read().await;
        guard.as_ref().cloned()
    }

    /// Install a new gateway implementation and leave degraded mode.
    pub async fn install_gateway(&self, gateway: Arc<dyn PlayGateway>) {
        {
            let mut guard = self.gateway.write().await;
            *guard = Some(gateway);
        }
        self.update_degraded(false);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    /// Run one gateway call under the configured timeout.
    ///
    /// Fails fast with [`ServiceError::Degraded`] while the supervisor reports the gateway
    /// unhealthy.
    pub async fn gateway_call<T, F>(&self, call: F) -> Result<T, ServiceError>
    where
        F: FnOnce(Arc<dyn PlayGateway>) -> BoxFuture<'static, StorageResult<T>>,
    {
        if self.is_degraded() {
            return Err(ServiceError::Degraded);
        }
        let gateway = self.gateway().await.ok_or(ServiceError::Degraded)?;
        match timeout(self.config.gateway_timeout, call(gateway)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ServiceError::Timeout),
        }
    }

    /// Actor of a session, rehydrating it from the gateway when not resident.
    pub async fn session(&self, session_id: Uuid) -> Result<Arc<SessionActor>, ServiceError> {
        if let Some(actor) = self.sessions.get(&session_id) {
            return Ok(actor.clone());
        }

        let live = self.rehydrate(session_id).await?;
        let actor = self
            .sessions
            .entry(session_id)
            .or_insert_with(|| {
                info!(session_id = %session_id, "rehydrated session from gateway");
                Arc::new(SessionActor::new(live))
            })
            .clone();
        self.index_tokens(&*actor.read().await);
        Ok(actor)
    }

    /// Register a session created in this process.
    pub fn register_session(&self, live: LiveSession) -> Arc<SessionActor> {
        let actor = Arc::new(SessionActor::new(live));
        self.sessions.insert(actor.id(), actor.clone());
        actor
    }

    /// Drop a resident session that left the live statuses, with its token index entries.
    ///
    /// Only evicts when nothing else holds the actor, so no request can keep writing to a
    /// detached copy; the next access rehydrates from the gateway. Skipped while degraded.
    pub fn evict_idle_session(&self, session_id: Uuid) -> bool {
        if self.is_degraded() {
            return false;
        }
        let evicted = self
            .sessions
            .remove_if(&session_id, |_, actor| {
                Arc::strong_count(actor) == 1
                    && actor.try_status().is_some_and(|status| !status.is_live())
            })
            .is_some();
        if evicted {
            self.tokens.retain(|_, entry| entry.session_id != session_id);
            info!(session_id = %session_id, "idle session evicted");
        }
        evicted
    }

    /// Ids of sessions resident in memory.
    pub fn resident_sessions(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Remember which session and participant a token belongs to.
    pub fn index_token(&self, token: &str, entry: TokenEntry) {
        self.tokens.insert(token.to_owned(), entry);
    }

    /// Resolve a bearer token, falling back to the gateway when the index misses.
    pub async fn resolve_token(&self, token: &str) -> Result<TokenEntry, ServiceError> {
        if let Some(entry) = self.tokens.get(token) {
            return Ok(*entry);
        }

        let owned = token.to_owned();
        let participant = self
            .gateway_call(move |gateway| gateway.find_participant_by_token(owned))
            .await?
            .ok_or_else(|| ServiceError::Unauthorized("unknown participant token".into()))?;
        let entry = TokenEntry {
            session_id: participant.session_id,
            participant_id: participant.id,
        };
        debug!(session_id = %entry.session_id, participant_id = %entry.participant_id, "token resolved from gateway");
        self.index_token(token, entry);
        Ok(entry)
    }

    fn index_tokens(&self, live: &LiveSession) {
        for participant in live.participants.values() {
            self.index_token(
                &participant.token,
                TokenEntry {
                    session_id: participant.session_id,
                    participant_id: participant.id,
                },
            );
        }
    }

    async fn rehydrate(&self, session_id: Uuid) -> Result<LiveSession, ServiceError> {
        let session = self
            .gateway_call(move |gateway| gateway.find_session(session_id))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}`")))?;
        let participants = self
            .gateway_call(move |gateway| gateway.list_participants(session_id))
            .await?;
        let artifacts = self
            .gateway_call(move |gateway| gateway.list_artifacts(session_id))
            .await?;
        let triggers = self
            .gateway_call(move |gateway| gateway.list_triggers(session_id))
            .await?;
        let last_seq = self
            .gateway_call(move |gateway| gateway.current_broadcast_seq(session_id))
            .await?;

        let live = LiveSession::from_parts(session, participants, artifacts, triggers, last_seq);
        if live.status().is_live() {
            self.channels.open(session_id);
        }
        Ok(live)
    }
}
