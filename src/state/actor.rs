use std::{future::Future, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::ServiceError,
    state::{
        session::LiveSession,
        session_machine::{Plan, SessionEvent, SessionStatus},
    },
};

/// Serialized writer for one session.
///
/// Mutating commands hold the gate for their whole duration; readers only take the
/// `RwLock` briefly and may run concurrently with the writer.
pub struct SessionActor {
    id: Uuid,
    gate: Arc<Mutex<()>>,
    live: RwLock<LiveSession>,
}

impl SessionActor {
    /// Wrap a rehydrated or freshly created session.
    pub fn new(live: LiveSession) -> Self {
        Self {
            id: live.session.id,
            gate: Arc::new(Mutex::new(())),
            live: RwLock::new(live),
        }
    }

    /// Session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for exclusive writer access.
    pub async fn lock(self: &Arc<Self>) -> SessionGuard {
        let permit = self.gate.clone().lock_owned().await;
        SessionGuard {
            actor: self.clone(),
            _permit: permit,
        }
    }

    /// Concurrent read access.
    pub async fn read(&self) -> RwLockReadGuard<'_, LiveSession> {
        self.live.read().await
    }

    /// Current status without waiting; `None` while a writer holds the session.
    pub fn try_status(&self) -> Option<SessionStatus> {
        self.live.try_read().ok().map(|live| live.status())
    }
}

/// Proof that the holder is the session's single writer.
pub struct SessionGuard {
    actor: Arc<SessionActor>,
    _permit: OwnedMutexGuard<()>,
}

impl SessionGuard {
    /// Session id.
    pub fn session_id(&self) -> Uuid {
        self.actor.id
    }

    /// Owning actor.
    pub fn actor(&self) -> &Arc<SessionActor> {
        &self.actor
    }

    /// Read the live session.
    pub async fn read(&self) -> RwLockReadGuard<'_, LiveSession> {
        self.actor.live.read().await
    }

    /// Mutate the live session. Never hold the returned guard across a gateway call.
    pub async fn write(&self) -> RwLockWriteGuard<'_, LiveSession> {
        self.actor.live.write().await
    }

    /// Plan a lifecycle transition, run `work`, then apply the plan or abort it on error.
    ///
    /// The in-memory status only moves once `work` (the durable write) succeeded.
    pub async fn run_transition<F, Fut, T>(
        &self,
        event: SessionEvent,
        work: F,
    ) -> Result<(T, Plan), ServiceError>
    where
        F: FnOnce(Plan) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let plan = self.write().await.machine.plan(event)?;

        match work(plan.clone()).await {
            Ok(value) => {
                self.write().await.machine.apply(plan.id)?;
                Ok((value, plan))
            }
            Err(err) => {
                if let Err(abort_err) = self.write().await.machine.abort(plan.id) {
                    warn!(
                        session_id = %self.session_id(),
                        event = ?event,
                        plan_id = %plan.id,
                        error = ?abort_err,
                        "failed to abort transition after work error"
                    );
                }
                Err(err)
            }
        }
    }
}
