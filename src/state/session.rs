use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::models::{ArtifactEntity, ParticipantEntity, SessionEntity, TriggerEntity},
    state::{
        participant::ParticipantStatus,
        session_machine::{SessionMachine, SessionStatus},
    },
};

/// How a session is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayMode {
    /// A facilitator drives the session; starting requires an active participant.
    #[default]
    Facilitated,
    /// Participants play on their own.
    SelfGuided,
}

/// Bounds and seed of the session time bank, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TimeBankRules {
    /// Balance seeded when the session starts.
    pub initial_balance: i64,
    /// Default lower clamp.
    pub min_balance: i64,
    /// Default upper clamp.
    pub max_balance: i64,
}

/// Per-session settings blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SessionSettings {
    /// Seats available to participants.
    pub max_participants: u32,
    /// Bearer-token lifetime; `None` means tokens never expire.
    pub token_expiry_hours: Option<u32>,
    /// Whether a disconnected participant may rejoin with their previous token.
    pub allow_rejoin: bool,
    /// Whether every active participant must be ready before start.
    pub require_ready: bool,
    /// Roles participants may pick at join; empty accepts any role.
    pub roles: Vec<String>,
    /// Time-bank seed and default clamps.
    pub time_bank: TimeBankRules,
}

/// In-memory state of one session owned by its actor.
#[derive(Debug, Clone)]
pub struct LiveSession {
    /// Durable session record as last persisted.
    pub session: SessionEntity,
    /// Lifecycle machine mirroring `session.status`.
    pub machine: SessionMachine,
    /// Participants in join order.
    pub participants: IndexMap<Uuid, ParticipantEntity>,
    /// Artifacts keyed by authoring key, in ordering-index order.
    pub artifacts: IndexMap<String, ArtifactEntity>,
    /// Triggers in authoring order.
    pub triggers: IndexMap<Uuid, TriggerEntity>,
    /// Last gateway-assigned broadcast sequence seen by this actor.
    pub last_seq: u64,
    /// Cached time-bank projection, refreshed from every ledger apply.
    pub time_bank_balance: Option<i64>,
}

impl LiveSession {
    /// Assemble a live session from persisted parts.
    pub fn from_parts(
        session: SessionEntity,
        participants: Vec<ParticipantEntity>,
        mut artifacts: Vec<ArtifactEntity>,
        mut triggers: Vec<TriggerEntity>,
        last_seq: u64,
    ) -> Self {
        artifacts.sort_by_key(|artifact| artifact.order_index);
        triggers.sort_by_key(|trigger| trigger.order_index);
        let mut participants = participants;
        participants.sort_by_key(|participant| participant.joined_at);

        Self {
            machine: SessionMachine::restore(session.status, session.locked_from),
            session,
            participants: participants.into_iter().map(|p| (p.id, p)).collect(),
            artifacts: artifacts.into_iter().map(|a| (a.key.clone(), a)).collect(),
            triggers: triggers.into_iter().map(|t| (t.id, t)).collect(),
            last_seq,
            time_bank_balance: None,
        }
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        self.machine.status()
    }

    /// Participants occupying a seat.
    pub fn seated_count(&self) -> u32 {
        self.participants
            .values()
            .filter(|participant| participant.status.holds_seat())
            .count() as u32
    }

    /// Participants currently `active`.
    pub fn active_participants(&self) -> impl Iterator<Item = &ParticipantEntity> {
        self.participants
            .values()
            .filter(|participant| participant.status == ParticipantStatus::Active)
    }
}
