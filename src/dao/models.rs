use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::state::{
    artifact::{ArtifactState, ArtifactVariant, KeypadConfig},
    events::{Actor, ActorKind},
    participant::ParticipantStatus,
    session::{PlayMode, SessionSettings},
    session_machine::SessionStatus,
    timer::TimerState,
    trigger::{TriggerAction, TriggerCondition, TriggerStatus},
};

/// Durable session record. The broadcast counter lives apart from it at the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntity {
    pub id: Uuid,
    pub join_code: String,
    pub tenant_id: Uuid,
    pub host_user_id: Uuid,
    pub display_name: String,
    pub play_mode: PlayMode,
    pub status: SessionStatus,
    pub locked_from: Option<SessionStatus>,
    pub step_index: u32,
    pub step_count: u32,
    pub phase_index: u32,
    pub phase_count: u32,
    pub settings: SessionSettings,
    pub timer: TimerState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub paused_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub cancelled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub archived_at: Option<OffsetDateTime>,
}

/// Durable participant record; never deleted, only status-transitioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantEntity {
    pub id: Uuid,
    pub session_id: Uuid,
    pub display_name: String,
    pub role: Option<String>,
    pub status: ParticipantStatus,
    pub token: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub token_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen_at: OffsetDateTime,
    /// Free-form progress blob; `ready` lives here.
    pub progress: serde_json::Value,
}

impl ParticipantEntity {
    /// Ready flag stored in the progress blob.
    pub fn is_ready(&self) -> bool {
        self.progress
            .get("ready")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Durable artifact record with its variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntity {
    pub id: Uuid,
    pub session_id: Uuid,
    pub key: String,
    pub title: String,
    pub order_index: u32,
    pub state: ArtifactState,
    pub version: u64,
    pub variants: Vec<ArtifactVariant>,
    pub keypad: Option<KeypadConfig>,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Durable trigger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEntity {
    pub id: Uuid,
    pub session_id: Uuid,
    pub name: String,
    pub order_index: u32,
    pub condition: TriggerCondition,
    pub actions: Vec<TriggerAction>,
    pub execute_once: bool,
    pub delay_seconds: u32,
    pub status: TriggerStatus,
    pub fired_count: u32,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_fired_at: Option<OffsetDateTime>,
}

/// Request to record one firing of a trigger.
#[derive(Debug, Clone)]
pub struct TriggerFireClaim {
    pub session_id: Uuid,
    pub trigger_id: Uuid,
    pub execute_once: bool,
    /// Deduplicates retries and duplicate event deliveries.
    pub idempotency_key: String,
    pub status_after: TriggerStatus,
    pub fired_at: OffsetDateTime,
}

/// Outcome of a [`TriggerFireClaim`], decided atomically at the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerFireOutcome {
    /// The firing was recorded.
    Fired {
        fired_count: u32,
        fired_at: OffsetDateTime,
    },
    /// `execute_once` trigger already fired; nothing recorded.
    Exhausted { fired_count: u32 },
    /// Same idempotency key was recorded before.
    Replay {
        fired_count: u32,
        original_fired_at: OffsetDateTime,
    },
}

/// Record of one trigger firing, unique per `(trigger_id, idempotency_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerFireEntity {
    pub trigger_id: Uuid,
    pub session_id: Uuid,
    pub idempotency_key: String,
    pub fired_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub fired_at: OffsetDateTime,
}

/// Principal recorded on a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerActor {
    pub kind: ActorKind,
    pub id: Option<Uuid>,
}

impl From<Actor> for LedgerActor {
    fn from(actor: Actor) -> Self {
        Self {
            kind: actor.kind,
            id: actor.id,
        }
    }
}

/// Append-only time-bank row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBankEntryEntity {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Zero-based position within the session ledger.
    pub position: u64,
    pub delta_seconds: i64,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub event_id: Option<String>,
    pub actor: LedgerActor,
    /// Projection (sum of deltas up to and including this row).
    pub balance_after: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Input of the atomic time-bank apply.
#[derive(Debug, Clone)]
pub struct TimeBankDeltaRequest {
    pub session_id: Uuid,
    pub delta_seconds: i64,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub event_id: Option<String>,
    pub actor: LedgerActor,
    pub min_balance: i64,
    pub max_balance: i64,
    pub recorded_at: OffsetDateTime,
}

/// Largest single time-bank delta, in seconds.
pub const MAX_TIME_BANK_DELTA_SECONDS: i64 = 86_400;

/// Largest amount a single currency transaction may move.
pub const MAX_CURRENCY_AMOUNT: i64 = 1_000_000_000;

/// Outcome of the atomic time-bank apply.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeBankOutcome {
    /// A new row was appended.
    Applied(TimeBankEntryEntity),
    /// `event_id` was applied before; the original row is returned.
    Replayed(TimeBankEntryEntity),
    /// The delta would leave the bounds (or the `i64` range); nothing appended.
    OutOfBounds { balance: i64 },
}

/// Currency ledger row kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CurrencyTransactionKind {
    /// Credit.
    Earn,
    /// Debit; rejected when it would drive the balance negative.
    Spend,
    /// Reversal of a referenced earn or spend.
    Refund,
}

/// Append-only currency ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyTransactionEntity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub kind: CurrencyTransactionKind,
    /// Positive magnitude.
    pub amount: i64,
    /// Signed effect on the balance.
    pub delta: i64,
    pub reason_code: String,
    pub idempotency_key: String,
    pub refund_of: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub balance_after: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Input of the atomic currency apply.
#[derive(Debug, Clone)]
pub struct CurrencyTransactionRequest {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub kind: CurrencyTransactionKind,
    pub amount: i64,
    pub delta: i64,
    pub reason_code: String,
    pub idempotency_key: String,
    pub refund_of: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Rejected debit remembered under its idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyRejectionEntity {
    pub user_id: Uuid,
    pub idempotency_key: String,
    pub balance: i64,
    pub requested: i64,
}

/// Outcome of the atomic currency apply.
#[derive(Debug, Clone, PartialEq)]
pub enum CurrencyOutcome {
    /// A new row was appended.
    Applied(CurrencyTransactionEntity),
    /// Key used before; the original row is returned.
    Replayed(CurrencyTransactionEntity),
    /// Debit refused; `replay` tells whether this key was refused before.
    Rejected {
        balance: i64,
        requested: i64,
        replay: bool,
    },
    /// Credit would overflow the balance; nothing appended.
    Overflow { balance: i64 },
}

/// Audit row for every committed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEventEntity {
    pub id: Uuid,
    pub session_id: Uuid,
    pub seq: u64,
    pub degraded: bool,
    pub event_type: String,
    pub actor: LedgerActor,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
