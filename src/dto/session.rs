use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::models::{
        ArtifactEntity, ParticipantEntity, SessionEventEntity, TimeBankEntryEntity,
    },
    dto::{format_optional, format_timestamp, trigger::TriggerView},
    services::realtime_service::RealtimeCapability,
    state::{
        RealtimeMessage,
        artifact::{ArtifactAction, ArtifactState, ArtifactVariant, KeypadConfig},
        events::ActorKind,
        participant::{ModerationAction, ParticipantStatus},
        session::{LiveSession, PlayMode, SessionSettings, TimeBankRules},
        session_machine::SessionStatus,
        timer::{TimerDirection, TimerState},
        trigger::TriggerDefinition,
    },
};

/// Payload used by a facilitator to create a session from an authored definition.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 120))]
    pub display_name: String,
    pub tenant_id: Uuid,
    #[serde(default)]
    pub play_mode: PlayMode,
    #[serde(default)]
    pub step_count: u32,
    #[serde(default)]
    pub phase_count: u32,
    #[serde(default)]
    #[validate(nested)]
    pub settings: SettingsInput,
    #[serde(default)]
    #[validate(nested)]
    pub artifacts: Vec<ArtifactInput>,
    /// Trigger rules; unknown condition or action tags are rejected at deserialisation.
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
}

/// Session settings overrides. Omitted fields use the runtime defaults.
#[derive(Debug, Default, Deserialize, ToSchema, Validate)]
pub struct SettingsInput {
    #[validate(range(min = 1, max = 10_000))]
    pub max_participants: Option<u32>,
    /// If omitted, uses the configured lifetime. If null, tokens never expire.
    #[serde(default, with = "::serde_with::rust::double_option")]
    #[schema(value_type = Option<u32>)]
    pub token_expiry_hours: Option<Option<u32>>,
    pub allow_rejoin: Option<bool>,
    pub require_ready: Option<bool>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub time_bank: Option<TimeBankRules>,
}

/// Authored artifact.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct ArtifactInput {
    #[validate(length(min = 1, max = 64))]
    pub key: String,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[serde(default)]
    pub variants: Vec<ArtifactVariant>,
    pub keypad: Option<KeypadConfig>,
}

/// Target index for `/step` and `/phase`.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct SetIndexRequest {
    pub index: u32,
}

/// Moderation verb applied to one participant.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ModerateRequest {
    pub action: ModerationAction,
}

/// Timer start parameters.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct TimerStartRequest {
    #[validate(range(min = 0, max = 86_400))]
    pub duration_seconds: i64,
    #[serde(default)]
    pub direction: TimerDirection,
}

/// Timer shift in seconds; negative values remove time.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct TimerAdjustRequest {
    #[validate(range(min = -86_400, max = 86_400))]
    pub delta_seconds: i64,
}

/// Facilitator time-bank delta.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct TimeBankDeltaInput {
    #[validate(range(min = -86_400, max = 86_400))]
    pub delta_seconds: i64,
    #[validate(length(min = 1, max = 64))]
    pub reason: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    /// Correlation id; replaying the same id returns the original entry.
    #[validate(length(min = 1, max = 128))]
    pub event_id: Option<String>,
    /// Lower clamp; the session's time-bank minimum when absent.
    pub min_balance: Option<i64>,
    /// Upper clamp; the session's time-bank maximum when absent.
    pub max_balance: Option<i64>,
}

/// Query string of the event log route.
#[derive(Debug, Deserialize, IntoParams)]
pub struct LogQuery {
    /// Most recent rows to return (default 100, at most 500).
    pub limit: Option<usize>,
}

/// Timer state with its value computed at response time.
#[derive(Debug, Serialize, ToSchema, Clone)]
pub struct TimerView {
    #[serde(flatten)]
    pub state: TimerState,
    /// Remaining seconds for a countdown, elapsed seconds for count-up.
    pub value_seconds: i64,
}

impl TimerView {
    pub fn at(state: &TimerState, now: OffsetDateTime) -> Self {
        Self {
            state: state.clone(),
            value_seconds: state.value_at(now),
        }
    }
}

/// Participant as seen by the facilitator. The bearer token is never exposed.
#[derive(Debug, Serialize, ToSchema, Clone)]
pub struct ParticipantSummary {
    pub id: Uuid,
    pub display_name: String,
    pub role: Option<String>,
    pub status: ParticipantStatus,
    pub ready: bool,
    pub joined_at: String,
    pub last_seen_at: String,
    pub token_expires_at: Option<String>,
}

impl From<&ParticipantEntity> for ParticipantSummary {
    fn from(participant: &ParticipantEntity) -> Self {
        Self {
            id: participant.id,
            display_name: participant.display_name.clone(),
            role: participant.role.clone(),
            status: participant.status,
            ready: participant.is_ready(),
            joined_at: format_timestamp(participant.joined_at),
            last_seen_at: format_timestamp(participant.last_seen_at),
            token_expires_at: format_optional(participant.token_expires_at),
        }
    }
}

/// Artifact as seen by the facilitator, with every variant.
#[derive(Debug, Serialize, ToSchema, Clone)]
pub struct ArtifactView {
    pub id: Uuid,
    pub key: String,
    pub title: String,
    pub order_index: u32,
    pub state: ArtifactState,
    pub version: u64,
    pub attempts: u32,
    pub has_keypad: bool,
    pub variants: Vec<ArtifactVariant>,
}

impl From<&ArtifactEntity> for ArtifactView {
    fn from(artifact: &ArtifactEntity) -> Self {
        Self {
            id: artifact.id,
            key: artifact.key.clone(),
            title: artifact.title.clone(),
            order_index: artifact.order_index,
            state: artifact.state,
            version: artifact.version,
            attempts: artifact.attempts,
            has_keypad: artifact.keypad.is_some(),
            variants: artifact.variants.clone(),
        }
    }
}

/// Facilitator snapshot of a session.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionView {
    pub id: Uuid,
    pub join_code: String,
    pub tenant_id: Uuid,
    pub host_user_id: Uuid,
    pub display_name: String,
    pub play_mode: PlayMode,
    pub status: SessionStatus,
    pub step_index: u32,
    pub step_count: u32,
    pub phase_index: u32,
    pub phase_count: u32,
    pub settings: SessionSettings,
    pub timer: TimerView,
    pub time_bank_balance: Option<i64>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub paused_at: Option<String>,
    pub ended_at: Option<String>,
    pub cancelled_at: Option<String>,
    pub archived_at: Option<String>,
    /// Sequence the snapshot reflects; realtime messages continue from here.
    pub last_seq: u64,
    pub realtime: RealtimeCapability,
    pub participants: Vec<ParticipantSummary>,
    pub artifacts: Vec<ArtifactView>,
    pub triggers: Vec<TriggerView>,
}

impl SessionView {
    pub fn from_live(live: &LiveSession, realtime: RealtimeCapability, now: OffsetDateTime) -> Self {
        let session = &live.session;
        Self {
            id: session.id,
            join_code: session.join_code.clone(),
            tenant_id: session.tenant_id,
            host_user_id: session.host_user_id,
            display_name: session.display_name.clone(),
            play_mode: session.play_mode,
            status: live.status(),
            step_index: session.step_index,
            step_count: session.step_count,
            phase_index: session.phase_index,
            phase_count: session.phase_count,
            settings: session.settings.clone(),
            timer: TimerView::at(&session.timer, now),
            time_bank_balance: live.time_bank_balance,
            created_at: format_timestamp(session.created_at),
            started_at: format_optional(session.started_at),
            paused_at: format_optional(session.paused_at),
            ended_at: format_optional(session.ended_at),
            cancelled_at: format_optional(session.cancelled_at),
            archived_at: format_optional(session.archived_at),
            last_seq: live.last_seq,
            realtime,
            participants: live.participants.values().map(Into::into).collect(),
            artifacts: live.artifacts.values().map(Into::into).collect(),
            triggers: live.triggers.values().map(Into::into).collect(),
        }
    }
}

/// Result of a lifecycle command.
#[derive(Debug, Serialize, ToSchema)]
pub struct TransitionResponse {
    pub from: SessionStatus,
    pub status: SessionStatus,
    pub ended_at: Option<String>,
    pub realtime: RealtimeCapability,
    /// Messages published by the command, trigger follow-ups included.
    pub published: Vec<RealtimeMessage>,
}

/// Result of a step or phase move.
#[derive(Debug, Serialize, ToSchema)]
pub struct IndexChangeResponse {
    pub from: u32,
    pub to: u32,
    pub published: Vec<RealtimeMessage>,
}

/// Result of a timer command.
#[derive(Debug, Serialize, ToSchema)]
pub struct TimerResponse {
    pub timer: TimerView,
    pub published: Vec<RealtimeMessage>,
}

/// Result of a facilitator artifact override.
#[derive(Debug, Serialize, ToSchema)]
pub struct ArtifactActionResponse {
    pub action: ArtifactAction,
    /// `false` when the artifact already sat at or past the target state.
    pub changed: bool,
    pub artifact: ArtifactView,
    pub published: Vec<RealtimeMessage>,
}

/// Time-bank ledger row.
#[derive(Debug, Serialize, ToSchema, Clone)]
pub struct TimeBankEntryView {
    pub id: Uuid,
    pub position: u64,
    pub delta_seconds: i64,
    pub reason: String,
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    pub event_id: Option<String>,
    pub actor_kind: ActorKind,
    pub actor_id: Option<Uuid>,
    pub balance_after: i64,
    pub recorded_at: String,
}

impl From<&TimeBankEntryEntity> for TimeBankEntryView {
    fn from(entry: &TimeBankEntryEntity) -> Self {
        Self {
            id: entry.id,
            position: entry.position,
            delta_seconds: entry.delta_seconds,
            reason: entry.reason.clone(),
            metadata: entry.metadata.clone(),
            event_id: entry.event_id.clone(),
            actor_kind: entry.actor.kind,
            actor_id: entry.actor.id,
            balance_after: entry.balance_after,
            recorded_at: format_timestamp(entry.recorded_at),
        }
    }
}

/// Result of a time-bank apply.
#[derive(Debug, Serialize, ToSchema)]
pub struct TimeBankApplyResponse {
    pub entry: TimeBankEntryView,
    /// `true` when `event_id` had been applied before and nothing was appended.
    pub replayed: bool,
    pub balance: i64,
    pub published: Vec<RealtimeMessage>,
}

/// The session's time-bank ledger.
#[derive(Debug, Serialize, ToSchema)]
pub struct TimeBankLedgerView {
    pub balance: i64,
    pub entries: Vec<TimeBankEntryView>,
}

/// Audit row of a committed event.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionEventView {
    pub id: Uuid,
    pub seq: u64,
    pub degraded: bool,
    pub event_type: String,
    pub actor_kind: ActorKind,
    pub actor_id: Option<Uuid>,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    pub created_at: String,
}

impl From<SessionEventEntity> for SessionEventView {
    fn from(event: SessionEventEntity) -> Self {
        Self {
            id: event.id,
            seq: event.seq,
            degraded: event.degraded,
            event_type: event.event_type,
            actor_kind: event.actor.kind,
            actor_id: event.actor.id,
            payload: event.payload,
            created_at: format_timestamp(event.created_at),
        }
    }
}
