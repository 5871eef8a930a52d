use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::{session::TimerView, validation::validate_join_code},
    services::realtime_service::RealtimeCapability,
    state::{
        RealtimeMessage, artifact::ArtifactState, participant::ParticipantStatus,
        session_machine::SessionStatus,
    },
};

/// Join a session by code.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct JoinRequest {
    #[validate(custom(function = validate_join_code))]
    pub join_code: String,
    #[validate(length(min = 1, max = 50))]
    pub display_name: String,
    #[validate(length(min = 1, max = 50))]
    pub role: Option<String>,
    /// Token of an earlier membership; a disconnected participant resumes it when the
    /// session allows rejoining.
    pub previous_token: Option<String>,
}

/// Credentials handed to a joined participant.
#[derive(Debug, Serialize, ToSchema)]
pub struct JoinResponse {
    pub participant_id: Uuid,
    pub session_id: Uuid,
    pub token: String,
    pub token_expires_at: Option<String>,
    pub status: ParticipantStatus,
    /// `true` when an existing membership was resumed.
    pub rejoined: bool,
    pub session_status: SessionStatus,
    pub realtime: RealtimeCapability,
}

/// Presence refresh result.
#[derive(Debug, Serialize, ToSchema)]
pub struct HeartbeatResponse {
    pub status: ParticipantStatus,
    pub session_status: SessionStatus,
    pub realtime: RealtimeCapability,
}

/// Ready toggle.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ReadyRequest {
    pub ready: bool,
}

/// Result of a participant command.
#[derive(Debug, Serialize, ToSchema)]
pub struct ParticipantCommandResponse {
    pub status: ParticipantStatus,
    pub ready: bool,
    pub published: Vec<RealtimeMessage>,
}

/// Code typed into a keypad artifact.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct KeypadRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
}

/// Keypad verdict.
#[derive(Debug, Serialize, ToSchema)]
pub struct KeypadResponse {
    pub correct: bool,
    pub attempts: u32,
    /// Submissions left before the artifact fails, when limited.
    pub remaining: Option<u32>,
    pub state: ArtifactState,
}

/// Variant content a participant may see.
#[derive(Debug, Serialize, ToSchema, Clone)]
pub struct VariantView {
    pub key: String,
    pub title: Option<String>,
    pub body: String,
}

/// Artifact as seen by a participant.
#[derive(Debug, Serialize, ToSchema, Clone)]
pub struct ParticipantArtifactView {
    pub key: String,
    pub title: String,
    pub state: ArtifactState,
    pub version: u64,
    pub has_keypad: bool,
    pub variants: Vec<VariantView>,
}

/// Participant-scoped snapshot of the session.
#[derive(Debug, Serialize, ToSchema)]
pub struct ParticipantStateView {
    pub participant_id: Uuid,
    pub display_name: String,
    pub role: Option<String>,
    pub status: ParticipantStatus,
    pub ready: bool,
    pub session_id: Uuid,
    pub session_name: String,
    pub session_status: SessionStatus,
    pub step_index: u32,
    pub phase_index: u32,
    pub timer: TimerView,
    pub time_bank_balance: Option<i64>,
    /// Artifacts past `hidden`, with variants filtered by the participant's role.
    pub artifacts: Vec<ParticipantArtifactView>,
    pub last_seq: u64,
    pub realtime: RealtimeCapability,
}
