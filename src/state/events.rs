use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::state::{
    artifact::ArtifactState, participant::ParticipantStatus, session_machine::SessionStatus,
    timer::TimerState, trigger::TriggerStatus,
};

/// Kind of principal behind a committed event or ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    /// The runtime itself (timers, sweeps).
    System,
    /// The session facilitator.
    Host,
    /// A joined participant.
    Participant,
    /// A trigger action.
    Trigger,
}

/// Principal behind a committed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Actor {
    /// Principal kind.
    pub kind: ActorKind,
    /// User, participant or trigger id when known.
    pub id: Option<Uuid>,
}

impl Actor {
    /// The runtime acting on its own.
    pub fn system() -> Self {
        Self {
            kind: ActorKind::System,
            id: None,
        }
    }

    /// The facilitator with the given platform user id.
    pub fn host(user_id: Uuid) -> Self {
        Self {
            kind: ActorKind::Host,
            id: Some(user_id),
        }
    }

    /// A participant.
    pub fn participant(participant_id: Uuid) -> Self {
        Self {
            kind: ActorKind::Participant,
            id: Some(participant_id),
        }
    }

    /// A trigger firing.
    pub fn trigger(trigger_id: Uuid) -> Self {
        Self {
            kind: ActorKind::Trigger,
            id: Some(trigger_id),
        }
    }
}

/// Committed session or gameplay event. Serialises as `{ "type": ..., "payload": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PlayEvent {
    /// Session lifecycle moved.
    SessionStatusChanged {
        /// Previous status.
        from: SessionStatus,
        /// New status.
        to: SessionStatus,
        /// End timestamp once the session has ended.
        #[serde(with = "time::serde::rfc3339::option")]
        ended_at: Option<OffsetDateTime>,
    },
    /// Current step index moved.
    StepChanged {
        /// Previous index.
        from: u32,
        /// New index.
        to: u32,
    },
    /// Current phase index moved.
    PhaseChanged {
        /// Previous index.
        from: u32,
        /// New index.
        to: u32,
    },
    /// A participant joined.
    ParticipantJoined {
        /// New participant.
        participant_id: Uuid,
        /// Display name.
        display_name: String,
        /// Assigned role.
        role: Option<String>,
        /// Participants now holding a seat.
        seated: u32,
    },
    /// A participant's membership status moved.
    ParticipantStatusChanged {
        /// Participant.
        participant_id: Uuid,
        /// Previous status.
        from: ParticipantStatus,
        /// New status.
        to: ParticipantStatus,
    },
    /// A participant toggled their ready flag.
    ParticipantReady {
        /// Participant.
        participant_id: Uuid,
        /// New flag.
        ready: bool,
    },
    /// An artifact changed state.
    ArtifactChanged {
        /// Artifact key.
        artifact: String,
        /// Previous state.
        from: ArtifactState,
        /// New state.
        to: ArtifactState,
        /// Artifact version after the change.
        version: u64,
    },
    /// A keypad accepted its code.
    KeypadCorrect {
        /// Artifact key.
        artifact: String,
        /// Participant who entered the code.
        participant_id: Option<Uuid>,
    },
    /// A keypad rejected a code.
    KeypadFailed {
        /// Artifact key.
        artifact: String,
        /// Wrong submissions so far.
        attempts: u32,
        /// Whether the artifact failed as a result.
        exhausted: bool,
    },
    /// Timer state changed.
    TimerChanged {
        /// New timer state; clients render locally from the anchor.
        timer: TimerState,
    },
    /// A running countdown reached zero.
    TimerEnded,
    /// A time-bank entry was appended.
    TimeBankChanged {
        /// Applied delta.
        delta_seconds: i64,
        /// Balance after the entry.
        balance: i64,
        /// Reason code.
        reason: String,
    },
    /// The time bank dropped to its minimum.
    TimeBankExpired {
        /// Balance after the entry that exhausted it.
        balance: i64,
    },
    /// A trigger fired.
    TriggerFired {
        /// Trigger.
        trigger_id: Uuid,
        /// Trigger name.
        name: String,
        /// Fire count after this firing.
        fired_count: u32,
    },
    /// A trigger was armed or disabled.
    TriggerStatusChanged {
        /// Trigger.
        trigger_id: Uuid,
        /// New status.
        status: TriggerStatus,
    },
    /// Currency was granted by a trigger.
    CurrencyGranted {
        /// Recipient platform user.
        user_id: Uuid,
        /// Amount granted.
        amount: i64,
        /// Recipient balance after the grant.
        balance: i64,
    },
    /// Free-form message shown to every participant.
    Message {
        /// Message text.
        text: String,
    },
}

impl PlayEvent {
    /// Wire name used as the realtime message `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            PlayEvent::SessionStatusChanged { .. } => "session_status_changed",
            PlayEvent::StepChanged { .. } => "step_changed",
            PlayEvent::PhaseChanged { .. } => "phase_changed",
            PlayEvent::ParticipantJoined { .. } => "participant_joined",
            PlayEvent::ParticipantStatusChanged { .. } => "participant_status_changed",
            PlayEvent::ParticipantReady { .. } => "participant_ready",
            PlayEvent::ArtifactChanged { .. } => "artifact_changed",
            PlayEvent::KeypadCorrect { .. } => "keypad_correct",
            PlayEvent::KeypadFailed { .. } => "keypad_failed",
            PlayEvent::TimerChanged { .. } => "timer_changed",
            PlayEvent::TimerEnded => "timer_ended",
            PlayEvent::TimeBankChanged { .. } => "time_bank_changed",
            PlayEvent::TimeBankExpired { .. } => "time_bank_expired",
            PlayEvent::TriggerFired { .. } => "trigger_fired",
            PlayEvent::TriggerStatusChanged { .. } => "trigger_status_changed",
            PlayEvent::CurrencyGranted { .. } => "currency_granted",
            PlayEvent::Message { .. } => "message",
        }
    }

    /// Payload half of the serialised event.
    pub fn payload(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("payload").unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_strips_the_type_tag() {
        let event = PlayEvent::StepChanged { from: 2, to: 3 };
        assert_eq!(event.kind(), "step_changed");
        assert_eq!(event.payload(), serde_json::json!({"from": 2, "to": 3}));
    }

    #[test]
    fn unit_events_have_null_payload() {
        assert_eq!(PlayEvent::TimerEnded.payload(), serde_json::Value::Null);
    }

    #[test]
    fn wire_name_matches_serde_tag() {
        let event = PlayEvent::ArtifactChanged {
            artifact: "vault".into(),
            from: ArtifactState::Hidden,
            to: ArtifactState::Revealed,
            version: 1,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.kind());
    }
}
