use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::{dao::models::ParticipantEntity, error::ServiceError};

/// Membership status of a participant inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    /// Connected and heartbeating.
    Active,
    /// Heartbeat went silent; recovers on the next heartbeat.
    Disconnected,
    /// Removed by the facilitator. Absorbing.
    Kicked,
    /// Banned by the facilitator. Absorbing until unblocked into `left`.
    Blocked,
    /// Left the session; the token is no longer accepted.
    Left,
}

impl ParticipantStatus {
    /// Lower-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantStatus::Active => "active",
            ParticipantStatus::Disconnected => "disconnected",
            ParticipantStatus::Kicked => "kicked",
            ParticipantStatus::Blocked => "blocked",
            ParticipantStatus::Left => "left",
        }
    }

    /// Statuses whose bearer token is refused.
    pub fn is_rejected(self) -> bool {
        matches!(
            self,
            ParticipantStatus::Kicked | ParticipantStatus::Blocked | ParticipantStatus::Left
        )
    }

    /// Statuses that occupy a seat against the participant cap.
    pub fn holds_seat(self) -> bool {
        matches!(
            self,
            ParticipantStatus::Active | ParticipantStatus::Disconnected
        )
    }
}

impl fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facilitator moderation verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    /// Remove the participant from the session.
    Kick,
    /// Ban the participant.
    Block,
    /// Lift a ban. The participant ends up `left` and must rejoin.
    Unblock,
}

/// Errors raised by participant transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParticipantError {
    /// Bearer token is past its expiry.
    #[error("participant token expired")]
    TokenExpired,
    /// Participant is in a status whose token is refused.
    #[error("participant is {status}")]
    Rejected {
        /// Current status.
        status: ParticipantStatus,
    },
    /// Moderation verb does not apply to the current status.
    #[error("cannot {action:?} a participant who is {status}")]
    InvalidModeration {
        /// Current status.
        status: ParticipantStatus,
        /// Requested verb.
        action: ModerationAction,
    },
}

impl From<ParticipantError> for ServiceError {
    fn from(err: ParticipantError) -> Self {
        match err {
            ParticipantError::TokenExpired => ServiceError::Unauthorized(err.to_string()),
            ParticipantError::Rejected { .. } => ServiceError::Forbidden(err.to_string()),
            ParticipantError::InvalidModeration { status, .. } => {
                ServiceError::invalid_transition(err.to_string(), status)
            }
        }
    }
}

/// A status change produced by a participant transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// Status before the transition.
    pub from: ParticipantStatus,
    /// Status after the transition.
    pub to: ParticipantStatus,
}

/// Token-expiry and rejected-status check run on every authenticated call.
pub fn authorize(participant: &ParticipantEntity, now: OffsetDateTime) -> Result<(), ParticipantError> {
    if participant
        .token_expires_at
        .is_some_and(|expires_at| expires_at <= now)
    {
        return Err(ParticipantError::TokenExpired);
    }
    if participant.status.is_rejected() {
        return Err(ParticipantError::Rejected {
            status: participant.status,
        });
    }
    Ok(())
}

/// Refresh presence, reviving a disconnected participant.
pub fn heartbeat(
    participant: &mut ParticipantEntity,
    now: OffsetDateTime,
) -> Result<Option<StatusChange>, ParticipantError> {
    authorize(participant, now)?;
    participant.last_seen_at = now;
    if participant.status == ParticipantStatus::Disconnected {
        participant.status = ParticipantStatus::Active;
        return Ok(Some(StatusChange {
            from: ParticipantStatus::Disconnected,
            to: ParticipantStatus::Active,
        }));
    }
    Ok(None)
}

/// Participant-initiated exit.
pub fn leave(
    participant: &mut ParticipantEntity,
    now: OffsetDateTime,
) -> Result<StatusChange, ParticipantError> {
    authorize(participant, now)?;
    let from = participant.status;
    participant.status = ParticipantStatus::Left;
    participant.last_seen_at = now;
    Ok(StatusChange {
        from,
        to: ParticipantStatus::Left,
    })
}

/// Apply a facilitator moderation verb.
pub fn moderate(
    participant: &mut ParticipantEntity,
    action: ModerationAction,
) -> Result<StatusChange, ParticipantError> {
    use ParticipantStatus as P;

    let from = participant.status;
    let to = match (from, action) {
        (P::Active | P::Disconnected, ModerationAction::Kick) => P::Kicked,
        (P::Active | P::Disconnected | P::Kicked | P::Left, ModerationAction::Block) => P::Blocked,
        (P::Blocked, ModerationAction::Unblock) => P::Left,
        (status, action) => return Err(ParticipantError::InvalidModeration { status, action }),
    };
    participant.status = to;
    Ok(StatusChange { from, to })
}

/// Whether an active participant has been silent for at least `stale_after`.
pub fn is_stale(participant: &ParticipantEntity, now: OffsetDateTime, stale_after: Duration) -> bool {
    let silence = now - participant.last_seen_at;
    participant.status == ParticipantStatus::Active
        && silence.whole_milliseconds() >= stale_after.as_millis() as i128
}

/// Mark an active participant disconnected once their heartbeat is stale.
pub fn mark_if_stale(
    participant: &mut ParticipantEntity,
    now: OffsetDateTime,
    stale_after: Duration,
) -> Option<StatusChange> {
    if !is_stale(participant, now, stale_after) {
        return None;
    }
    participant.status = ParticipantStatus::Disconnected;
    Some(StatusChange {
        from: ParticipantStatus::Active,
        to: ParticipantStatus::Disconnected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration as TimeDuration;
    use uuid::Uuid;

    fn participant(status: ParticipantStatus) -> ParticipantEntity {
        let now = OffsetDateTime::now_utc();
        ParticipantEntity {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            display_name: "Ada".into(),
            role: None,
            status,
            token: "token".into(),
            token_expires_at: Some(now + TimeDuration::hours(1)),
            joined_at: now,
            last_seen_at: now,
            progress: serde_json::json!({}),
        }
    }

    #[test]
    fn heartbeat_revives_disconnected() {
        let mut p = participant(ParticipantStatus::Disconnected);
        let change = heartbeat(&mut p, OffsetDateTime::now_utc()).unwrap();
        assert_eq!(
            change,
            Some(StatusChange {
                from: ParticipantStatus::Disconnected,
                to: ParticipantStatus::Active
            })
        );
    }

    #[test]
    fn absorbing_statuses_never_return_to_active() {
        for status in [ParticipantStatus::Kicked, ParticipantStatus::Blocked] {
            let mut p = participant(status);
            let err = heartbeat(&mut p, OffsetDateTime::now_utc()).unwrap_err();
            assert_eq!(err, ParticipantError::Rejected { status });
            assert!(leave(&mut p, OffsetDateTime::now_utc()).is_err());
            assert!(moderate(&mut p, ModerationAction::Kick).is_err());
            assert_eq!(p.status, status);
        }
    }

    #[test]
    fn expired_token_is_refused_and_status_kept() {
        let mut p = participant(ParticipantStatus::Active);
        let before = p.last_seen_at;
        let later = before + TimeDuration::hours(2);
        assert_eq!(
            heartbeat(&mut p, later).unwrap_err(),
            ParticipantError::TokenExpired
        );
        assert_eq!(p.status, ParticipantStatus::Active);
        assert_eq!(p.last_seen_at, before);
    }

    #[test]
    fn token_without_expiry_is_accepted() {
        let mut p = participant(ParticipantStatus::Active);
        p.token_expires_at = None;
        let far = OffsetDateTime::now_utc() + TimeDuration::days(365);
        assert!(heartbeat(&mut p, far).is_ok());
    }

    #[test]
    fn unblock_moves_to_left_not_active() {
        let mut p = participant(ParticipantStatus::Blocked);
        let change = moderate(&mut p, ModerationAction::Unblock).unwrap();
        assert_eq!(change.to, ParticipantStatus::Left);
        assert!(heartbeat(&mut p, OffsetDateTime::now_utc()).is_err());
    }

    #[test]
    fn kicking_a_blocked_participant_is_rejected() {
        let mut p = participant(ParticipantStatus::Blocked);
        let err = moderate(&mut p, ModerationAction::Kick).unwrap_err();
        assert!(matches!(err, ParticipantError::InvalidModeration { .. }));
        assert_eq!(p.status, ParticipantStatus::Blocked);
    }

    #[test]
    fn stale_participants_are_marked_disconnected() {
        let mut p = participant(ParticipantStatus::Active);
        let now = p.last_seen_at + TimeDuration::seconds(90);
        assert!(mark_if_stale(&mut p, now, Duration::from_secs(120)).is_none());
        let change = mark_if_stale(&mut p, now, Duration::from_secs(60)).unwrap();
        assert_eq!(change.to, ParticipantStatus::Disconnected);
        assert!(mark_if_stale(&mut p, now, Duration::from_secs(60)).is_none());
    }
}
