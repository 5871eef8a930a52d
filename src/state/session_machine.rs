use std::{fmt, time::Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle status of a play session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Authored but not yet opened to participants.
    Draft,
    /// Accepting joins, gameplay not started.
    Lobby,
    /// Gameplay running.
    Active,
    /// Gameplay frozen by the facilitator.
    Paused,
    /// Participant actions blocked; the realtime channel stays open.
    Locked,
    /// Terminal after gameplay.
    Ended,
    /// Terminal without gameplay having finished.
    Cancelled,
    /// Terminal and hidden; restorable to its prior terminal status.
    Archived,
}

impl SessionStatus {
    /// Lower-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Draft => "draft",
            SessionStatus::Lobby => "lobby",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Locked => "locked",
            SessionStatus::Ended => "ended",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Archived => "archived",
        }
    }

    /// Statuses during which a realtime channel may exist.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionStatus::Lobby
                | SessionStatus::Active
                | SessionStatus::Paused
                | SessionStatus::Locked
        )
    }

    /// Statuses after which no gameplay command is accepted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Ended | SessionStatus::Cancelled | SessionStatus::Archived
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that can be applied to the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Open a draft session to joins.
    Open,
    /// Begin gameplay.
    Start,
    /// Freeze gameplay.
    Pause,
    /// Continue after a pause.
    Resume,
    /// Block participant actions.
    Lock,
    /// Lift a lock, returning to the status held before it.
    Unlock,
    /// Finish the session.
    End,
    /// Abandon a session that never ran.
    Cancel,
    /// Hide a terminal session.
    Archive,
    /// Bring an archived session back; `ended` tells whether it had ended.
    Restore {
        /// Whether `ended_at` was recorded before archiving.
        ended: bool,
    },
}

impl SessionEvent {
    /// Status the event always settles in, when it has a fixed target.
    fn settles_in(self) -> Option<SessionStatus> {
        match self {
            SessionEvent::Open => Some(SessionStatus::Lobby),
            SessionEvent::Start | SessionEvent::Resume => Some(SessionStatus::Active),
            SessionEvent::Pause => Some(SessionStatus::Paused),
            SessionEvent::Lock => Some(SessionStatus::Locked),
            SessionEvent::End => Some(SessionStatus::Ended),
            SessionEvent::Cancel => Some(SessionStatus::Cancelled),
            SessionEvent::Archive => Some(SessionStatus::Archived),
            SessionEvent::Unlock | SessionEvent::Restore { .. } => None,
        }
    }
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{event:?} cannot be applied while the session is {from}")]
pub struct InvalidTransition {
    /// Status the machine was in when the event was received.
    pub from: SessionStatus,
    /// The event that cannot be applied from this status.
    pub event: SessionEvent,
}

impl InvalidTransition {
    /// The session already sits where the event would take it.
    pub fn is_redundant(&self) -> bool {
        self.event.settles_in() == Some(self.from)
    }
}

/// Errors that can occur when planning a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A transition is already pending and must be applied or aborted.
    AlreadyPending {
        /// Current status.
        current: SessionStatus,
    },
    /// The requested transition is not valid from the current status.
    InvalidTransition(InvalidTransition),
}

/// Errors that can occur when applying a planned transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// No transition is currently pending.
    NoPending {
        /// Current status.
        current: SessionStatus,
    },
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
        /// Current status.
        current: SessionStatus,
    },
    /// Status changed since the plan was created.
    StatusMismatch {
        /// Status when the plan was created.
        expected: SessionStatus,
        /// Current status.
        actual: SessionStatus,
    },
    /// Version changed since the plan was created.
    VersionMismatch {
        /// Version the plan expected to produce.
        expected: u64,
        /// Version the machine would produce.
        actual: u64,
        /// Current status.
        current: SessionStatus,
    },
}

/// Errors that can occur when aborting a planned transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortError {
    /// No transition is currently pending.
    NoPending {
        /// Current status.
        current: SessionStatus,
    },
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
        /// Current status.
        current: SessionStatus,
    },
}

/// Unique identifier for a planned transition.
pub type PlanId = Uuid;

/// A validated transition that has not been applied yet.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Unique identifier for this plan.
    pub id: PlanId,
    /// Status the machine is currently in.
    pub from: SessionStatus,
    /// Status the machine will transition to.
    pub to: SessionStatus,
    /// Event that produced this plan.
    pub event: SessionEvent,
    /// Status to return to on unlock once the plan is applied.
    pub locked_from_next: Option<SessionStatus>,
    /// Version number after applying this plan.
    pub version_next: u64,
    /// When the plan was created.
    pub pending_since: Instant,
}

/// Snapshot of the current state machine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Current status.
    pub status: SessionStatus,
    /// Status restored by the next unlock.
    pub locked_from: Option<SessionStatus>,
    /// Number of applied transitions.
    pub version: u64,
    /// Target of a planned but unapplied transition.
    pub pending: Option<SessionStatus>,
}

/// Two-phase session lifecycle: plan, persist, then apply or abort.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    status: SessionStatus,
    locked_from: Option<SessionStatus>,
    version: u64,
    pending: Option<Plan>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self {
            status: SessionStatus::Draft,
            locked_from: None,
            version: 0,
            pending: None,
        }
    }
}

impl SessionMachine {
    /// Create a machine in the draft status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a machine from persisted status.
    pub fn restore(status: SessionStatus, locked_from: Option<SessionStatus>) -> Self {
        Self {
            status,
            locked_from: locked_from.filter(|_| status == SessionStatus::Locked),
            version: 0,
            pending: None,
        }
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Status the next unlock returns to.
    pub fn locked_from(&self) -> Option<SessionStatus> {
        self.locked_from
    }

    /// Create a snapshot of the machine.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            status: self.status,
            locked_from: self.locked_from,
            version: self.version,
            pending: self.pending.as_ref().map(|plan| plan.to),
        }
    }

    /// Validate an event against the current status and record it as pending.
    pub fn plan(&mut self, event: SessionEvent) -> Result<Plan, PlanError> {
        if self.pending.is_some() {
            return Err(PlanError::AlreadyPending {
                current: self.status,
            });
        }

        let (to, locked_from_next) = self
            .compute_transition(event)
            .map_err(PlanError::InvalidTransition)?;

        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.status,
            to,
            event,
            locked_from_next,
            version_next: self.version + 1,
            pending_since: Instant::now(),
        };

        self.pending = Some(plan.clone());

        Ok(plan)
    }

    /// Apply a pending plan, returning the new status.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<SessionStatus, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending {
            current: self.status,
        })?;

        if plan.id != plan_id {
            let expected = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected,
                got: plan_id,
                current: self.status,
            });
        }

        if self.status != plan.from {
            return Err(ApplyError::StatusMismatch {
                expected: plan.from,
                actual: self.status,
            });
        }

        if self.version + 1 != plan.version_next {
            return Err(ApplyError::VersionMismatch {
                expected: plan.version_next,
                actual: self.version + 1,
                current: self.status,
            });
        }

        self.status = plan.to;
        self.locked_from = plan.locked_from_next;
        self.version = plan.version_next;

        Ok(self.status)
    }

    /// Drop a pending plan without applying it.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending {
            current: self.status,
        })?;

        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
                current: self.status,
            });
        }

        self.pending = None;
        Ok(())
    }

    fn compute_transition(
        &self,
        event: SessionEvent,
    ) -> Result<(SessionStatus, Option<SessionStatus>), InvalidTransition> {
        use SessionStatus as S;

        let next = match (self.status, event) {
            (S::Draft, SessionEvent::Open) => (S::Lobby, None),
            (S::Draft | S::Lobby, SessionEvent::Start) => (S::Active, None),
            (S::Active, SessionEvent::Pause) => (S::Paused, None),
            (S::Paused, SessionEvent::Resume) => (S::Active, None),
            (from @ (S::Active | S::Paused), SessionEvent::Lock) => (S::Locked, Some(from)),
            (S::Locked, SessionEvent::Unlock) => (self.locked_from.unwrap_or(S::Active), None),
            (S::Lobby | S::Active | S::Paused | S::Locked, SessionEvent::End) => (S::Ended, None),
            (S::Draft | S::Lobby, SessionEvent::Cancel) => (S::Cancelled, None),
            (S::Ended | S::Cancelled, SessionEvent::Archive) => (S::Archived, None),
            (S::Archived, SessionEvent::Restore { ended: true }) => (S::Ended, None),
            (S::Archived, SessionEvent::Restore { ended: false }) => (S::Cancelled, None),
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(sm: &mut SessionMachine, event: SessionEvent) -> SessionStatus {
        let plan = sm.plan(event).unwrap();
        sm.apply(plan.id).unwrap()
    }

    #[test]
    fn initial_state_is_draft() {
        let sm = SessionMachine::new();
        assert_eq!(sm.status(), SessionStatus::Draft);
    }

    #[test]
    fn full_lifecycle_through_archive_and_restore() {
        let mut sm = SessionMachine::new();

        assert_eq!(apply(&mut sm, SessionEvent::Open), SessionStatus::Lobby);
        assert_eq!(apply(&mut sm, SessionEvent::Start), SessionStatus::Active);
        assert_eq!(apply(&mut sm, SessionEvent::Pause), SessionStatus::Paused);
        assert_eq!(apply(&mut sm, SessionEvent::Resume), SessionStatus::Active);
        assert_eq!(apply(&mut sm, SessionEvent::End), SessionStatus::Ended);
        assert_eq!(apply(&mut sm, SessionEvent::Archive), SessionStatus::Archived);
        assert_eq!(
            apply(&mut sm, SessionEvent::Restore { ended: true }),
            SessionStatus::Ended
        );
        assert_eq!(sm.snapshot().version, 7);
    }

    #[test]
    fn unlock_returns_to_the_status_held_before_lock() {
        let mut sm = SessionMachine::restore(SessionStatus::Paused, None);
        assert_eq!(apply(&mut sm, SessionEvent::Lock), SessionStatus::Locked);
        assert_eq!(sm.locked_from(), Some(SessionStatus::Paused));
        assert_eq!(apply(&mut sm, SessionEvent::Unlock), SessionStatus::Paused);
        assert_eq!(sm.locked_from(), None);

        let mut sm = SessionMachine::restore(SessionStatus::Active, None);
        apply(&mut sm, SessionEvent::Lock);
        assert_eq!(apply(&mut sm, SessionEvent::Unlock), SessionStatus::Active);
    }

    #[test]
    fn restore_without_end_returns_to_cancelled() {
        let mut sm = SessionMachine::new();
        apply(&mut sm, SessionEvent::Cancel);
        apply(&mut sm, SessionEvent::Archive);
        assert_eq!(
            apply(&mut sm, SessionEvent::Restore { ended: false }),
            SessionStatus::Cancelled
        );
    }

    #[test]
    fn archive_only_from_terminal_states() {
        for status in [
            SessionStatus::Draft,
            SessionStatus::Lobby,
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Locked,
        ] {
            let mut sm = SessionMachine::restore(status, None);
            match sm.plan(SessionEvent::Archive).unwrap_err() {
                PlanError::InvalidTransition(invalid) => assert_eq!(invalid.from, status),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[test]
    fn archived_is_never_revived_without_restore() {
        let mut sm = SessionMachine::restore(SessionStatus::Archived, None);
        for event in [
            SessionEvent::Open,
            SessionEvent::Start,
            SessionEvent::Resume,
            SessionEvent::End,
        ] {
            assert!(sm.plan(event).is_err());
        }
    }

    #[test]
    fn repeated_event_is_flagged_redundant() {
        let mut sm = SessionMachine::restore(SessionStatus::Paused, None);
        match sm.plan(SessionEvent::Pause).unwrap_err() {
            PlanError::InvalidTransition(invalid) => assert!(invalid.is_redundant()),
            other => panic!("unexpected error: {other:?}"),
        }

        let mut sm = SessionMachine::new();
        match sm.plan(SessionEvent::Resume).unwrap_err() {
            PlanError::InvalidTransition(invalid) => assert!(!invalid.is_redundant()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn abort_clears_pending_and_keeps_status() {
        let mut sm = SessionMachine::new();
        let plan = sm.plan(SessionEvent::Open).unwrap();
        assert_eq!(sm.snapshot().pending, Some(SessionStatus::Lobby));
        sm.abort(plan.id).unwrap();
        assert!(sm.pending.is_none());
        assert_eq!(sm.status(), SessionStatus::Draft);

        let plan = sm.plan(SessionEvent::Open).unwrap();
        assert_eq!(sm.apply(plan.id).unwrap(), SessionStatus::Lobby);
    }

    #[test]
    fn second_plan_is_rejected_while_one_is_pending() {
        let mut sm = SessionMachine::new();
        let _plan = sm.plan(SessionEvent::Open).unwrap();
        assert_eq!(
            sm.plan(SessionEvent::Cancel).unwrap_err(),
            PlanError::AlreadyPending {
                current: SessionStatus::Draft
            }
        );
    }

    #[test]
    fn apply_with_foreign_plan_id_keeps_pending() {
        let mut sm = SessionMachine::new();
        let plan = sm.plan(SessionEvent::Open).unwrap();
        let err = sm.apply(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, ApplyError::IdMismatch { .. }));
        assert_eq!(sm.apply(plan.id).unwrap(), SessionStatus::Lobby);
    }
}
