//! Trigger rules: a typed condition plus an ordered list of typed actions.
//!
//! Conditions and actions are closed sets. Payloads with an unknown `type` tag fail to
//! deserialise, so they are rejected when a definition is imported and never reach evaluation.

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::models::{MAX_CURRENCY_AMOUNT, MAX_TIME_BANK_DELTA_SECONDS, TriggerEntity},
    error::ServiceError,
    state::{
        artifact::ArtifactState, events::PlayEvent, session::LiveSession,
        session_machine::SessionStatus,
        timer::{MAX_TIMER_SECONDS, TimerDirection},
    },
};

/// Longest accepted trigger name.
pub const MAX_TRIGGER_NAME_LEN: usize = 50;

/// Predicate over committed events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Only fires when the facilitator fires it by hand.
    Manual,
    /// The session entered `active` from the lobby or draft.
    SessionStarted,
    /// The step index moved onto or past `step`.
    StepReached {
        /// Target step index.
        step: u32,
    },
    /// The phase index moved onto or past `phase`.
    PhaseReached {
        /// Target phase index.
        phase: u32,
    },
    /// An artifact entered `state`.
    ArtifactStateIs {
        /// Artifact key.
        artifact: String,
        /// Target state.
        state: ArtifactState,
    },
    /// A keypad accepted its code.
    KeypadCorrect {
        /// Artifact key.
        artifact: String,
    },
    /// A keypad rejected a code.
    KeypadFailed {
        /// Artifact key.
        artifact: String,
    },
    /// The session countdown reached zero.
    TimerEnded,
    /// The time bank dropped to its minimum.
    TimeBankExpired,
    /// The number of seated participants reached `count`.
    ParticipantCountReached {
        /// Seat count to reach.
        count: u32,
    },
}

impl TriggerCondition {
    /// Pure predicate over the event and the current session snapshot.
    pub fn matches(&self, event: &PlayEvent, session: &LiveSession) -> bool {
        match (self, event) {
            (TriggerCondition::Manual, _) => false,
            (
                TriggerCondition::SessionStarted,
                PlayEvent::SessionStatusChanged {
                    from: SessionStatus::Draft | SessionStatus::Lobby,
                    to: SessionStatus::Active,
                    ..
                },
            ) => true,
            (TriggerCondition::StepReached { step }, PlayEvent::StepChanged { from, to }) => {
                from < step && to >= step
            }
            (TriggerCondition::PhaseReached { phase }, PlayEvent::PhaseChanged { from, to }) => {
                from < phase && to >= phase
            }
            (
                TriggerCondition::ArtifactStateIs { artifact, state },
                PlayEvent::ArtifactChanged {
                    artifact: changed,
                    to,
                    ..
                },
            ) => {
                artifact == changed
                    && to == state
                    && session
                        .artifacts
                        .get(artifact)
                        .is_some_and(|current| current.state == *state)
            }
            (
                TriggerCondition::KeypadCorrect { artifact },
                PlayEvent::KeypadCorrect {
                    artifact: changed, ..
                },
            ) => artifact == changed,
            (
                TriggerCondition::KeypadFailed { artifact },
                PlayEvent::KeypadFailed {
                    artifact: changed, ..
                },
            ) => artifact == changed,
            (TriggerCondition::TimerEnded, PlayEvent::TimerEnded) => true,
            (TriggerCondition::TimeBankExpired, PlayEvent::TimeBankExpired { .. }) => true,
            (
                TriggerCondition::ParticipantCountReached { count },
                PlayEvent::ParticipantJoined { seated, .. },
            ) => seated == count,
            _ => false,
        }
    }

    fn artifact_ref(&self) -> Option<&str> {
        match self {
            TriggerCondition::ArtifactStateIs { artifact, .. }
            | TriggerCondition::KeypadCorrect { artifact }
            | TriggerCondition::KeypadFailed { artifact } => Some(artifact),
            _ => None,
        }
    }
}

fn default_time_bank_reason() -> String {
    "trigger".into()
}

/// Mutation a trigger performs through the owning subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerAction {
    /// Reveal an artifact.
    RevealArtifact {
        /// Artifact key.
        artifact: String,
    },
    /// Reset an artifact back to hidden.
    HideArtifact {
        /// Artifact key.
        artifact: String,
    },
    /// Unlock a revealed artifact.
    UnlockArtifact {
        /// Artifact key.
        artifact: String,
    },
    /// Solve an unlocked artifact.
    SolveArtifact {
        /// Artifact key.
        artifact: String,
    },
    /// Move to the next step.
    AdvanceStep,
    /// Move to the next phase.
    AdvancePhase,
    /// Start the session timer.
    StartTimer {
        /// Initial value in seconds.
        duration_seconds: i64,
        /// Counting direction.
        #[serde(default)]
        direction: TimerDirection,
    },
    /// Pause the session timer.
    PauseTimer,
    /// Shift the session timer.
    AdjustTimer {
        /// Seconds added (or removed when negative).
        delta_seconds: i64,
    },
    /// Append a time-bank entry.
    AdjustTimeBank {
        /// Signed delta in seconds.
        delta_seconds: i64,
        /// Reason code recorded on the entry.
        #[serde(default = "default_time_bank_reason")]
        reason: String,
    },
    /// Grant virtual currency.
    GrantCurrency {
        /// Amount granted.
        amount: i64,
        /// Recipient; the session host when absent.
        #[serde(default)]
        user_id: Option<Uuid>,
        /// Reason code recorded on the ledger row.
        reason_code: String,
    },
    /// Broadcast a message to participants.
    SendMessage {
        /// Message text.
        text: String,
    },
}

impl TriggerAction {
    fn artifact_ref(&self) -> Option<&str> {
        match self {
            TriggerAction::RevealArtifact { artifact }
            | TriggerAction::HideArtifact { artifact }
            | TriggerAction::UnlockArtifact { artifact }
            | TriggerAction::SolveArtifact { artifact } => Some(artifact),
            _ => None,
        }
    }
}

/// Authored trigger as imported with the session definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TriggerDefinition {
    /// Display name.
    pub name: String,
    /// When the trigger fires.
    pub condition: TriggerCondition,
    /// What the trigger does, in order.
    pub actions: Vec<TriggerAction>,
    /// Fire at most once per session.
    #[serde(default)]
    pub execute_once: bool,
    /// Delay between the condition matching and the actions applying.
    #[serde(default)]
    pub delay_seconds: u32,
    /// Whether the trigger starts armed.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Lifecycle of a trigger inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// Evaluated on every event.
    Armed,
    /// Fired at least once.
    Fired,
    /// Skipped during evaluation.
    Disabled,
}

impl fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerStatus::Armed => "armed",
            TriggerStatus::Fired => "fired",
            TriggerStatus::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

/// An `execute_once` trigger that already fired.
pub fn is_exhausted(trigger: &TriggerEntity) -> bool {
    trigger.execute_once && trigger.fired_count >= 1
}

/// Enabled and not exhausted.
pub fn is_eligible(trigger: &TriggerEntity) -> bool {
    trigger.status != TriggerStatus::Disabled && !is_exhausted(trigger)
}

/// Ids of eligible triggers whose condition holds for `event`, in authoring order.
pub fn evaluate(session: &LiveSession, event: &PlayEvent) -> Vec<Uuid> {
    session
        .triggers
        .values()
        .filter(|trigger| is_eligible(trigger))
        .filter(|trigger| trigger.condition.matches(event, session))
        .map(|trigger| trigger.id)
        .collect()
}

/// Status after a successful firing.
pub fn status_after_fire(trigger: &TriggerEntity) -> TriggerStatus {
    if trigger.status == TriggerStatus::Disabled {
        TriggerStatus::Disabled
    } else {
        TriggerStatus::Fired
    }
}

/// Status after re-arming; the fire count is preserved.
pub fn status_after_arm(trigger: &TriggerEntity) -> TriggerStatus {
    if is_exhausted(trigger) {
        TriggerStatus::Fired
    } else {
        TriggerStatus::Armed
    }
}

/// Validate an imported definition against the artifact keys it may reference.
///
/// Returns advisory warnings on success.
pub fn validate_definition(
    definition: &TriggerDefinition,
    artifact_keys: &HashSet<&str>,
) -> Result<Vec<String>, ServiceError> {
    let name = definition.name.trim();
    if name.is_empty() {
        return Err(ServiceError::Validation("trigger name is required".into()));
    }
    if name.chars().count() > MAX_TRIGGER_NAME_LEN {
        return Err(ServiceError::Validation(format!(
            "trigger name `{name}` exceeds {MAX_TRIGGER_NAME_LEN} characters"
        )));
    }
    if definition.actions.is_empty() {
        return Err(ServiceError::Validation(format!(
            "trigger `{name}` has no actions"
        )));
    }

    let references = definition
        .condition
        .artifact_ref()
        .into_iter()
        .chain(definition.actions.iter().filter_map(TriggerAction::artifact_ref));
    for artifact in references {
        if !artifact_keys.contains(artifact) {
            return Err(ServiceError::Validation(format!(
                "trigger `{name}` references unknown artifact `{artifact}`"
            )));
        }
    }

    for action in &definition.actions {
        match action {
            TriggerAction::SendMessage { text } if text.trim().is_empty() => {
                return Err(ServiceError::Validation(format!(
                    "trigger `{name}` sends an empty message"
                )));
            }
            TriggerAction::StartTimer {
                duration_seconds, ..
            } if *duration_seconds <= 0 => {
                return Err(ServiceError::Validation(format!(
                    "trigger `{name}` starts a timer with a non-positive duration"
                )));
            }
            TriggerAction::StartTimer {
                duration_seconds, ..
            } if *duration_seconds > MAX_TIMER_SECONDS => {
                return Err(ServiceError::Validation(format!(
                    "trigger `{name}` starts a timer longer than {MAX_TIMER_SECONDS} seconds"
                )));
            }
            TriggerAction::AdjustTimer { delta_seconds }
                if !(-MAX_TIMER_SECONDS..=MAX_TIMER_SECONDS).contains(delta_seconds) =>
            {
                return Err(ServiceError::Validation(format!(
                    "trigger `{name}` adjusts the timer by more than {MAX_TIMER_SECONDS} seconds"
                )));
            }
            TriggerAction::AdjustTimeBank { delta_seconds, .. }
                if !(-MAX_TIME_BANK_DELTA_SECONDS..=MAX_TIME_BANK_DELTA_SECONDS)
                    .contains(delta_seconds) =>
            {
                return Err(ServiceError::Validation(format!(
                    "trigger `{name}` moves the time bank by more than {MAX_TIME_BANK_DELTA_SECONDS} seconds"
                )));
            }
            TriggerAction::GrantCurrency { amount, .. } if *amount <= 0 => {
                return Err(ServiceError::Validation(format!(
                    "trigger `{name}` grants a non-positive amount"
                )));
            }
            TriggerAction::GrantCurrency { amount, .. } if *amount > MAX_CURRENCY_AMOUNT => {
                return Err(ServiceError::Validation(format!(
                    "trigger `{name}` grants more than {MAX_CURRENCY_AMOUNT}"
                )));
            }
            _ => {}
        }
    }

    let mut warnings = Vec::new();
    let advances_step = definition
        .actions
        .iter()
        .any(|action| matches!(action, TriggerAction::AdvanceStep));
    if matches!(definition.condition, TriggerCondition::StepReached { .. })
        && advances_step
        && !definition.execute_once
    {
        let warning = format!(
            "trigger `{name}` advances the step on step_reached without execute_once and may cascade"
        );
        warn!(trigger = name, "{warning}");
        warnings.push(warning);
    }

    Ok(warnings)
}
