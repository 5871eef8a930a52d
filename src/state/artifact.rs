use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::{dao::models::ArtifactEntity, error::ServiceError};

/// Reveal/unlock lifecycle of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    /// Not visible to participants. Initial state.
    #[default]
    Hidden,
    /// Visible to participants.
    Revealed,
    /// Opened (code entered, lock removed).
    Unlocked,
    /// Completed. Terminal until reset.
    Solved,
    /// Given up on. Terminal until reset.
    Failed,
}

impl ArtifactState {
    /// Lower-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactState::Hidden => "hidden",
            ArtifactState::Revealed => "revealed",
            ArtifactState::Unlocked => "unlocked",
            ArtifactState::Solved => "solved",
            ArtifactState::Failed => "failed",
        }
    }

    /// Whether this state meets a variant's visibility threshold.
    pub fn reaches(self, threshold: ArtifactState) -> bool {
        match threshold {
            ArtifactState::Hidden => true,
            ArtifactState::Revealed => self != ArtifactState::Hidden,
            ArtifactState::Unlocked => {
                matches!(self, ArtifactState::Unlocked | ArtifactState::Solved)
            }
            ArtifactState::Solved => self == ArtifactState::Solved,
            ArtifactState::Failed => self == ArtifactState::Failed,
        }
    }
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verbs that move an artifact through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactAction {
    /// hidden → revealed
    Reveal,
    /// revealed → unlocked
    Unlock,
    /// unlocked → solved
    Solve,
    /// revealed → failed
    Fail,
    /// any → hidden; the only backward edge.
    Reset,
}

/// Who can see a variant once its threshold is met.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VariantVisibility {
    /// Every participant.
    Public,
    /// Participants holding this role.
    Role {
        /// Role name as assigned at join.
        role: String,
    },
    /// Facilitator only.
    Facilitator,
}

/// Role- or visibility-scoped rendering of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ArtifactVariant {
    /// Stable key within the artifact.
    pub key: String,
    /// Optional heading.
    pub title: Option<String>,
    /// Content exposed once visible.
    pub body: String,
    /// Audience of this variant.
    pub visibility: VariantVisibility,
    /// Artifact state required before the variant is exposed.
    #[serde(default = "default_threshold")]
    pub min_state: ArtifactState,
}

fn default_threshold() -> ArtifactState {
    ArtifactState::Revealed
}

/// Code lock carried by keypad artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct KeypadConfig {
    /// Expected code, compared trimmed and case-insensitively.
    pub code: String,
    /// Wrong submissions allowed before the artifact fails.
    pub max_attempts: Option<u32>,
}

/// Who is reading an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewer<'a> {
    /// Session host; sees everything.
    Facilitator,
    /// A joined participant with an optional role.
    Participant {
        /// Role assigned at join.
        role: Option<&'a str>,
    },
}

/// Errors raised by artifact transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactTransitionError {
    /// The action has no edge from the current state.
    #[error("cannot {action:?} an artifact that is {from}")]
    Invalid {
        /// Current state.
        from: ArtifactState,
        /// Requested action.
        action: ArtifactAction,
    },
    /// A code was submitted to an artifact without a keypad.
    #[error("artifact `{key}` has no keypad")]
    NotKeypad {
        /// Artifact key.
        key: String,
    },
}

impl From<ArtifactTransitionError> for ServiceError {
    fn from(err: ArtifactTransitionError) -> Self {
        match &err {
            ArtifactTransitionError::Invalid { from, .. } => {
                ServiceError::invalid_transition(err.to_string(), from)
            }
            ArtifactTransitionError::NotKeypad { .. } => ServiceError::Validation(err.to_string()),
        }
    }
}

/// Result of applying an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactTransition {
    /// State moved.
    Changed {
        /// State before.
        from: ArtifactState,
        /// State after.
        to: ArtifactState,
    },
    /// The artifact already sits at or past the target.
    Unchanged(ArtifactState),
}

/// Compute the next state for `action` without mutating anything.
pub fn next_state(
    from: ArtifactState,
    action: ArtifactAction,
) -> Result<ArtifactTransition, ArtifactTransitionError> {
    use ArtifactState as S;

    let to = match (from, action) {
        (S::Hidden, ArtifactAction::Reset) => return Ok(ArtifactTransition::Unchanged(from)),
        (_, ArtifactAction::Reset) => S::Hidden,
        (S::Hidden, ArtifactAction::Reveal) => S::Revealed,
        (_, ArtifactAction::Reveal) => return Ok(ArtifactTransition::Unchanged(from)),
        (S::Revealed, ArtifactAction::Unlock) => S::Unlocked,
        (S::Unlocked | S::Solved, ArtifactAction::Unlock) => {
            return Ok(ArtifactTransition::Unchanged(from));
        }
        (S::Unlocked, ArtifactAction::Solve) => S::Solved,
        (S::Solved, ArtifactAction::Solve) => return Ok(ArtifactTransition::Unchanged(from)),
        (S::Revealed, ArtifactAction::Fail) => S::Failed,
        (S::Failed, ArtifactAction::Fail) => return Ok(ArtifactTransition::Unchanged(from)),
        (from, action) => return Err(ArtifactTransitionError::Invalid { from, action }),
    };

    Ok(ArtifactTransition::Changed { from, to })
}

/// Apply `action` to the artifact, bumping its version when the state moves.
pub fn apply(
    artifact: &mut ArtifactEntity,
    action: ArtifactAction,
) -> Result<ArtifactTransition, ArtifactTransitionError> {
    let transition = next_state(artifact.state, action)?;
    if let ArtifactTransition::Changed { to, .. } = transition {
        artifact.state = to;
        artifact.version += 1;
        if to == ArtifactState::Hidden {
            artifact.attempts = 0;
        }
    }
    Ok(transition)
}

/// Outcome of a keypad submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypadOutcome {
    /// Code matched; the artifact is now unlocked.
    Correct,
    /// Code did not match.
    Wrong {
        /// Wrong submissions so far.
        attempts: u32,
        /// Submissions left before the artifact fails, when limited.
        remaining: Option<u32>,
    },
    /// Code did not match and no attempts remain; the artifact failed.
    Exhausted {
        /// Wrong submissions so far.
        attempts: u32,
    },
}

/// Check a submitted code against a revealed keypad artifact.
pub fn submit_code(
    artifact: &mut ArtifactEntity,
    code: &str,
) -> Result<KeypadOutcome, ArtifactTransitionError> {
    let Some(keypad) = artifact.keypad.clone() else {
        return Err(ArtifactTransitionError::NotKeypad {
            key: artifact.key.clone(),
        });
    };
    if artifact.state != ArtifactState::Revealed {
        return Err(ArtifactTransitionError::Invalid {
            from: artifact.state,
            action: ArtifactAction::Unlock,
        });
    }

    if code.trim().eq_ignore_ascii_case(keypad.code.trim()) {
        apply(artifact, ArtifactAction::Unlock)?;
        return Ok(KeypadOutcome::Correct);
    }

    artifact.attempts += 1;
    artifact.version += 1;
    match keypad.max_attempts {
        Some(max) if artifact.attempts >= max => {
            apply(artifact, ArtifactAction::Fail)?;
            Ok(KeypadOutcome::Exhausted {
                attempts: artifact.attempts,
            })
        }
        max => Ok(KeypadOutcome::Wrong {
            attempts: artifact.attempts,
            remaining: max.map(|max| max - artifact.attempts),
        }),
    }
}

/// Variants of an artifact the viewer may see right now.
pub fn visible_variants<'a>(
    artifact: &'a ArtifactEntity,
    viewer: Viewer<'_>,
) -> Vec<&'a ArtifactVariant> {
    match viewer {
        Viewer::Facilitator => artifact.variants.iter().collect(),
        Viewer::Participant { role } => {
            if artifact.state == ArtifactState::Hidden {
                return Vec::new();
            }
            artifact
                .variants
                .iter()
                .filter(|variant| match &variant.visibility {
                    VariantVisibility::Public => true,
                    VariantVisibility::Role { role: wanted } => role == Some(wanted.as_str()),
                    VariantVisibility::Facilitator => false,
                })
                .filter(|variant| artifact.state.reaches(variant.min_state))
                .collect()
        }
    }
}
