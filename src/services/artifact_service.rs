use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    dao::models::ArtifactEntity,
    dto::{
        participant::KeypadResponse,
        session::{ArtifactActionResponse, ArtifactView},
    },
    error::ServiceError,
    services::{
        participant_service::authenticate,
        pipeline,
        session_service::{ensure_host, ensure_live},
    },
    state::{
        SessionGuard, SharedState,
        artifact::{self, ArtifactAction, ArtifactTransition, KeypadOutcome},
        events::{Actor, PlayEvent},
        participant,
        session::LiveSession,
        session_machine::SessionStatus,
    },
};

fn artifact_in(live: &LiveSession, key: &str) -> Result<ArtifactEntity, ServiceError> {
    live.artifacts
        .get(key)
        .cloned()
        .ok_or_else(|| ServiceError::NotFound(format!("artifact `{key}`")))
}

async fn save_artifact(state: &SharedState, artifact: ArtifactEntity) -> Result<(), ServiceError> {
    state
        .gateway_call(move |gateway| gateway.save_artifact(artifact))
        .await
}

async fn store(
    state: &SharedState,
    guard: &SessionGuard,
    artifact: &ArtifactEntity,
) -> Result<(), ServiceError> {
    save_artifact(state, artifact.clone()).await?;
    guard
        .write()
        .await
        .artifacts
        .insert(artifact.key.clone(), artifact.clone());
    Ok(())
}

fn changed_event(artifact: &ArtifactEntity, transition: ArtifactTransition) -> Option<PlayEvent> {
    match transition {
        ArtifactTransition::Changed { from, to } => Some(PlayEvent::ArtifactChanged {
            artifact: artifact.key.clone(),
            from,
            to,
            version: artifact.version,
        }),
        ArtifactTransition::Unchanged(_) => None,
    }
}

/// Facilitator override: reveal, hide, unlock, solve or fail an artifact.
pub async fn apply_override(
    state: &SharedState,
    host: Uuid,
    session_id: Uuid,
    key: &str,
    action: ArtifactAction,
) -> Result<ArtifactActionResponse, ServiceError> {
    let actor = state.session(session_id).await?;
    let guard = actor.lock().await;
    {
        let live = guard.read().await;
        ensure_host(&live, host)?;
        ensure_live(&live)?;
    }

    let (transition, artifact, events) = apply_locked(state, &guard, key, action).await?;
    let published = pipeline::dispatch(state, &guard, Actor::host(host), events).await;
    Ok(ArtifactActionResponse {
        action,
        changed: matches!(transition, ArtifactTransition::Changed { .. }),
        artifact: ArtifactView::from(&artifact),
        published,
    })
}

/// Apply an action under the writer gate. Only a state change is persisted and published.
pub(crate) async fn apply_locked(
    state: &SharedState,
    guard: &SessionGuard,
    key: &str,
    action: ArtifactAction,
) -> Result<(ArtifactTransition, ArtifactEntity, Vec<PlayEvent>), ServiceError> {
    let mut artifact = artifact_in(&*guard.read().await, key)?;
    let transition = artifact::apply(&mut artifact, action)?;
    let Some(event) = changed_event(&artifact, transition) else {
        debug!(session_id = %guard.session_id(), artifact = key, ?action, "artifact already at target");
        return Ok((transition, artifact, Vec::new()));
    };

    artifact.updated_at = OffsetDateTime::now_utc();
    store(state, guard, &artifact).await?;
    info!(
        session_id = %guard.session_id(),
        artifact = key,
        to = %artifact.state,
        version = artifact.version,
        "artifact changed"
    );
    Ok((transition, artifact, vec![event]))
}

/// Participant keypad entry. Only accepted while the session is `active`.
pub async fn submit_keypad(
    state: &SharedState,
    token: &str,
    key: &str,
    code: &str,
) -> Result<KeypadResponse, ServiceError> {
    let (actor, participant_id) = authenticate(state, token).await?;
    let guard = actor.lock().await;

    let mut artifact = {
        let live = guard.read().await;
        let caller = live
            .participants
            .get(&participant_id)
            .ok_or_else(|| ServiceError::NotFound(format!("participant `{participant_id}`")))?;
        participant::authorize(caller, OffsetDateTime::now_utc())?;
        let status = live.status();
        if status != SessionStatus::Active {
            return Err(ServiceError::invalid_transition(
                format!("keypads only accept codes while the session is active, not {status}"),
                status,
            ));
        }
        artifact_in(&live, key)?
    };

    let from = artifact.state;
    let outcome = artifact::submit_code(&mut artifact, code)?;
    artifact.updated_at = OffsetDateTime::now_utc();
    store(state, &guard, &artifact).await?;

    let changed = PlayEvent::ArtifactChanged {
        artifact: artifact.key.clone(),
        from,
        to: artifact.state,
        version: artifact.version,
    };
    let (events, remaining) = match outcome {
        KeypadOutcome::Correct => (
            vec![
                changed,
                PlayEvent::KeypadCorrect {
                    artifact: artifact.key.clone(),
                    participant_id: Some(participant_id),
                },
            ],
            None,
        ),
        KeypadOutcome::Wrong {
            attempts,
            remaining,
        } => (
            vec![PlayEvent::KeypadFailed {
                artifact: artifact.key.clone(),
                attempts,
                exhausted: false,
            }],
            remaining,
        ),
        KeypadOutcome::Exhausted { attempts } => (
            vec![
                PlayEvent::KeypadFailed {
                    artifact: artifact.key.clone(),
                    attempts,
                    exhausted: true,
                },
                changed,
            ],
            Some(0),
        ),
    };
    info!(
        session_id = %guard.session_id(),
        participant_id = %participant_id,
        artifact = key,
        outcome = ?outcome,
        "keypad code submitted"
    );

    pipeline::dispatch(state, &guard, Actor::participant(participant_id), events).await;
    Ok(KeypadResponse {
        correct: outcome == KeypadOutcome::Correct,
        attempts: artifact.attempts,
        remaining,
        state: artifact.state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::test_support::{TestSession, active_with_triggers, lobby_with_participant},
        state::artifact::ArtifactState,
    };

    async fn reveal_vault(session: &TestSession) {
        apply_override(
            &session.state,
            session.host_id,
            session.session_id,
            "vault",
            ArtifactAction::Reveal,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn repeated_reveal_is_unchanged_and_silent() {
        let session = lobby_with_participant().await;
        reveal_vault(&session).await;

        let again = apply_override(
            &session.state,
            session.host_id,
            session.session_id,
            "vault",
            ArtifactAction::Reveal,
        )
        .await
        .unwrap();

        assert!(!again.changed);
        assert!(again.published.is_empty());
        assert_eq!(again.artifact.version, 1);
    }

    #[tokio::test]
    async fn solving_a_hidden_artifact_is_rejected() {
        let session = lobby_with_participant().await;
        let err = apply_override(
            &session.state,
            session.host_id,
            session.session_id,
            "vault",
            ArtifactAction::Solve,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { ref current, .. } if current == "hidden"));
    }

    #[tokio::test]
    async fn keypad_rejected_outside_active_sessions() {
        let session = lobby_with_participant().await;
        reveal_vault(&session).await;
        let token = session.participant.as_ref().unwrap().token.clone();

        let err = submit_keypad(&session.state, &token, "vault", "4321")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { ref current, .. } if current == "lobby"));
    }

    #[tokio::test]
    async fn correct_code_unlocks_and_publishes_in_order() {
        let session = active_with_triggers(Vec::new()).await;
        reveal_vault(&session).await;
        let token = session.participant.as_ref().unwrap().token.clone();
        let mut receiver = session
            .state
            .channels()
            .get(session.session_id)
            .unwrap()
            .subscribe();

        let response = submit_keypad(&session.state, &token, "vault", " 4321 ")
            .await
            .unwrap();

        assert!(response.correct);
        assert_eq!(response.state, ArtifactState::Unlocked);
        assert_eq!(receiver.recv().await.unwrap().kind, "artifact_changed");
        assert_eq!(receiver.recv().await.unwrap().kind, "keypad_correct");
    }

    #[tokio::test]
    async fn exhausted_keypad_fails_the_artifact() {
        let session = active_with_triggers(Vec::new()).await;
        reveal_vault(&session).await;
        let token = session.participant.as_ref().unwrap().token.clone();

        let first = submit_keypad(&session.state, &token, "vault", "0000")
            .await
            .unwrap();
        assert_eq!(first.remaining, Some(2));
        submit_keypad(&session.state, &token, "vault", "1111")
            .await
            .unwrap();
        let last = submit_keypad(&session.state, &token, "vault", "2222")
            .await
            .unwrap();

        assert!(!last.correct);
        assert_eq!(last.attempts, 3);
        assert_eq!(last.state, ArtifactState::Failed);
        let err = submit_keypad(&session.state, &token, "vault", "4321")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn unknown_artifact_is_not_found() {
        let session = lobby_with_participant().await;
        let err = apply_override(
            &session.state,
            session.host_id,
            session.session_id,
            "ghost",
            ArtifactAction::Reveal,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
