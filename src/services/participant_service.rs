use std::{sync::Arc, time::Duration};

use rand::{Rng, distr::Alphanumeric, rng};
use time::OffsetDateTime;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::models::ParticipantEntity,
    dto::{
        format_optional,
        participant::{
            HeartbeatResponse, JoinRequest, JoinResponse, ParticipantArtifactView,
            ParticipantCommandResponse, ParticipantStateView, VariantView,
        },
        session::{ParticipantSummary, TimerView},
        validation::normalize_join_code,
    },
    error::ServiceError,
    services::{
        pipeline,
        session_service::{capability, ensure_host},
    },
    state::{
        SessionActor, SessionGuard, SharedState, TokenEntry,
        artifact::{ArtifactState, Viewer, visible_variants},
        events::{Actor, PlayEvent},
        participant::{self, ModerationAction, ParticipantError, ParticipantStatus, StatusChange},
        session::LiveSession,
        session_machine::SessionStatus,
    },
};

const TOKEN_LEN: usize = 32;

fn generate_token() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn accepts_joins(status: SessionStatus) -> bool {
    matches!(
        status,
        SessionStatus::Lobby | SessionStatus::Active | SessionStatus::Paused
    )
}

fn status_event(participant_id: Uuid, change: StatusChange) -> PlayEvent {
    PlayEvent::ParticipantStatusChanged {
        participant_id,
        from: change.from,
        to: change.to,
    }
}

pub(crate) async fn save_participant(
    state: &SharedState,
    participant: ParticipantEntity,
) -> Result<(), ServiceError> {
    state
        .gateway_call(move |gateway| gateway.save_participant(participant))
        .await
}

/// Resolve a bearer token to its session actor and participant id.
pub(crate) async fn authenticate(
    state: &SharedState,
    token: &str,
) -> Result<(Arc<SessionActor>, Uuid), ServiceError> {
    let TokenEntry {
        session_id,
        participant_id,
    } = state.resolve_token(token).await?;
    let actor = state.session(session_id).await?;
    Ok((actor, participant_id))
}

fn participant_in(live: &LiveSession, participant_id: Uuid) -> Result<ParticipantEntity, ServiceError> {
    live.participants
        .get(&participant_id)
        .cloned()
        .ok_or_else(|| ServiceError::NotFound(format!("participant `{participant_id}`")))
}

/// Join by code, or resume an earlier membership when `previous_token` allows it.
pub async fn join(state: &SharedState, request: JoinRequest) -> Result<JoinResponse, ServiceError> {
    let code = normalize_join_code(&request.join_code);
    let lookup = code.clone();
    let session = state
        .gateway_call(move |gateway| gateway.find_session_by_code(lookup))
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("no session with join code `{code}`")))?;

    let actor = state.session(session.id).await?;
    let guard = actor.lock().await;
    let now = OffsetDateTime::now_utc();

    if let Some(token) = request.previous_token.as_deref() {
        let previous = guard
            .read()
            .await
            .participants
            .values()
            .find(|participant| participant.token == token)
            .cloned();
        if let Some(previous) = previous {
            if let Some(response) = rejoin(state, &guard, previous, now).await? {
                return Ok(response);
            }
        }
    }

    let (participant, seated) = {
        let live = guard.read().await;
        let status = live.status();
        if !accepts_joins(status) {
            return Err(ServiceError::invalid_transition(
                format!("session is {status} and not accepting joins"),
                status,
            ));
        }
        let settings = &live.session.settings;
        if live.seated_count() >= settings.max_participants {
            return Err(ServiceError::conflict(
                format!("session is full ({} seats)", settings.max_participants),
                status,
            ));
        }

        let role = request
            .role
            .as_deref()
            .map(str::trim)
            .filter(|role| !role.is_empty())
            .map(str::to_owned);
        if !settings.roles.is_empty()
            && !role.as_ref().is_some_and(|role| settings.roles.contains(role))
        {
            return Err(ServiceError::Validation(format!(
                "role must be one of: {}",
                settings.roles.join(", ")
            )));
        }

        let participant = ParticipantEntity {
            id: Uuid::new_v4(),
            session_id: live.session.id,
            display_name: request.display_name.trim().to_owned(),
            role,
            status: ParticipantStatus::Active,
            token: generate_token(),
            token_expires_at: settings
                .token_expiry_hours
                .map(|hours| now + time::Duration::hours(hours.into())),
            joined_at: now,
            last_seen_at: now,
            progress: serde_json::json!({ "ready": false }),
        };
        (participant, live.seated_count() + 1)
    };

    save_participant(state, participant.clone()).await?;
    state.index_token(
        &participant.token,
        TokenEntry {
            session_id: participant.session_id,
            participant_id: participant.id,
        },
    );
    guard
        .write()
        .await
        .participants
        .insert(participant.id, participant.clone());
    info!(
        session_id = %participant.session_id,
        participant_id = %participant.id,
        seated,
        "participant joined"
    );

    let event = PlayEvent::ParticipantJoined {
        participant_id: participant.id,
        display_name: participant.display_name.clone(),
        role: participant.role.clone(),
        seated,
    };
    pipeline::dispatch(state, &guard, Actor::participant(participant.id), vec![event]).await;

    let live = guard.read().await;
    Ok(JoinResponse {
        participant_id: participant.id,
        session_id: participant.session_id,
        token: participant.token,
        token_expires_at: format_optional(participant.token_expires_at),
        status: participant.status,
        rejoined: false,
        session_status: live.status(),
        realtime: capability(state, &live),
    })
}

/// Resume a membership. `Ok(None)` means the earlier membership ended and a fresh join
/// should follow.
async fn rejoin(
    state: &SharedState,
    guard: &SessionGuard,
    mut participant: ParticipantEntity,
    now: OffsetDateTime,
) -> Result<Option<JoinResponse>, ServiceError> {
    let (allow_rejoin, status) = {
        let live = guard.read().await;
        (live.session.settings.allow_rejoin, live.status())
    };

    match participant.status {
        ParticipantStatus::Left => return Ok(None),
        ParticipantStatus::Kicked | ParticipantStatus::Blocked => {
            return Err(ParticipantError::Rejected {
                status: participant.status,
            }
            .into());
        }
        ParticipantStatus::Active | ParticipantStatus::Disconnected => {}
    }
    participant::authorize(&participant, now)?;

    let mut published = false;
    if participant.status == ParticipantStatus::Disconnected {
        if !allow_rejoin {
            return Err(ServiceError::Forbidden(
                "rejoining is disabled for this session".into(),
            ));
        }
        if !accepts_joins(status) {
            return Err(ServiceError::invalid_transition(
                format!("session is {status} and not accepting joins"),
                status,
            ));
        }
        let change = participant::heartbeat(&mut participant, now)?;
        save_participant(state, participant.clone()).await?;
        guard
            .write()
            .await
            .participants
            .insert(participant.id, participant.clone());
        if let Some(change) = change {
            info!(session_id = %participant.session_id, participant_id = %participant.id, "participant rejoined");
            pipeline::dispatch(
                state,
                guard,
                Actor::participant(participant.id),
                vec![status_event(participant.id, change)],
            )
            .await;
            published = true;
        }
    }
    debug!(participant_id = %participant.id, published, "membership resumed");

    let live = guard.read().await;
    Ok(Some(JoinResponse {
        participant_id: participant.id,
        session_id: participant.session_id,
        token: participant.token,
        token_expires_at: format_optional(participant.token_expires_at),
        status: participant.status,
        rejoined: true,
        session_status: live.status(),
        realtime: capability(state, &live),
    }))
}

/// Refresh presence; fails closed on an expired token or a rejected status.
pub async fn heartbeat(state: &SharedState, token: &str) -> Result<HeartbeatResponse, ServiceError> {
    let (actor, participant_id) = authenticate(state, token).await?;
    let guard = actor.lock().await;
    let now = OffsetDateTime::now_utc();

    let mut participant = participant_in(&*guard.read().await, participant_id)?;
    let change = participant::heartbeat(&mut participant, now)?;
    save_participant(state, participant.clone()).await?;
    guard
        .write()
        .await
        .participants
        .insert(participant_id, participant.clone());

    if let Some(change) = change {
        pipeline::dispatch(
            state,
            &guard,
            Actor::participant(participant_id),
            vec![status_event(participant_id, change)],
        )
        .await;
    }

    let live = guard.read().await;
    Ok(HeartbeatResponse {
        status: participant.status,
        session_status: live.status(),
        realtime: capability(state, &live),
    })
}

/// Toggle the ready flag; only while the session is `lobby` or `active`.
pub async fn set_ready(
    state: &SharedState,
    token: &str,
    ready: bool,
) -> Result<ParticipantCommandResponse, ServiceError> {
    let (actor, participant_id) = authenticate(state, token).await?;
    let guard = actor.lock().await;
    let now = OffsetDateTime::now_utc();

    let mut participant = {
        let live = guard.read().await;
        let status = live.status();
        if !matches!(status, SessionStatus::Lobby | SessionStatus::Active) {
            return Err(ServiceError::invalid_transition(
                format!("cannot change readiness while the session is {status}"),
                status,
            ));
        }
        participant_in(&live, participant_id)?
    };
    participant::authorize(&participant, now)?;
    if participant.is_ready() == ready {
        return Ok(ParticipantCommandResponse {
            status: participant.status,
            ready,
            published: Vec::new(),
        });
    }

    if let Some(progress) = participant.progress.as_object_mut() {
        progress.insert("ready".into(), ready.into());
    } else {
        participant.progress = serde_json::json!({ "ready": ready });
    }
    participant.last_seen_at = now;
    save_participant(state, participant.clone()).await?;
    guard
        .write()
        .await
        .participants
        .insert(participant_id, participant.clone());

    let published = pipeline::dispatch(
        state,
        &guard,
        Actor::participant(participant_id),
        vec![PlayEvent::ParticipantReady {
            participant_id,
            ready,
        }],
    )
    .await;
    Ok(ParticipantCommandResponse {
        status: participant.status,
        ready,
        published,
    })
}

/// Participant-initiated exit.
pub async fn leave(
    state: &SharedState,
    token: &str,
) -> Result<ParticipantCommandResponse, ServiceError> {
    let (actor, participant_id) = authenticate(state, token).await?;
    let guard = actor.lock().await;
    let now = OffsetDateTime::now_utc();

    let mut participant = participant_in(&*guard.read().await, participant_id)?;
    let change = participant::leave(&mut participant, now)?;
    save_participant(state, participant.clone()).await?;
    guard
        .write()
        .await
        .participants
        .insert(participant_id, participant.clone());
    info!(session_id = %participant.session_id, participant_id = %participant_id, "participant left");

    let published = pipeline::dispatch(
        state,
        &guard,
        Actor::participant(participant_id),
        vec![status_event(participant_id, change)],
    )
    .await;
    Ok(ParticipantCommandResponse {
        status: participant.status,
        ready: participant.is_ready(),
        published,
    })
}

/// Facilitator kick, block or unblock.
pub async fn moderate(
    state: &SharedState,
    host: Uuid,
    session_id: Uuid,
    participant_id: Uuid,
    action: ModerationAction,
) -> Result<ParticipantSummary, ServiceError> {
    let actor = state.session(session_id).await?;
    let guard = actor.lock().await;

    let mut participant = {
        let live = guard.read().await;
        ensure_host(&live, host)?;
        participant_in(&live, participant_id)?
    };
    let change = participant::moderate(&mut participant, action)?;
    save_participant(state, participant.clone()).await?;
    guard
        .write()
        .await
        .participants
        .insert(participant_id, participant.clone());
    info!(
        session_id = %session_id,
        participant_id = %participant_id,
        action = ?action,
        to = %change.to,
        "participant moderated"
    );

    pipeline::dispatch(
        state,
        &guard,
        Actor::host(host),
        vec![status_event(participant_id, change)],
    )
    .await;
    Ok(ParticipantSummary::from(&participant))
}

/// Participant-scoped snapshot: hidden artifacts are omitted and variants are filtered by
/// the participant's role.
pub async fn state_view(
    state: &SharedState,
    token: &str,
) -> Result<ParticipantStateView, ServiceError> {
    let (actor, participant_id) = authenticate(state, token).await?;
    let live = actor.read().await;
    let now = OffsetDateTime::now_utc();
    let participant = participant_in(&live, participant_id)?;
    participant::authorize(&participant, now)?;

    let viewer = Viewer::Participant {
        role: participant.role.as_deref(),
    };
    let artifacts = live
        .artifacts
        .values()
        .filter(|artifact| artifact.state != ArtifactState::Hidden)
        .map(|artifact| ParticipantArtifactView {
            key: artifact.key.clone(),
            title: artifact.title.clone(),
            state: artifact.state,
            version: artifact.version,
            has_keypad: artifact.keypad.is_some(),
            variants: visible_variants(artifact, viewer)
                .into_iter()
                .map(|variant| VariantView {
                    key: variant.key.clone(),
                    title: variant.title.clone(),
                    body: variant.body.clone(),
                })
                .collect(),
        })
        .collect();

    Ok(ParticipantStateView {
        participant_id,
        display_name: participant.display_name.clone(),
        role: participant.role.clone(),
        status: participant.status,
        ready: participant.is_ready(),
        session_id: live.session.id,
        session_name: live.session.display_name.clone(),
        session_status: live.status(),
        step_index: live.session.step_index,
        phase_index: live.session.phase_index,
        timer: TimerView::at(&live.session.timer, now),
        time_bank_balance: live.time_bank_balance,
        artifacts,
        last_seq: live.last_seq,
        realtime: capability(state, &live),
    })
}

/// Mark stale participants of one live session as disconnected.
pub async fn sweep_session(
    state: &SharedState,
    session_id: Uuid,
) -> Result<usize, ServiceError> {
    let actor = state.session(session_id).await?;
    let now = OffsetDateTime::now_utc();
    let stale_after = state.config().stale_participant_after;
    {
        let live = actor.read().await;
        let any_stale = live
            .active_participants()
            .any(|participant| participant::is_stale(participant, now, stale_after));
        if !live.status().is_live() || !any_stale {
            return Ok(0);
        }
    }

    let guard = actor.lock().await;
    if !guard.read().await.status().is_live() {
        return Ok(0);
    }
    let candidates: Vec<ParticipantEntity> = guard
        .read()
        .await
        .active_participants()
        .cloned()
        .collect();

    let mut events = Vec::new();
    for mut participant in candidates {
        let Some(change) = participant::mark_if_stale(&mut participant, now, stale_after) else {
            continue;
        };
        let participant_id = participant.id;
        save_participant(state, participant.clone()).await?;
        guard
            .write()
            .await
            .participants
            .insert(participant_id, participant);
        debug!(session_id = %session_id, participant_id = %participant_id, "participant marked disconnected");
        events.push(status_event(participant_id, change));
    }

    let marked = events.len();
    if marked > 0 {
        pipeline::dispatch(state, &guard, Actor::system(), events).await;
    }
    Ok(marked)
}

/// Periodically sweep every resident session for stale heartbeats, evicting idle sessions
/// that left the live statuses.
pub async fn run_presence_sweeper(state: SharedState) {
    let period = (state.config().stale_participant_after / 2).max(Duration::from_secs(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_ms = period.as_millis() as u64, "presence sweeper started");

    loop {
        ticker.tick().await;
        for session_id in state.resident_sessions() {
            if state.evict_idle_session(session_id) {
                continue;
            }
            match sweep_session(&state, session_id).await {
                Ok(0) => {}
                Ok(marked) => {
                    info!(session_id = %session_id, marked, "stale participants disconnected")
                }
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "presence sweep failed")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{
        TestSession, draft_session, join, lobby_with_participant,
    };

    #[tokio::test]
    async fn joining_a_draft_session_is_refused() {
        let TestSession {
            state, join_code, ..
        } = draft_session().await;

        let err = join_request(&state, &join_code, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { ref current, .. } if current == "draft"));
    }

    async fn join_request(
        state: &SharedState,
        code: &str,
        previous_token: Option<String>,
    ) -> Result<JoinResponse, ServiceError> {
        super::join(
            state,
            JoinRequest {
                join_code: format!(" {code} "),
                display_name: "Grace".into(),
                role: None,
                previous_token,
            },
        )
        .await
    }

    #[tokio::test]
    async fn expired_token_heartbeat_is_unauthorized_and_status_unchanged() {
        let TestSession {
            state,
            actor,
            participant,
            ..
        } = lobby_with_participant().await;
        let joined = participant.unwrap();
        {
            let guard = actor.lock().await;
            let mut live = guard.write().await;
            let entry = live.participants.get_mut(&joined.participant_id).unwrap();
            entry.token_expires_at = Some(OffsetDateTime::now_utc() - time::Duration::minutes(1));
        }

        let err = heartbeat(&state, &joined.token).await.unwrap_err();

        assert!(matches!(err, ServiceError::Unauthorized(_)));
        let live = actor.read().await;
        assert_eq!(
            live.participants[&joined.participant_id].status,
            ParticipantStatus::Active
        );
    }

    #[tokio::test]
    async fn blocked_participant_is_denied_on_next_heartbeat() {
        let TestSession {
            state,
            session_id,
            host_id,
            participant,
            ..
        } = lobby_with_participant().await;
        let joined = participant.unwrap();

        moderate(
            &state,
            host_id,
            session_id,
            joined.participant_id,
            ModerationAction::Block,
        )
        .await
        .unwrap();

        let err = heartbeat(&state, &joined.token).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        let err = set_ready(&state, &joined.token, true).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn kicked_participant_cannot_rejoin_with_their_token() {
        let TestSession {
            state,
            session_id,
            host_id,
            join_code,
            participant,
            ..
        } = lobby_with_participant().await;
        let joined = participant.unwrap();
        moderate(
            &state,
            host_id,
            session_id,
            joined.participant_id,
            ModerationAction::Kick,
        )
        .await
        .unwrap();

        let err = join_request(&state, &join_code, Some(joined.token))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn disconnected_participant_rejoins_and_heartbeat_revives() {
        let TestSession {
            state,
            actor,
            session_id,
            join_code,
            participant,
            ..
        } = lobby_with_participant().await;
        let joined = participant.unwrap();
        {
            let guard = actor.lock().await;
            let mut live = guard.write().await;
            let entry = live.participants.get_mut(&joined.participant_id).unwrap();
            entry.last_seen_at = OffsetDateTime::now_utc() - time::Duration::minutes(10);
        }

        assert_eq!(sweep_session(&state, session_id).await.unwrap(), 1);
        let resumed = join_request(&state, &join_code, Some(joined.token.clone()))
            .await
            .unwrap();

        assert!(resumed.rejoined);
        assert_eq!(resumed.participant_id, joined.participant_id);
        assert_eq!(resumed.status, ParticipantStatus::Active);
    }

    #[tokio::test]
    async fn sweep_leaves_fresh_sessions_unlocked() {
        let TestSession {
            state,
            actor,
            session_id,
            ..
        } = lobby_with_participant().await;
        let _writer = actor.lock().await;

        let swept = tokio::time::timeout(
            Duration::from_millis(200),
            sweep_session(&state, session_id),
        )
        .await
        .expect("sweep must not wait for the writer");
        assert_eq!(swept.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_session_rejects_new_joins() {
        let TestSession {
            state,
            actor,
            join_code,
            ..
        } = lobby_with_participant().await;
        {
            let guard = actor.lock().await;
            guard.write().await.session.settings.max_participants = 1;
        }

        let err = join_request(&state, &join_code, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict { .. }));
    }

    #[tokio::test]
    async fn unblocked_participant_ends_up_left() {
        let TestSession {
            state,
            session_id,
            host_id,
            participant,
            ..
        } = lobby_with_participant().await;
        let joined = participant.unwrap();
        for action in [ModerationAction::Block, ModerationAction::Unblock] {
            moderate(&state, host_id, session_id, joined.participant_id, action)
                .await
                .unwrap();
        }

        let err = moderate(
            &state,
            host_id,
            session_id,
            joined.participant_id,
            ModerationAction::Kick,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { ref current, .. } if current == "left"));
    }

    #[tokio::test]
    async fn state_view_filters_variants_by_role() {
        let TestSession {
            state,
            host_id,
            session_id,
            join_code,
            ..
        } = lobby_with_participant().await;
        let navigator = super::join(
            &state,
            JoinRequest {
                join_code: join_code.clone(),
                display_name: "Nav".into(),
                role: Some("navigator".into()),
                previous_token: None,
            },
        )
        .await
        .unwrap();
        let plain = join(&state, &join_code, "Plain").await;
        crate::services::artifact_service::apply_override(
            &state,
            host_id,
            session_id,
            "map",
            crate::state::artifact::ArtifactAction::Reveal,
        )
        .await
        .unwrap();

        let nav_view = state_view(&state, &navigator.token).await.unwrap();
        let plain_view = state_view(&state, &plain.token).await.unwrap();

        let keys = |view: &ParticipantStateView| -> Vec<String> {
            view.artifacts[0]
                .variants
                .iter()
                .map(|variant| variant.key.clone())
                .collect()
        };
        assert_eq!(nav_view.artifacts.len(), 1);
        assert_eq!(keys(&nav_view), ["overview", "route"]);
        assert_eq!(keys(&plain_view), ["overview"]);
    }

    #[tokio::test]
    async fn ready_toggle_is_published() {
        let TestSession {
            state, participant, ..
        } = lobby_with_participant().await;
        let joined = participant.unwrap();

        let response = set_ready(&state, &joined.token, true).await.unwrap();

        assert!(response.ready);
        assert_eq!(response.published[0].kind, "participant_ready");
        let again = set_ready(&state, &joined.token, true).await.unwrap();
        assert!(again.published.is_empty());
    }
}
