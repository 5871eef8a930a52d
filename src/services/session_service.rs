use std::collections::HashSet;

use rand::{Rng, rng};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::models::{ArtifactEntity, SessionEntity, TriggerEntity},
    dto::{
        format_optional,
        session::{
            CreateSessionRequest, IndexChangeResponse, SessionEventView, SessionView,
            SettingsInput, TransitionResponse,
        },
    },
    error::ServiceError,
    services::{
        ledger_service, pipeline,
        realtime_service::{RealtimeCapability, realtime_capability},
    },
    state::{
        SessionGuard, SharedState,
        artifact::ArtifactState,
        events::{Actor, PlayEvent},
        session::{LiveSession, PlayMode, SessionSettings, TimeBankRules},
        session_machine::{Plan, SessionEvent, SessionStatus},
        timer::{TimerState, TimerStatus},
        trigger::{self, TriggerStatus},
    },
};

/// Join codes avoid characters that are easy to misread (0/O, 1/I/L).
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const JOIN_CODE_ATTEMPTS: usize = 8;
const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 500;

/// Lifecycle commands exposed on `/sessions/{id}/{command}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleCommand {
    Open,
    Start,
    Pause,
    Resume,
    Lock,
    Unlock,
    End,
    Cancel,
    Archive,
    Restore,
}

impl LifecycleCommand {
    fn machine_event(self, has_ended: bool) -> SessionEvent {
        match self {
            LifecycleCommand::Open => SessionEvent::Open,
            LifecycleCommand::Start => SessionEvent::Start,
            LifecycleCommand::Pause => SessionEvent::Pause,
            LifecycleCommand::Resume => SessionEvent::Resume,
            LifecycleCommand::Lock => SessionEvent::Lock,
            LifecycleCommand::Unlock => SessionEvent::Unlock,
            LifecycleCommand::End => SessionEvent::End,
            LifecycleCommand::Cancel => SessionEvent::Cancel,
            LifecycleCommand::Archive => SessionEvent::Archive,
            LifecycleCommand::Restore => SessionEvent::Restore { ended: has_ended },
        }
    }
}

/// Which index `/step` or `/phase` moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Step,
    Phase,
}

/// Reject callers other than the session host.
pub(crate) fn ensure_host(live: &LiveSession, facilitator: Uuid) -> Result<(), ServiceError> {
    if live.session.host_user_id != facilitator {
        return Err(ServiceError::Forbidden(
            "only the session host may run this command".into(),
        ));
    }
    Ok(())
}

/// Reject gameplay commands outside `lobby|active|paused|locked`.
pub(crate) fn ensure_live(live: &LiveSession) -> Result<(), ServiceError> {
    let status = live.status();
    if !status.is_live() {
        return Err(ServiceError::invalid_transition(
            format!("session is {status}"),
            status,
        ));
    }
    Ok(())
}

/// Capability advertised for the session's current status.
pub(crate) fn capability(state: &SharedState, live: &LiveSession) -> RealtimeCapability {
    realtime_capability(live.status(), state.config().poll_interval)
}

/// Persist the session record.
pub(crate) async fn save_session(
    state: &SharedState,
    session: SessionEntity,
) -> Result<(), ServiceError> {
    state
        .gateway_call(move |gateway| gateway.save_session(session))
        .await
}

/// Create a draft session from an authored definition.
pub async fn create(
    state: &SharedState,
    host: Uuid,
    request: CreateSessionRequest,
) -> Result<SessionView, ServiceError> {
    let CreateSessionRequest {
        display_name,
        tenant_id,
        play_mode,
        step_count,
        phase_count,
        settings,
        artifacts,
        triggers,
    } = request;

    let display_name = display_name.trim().to_owned();
    if display_name.is_empty() {
        return Err(ServiceError::Validation(
            "session name must not be empty".into(),
        ));
    }
    let settings = build_settings(state, settings)?;

    let mut keys = HashSet::new();
    for artifact in &artifacts {
        if !keys.insert(artifact.key.as_str()) {
            return Err(ServiceError::Validation(format!(
                "duplicate artifact key `{}`",
                artifact.key
            )));
        }
    }
    for definition in &triggers {
        for warning in trigger::validate_definition(definition, &keys)? {
            warn!(trigger = %definition.name, warning = %warning, "trigger definition warning");
        }
    }

    let session_id = Uuid::new_v4();
    let join_code = reserve_join_code(state, session_id).await?;
    let now = OffsetDateTime::now_utc();

    let session = SessionEntity {
        id: session_id,
        join_code,
        tenant_id,
        host_user_id: host,
        display_name,
        play_mode,
        status: SessionStatus::Draft,
        locked_from: None,
        step_index: 0,
        step_count,
        phase_index: 0,
        phase_count,
        settings,
        timer: TimerState::default(),
        created_at: now,
        started_at: None,
        paused_at: None,
        ended_at: None,
        cancelled_at: None,
        archived_at: None,
    };
    let artifacts: Vec<ArtifactEntity> = artifacts
        .into_iter()
        .enumerate()
        .map(|(index, input)| ArtifactEntity {
            id: Uuid::new_v4(),
            session_id,
            key: input.key,
            title: input.title,
            order_index: index as u32,
            state: ArtifactState::Hidden,
            version: 0,
            variants: input.variants,
            keypad: input.keypad,
            attempts: 0,
            updated_at: now,
        })
        .collect();
    let triggers: Vec<TriggerEntity> = triggers
        .into_iter()
        .enumerate()
        .map(|(index, definition)| TriggerEntity {
            id: Uuid::new_v4(),
            session_id,
            name: definition.name.trim().to_owned(),
            order_index: index as u32,
            condition: definition.condition,
            actions: definition.actions,
            execute_once: definition.execute_once,
            delay_seconds: definition.delay_seconds,
            status: if definition.enabled {
                TriggerStatus::Armed
            } else {
                TriggerStatus::Disabled
            },
            fired_count: 0,
            last_fired_at: None,
        })
        .collect();

    save_session(state, session.clone()).await?;
    for artifact in &artifacts {
        let artifact = artifact.clone();
        state
            .gateway_call(move |gateway| gateway.save_artifact(artifact))
            .await?;
    }
    if !triggers.is_empty() {
        let batch = triggers.clone();
        state
            .gateway_call(move |gateway| gateway.insert_triggers(batch))
            .await?;
    }

    let live = LiveSession::from_parts(session, Vec::new(), artifacts, triggers, 0);
    let view = SessionView::from_live(&live, capability(state, &live), now);
    state.register_session(live);
    info!(session_id = %session_id, join_code = %view.join_code, host = %host, "session created");
    Ok(view)
}

fn build_settings(
    state: &SharedState,
    input: SettingsInput,
) -> Result<SessionSettings, ServiceError> {
    let config = state.config();
    let time_bank: TimeBankRules = input.time_bank.unwrap_or(config.time_bank);
    if time_bank.min_balance > time_bank.max_balance
        || time_bank.initial_balance < time_bank.min_balance
        || time_bank.initial_balance > time_bank.max_balance
    {
        return Err(ServiceError::Validation(
            "time bank rules need min <= initial <= max".into(),
        ));
    }

    let mut roles = Vec::new();
    for role in input.roles {
        let role = role.trim().to_owned();
        if role.is_empty() {
            return Err(ServiceError::Validation("role names must not be empty".into()));
        }
        if !roles.contains(&role) {
            roles.push(role);
        }
    }

    Ok(SessionSettings {
        max_participants: input.max_participants.unwrap_or(config.max_participants),
        token_expiry_hours: input
            .token_expiry_hours
            .unwrap_or(Some(config.token_ttl_hours)),
        allow_rejoin: input.allow_rejoin.unwrap_or(true),
        require_ready: input.require_ready.unwrap_or(false),
        roles,
        time_bank,
    })
}

fn generate_join_code() -> String {
    let mut rng = rng();
    (0..crate::dto::validation::JOIN_CODE_LEN)
        .map(|_| JOIN_CODE_ALPHABET[rng.random_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}

async fn reserve_join_code(state: &SharedState, session_id: Uuid) -> Result<String, ServiceError> {
    for attempt in 1..=JOIN_CODE_ATTEMPTS {
        let code = generate_join_code();
        let candidate = code.clone();
        if state
            .gateway_call(move |gateway| gateway.reserve_join_code(candidate, session_id))
            .await?
        {
            return Ok(code);
        }
        warn!(session_id = %session_id, attempt, "join code collision; retrying");
    }
    Err(ServiceError::conflict(
        "could not allocate a unique join code",
        SessionStatus::Draft,
    ))
}

/// Facilitator snapshot of a session.
pub async fn view(
    state: &SharedState,
    host: Uuid,
    session_id: Uuid,
) -> Result<SessionView, ServiceError> {
    let actor = state.session(session_id).await?;
    let live = actor.read().await;
    ensure_host(&live, host)?;
    Ok(SessionView::from_live(
        &live,
        capability(state, &live),
        OffsetDateTime::now_utc(),
    ))
}

/// Run a lifecycle command.
///
/// `end` on an ended session succeeds again with the original `ended_at` and publishes
/// nothing.
pub async fn transition(
    state: &SharedState,
    host: Uuid,
    session_id: Uuid,
    command: LifecycleCommand,
) -> Result<TransitionResponse, ServiceError> {
    let actor = state.session(session_id).await?;
    let guard = actor.lock().await;

    let base = {
        let live = guard.read().await;
        ensure_host(&live, host)?;
        let status = live.status();
        if command == LifecycleCommand::End && status == SessionStatus::Ended {
            return Ok(TransitionResponse {
                from: status,
                status,
                ended_at: format_optional(live.session.ended_at),
                realtime: capability(state, &live),
                published: Vec::new(),
            });
        }
        if command == LifecycleCommand::Start
            && matches!(status, SessionStatus::Draft | SessionStatus::Lobby)
        {
            check_start_preconditions(&live)?;
        }
        live.session.clone()
    };

    let event = command.machine_event(base.ended_at.is_some());
    let now = OffsetDateTime::now_utc();
    let (session, plan) = guard
        .run_transition(event, |plan| persist_transition(state, base, plan, now))
        .await?;

    let ended_at = session.ended_at;
    guard.write().await.session = session;
    info!(
        session_id = %session_id,
        from = %plan.from,
        to = %plan.to,
        "session transition applied"
    );

    let mut events = vec![PlayEvent::SessionStatusChanged {
        from: plan.from,
        to: plan.to,
        ended_at,
    }];
    if plan.to == SessionStatus::Active && matches!(plan.from, SessionStatus::Draft | SessionStatus::Lobby)
    {
        match ledger_service::seed_time_bank(state, &guard).await {
            Ok(seeded) => events.extend(seeded),
            Err(err) => warn!(session_id = %session_id, error = %err, "failed to seed time bank"),
        }
    }

    let published = pipeline::dispatch(state, &guard, Actor::host(host), events).await;
    let live = guard.read().await;
    Ok(TransitionResponse {
        from: plan.from,
        status: live.status(),
        ended_at: format_optional(ended_at),
        realtime: capability(state, &live),
        published,
    })
}

fn check_start_preconditions(live: &LiveSession) -> Result<(), ServiceError> {
    let status = live.status();
    if live.session.play_mode == PlayMode::Facilitated && live.active_participants().next().is_none()
    {
        return Err(ServiceError::invalid_transition(
            "a facilitated session needs at least one active participant to start",
            status,
        ));
    }
    if live.session.settings.require_ready
        && live.active_participants().any(|participant| !participant.is_ready())
    {
        return Err(ServiceError::invalid_transition(
            "every active participant must be ready before the session starts",
            status,
        ));
    }
    Ok(())
}

async fn persist_transition(
    state: &SharedState,
    mut session: SessionEntity,
    plan: Plan,
    now: OffsetDateTime,
) -> Result<SessionEntity, ServiceError> {
    stamp_transition(&mut session, &plan, now)?;
    save_session(state, session.clone()).await?;
    Ok(session)
}

fn stamp_transition(
    session: &mut SessionEntity,
    plan: &Plan,
    now: OffsetDateTime,
) -> Result<(), ServiceError> {
    session.status = plan.to;
    session.locked_from = plan.locked_from_next;
    match (plan.from, plan.to) {
        (SessionStatus::Archived, _) => session.archived_at = None,
        (SessionStatus::Draft | SessionStatus::Lobby, SessionStatus::Active) => {
            session.started_at.get_or_insert(now);
        }
        (_, SessionStatus::Paused) => {
            session.paused_at.get_or_insert(now);
        }
        (SessionStatus::Paused | SessionStatus::Locked, SessionStatus::Active) => {
            session.paused_at = None;
        }
        (_, SessionStatus::Ended) => {
            session.ended_at = Some(now);
            if session.timer.status == TimerStatus::Running {
                session.timer.pause(now)?;
            }
        }
        (_, SessionStatus::Cancelled) => session.cancelled_at = Some(now),
        (_, SessionStatus::Archived) => session.archived_at = Some(now),
        _ => {}
    }
    Ok(())
}

/// Move the step or phase index as the facilitator.
pub async fn set_index(
    state: &SharedState,
    host: Uuid,
    session_id: Uuid,
    kind: IndexKind,
    index: u32,
) -> Result<IndexChangeResponse, ServiceError> {
    let actor = state.session(session_id).await?;
    let guard = actor.lock().await;
    {
        let live = guard.read().await;
        ensure_host(&live, host)?;
        ensure_live(&live)?;
    }

    let (from, to, events) = set_index_locked(state, &guard, kind, index).await?;
    let published = pipeline::dispatch(state, &guard, Actor::host(host), events).await;
    Ok(IndexChangeResponse {
        from,
        to,
        published,
    })
}

/// Move the index by one, as the `advance_step`/`advance_phase` trigger actions do.
pub(crate) async fn advance_locked(
    state: &SharedState,
    guard: &SessionGuard,
    kind: IndexKind,
) -> Result<Vec<PlayEvent>, ServiceError> {
    let current = {
        let live = guard.read().await;
        match kind {
            IndexKind::Step => live.session.step_index,
            IndexKind::Phase => live.session.phase_index,
        }
    };
    let (_, _, events) = set_index_locked(state, guard, kind, current + 1).await?;
    Ok(events)
}

/// Persist an index move under the writer gate; moving onto the current index is a no-op.
pub(crate) async fn set_index_locked(
    state: &SharedState,
    guard: &SessionGuard,
    kind: IndexKind,
    index: u32,
) -> Result<(u32, u32, Vec<PlayEvent>), ServiceError> {
    let mut session = guard.read().await.session.clone();
    let (slot, count, label) = match kind {
        IndexKind::Step => (&mut session.step_index, session.step_count, "step"),
        IndexKind::Phase => (&mut session.phase_index, session.phase_count, "phase"),
    };
    if count > 0 && index >= count {
        return Err(ServiceError::Validation(format!(
            "{label} index {index} is out of range (count {count})"
        )));
    }
    let from = *slot;
    if from == index {
        return Ok((from, index, Vec::new()));
    }
    *slot = index;

    save_session(state, session.clone()).await?;
    guard.write().await.session = session;

    let event = match kind {
        IndexKind::Step => PlayEvent::StepChanged { from, to: index },
        IndexKind::Phase => PlayEvent::PhaseChanged { from, to: index },
    };
    Ok((from, index, vec![event]))
}

/// Most recent audit rows of a session.
pub async fn list_log(
    state: &SharedState,
    host: Uuid,
    session_id: Uuid,
    limit: Option<usize>,
) -> Result<Vec<SessionEventView>, ServiceError> {
    let actor = state.session(session_id).await?;
    ensure_host(&*actor.read().await, host)?;
    let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let rows = state
        .gateway_call(move |gateway| gateway.list_session_events(session_id, limit))
        .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        participant_service,
        test_support::{TestSession, draft_session, join, lobby_with_participant},
    };

    #[tokio::test]
    async fn draft_start_without_participants_is_rejected() {
        let TestSession {
            state,
            session_id,
            host_id,
            ..
        } = draft_session().await;

        let err = transition(&state, host_id, session_id, LifecycleCommand::Start)
            .await
            .unwrap_err();

        match err {
            ServiceError::InvalidTransition { current, .. } => assert_eq!(current, "draft"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_twice_returns_the_same_timestamp() {
        let TestSession {
            state,
            session_id,
            host_id,
            ..
        } = lobby_with_participant().await;
        transition(&state, host_id, session_id, LifecycleCommand::Start)
            .await
            .unwrap();

        let first = transition(&state, host_id, session_id, LifecycleCommand::End)
            .await
            .unwrap();
        let second = transition(&state, host_id, session_id, LifecycleCommand::End)
            .await
            .unwrap();

        assert_eq!(first.status, SessionStatus::Ended);
        assert!(first.ended_at.is_some());
        assert_eq!(first.ended_at, second.ended_at);
        assert!(second.published.is_empty());
    }

    #[tokio::test]
    async fn starting_an_active_session_conflicts() {
        let TestSession {
            state,
            session_id,
            host_id,
            ..
        } = lobby_with_participant().await;
        transition(&state, host_id, session_id, LifecycleCommand::Start)
            .await
            .unwrap();

        let err = transition(&state, host_id, session_id, LifecycleCommand::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict { ref current, .. } if current == "active"));
    }

    #[tokio::test]
    async fn unlock_returns_to_the_locked_from_status() {
        let TestSession {
            state,
            session_id,
            host_id,
            ..
        } = lobby_with_participant().await;
        transition(&state, host_id, session_id, LifecycleCommand::Start)
            .await
            .unwrap();
        transition(&state, host_id, session_id, LifecycleCommand::Pause)
            .await
            .unwrap();
        transition(&state, host_id, session_id, LifecycleCommand::Lock)
            .await
            .unwrap();

        let unlocked = transition(&state, host_id, session_id, LifecycleCommand::Unlock)
            .await
            .unwrap();
        assert_eq!(unlocked.status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn archive_and_restore_round_trip_to_ended() {
        let TestSession {
            state,
            session_id,
            host_id,
            ..
        } = lobby_with_participant().await;
        for command in [
            LifecycleCommand::Start,
            LifecycleCommand::End,
            LifecycleCommand::Archive,
        ] {
            transition(&state, host_id, session_id, command).await.unwrap();
        }

        let restored = transition(&state, host_id, session_id, LifecycleCommand::Restore)
            .await
            .unwrap();
        assert_eq!(restored.status, SessionStatus::Ended);
        assert!(!restored.realtime.enabled);
    }

    #[tokio::test]
    async fn ending_tears_down_the_channel() {
        let TestSession {
            state,
            session_id,
            host_id,
            ..
        } = lobby_with_participant().await;
        assert!(state.channels().is_open(session_id));
        transition(&state, host_id, session_id, LifecycleCommand::Start)
            .await
            .unwrap();

        let ended = transition(&state, host_id, session_id, LifecycleCommand::End)
            .await
            .unwrap();

        assert!(!state.channels().is_open(session_id));
        assert_eq!(ended.published[0].kind, "session_status_changed");
    }

    #[tokio::test]
    async fn pause_resume_cycles_publish_increasing_seqs() {
        let TestSession {
            state,
            session_id,
            host_id,
            ..
        } = lobby_with_participant().await;

        let mut seqs = Vec::new();
        for command in [
            LifecycleCommand::Start,
            LifecycleCommand::Pause,
            LifecycleCommand::Resume,
            LifecycleCommand::Pause,
            LifecycleCommand::Resume,
        ] {
            let response = transition(&state, host_id, session_id, command).await.unwrap();
            assert!(!response.published.is_empty());
            seqs.extend(response.published.iter().map(|message| message.seq));
        }

        assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]), "{seqs:?}");
    }

    #[tokio::test]
    async fn ended_session_is_evicted_once_idle_and_rehydrates() {
        let TestSession {
            state,
            session_id,
            host_id,
            participant,
            ..
        } = lobby_with_participant().await;
        let joined = participant.unwrap();
        assert!(!state.evict_idle_session(session_id));

        for command in [LifecycleCommand::Start, LifecycleCommand::End] {
            transition(&state, host_id, session_id, command).await.unwrap();
        }
        let held = state.session(session_id).await.unwrap();
        assert!(!state.evict_idle_session(session_id));
        drop(held);

        assert!(state.evict_idle_session(session_id));
        assert!(!state.resident_sessions().contains(&session_id));
        let entry = state.resolve_token(&joined.token).await.unwrap();
        assert_eq!(entry.participant_id, joined.participant_id);
        let actor = state.session(session_id).await.unwrap();
        assert_eq!(actor.read().await.status(), SessionStatus::Ended);
    }

    #[tokio::test]
    async fn start_seeds_the_time_bank() {
        let TestSession {
            state,
            session_id,
            host_id,
            ..
        } = lobby_with_participant().await;

        let started = transition(&state, host_id, session_id, LifecycleCommand::Start)
            .await
            .unwrap();

        let kinds: Vec<_> = started.published.iter().map(|m| m.kind.as_str()).collect();
        assert_eq!(kinds, ["session_status_changed", "time_bank_changed"]);
        let ledger = ledger_service::list_time_bank(&state, host_id, session_id)
            .await
            .unwrap();
        assert_eq!(ledger.balance, state.config().time_bank.initial_balance);
    }

    #[tokio::test]
    async fn require_ready_blocks_start_until_everyone_is_ready() {
        let TestSession {
            state,
            session_id,
            host_id,
            join_code,
            ..
        } = draft_session().await;
        {
            let actor = state.session(session_id).await.unwrap();
            let mut session = actor.read().await.session.clone();
            session.settings.require_ready = true;
            let guard = actor.lock().await;
            guard.write().await.session = session;
        }
        transition(&state, host_id, session_id, LifecycleCommand::Open)
            .await
            .unwrap();
        let joined = join(&state, &join_code, "Ada").await;

        let err = transition(&state, host_id, session_id, LifecycleCommand::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { .. }));

        participant_service::set_ready(&state, &joined.token, true)
            .await
            .unwrap();
        transition(&state, host_id, session_id, LifecycleCommand::Start)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn outage_leaves_the_actor_retryable() {
        let TestSession {
            state,
            gateway,
            session_id,
            host_id,
            ..
        } = lobby_with_participant().await;

        gateway.set_offline(true);
        let err = transition(&state, host_id, session_id, LifecycleCommand::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
        {
            let actor = state.session(session_id).await.unwrap();
            let live = actor.read().await;
            assert_eq!(live.status(), SessionStatus::Lobby);
            assert_eq!(live.machine.snapshot().pending, None);
            assert_eq!(live.session.started_at, None);
        }

        gateway.set_offline(false);
        let started = transition(&state, host_id, session_id, LifecycleCommand::Start)
            .await
            .unwrap();
        assert_eq!(started.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn step_moves_are_published_and_bounded() {
        let TestSession {
            state,
            session_id,
            host_id,
            ..
        } = lobby_with_participant().await;

        let moved = set_index(&state, host_id, session_id, IndexKind::Step, 2)
            .await
            .unwrap();
        assert_eq!((moved.from, moved.to), (0, 2));
        assert_eq!(moved.published[0].kind, "step_changed");

        let err = set_index(&state, host_id, session_id, IndexKind::Step, 99)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn other_facilitators_are_forbidden() {
        let TestSession {
            state, session_id, ..
        } = draft_session().await;

        let err = view(&state, Uuid::new_v4(), session_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[test]
    fn join_codes_use_the_unambiguous_alphabet() {
        let code = generate_join_code();
        assert_eq!(code.len(), 6);
        assert!(code.bytes().all(|b| JOIN_CODE_ALPHABET.contains(&b)));
    }
}
