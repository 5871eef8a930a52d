use std::convert::Infallible;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::sse::{Event, Sse},
    routing::{get, post},
};
use axum_valid::Valid;
use futures::Stream;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::{
    dto::{
        session::{
            ArtifactActionResponse, CreateSessionRequest, IndexChangeResponse, LogQuery,
            ModerateRequest, ParticipantSummary, SessionEventView, SessionView, SetIndexRequest,
            TimeBankApplyResponse, TimeBankDeltaInput, TimeBankLedgerView, TimerAdjustRequest,
            TimerResponse, TimerStartRequest, TransitionResponse,
        },
        trigger::{FireTriggerRequest, FireTriggerResponse, TriggerStatusResponse},
    },
    error::AppError,
    routes::identity::{Facilitator, require_facilitator},
    services::{
        artifact_service, ledger_service, participant_service, realtime_service,
        session_service::{self, IndexKind, LifecycleCommand},
        timer_service::{self, TimerCommand},
        trigger_service,
    },
    state::{SharedState, artifact::ArtifactAction},
};

/// Timer verbs that carry no body.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerVerb {
    Pause,
    Resume,
    Reset,
}

impl From<TimerVerb> for TimerCommand {
    fn from(verb: TimerVerb) -> Self {
        match verb {
            TimerVerb::Pause => TimerCommand::Pause,
            TimerVerb::Resume => TimerCommand::Resume,
            TimerVerb::Reset => TimerCommand::Reset,
        }
    }
}

/// Facilitator endpoints driving a session.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/{command}", post(run_lifecycle))
        .route("/sessions/{id}/step", post(set_step))
        .route("/sessions/{id}/phase", post(set_phase))
        .route("/sessions/{id}/timer/start", post(start_timer))
        .route("/sessions/{id}/timer/adjust", post(adjust_timer))
        .route("/sessions/{id}/timer/{verb}", post(timer_verb))
        .route(
            "/sessions/{id}/participants/{pid}/moderate",
            post(moderate_participant),
        )
        .route(
            "/sessions/{id}/artifacts/{key}/{action}",
            post(artifact_action),
        )
        .route("/sessions/{id}/triggers/disable-all", post(disable_all_triggers))
        .route("/sessions/{id}/triggers/{tid}/fire", post(fire_trigger))
        .route("/sessions/{id}/triggers/{tid}/arm", post(arm_trigger))
        .route("/sessions/{id}/triggers/{tid}/disable", post(disable_trigger))
        .route(
            "/sessions/{id}/time-bank",
            get(list_time_bank).post(apply_time_bank),
        )
        .route("/sessions/{id}/log", get(session_log))
        .route("/sessions/{id}/stream", get(session_stream))
        .route_layer(middleware::from_fn(require_facilitator))
}

/// Create a draft session from an authored definition.
#[utoipa::path(
    post,
    path = "/sessions",
    tag = "sessions",
    params(("x-facilitator-id" = String, Header, description = "Facilitator user id")),
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = SessionView),
        (status = 400, description = "Invalid definition"),
        (status = 401, description = "Missing facilitator identity")
    )
)]
pub async fn create_session(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Valid(Json(payload)): Valid<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<SessionView>), AppError> {
    let view = session_service::create(&state, host, payload).await?;
    info!(session_id = %view.id, host = %host, "session created");
    Ok((StatusCode::CREATED, Json(view)))
}

/// Facilitator view of a session.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    tag = "sessions",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier")
    ),
    responses(
        (status = 200, description = "Session", body = SessionView),
        (status = 403, description = "Caller is not the host"),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn get_session(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(session_service::view(&state, host, id).await?))
}

/// Run a lifecycle command.
#[utoipa::path(
    post,
    path = "/sessions/{id}/{command}",
    tag = "sessions",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier"),
        ("command" = LifecycleCommand, Path, description = "open, start, pause, resume, lock, unlock, end, cancel, archive or restore")
    ),
    responses(
        (status = 200, description = "Transition applied", body = TransitionResponse),
        (status = 409, description = "Command not allowed from the current status")
    )
)]
pub async fn run_lifecycle(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path((id, command)): Path<(Uuid, LifecycleCommand)>,
) -> Result<Json<TransitionResponse>, AppError> {
    Ok(Json(
        session_service::transition(&state, host, id, command).await?,
    ))
}

/// Move the current step.
#[utoipa::path(
    post,
    path = "/sessions/{id}/step",
    tag = "sessions",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier")
    ),
    request_body = SetIndexRequest,
    responses(
        (status = 200, description = "Step changed", body = IndexChangeResponse),
        (status = 400, description = "Index outside the authored range")
    )
)]
pub async fn set_step(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SetIndexRequest>,
) -> Result<Json<IndexChangeResponse>, AppError> {
    Ok(Json(
        session_service::set_index(&state, host, id, IndexKind::Step, payload.index).await?,
    ))
}

/// Move the current phase.
#[utoipa::path(
    post,
    path = "/sessions/{id}/phase",
    tag = "sessions",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier")
    ),
    request_body = SetIndexRequest,
    responses(
        (status = 200, description = "Phase changed", body = IndexChangeResponse),
        (status = 400, description = "Index outside the authored range")
    )
)]
pub async fn set_phase(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SetIndexRequest>,
) -> Result<Json<IndexChangeResponse>, AppError> {
    Ok(Json(
        session_service::set_index(&state, host, id, IndexKind::Phase, payload.index).await?,
    ))
}

/// Start the session timer.
#[utoipa::path(
    post,
    path = "/sessions/{id}/timer/start",
    tag = "timer",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier")
    ),
    request_body = TimerStartRequest,
    responses((status = 200, description = "Timer running", body = TimerResponse))
)]
pub async fn start_timer(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<TimerStartRequest>>,
) -> Result<Json<TimerResponse>, AppError> {
    let command = TimerCommand::Start {
        duration_seconds: payload.duration_seconds,
        direction: payload.direction,
    };
    Ok(Json(timer_service::command(&state, host, id, command).await?))
}

/// Shift the timer value.
#[utoipa::path(
    post,
    path = "/sessions/{id}/timer/adjust",
    tag = "timer",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier")
    ),
    request_body = TimerAdjustRequest,
    responses((status = 200, description = "Timer adjusted", body = TimerResponse))
)]
pub async fn adjust_timer(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<TimerAdjustRequest>>,
) -> Result<Json<TimerResponse>, AppError> {
    let command = TimerCommand::Adjust {
        delta_seconds: payload.delta_seconds,
    };
    Ok(Json(timer_service::command(&state, host, id, command).await?))
}

/// Pause, resume or reset the timer.
#[utoipa::path(
    post,
    path = "/sessions/{id}/timer/{verb}",
    tag = "timer",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier"),
        ("verb" = String, Path, description = "pause, resume or reset")
    ),
    responses(
        (status = 200, description = "Timer updated", body = TimerResponse),
        (status = 409, description = "Verb not allowed from the current timer status")
    )
)]
pub async fn timer_verb(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path((id, verb)): Path<(Uuid, TimerVerb)>,
) -> Result<Json<TimerResponse>, AppError> {
    Ok(Json(
        timer_service::command(&state, host, id, verb.into()).await?,
    ))
}

/// Kick, block or unblock a participant.
#[utoipa::path(
    post,
    path = "/sessions/{id}/participants/{pid}/moderate",
    tag = "participants",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier"),
        ("pid" = Uuid, Path, description = "Participant identifier")
    ),
    request_body = ModerateRequest,
    responses(
        (status = 200, description = "Participant updated", body = ParticipantSummary),
        (status = 409, description = "Action not allowed from the participant's status")
    )
)]
pub async fn moderate_participant(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path((id, participant_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<ModerateRequest>,
) -> Result<Json<ParticipantSummary>, AppError> {
    Ok(Json(
        participant_service::moderate(&state, host, id, participant_id, payload.action).await?,
    ))
}

/// Override an artifact's state.
#[utoipa::path(
    post,
    path = "/sessions/{id}/artifacts/{key}/{action}",
    tag = "artifacts",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier"),
        ("key" = String, Path, description = "Artifact key"),
        ("action" = ArtifactAction, Path, description = "reveal, unlock, solve, fail or reset")
    ),
    responses(
        (status = 200, description = "Artifact state after the action", body = ArtifactActionResponse),
        (status = 409, description = "Edge not allowed from the artifact's state")
    )
)]
pub async fn artifact_action(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path((id, key, action)): Path<(Uuid, String, ArtifactAction)>,
) -> Result<Json<ArtifactActionResponse>, AppError> {
    Ok(Json(
        artifact_service::apply_override(&state, host, id, &key, action).await?,
    ))
}

/// Fire a trigger by hand.
#[utoipa::path(
    post,
    path = "/sessions/{id}/triggers/{tid}/fire",
    tag = "triggers",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier"),
        ("tid" = Uuid, Path, description = "Trigger identifier")
    ),
    request_body = FireTriggerRequest,
    responses(
        (status = 200, description = "Fired, or a no-op with its reason", body = FireTriggerResponse),
        (status = 409, description = "Trigger disabled or session not live")
    )
)]
pub async fn fire_trigger(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path((id, trigger_id)): Path<(Uuid, Uuid)>,
    Valid(Json(payload)): Valid<Json<FireTriggerRequest>>,
) -> Result<Json<FireTriggerResponse>, AppError> {
    Ok(Json(
        trigger_service::fire_manually(&state, host, id, trigger_id, &payload.idempotency_key)
            .await?,
    ))
}

/// Re-arm a trigger.
#[utoipa::path(
    post,
    path = "/sessions/{id}/triggers/{tid}/arm",
    tag = "triggers",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier"),
        ("tid" = Uuid, Path, description = "Trigger identifier")
    ),
    responses((status = 200, description = "Trigger armed", body = TriggerStatusResponse))
)]
pub async fn arm_trigger(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path((id, trigger_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<TriggerStatusResponse>, AppError> {
    Ok(Json(
        trigger_service::set_status(&state, host, id, trigger_id, true).await?,
    ))
}

/// Disable a trigger.
#[utoipa::path(
    post,
    path = "/sessions/{id}/triggers/{tid}/disable",
    tag = "triggers",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier"),
        ("tid" = Uuid, Path, description = "Trigger identifier")
    ),
    responses((status = 200, description = "Trigger disabled", body = TriggerStatusResponse))
)]
pub async fn disable_trigger(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path((id, trigger_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<TriggerStatusResponse>, AppError> {
    Ok(Json(
        trigger_service::set_status(&state, host, id, trigger_id, false).await?,
    ))
}

/// Disable every trigger of the session.
#[utoipa::path(
    post,
    path = "/sessions/{id}/triggers/disable-all",
    tag = "triggers",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier")
    ),
    responses((status = 200, description = "Triggers disabled", body = TriggerStatusResponse))
)]
pub async fn disable_all_triggers(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path(id): Path<Uuid>,
) -> Result<Json<TriggerStatusResponse>, AppError> {
    Ok(Json(trigger_service::disable_all(&state, host, id).await?))
}

/// Apply a time-bank delta.
#[utoipa::path(
    post,
    path = "/sessions/{id}/time-bank",
    tag = "ledgers",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier")
    ),
    request_body = TimeBankDeltaInput,
    responses(
        (status = 200, description = "Applied or replayed entry", body = TimeBankApplyResponse),
        (status = 409, description = "Balance would leave the clamp range")
    )
)]
pub async fn apply_time_bank(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<TimeBankDeltaInput>>,
) -> Result<Json<TimeBankApplyResponse>, AppError> {
    Ok(Json(
        ledger_service::apply_time_bank(&state, host, id, payload).await?,
    ))
}

/// Time-bank entries of the session, oldest first.
#[utoipa::path(
    get,
    path = "/sessions/{id}/time-bank",
    tag = "ledgers",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier")
    ),
    responses((status = 200, description = "Ledger", body = TimeBankLedgerView))
)]
pub async fn list_time_bank(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path(id): Path<Uuid>,
) -> Result<Json<TimeBankLedgerView>, AppError> {
    Ok(Json(ledger_service::list_time_bank(&state, host, id).await?))
}

/// Most recent session events.
#[utoipa::path(
    get,
    path = "/sessions/{id}/log",
    tag = "sessions",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier"),
        LogQuery
    ),
    responses((status = 200, description = "Event log", body = [SessionEventView]))
)]
pub async fn session_log(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<SessionEventView>>, AppError> {
    Ok(Json(
        session_service::list_log(&state, host, id, query.limit).await?,
    ))
}

/// Stream `play:{id}` to the facilitator console.
#[utoipa::path(
    get,
    path = "/sessions/{id}/stream",
    tag = "realtime",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Session identifier")
    ),
    responses(
        (status = 200, description = "Session event stream", content_type = "text/event-stream", body = String),
        (status = 409, description = "Session has no open channel")
    )
)]
pub async fn session_stream(
    State(state): State<SharedState>,
    Extension(Facilitator(host)): Extension<Facilitator>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    session_service::view(&state, host, id).await?;
    let subscription = realtime_service::subscribe(&state, id).await?;
    info!(session_id = %id, "facilitator stream connected");
    Ok(realtime_service::to_sse_stream(subscription, id))
}
