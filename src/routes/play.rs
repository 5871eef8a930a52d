use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dto::participant::{
        HeartbeatResponse, JoinRequest, JoinResponse, KeypadRequest, KeypadResponse,
        ParticipantCommandResponse, ParticipantStateView, ReadyRequest,
    },
    error::AppError,
    routes::identity::participant_token,
    services::{artifact_service, participant_service, websocket_service},
    state::SharedState,
};

/// Participant endpoints. Everything but `/play/join` authenticates with the bearer token.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/play/join", post(join))
        .route("/play/heartbeat", post(heartbeat))
        .route("/play/ready", post(ready))
        .route("/play/leave", post(leave))
        .route("/play/state", get(state_view))
        .route("/play/artifacts/{key}/keypad", post(submit_keypad))
        .route("/play/ws", get(ws_handler))
}

/// Join a session with its join code.
#[utoipa::path(
    post,
    path = "/play/join",
    tag = "play",
    request_body = JoinRequest,
    responses(
        (status = 201, description = "Joined or rejoined", body = JoinResponse),
        (status = 403, description = "Participant was kicked or blocked"),
        (status = 404, description = "Unknown join code"),
        (status = 409, description = "Session closed to joins or full")
    )
)]
pub async fn join(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<JoinRequest>>,
) -> Result<(StatusCode, Json<JoinResponse>), AppError> {
    let joined = participant_service::join(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(joined)))
}

/// Refresh presence.
#[utoipa::path(
    post,
    path = "/play/heartbeat",
    tag = "play",
    params(("x-participant-token" = String, Header, description = "Participant bearer token")),
    responses(
        (status = 200, description = "Presence refreshed", body = HeartbeatResponse),
        (status = 401, description = "Unknown or expired token"),
        (status = 403, description = "Participant was kicked or blocked")
    )
)]
pub async fn heartbeat(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let token = participant_token(&headers)?;
    Ok(Json(participant_service::heartbeat(&state, token).await?))
}

/// Toggle the ready flag.
#[utoipa::path(
    post,
    path = "/play/ready",
    tag = "play",
    params(("x-participant-token" = String, Header, description = "Participant bearer token")),
    request_body = ReadyRequest,
    responses((status = 200, description = "Ready flag stored", body = ParticipantCommandResponse))
)]
pub async fn ready(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<ReadyRequest>,
) -> Result<Json<ParticipantCommandResponse>, AppError> {
    let token = participant_token(&headers)?;
    Ok(Json(
        participant_service::set_ready(&state, token, payload.ready).await?,
    ))
}

/// Leave the session.
#[utoipa::path(
    post,
    path = "/play/leave",
    tag = "play",
    params(("x-participant-token" = String, Header, description = "Participant bearer token")),
    responses((status = 200, description = "Participant left", body = ParticipantCommandResponse))
)]
pub async fn leave(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<ParticipantCommandResponse>, AppError> {
    let token = participant_token(&headers)?;
    Ok(Json(participant_service::leave(&state, token).await?))
}

/// Everything the participant may currently see.
#[utoipa::path(
    get,
    path = "/play/state",
    tag = "play",
    params(("x-participant-token" = String, Header, description = "Participant bearer token")),
    responses((status = 200, description = "Participant snapshot", body = ParticipantStateView))
)]
pub async fn state_view(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<ParticipantStateView>, AppError> {
    let token = participant_token(&headers)?;
    Ok(Json(participant_service::state_view(&state, token).await?))
}

/// Submit a code to a keypad artifact.
#[utoipa::path(
    post,
    path = "/play/artifacts/{key}/keypad",
    tag = "play",
    params(
        ("x-participant-token" = String, Header, description = "Participant bearer token"),
        ("key" = String, Path, description = "Artifact key")
    ),
    request_body = KeypadRequest,
    responses(
        (status = 200, description = "Keypad verdict", body = KeypadResponse),
        (status = 409, description = "Artifact not accepting codes")
    )
)]
pub async fn submit_keypad(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Valid(Json(payload)): Valid<Json<KeypadRequest>>,
) -> Result<Json<KeypadResponse>, AppError> {
    let token = participant_token(&headers)?;
    Ok(Json(
        artifact_service::submit_keypad(&state, token, &key, &payload.code).await?,
    ))
}

/// Upgrade to the participant WebSocket. The first frame must carry the token.
#[utoipa::path(
    get,
    path = "/play/ws",
    tag = "realtime",
    responses((status = 101, description = "Switching protocols to WebSocket"))
)]
pub async fn ws_handler(
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket_service::handle_socket(state, socket))
}
