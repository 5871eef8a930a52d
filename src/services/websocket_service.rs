use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::ws::ParticipantInboundMessage,
    error::ServiceError,
    services::{
        participant_service,
        realtime_service::{self, Subscription},
    },
    state::{RealtimeMessage, SharedState, participant},
};

const IDENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Failures while serving a participant socket.
#[derive(Debug, Error)]
enum SocketError {
    /// Writer channel closed; the connection is gone.
    #[error("connection closed")]
    ConnectionClosed,
    /// The participant may no longer use this socket.
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

/// Serve one participant WebSocket: identify, then forward `play:{session_id}` and accept
/// heartbeats until either side closes.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let initial_message = match tokio::time::timeout(IDENT_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(error = %err, "websocket receive error");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!("websocket identification timed out");
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let token = match serde_json::from_str::<ParticipantInboundMessage>(&initial_message) {
        Ok(message) => match message.identification_token() {
            Some(token) => token.to_owned(),
            None => {
                warn!("first message was not identification");
                let _ = outbound_tx.send(Message::Close(None));
                finalize(writer_task, outbound_tx).await;
                return;
            }
        },
        Err(err) => {
            warn!(error = %err, "failed to parse participant message");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let (participant_id, session_id, subscription) = match identify(&state, &token).await {
        Ok(identified) => identified,
        Err(err) => {
            warn!(error = %err, "participant socket refused");
            let _ = send_json(&outbound_tx, &error_message(&err));
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };
    info!(session_id = %session_id, participant_id = %participant_id, "participant socket identified");

    let identified = RealtimeMessage {
        kind: "identified".into(),
        payload: serde_json::json!({
            "participant_id": participant_id,
            "session_id": session_id,
        }),
        seq: subscription.cursor.last_seen().unwrap_or(0),
        degraded: false,
    };
    if send_json(&outbound_tx, &identified).is_err() {
        finalize(writer_task, outbound_tx).await;
        return;
    }

    let forwarder = spawn_forwarder(
        state.clone(),
        subscription,
        outbound_tx.clone(),
        session_id,
        participant_id,
    );

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ParticipantInboundMessage>(&text) {
                Ok(ParticipantInboundMessage::Heartbeat) => {
                    if let Err(err) = heartbeat(&state, &token, &outbound_tx).await {
                        warn!(participant_id = %participant_id, error = %err, "closing participant socket");
                        let _ = outbound_tx.send(Message::Close(None));
                        break;
                    }
                }
                Ok(ParticipantInboundMessage::Identification { .. }) => {
                    warn!(participant_id = %participant_id, "ignoring duplicate identification message");
                }
                Ok(ParticipantInboundMessage::Unknown) => {
                    debug!(participant_id = %participant_id, payload = %text, "ignoring unknown message");
                }
                Err(err) => {
                    warn!(participant_id = %participant_id, error = %err, "failed to parse participant message");
                }
            },
            Ok(Message::Ping(payload)) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                info!(participant_id = %participant_id, "participant socket closed");
                let _ = outbound_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(participant_id = %participant_id, error = %err, "websocket error");
                break;
            }
        }
    }

    forwarder.abort();
    info!(session_id = %session_id, participant_id = %participant_id, "participant socket disconnected");
    finalize(writer_task, outbound_tx).await;
}

/// Resolve the token, check the participant may still play, and subscribe to the session.
async fn identify(
    state: &SharedState,
    token: &str,
) -> Result<(Uuid, Uuid, Subscription), ServiceError> {
    let (actor, participant_id) = participant_service::authenticate(state, token).await?;
    let session_id = actor.id();
    ensure_still_allowed(state, session_id, participant_id).await?;
    let subscription = realtime_service::subscribe(state, session_id).await?;
    Ok((participant_id, session_id, subscription))
}

/// Re-run the participant checks against the live session: a kick, block or token expiry
/// after identification ends the socket.
async fn ensure_still_allowed(
    state: &SharedState,
    session_id: Uuid,
    participant_id: Uuid,
) -> Result<(), ServiceError> {
    let actor = state.session(session_id).await?;
    let live = actor.read().await;
    let caller = live
        .participants
        .get(&participant_id)
        .ok_or_else(|| ServiceError::NotFound(format!("participant `{participant_id}`")))?;
    participant::authorize(caller, time::OffsetDateTime::now_utc())?;
    Ok(())
}

async fn heartbeat(
    state: &SharedState,
    token: &str,
    tx: &mpsc::UnboundedSender<Message>,
) -> Result<(), SocketError> {
    let response = participant_service::heartbeat(state, token).await?;
    let ack = RealtimeMessage {
        kind: "heartbeat_ack".into(),
        payload: serde_json::to_value(&response).unwrap_or_default(),
        seq: 0,
        degraded: false,
    };
    send_json(tx, &ack)
}

fn spawn_forwarder(
    state: SharedState,
    subscription: Subscription,
    tx: mpsc::UnboundedSender<Message>,
    session_id: Uuid,
    participant_id: Uuid,
) -> JoinHandle<()> {
    let Subscription {
        mut receiver,
        mut cursor,
    } = subscription;
    tokio::spawn(async move {
        while let Some(batch) = realtime_service::next_batch(&mut receiver, &mut cursor).await {
            if let Err(err) = ensure_still_allowed(&state, session_id, participant_id).await {
                warn!(session_id = %session_id, participant_id = %participant_id, error = %err, "participant no longer allowed; closing socket");
                let _ = send_json(&tx, &error_message(&err));
                let _ = tx.send(Message::Close(None));
                return;
            }
            for message in &batch {
                if send_json(&tx, message).is_err() {
                    return;
                }
            }
        }
        debug!(session_id = %session_id, "realtime channel closed; closing participant socket");
        let _ = tx.send(Message::Close(None));
    })
}

fn error_message(err: &ServiceError) -> RealtimeMessage {
    RealtimeMessage {
        kind: "error".into(),
        payload: serde_json::json!({ "message": err.to_string() }),
        seq: 0,
        degraded: false,
    }
}

/// Serialize a payload and push it onto the writer channel.
///
/// A serialization failure is logged and swallowed; only a closed writer is an error.
fn send_json<T>(tx: &mpsc::UnboundedSender<Message>, value: &T) -> Result<(), SocketError>
where
    T: ?Sized + serde::Serialize + std::fmt::Debug,
{
    let payload = match serde_json::to_string(value) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialize message `{value:?}`");
            return Ok(());
        }
    };
    tx.send(Message::Text(payload.into()))
        .map_err(|_| SocketError::ConnectionClosed)
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}
