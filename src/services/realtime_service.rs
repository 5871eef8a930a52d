use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Serialize;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    error::ServiceError,
    services::sequencer::{Delivery, SequenceCursor},
    state::{RealtimeMessage, SharedState, session_machine::SessionStatus},
};

/// Whether clients should hold a realtime channel or poll, decided per session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct RealtimeCapability {
    /// Push channel available.
    pub enabled: bool,
    /// Polling interval when push is unavailable; absent when nothing changes any more.
    pub poll_interval_ms: Option<u64>,
}

/// Pure capability decision for a session status.
pub fn realtime_capability(status: SessionStatus, poll_interval: Duration) -> RealtimeCapability {
    match status {
        SessionStatus::Lobby
        | SessionStatus::Active
        | SessionStatus::Paused
        | SessionStatus::Locked => RealtimeCapability {
            enabled: true,
            poll_interval_ms: None,
        },
        SessionStatus::Draft | SessionStatus::Ended => RealtimeCapability {
            enabled: false,
            poll_interval_ms: Some(poll_interval.as_millis() as u64),
        },
        SessionStatus::Cancelled | SessionStatus::Archived => RealtimeCapability {
            enabled: false,
            poll_interval_ms: None,
        },
    }
}

/// Live subscription to a session channel.
pub struct Subscription {
    /// Receiver on the session hub.
    pub receiver: broadcast::Receiver<RealtimeMessage>,
    /// Cursor positioned at the sequence the subscriber's snapshot reflects.
    pub cursor: SequenceCursor,
}

/// Subscribe to `play:{session_id}`; refused while the session has no open channel.
pub async fn subscribe(state: &SharedState, session_id: Uuid) -> Result<Subscription, ServiceError> {
    let actor = state.session(session_id).await?;
    let live = actor.read().await;
    let status = live.status();
    let Some(hub) = state.channels().get(session_id) else {
        return Err(ServiceError::invalid_transition(
            format!("no realtime channel while the session is {status}"),
            status,
        ));
    };
    Ok(Subscription {
        receiver: hub.subscribe(),
        cursor: SequenceCursor::at(live.last_seq),
    })
}

/// Messages to forward for one received message: drops duplicates, and prefixes a
/// `resync_required` marker when a gap shows up.
pub fn route(cursor: &mut SequenceCursor, message: RealtimeMessage) -> Vec<RealtimeMessage> {
    match cursor.observe(message.seq, message.degraded) {
        Delivery::Deliver => vec![message],
        Delivery::Duplicate => Vec::new(),
        Delivery::Gap { expected, got } => {
            warn!(expected, got, "sequence gap on realtime channel; asking client to resync");
            let marker = RealtimeMessage::resync_required(cursor.last_seen());
            cursor.reset();
            cursor.observe(message.seq, message.degraded);
            vec![marker, message]
        }
    }
}

/// Receive the next batch of messages to forward, or `None` once the channel closed.
pub async fn next_batch(
    receiver: &mut broadcast::Receiver<RealtimeMessage>,
    cursor: &mut SequenceCursor,
) -> Option<Vec<RealtimeMessage>> {
    match receiver.recv().await {
        Ok(message) => Some(route(cursor, message)),
        Err(RecvError::Closed) => None,
        Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, "realtime subscriber lagged; asking client to resync");
            let marker = RealtimeMessage::resync_required(cursor.last_seen());
            cursor.reset();
            Some(vec![marker])
        }
    }
}

fn to_event(message: &RealtimeMessage) -> Option<Event> {
    match Event::default().event(message.kind.clone()).json_data(message) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(error = %err, kind = %message.kind, "failed to serialise realtime message");
            None
        }
    }
}

/// Convert a subscription into an SSE response, forwarding messages until the client
/// disconnects or the channel is torn down.
pub fn to_sse_stream(
    subscription: Subscription,
    session_id: Uuid,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let Subscription {
        mut receiver,
        mut cursor,
    } = subscription;
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        'forward: loop {
            tokio::select! {
                _ = tx.closed() => break,
                batch = next_batch(&mut receiver, &mut cursor) => {
                    let Some(batch) = batch else { break };
                    for message in &batch {
                        let Some(event) = to_event(message) else { continue };
                        if tx.send(Ok(event)).await.is_err() {
                            break 'forward;
                        }
                    }
                }
            }
        }
        info!(session_id = %session_id, "facilitator SSE stream disconnected");
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(seq: u64) -> RealtimeMessage {
        RealtimeMessage {
            kind: "message".into(),
            payload: serde_json::Value::Null,
            seq,
            degraded: false,
        }
    }

    #[test]
    fn capability_follows_status() {
        let poll = Duration::from_millis(3000);
        assert!(realtime_capability(SessionStatus::Locked, poll).enabled);
        assert_eq!(
            realtime_capability(SessionStatus::Draft, poll),
            RealtimeCapability {
                enabled: false,
                poll_interval_ms: Some(3000)
            }
        );
        assert_eq!(
            realtime_capability(SessionStatus::Archived, poll).poll_interval_ms,
            None
        );
    }

    #[test]
    fn gap_inserts_resync_marker() {
        let mut cursor = SequenceCursor::at(3);
        let forwarded = route(&mut cursor, message(6));
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[0].kind, "resync_required");
        assert_eq!(forwarded[1].seq, 6);
        assert!(route(&mut cursor, message(6)).is_empty());
        assert_eq!(route(&mut cursor, message(7)).len(), 1);
    }

    #[tokio::test]
    async fn lagged_receiver_gets_resync() {
        let hub = crate::state::RealtimeHub::new(1);
        let mut receiver = hub.subscribe();
        hub.broadcast(message(1));
        hub.broadcast(message(2));
        let mut cursor = SequenceCursor::default();

        let batch = next_batch(&mut receiver, &mut cursor).await.unwrap();
        assert_eq!(batch[0].kind, "resync_required");
    }
}
