//! Post-commit event pipeline: sequence, fan out, audit, then let triggers react.

use std::collections::VecDeque;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::models::SessionEventEntity,
    services::{
        realtime_service::realtime_capability,
        sequencer::{Sequenced, next_seq},
        trigger_service,
    },
    state::{
        RealtimeMessage, SessionGuard, SharedState,
        events::{Actor, PlayEvent},
    },
};

/// Publish events that are already durable, then run the trigger cascade they cause.
///
/// Trigger follow-ups are queued behind the event that caused them, so they always get a
/// later sequence. Returns every message published, in order.
pub async fn dispatch(
    state: &SharedState,
    guard: &SessionGuard,
    actor: Actor,
    events: Vec<PlayEvent>,
) -> Vec<RealtimeMessage> {
    let mut queue: VecDeque<(Actor, PlayEvent)> =
        events.into_iter().map(|event| (actor, event)).collect();
    let mut published = Vec::new();
    let limit = state.config().max_trigger_cascade;

    while let Some((actor, event)) = queue.pop_front() {
        let (message, event_id) = publish(state, guard, actor, &event).await;
        published.push(message);

        if published.len() > limit {
            warn!(
                session_id = %guard.session_id(),
                event = event.kind(),
                limit,
                "trigger cascade limit reached; skipping evaluation"
            );
            continue;
        }

        let follow_ups = trigger_service::on_event(state, guard, &event, event_id).await;
        queue.extend(follow_ups);
    }

    published
}

async fn publish(
    state: &SharedState,
    guard: &SessionGuard,
    actor: Actor,
    event: &PlayEvent,
) -> (RealtimeMessage, Uuid) {
    let session_id = guard.session_id();
    let Sequenced { seq, degraded } = next_seq(state, guard).await;
    let message = RealtimeMessage::from_event(event, seq, degraded);

    let status_change = match event {
        PlayEvent::SessionStatusChanged { to, .. } => {
            Some(realtime_capability(*to, state.config().poll_interval))
        }
        _ => None,
    };
    if status_change.is_some_and(|capability| capability.enabled) {
        state.channels().open(session_id);
    }

    match state.channels().get(session_id) {
        Some(hub) => {
            let receivers = hub.broadcast(message.clone());
            debug!(session_id = %session_id, seq, kind = %message.kind, receivers, "event broadcast");
        }
        None => debug!(session_id = %session_id, seq, kind = %message.kind, "no open channel; event not broadcast"),
    }

    if status_change.is_some_and(|capability| !capability.enabled)
        && state.channels().teardown(session_id)
    {
        info!(session_id = %session_id, "realtime channel torn down");
    }

    let event_id = Uuid::new_v4();
    let row = SessionEventEntity {
        id: event_id,
        session_id,
        seq,
        degraded,
        event_type: message.kind.clone(),
        actor: actor.into(),
        payload: message.payload.clone(),
        created_at: OffsetDateTime::now_utc(),
    };
    if let Err(err) = state
        .gateway_call(move |gateway| gateway.append_session_event(row))
        .await
    {
        warn!(session_id = %session_id, seq, error = %err, "failed to append session event");
    }

    (message, event_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::gateway::PlayGateway,
        services::test_support::{TestSession, draft_session},
    };

    #[tokio::test]
    async fn events_are_sequenced_and_audited() {
        let TestSession {
            state,
            actor,
            gateway,
            session_id,
            ..
        } = draft_session().await;
        let guard = actor.lock().await;

        let published = dispatch(
            &state,
            &guard,
            Actor::system(),
            vec![
                PlayEvent::Message { text: "one".into() },
                PlayEvent::Message { text: "two".into() },
            ],
        )
        .await;

        assert_eq!(published.len(), 2);
        assert_eq!(published[1].seq, published[0].seq + 1);
        let log = gateway.list_session_events(session_id, 10).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].event_type, "message");
    }

    #[tokio::test]
    async fn audit_failure_does_not_block_publication() {
        let TestSession {
            state,
            actor,
            gateway,
            session_id,
            ..
        } = draft_session().await;
        let hub = state.channels().open(session_id);
        let mut receiver = hub.subscribe();
        let guard = actor.lock().await;
        gateway.set_offline(true);

        let published = dispatch(
            &state,
            &guard,
            Actor::system(),
            vec![PlayEvent::Message { text: "hi".into() }],
        )
        .await;

        assert!(published[0].degraded);
        assert_eq!(receiver.recv().await.unwrap(), published[0]);
    }
}
