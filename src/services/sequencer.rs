//! Broadcast sequencing: gateway-assigned sequence numbers with a wall-clock fallback, and
//! the receiver-side cursor that checks them.

use time::OffsetDateTime;
use tracing::warn;

use crate::state::{SessionGuard, SharedState};

/// Sequence number assigned to one outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequenced {
    /// The sequence value.
    pub seq: u64,
    /// `true` when the gateway counter was unavailable and `seq` is wall-clock derived.
    pub degraded: bool,
}

/// Next sequence for the guarded session.
///
/// Increments the gateway's durable counter. When that fails the event is still delivered
/// with a millisecond timestamp flagged `degraded`, and the actor's cached `last_seq` is left
/// untouched.
pub async fn next_seq(state: &SharedState, guard: &SessionGuard) -> Sequenced {
    let session_id = guard.session_id();
    match state
        .gateway_call(move |gateway| gateway.increment_broadcast_seq(session_id))
        .await
    {
        Ok(seq) => {
            let mut live = guard.write().await;
            live.last_seq = live.last_seq.max(seq);
            Sequenced {
                seq,
                degraded: false,
            }
        }
        Err(err) => {
            let seq = wall_clock_seq();
            warn!(session_id = %session_id, seq, error = %err, "broadcast counter unavailable; using degraded sequence");
            Sequenced {
                seq,
                degraded: true,
            }
        }
    }
}

fn wall_clock_seq() -> u64 {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    millis.max(0) as u64
}

/// What a receiver should do with an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// In order; apply it.
    Deliver,
    /// Already seen; drop it.
    Duplicate,
    /// Messages are missing; refetch the snapshot.
    Gap {
        /// Sequence the receiver was waiting for.
        expected: u64,
        /// Sequence that arrived.
        got: u64,
    },
}

/// Receiver-side ordering check over gateway-assigned sequences.
///
/// Degraded messages are always delivered and never move the cursor.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceCursor {
    last_seen: Option<u64>,
}

impl SequenceCursor {
    /// Cursor that has already seen `last_seen`.
    pub fn at(last_seen: u64) -> Self {
        Self {
            last_seen: Some(last_seen),
        }
    }

    /// Last gateway sequence accepted.
    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    /// Forget the position, e.g. after the client refetched its snapshot.
    pub fn reset(&mut self) {
        self.last_seen = None;
    }

    /// Classify a message and advance on in-order delivery.
    pub fn observe(&mut self, seq: u64, degraded: bool) -> Delivery {
        if degraded {
            return Delivery::Deliver;
        }
        match self.last_seen {
            None => {
                self.last_seen = Some(seq);
                Delivery::Deliver
            }
            Some(last) if seq <= last => Delivery::Duplicate,
            Some(last) if seq == last + 1 => {
                self.last_seen = Some(seq);
                Delivery::Deliver
            }
            Some(last) => Delivery::Gap {
                expected: last + 1,
                got: seq,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{TestSession, draft_session};

    #[test]
    fn cursor_flags_gaps_and_duplicates() {
        let mut cursor = SequenceCursor::at(4);
        assert_eq!(cursor.observe(5, false), Delivery::Deliver);
        assert_eq!(cursor.observe(5, false), Delivery::Duplicate);
        assert_eq!(
            cursor.observe(8, false),
            Delivery::Gap {
                expected: 6,
                got: 8
            }
        );
        assert_eq!(cursor.last_seen(), Some(5));
    }

    #[test]
    fn cursor_tolerates_degraded_messages() {
        let mut cursor = SequenceCursor::at(2);
        assert_eq!(cursor.observe(1_700_000_000_000, true), Delivery::Deliver);
        assert_eq!(cursor.observe(3, false), Delivery::Deliver);
    }

    #[tokio::test]
    async fn gateway_sequence_is_strictly_increasing() {
        let TestSession { state, actor, .. } = draft_session().await;
        let guard = actor.lock().await;

        let first = next_seq(&state, &guard).await;
        let second = next_seq(&state, &guard).await;

        assert!(!first.degraded && !second.degraded);
        assert_eq!(second.seq, first.seq + 1);
        assert_eq!(guard.read().await.last_seq, second.seq);
    }

    #[tokio::test]
    async fn outage_falls_back_to_flagged_wall_clock() {
        let TestSession {
            state,
            actor,
            gateway,
            ..
        } = draft_session().await;
        let guard = actor.lock().await;
        let before = next_seq(&state, &guard).await;

        gateway.set_offline(true);
        let fallback = next_seq(&state, &guard).await;

        assert!(fallback.degraded);
        assert_eq!(guard.read().await.last_seq, before.seq);
    }
}
