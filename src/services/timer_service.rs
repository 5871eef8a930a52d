use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dto::session::{TimerResponse, TimerView},
    error::ServiceError,
    services::{
        pipeline,
        session_service::{ensure_host, ensure_live, save_session},
    },
    state::{
        SessionGuard, SharedState,
        events::{Actor, PlayEvent},
        timer::TimerDirection,
    },
};

/// Timer verbs shared by the facilitator routes and trigger actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TimerCommand {
    /// Start a fresh run.
    Start {
        /// Initial value in seconds.
        duration_seconds: i64,
        /// Counting direction.
        #[serde(default)]
        direction: TimerDirection,
    },
    /// Freeze the current value.
    Pause,
    /// Continue from the frozen value.
    Resume,
    /// Back to idle.
    Reset,
    /// Shift the current value.
    Adjust {
        /// Seconds added, or removed when negative.
        delta_seconds: i64,
    },
}

/// Run a timer command as the facilitator.
pub async fn command(
    state: &SharedState,
    host: Uuid,
    session_id: Uuid,
    command: TimerCommand,
) -> Result<TimerResponse, ServiceError> {
    let actor = state.session(session_id).await?;
    let guard = actor.lock().await;
    {
        let live = guard.read().await;
        ensure_host(&live, host)?;
        ensure_live(&live)?;
    }

    let events = apply_locked(state, &guard, command).await?;
    let published = pipeline::dispatch(state, &guard, Actor::host(host), events).await;
    let timer = TimerView::at(&guard.read().await.session.timer, OffsetDateTime::now_utc());
    Ok(TimerResponse { timer, published })
}

/// Apply a timer command under the writer gate and schedule expiry for a running countdown.
pub(crate) async fn apply_locked(
    state: &SharedState,
    guard: &SessionGuard,
    command: TimerCommand,
) -> Result<Vec<PlayEvent>, ServiceError> {
    let now = OffsetDateTime::now_utc();
    let mut session = guard.read().await.session.clone();
    let timer = &mut session.timer;
    match command {
        TimerCommand::Start {
            duration_seconds,
            direction,
        } => timer.start(duration_seconds, direction, now)?,
        TimerCommand::Pause => timer.pause(now)?,
        TimerCommand::Resume => timer.resume(now)?,
        TimerCommand::Reset => timer.reset(),
        TimerCommand::Adjust { delta_seconds } => timer.adjust(delta_seconds, now)?,
    }
    let timer = session.timer.clone();

    save_session(state, session.clone()).await?;
    guard.write().await.session = session;
    debug!(session_id = %guard.session_id(), ?command, status = ?timer.status, "timer changed");

    if let Some(at) = timer.expires_at() {
        schedule_expiry(state, guard.session_id(), timer.generation, at);
    }
    Ok(vec![PlayEvent::TimerChanged { timer }])
}

/// Wake up when a countdown should reach zero.
///
/// The task carries the timer generation it was scheduled for; any later change bumps the
/// generation and turns this wake-up into a no-op.
pub(crate) fn schedule_expiry(
    state: &SharedState,
    session_id: Uuid,
    generation: u64,
    at: OffsetDateTime,
) {
    let state = state.clone();
    let wait: Duration = (at - OffsetDateTime::now_utc())
        .try_into()
        .unwrap_or_default();
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        if let Err(err) = expire(&state, session_id, generation).await {
            warn!(session_id = %session_id, generation, error = %err, "timer expiry failed");
        }
    });
}

/// Finish the countdown if it is still the same run and has reached zero.
pub(crate) async fn expire(
    state: &SharedState,
    session_id: Uuid,
    generation: u64,
) -> Result<bool, ServiceError> {
    let actor = state.session(session_id).await?;
    let guard = actor.lock().await;
    let now = OffsetDateTime::now_utc();

    let mut session = guard.read().await.session.clone();
    if session.timer.generation != generation {
        debug!(session_id = %session_id, generation, "stale timer expiry ignored");
        return Ok(false);
    }
    if !session.timer.finish_if_expired(now) {
        return Ok(false);
    }
    let timer = session.timer.clone();
    save_session(state, session.clone()).await?;
    guard.write().await.session = session;
    info!(session_id = %session_id, "countdown finished");

    pipeline::dispatch(
        state,
        &guard,
        Actor::system(),
        vec![PlayEvent::TimerChanged { timer }, PlayEvent::TimerEnded],
    )
    .await;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::test_support::{TestSession, active_with_triggers},
        state::timer::TimerStatus,
    };

    #[tokio::test]
    async fn pause_freezes_and_resume_continues() {
        let TestSession {
            state,
            host_id,
            session_id,
            ..
        } = active_with_triggers(Vec::new()).await;

        let started = command(
            &state,
            host_id,
            session_id,
            TimerCommand::Start {
                duration_seconds: 300,
                direction: TimerDirection::Countdown,
            },
        )
        .await
        .unwrap();
        assert_eq!(started.timer.state.status, TimerStatus::Running);

        let paused = command(&state, host_id, session_id, TimerCommand::Pause)
            .await
            .unwrap();
        assert_eq!(paused.timer.state.status, TimerStatus::Paused);
        assert!(paused.timer.state.anchor.is_none());
        assert!(paused.timer.value_seconds <= 300);

        let resumed = command(&state, host_id, session_id, TimerCommand::Resume)
            .await
            .unwrap();
        assert_eq!(resumed.timer.state.status, TimerStatus::Running);
        assert_eq!(resumed.published[0].kind, "timer_changed");
    }

    #[tokio::test]
    async fn pausing_an_idle_timer_is_rejected() {
        let TestSession {
            state,
            host_id,
            session_id,
            ..
        } = active_with_triggers(Vec::new()).await;

        let err = command(&state, host_id, session_id, TimerCommand::Pause)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { ref current, .. } if current == "idle"));
    }

    #[tokio::test]
    async fn stale_generation_does_not_finish_the_timer() {
        let TestSession {
            state,
            host_id,
            session_id,
            actor,
            ..
        } = active_with_triggers(Vec::new()).await;
        command(
            &state,
            host_id,
            session_id,
            TimerCommand::Start {
                duration_seconds: 600,
                direction: TimerDirection::Countdown,
            },
        )
        .await
        .unwrap();
        let generation = actor.read().await.session.timer.generation;

        assert!(!expire(&state, session_id, generation - 1).await.unwrap());
        assert!(!expire(&state, session_id, generation).await.unwrap());
        assert_eq!(
            actor.read().await.session.timer.status,
            TimerStatus::Running
        );
    }

    #[tokio::test]
    async fn countdown_expiry_publishes_timer_ended() {
        let TestSession {
            state,
            session_id,
            actor,
            ..
        } = active_with_triggers(Vec::new()).await;
        {
            let guard = actor.lock().await;
            let mut live = guard.write().await;
            let now = OffsetDateTime::now_utc();
            live.session.timer.start(5, TimerDirection::Countdown, now).unwrap();
            live.session.timer.anchor = Some(now - time::Duration::seconds(10));
        }
        let generation = actor.read().await.session.timer.generation;
        let mut receiver = state.channels().get(session_id).unwrap().subscribe();

        assert!(expire(&state, session_id, generation).await.unwrap());

        assert_eq!(receiver.recv().await.unwrap().kind, "timer_changed");
        assert_eq!(receiver.recv().await.unwrap().kind, "timer_ended");
        assert_eq!(
            actor.read().await.session.timer.status,
            TimerStatus::Finished
        );
    }
}
