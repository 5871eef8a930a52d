//! Trigger engine: evaluates armed triggers against committed events and runs their actions
//! through the owning subsystems.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::models::{TriggerEntity, TriggerFireClaim, TriggerFireOutcome},
    dto::{
        format_optional, format_timestamp,
        trigger::{FireTriggerResponse, NoopReason, TriggerStatusResponse, TriggerView},
    },
    error::ServiceError,
    services::{
        artifact_service, ledger_service, pipeline,
        session_service::{IndexKind, advance_locked, ensure_host, ensure_live},
        timer_service::{self, TimerCommand},
    },
    state::{
        SessionGuard, SharedState,
        artifact::ArtifactAction,
        events::{Actor, PlayEvent},
        session::LiveSession,
        trigger::{self, TriggerAction, TriggerStatus},
    },
};

/// Result of one claim-and-run attempt.
#[derive(Debug)]
pub(crate) enum FireOutcome {
    Fired {
        fired_count: u32,
        fired_at: OffsetDateTime,
        events: Vec<PlayEvent>,
    },
    Noop {
        reason: NoopReason,
        original_fired_at: Option<OffsetDateTime>,
        /// Events of ledger actions recovered on an idempotent replay.
        events: Vec<PlayEvent>,
    },
}

/// Ledger actions carry a per-action key, so running them again under the same firing key
/// applies each at most once.
fn reruns_on_replay(action: &TriggerAction) -> bool {
    matches!(
        action,
        TriggerAction::AdjustTimeBank { .. } | TriggerAction::GrantCurrency { .. }
    )
}

fn trigger_in(live: &LiveSession, trigger_id: Uuid) -> Result<TriggerEntity, ServiceError> {
    live.triggers
        .get(&trigger_id)
        .cloned()
        .ok_or_else(|| ServiceError::NotFound(format!("trigger `{trigger_id}`")))
}

/// Claim a firing at the gateway and, when it is new, run every action in order.
///
/// A failing action is logged and skipped; the remaining actions still run. Replaying the
/// same key runs the ledger actions again so a write lost after the claim is recovered.
pub(crate) async fn fire_now(
    state: &SharedState,
    guard: &SessionGuard,
    trigger_id: Uuid,
    idempotency_key: String,
) -> Result<FireOutcome, ServiceError> {
    let trigger = trigger_in(&*guard.read().await, trigger_id)?;
    let claim = TriggerFireClaim {
        session_id: guard.session_id(),
        trigger_id,
        execute_once: trigger.execute_once,
        idempotency_key: idempotency_key.clone(),
        status_after: trigger::status_after_fire(&trigger),
        fired_at: OffsetDateTime::now_utc(),
    };
    let status_after = claim.status_after;
    let outcome = state
        .gateway_call(move |gateway| gateway.claim_trigger_fire(claim))
        .await?;

    let (fired_count, fired_at) = match outcome {
        TriggerFireOutcome::Fired {
            fired_count,
            fired_at,
        } => (fired_count, fired_at),
        TriggerFireOutcome::Exhausted { .. } => {
            return Ok(FireOutcome::Noop {
                reason: NoopReason::ExecuteOnceAlreadyFired,
                original_fired_at: trigger.last_fired_at,
                events: Vec::new(),
            });
        }
        TriggerFireOutcome::Replay {
            original_fired_at, ..
        } => {
            let events =
                run_actions(state, guard, &trigger, &idempotency_key, reruns_on_replay).await;
            if !events.is_empty() {
                info!(
                    session_id = %guard.session_id(),
                    trigger_id = %trigger_id,
                    key = %idempotency_key,
                    recovered = events.len(),
                    "trigger replay recovered ledger actions"
                );
            }
            return Ok(FireOutcome::Noop {
                reason: NoopReason::IdempotencyReplay,
                original_fired_at: Some(original_fired_at),
                events,
            });
        }
    };

    if let Some(live) = guard.write().await.triggers.get_mut(&trigger_id) {
        live.fired_count = fired_count;
        live.last_fired_at = Some(fired_at);
        live.status = status_after;
    }
    info!(
        session_id = %guard.session_id(),
        trigger_id = %trigger_id,
        fired_count,
        key = %idempotency_key,
        "trigger fired"
    );

    let mut events = vec![PlayEvent::TriggerFired {
        trigger_id,
        name: trigger.name.clone(),
        fired_count,
    }];
    events.extend(run_actions(state, guard, &trigger, &idempotency_key, |_| true).await);

    Ok(FireOutcome::Fired {
        fired_count,
        fired_at,
        events,
    })
}

async fn run_actions(
    state: &SharedState,
    guard: &SessionGuard,
    trigger: &TriggerEntity,
    key: &str,
    selected: impl Fn(&TriggerAction) -> bool,
) -> Vec<PlayEvent> {
    let mut events = Vec::new();
    for (index, action) in trigger.actions.iter().enumerate() {
        if !selected(action) {
            continue;
        }
        match run_action(state, guard, trigger, index, action, key).await {
            Ok(produced) => events.extend(produced),
            Err(err) => warn!(
                session_id = %guard.session_id(),
                trigger_id = %trigger.id,
                action = index,
                error = %err,
                "trigger action failed"
            ),
        }
    }
    events
}

async fn artifact_events(
    state: &SharedState,
    guard: &SessionGuard,
    key: &str,
    action: ArtifactAction,
) -> Result<Vec<PlayEvent>, ServiceError> {
    let (_, _, events) = artifact_service::apply_locked(state, guard, key, action).await?;
    Ok(events)
}

async fn run_action(
    state: &SharedState,
    guard: &SessionGuard,
    trigger: &TriggerEntity,
    index: usize,
    action: &TriggerAction,
    key: &str,
) -> Result<Vec<PlayEvent>, ServiceError> {
    match action {
        TriggerAction::RevealArtifact { artifact } => {
            artifact_events(state, guard, artifact, ArtifactAction::Reveal).await
        }
        TriggerAction::HideArtifact { artifact } => {
            artifact_events(state, guard, artifact, ArtifactAction::Reset).await
        }
        TriggerAction::UnlockArtifact { artifact } => {
            artifact_events(state, guard, artifact, ArtifactAction::Unlock).await
        }
        TriggerAction::SolveArtifact { artifact } => {
            artifact_events(state, guard, artifact, ArtifactAction::Solve).await
        }
        TriggerAction::AdvanceStep => advance_locked(state, guard, IndexKind::Step).await,
        TriggerAction::AdvancePhase => advance_locked(state, guard, IndexKind::Phase).await,
        TriggerAction::StartTimer {
            duration_seconds,
            direction,
        } => {
            let command = TimerCommand::Start {
                duration_seconds: *duration_seconds,
                direction: *direction,
            };
            timer_service::apply_locked(state, guard, command).await
        }
        TriggerAction::PauseTimer => {
            timer_service::apply_locked(state, guard, TimerCommand::Pause).await
        }
        TriggerAction::AdjustTimer { delta_seconds } => {
            let command = TimerCommand::Adjust {
                delta_seconds: *delta_seconds,
            };
            timer_service::apply_locked(state, guard, command).await
        }
        TriggerAction::AdjustTimeBank {
            delta_seconds,
            reason,
        } => {
            let delta = ledger_service::TimeBankDelta {
                delta_seconds: *delta_seconds,
                reason: reason.clone(),
                metadata: serde_json::json!({ "trigger_id": trigger.id }),
                event_id: Some(format!("{key}:{}:{index}", trigger.id)),
                min_balance: None,
                max_balance: None,
            };
            let applied =
                ledger_service::apply_time_bank_locked(state, guard, delta, Actor::trigger(trigger.id))
                    .await?;
            Ok(applied.events)
        }
        TriggerAction::GrantCurrency {
            amount,
            user_id,
            reason_code,
        } => {
            let (host, tenant) = {
                let live = guard.read().await;
                (live.session.host_user_id, live.session.tenant_id)
            };
            let recipient = user_id.unwrap_or(host);
            let (row, replayed) = ledger_service::grant(
                state,
                recipient,
                tenant,
                *amount,
                reason_code.clone(),
                format!("trigger:{}:{key}:{index}", trigger.id),
            )
            .await?;
            if replayed {
                return Ok(Vec::new());
            }
            Ok(vec![PlayEvent::CurrencyGranted {
                user_id: recipient,
                amount: row.amount,
                balance: row.balance_after,
            }])
        }
        TriggerAction::SendMessage { text } => Ok(vec![PlayEvent::Message { text: text.clone() }]),
    }
}

/// React to a committed event. Returns the follow-up events of immediate firings; delayed
/// triggers are scheduled and publish on their own.
pub(crate) async fn on_event(
    state: &SharedState,
    guard: &SessionGuard,
    event: &PlayEvent,
    event_id: Uuid,
) -> Vec<(Actor, PlayEvent)> {
    let matched: Vec<(Uuid, u32)> = {
        let live = guard.read().await;
        if !live.status().is_live() {
            return Vec::new();
        }
        trigger::evaluate(&live, event)
            .into_iter()
            .filter_map(|id| live.triggers.get(&id).map(|t| (id, t.delay_seconds)))
            .collect()
    };

    let mut follow_ups = Vec::new();
    for (trigger_id, delay_seconds) in matched {
        let key = format!("event:{event_id}");
        if delay_seconds > 0 {
            schedule_delayed(state, guard.session_id(), trigger_id, key, delay_seconds);
            continue;
        }
        match fire_now(state, guard, trigger_id, key).await {
            Ok(FireOutcome::Fired { events, .. }) => follow_ups.extend(
                events
                    .into_iter()
                    .map(|follow_up| (Actor::trigger(trigger_id), follow_up)),
            ),
            Ok(FireOutcome::Noop { reason, events, .. }) => {
                debug!(trigger_id = %trigger_id, ?reason, "trigger did not fire");
                follow_ups.extend(
                    events
                        .into_iter()
                        .map(|follow_up| (Actor::trigger(trigger_id), follow_up)),
                );
            }
            Err(err) => warn!(
                session_id = %guard.session_id(),
                trigger_id = %trigger_id,
                error = %err,
                "trigger fire failed"
            ),
        }
    }
    follow_ups
}

fn schedule_delayed(
    state: &SharedState,
    session_id: Uuid,
    trigger_id: Uuid,
    key: String,
    delay_seconds: u32,
) {
    debug!(session_id = %session_id, trigger_id = %trigger_id, delay_seconds, "trigger scheduled");
    let state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(delay_seconds.into())).await;
        if let Err(err) = fire_delayed(&state, session_id, trigger_id, key).await {
            warn!(session_id = %session_id, trigger_id = %trigger_id, error = %err, "delayed trigger failed");
        }
    });
}

/// Fire a scheduled trigger, rechecking liveness and `execute_once` at apply time.
async fn fire_delayed(
    state: &SharedState,
    session_id: Uuid,
    trigger_id: Uuid,
    key: String,
) -> Result<(), ServiceError> {
    let actor = state.session(session_id).await?;
    let guard = actor.lock().await;
    {
        let live = guard.read().await;
        let eligible = live.status().is_live()
            && live.triggers.get(&trigger_id).is_some_and(trigger::is_eligible);
        if !eligible {
            debug!(session_id = %session_id, trigger_id = %trigger_id, "scheduled trigger no longer eligible");
            return Ok(());
        }
    }

    match fire_now(state, &guard, trigger_id, key).await? {
        FireOutcome::Fired { events, .. } => {
            pipeline::dispatch(state, &guard, Actor::trigger(trigger_id), events).await;
        }
        FireOutcome::Noop { reason, events, .. } => {
            debug!(trigger_id = %trigger_id, ?reason, "scheduled trigger did not fire");
            pipeline::dispatch(state, &guard, Actor::trigger(trigger_id), events).await;
        }
    }
    Ok(())
}

/// Facilitator fire. Keys are namespaced so they never collide with event-driven firings.
pub async fn fire_manually(
    state: &SharedState,
    host: Uuid,
    session_id: Uuid,
    trigger_id: Uuid,
    idempotency_key: &str,
) -> Result<FireTriggerResponse, ServiceError> {
    let idempotency_key = idempotency_key.trim();
    if idempotency_key.is_empty() {
        return Err(ServiceError::Validation(
            "idempotency_key must not be empty".into(),
        ));
    }

    let actor = state.session(session_id).await?;
    let guard = actor.lock().await;
    {
        let live = guard.read().await;
        ensure_host(&live, host)?;
        ensure_live(&live)?;
        let trigger = trigger_in(&live, trigger_id)?;
        if trigger.status == TriggerStatus::Disabled {
            return Err(ServiceError::invalid_transition(
                format!("trigger `{}` is disabled", trigger.name),
                trigger.status,
            ));
        }
    }

    let outcome = fire_now(state, &guard, trigger_id, format!("manual:{idempotency_key}")).await?;
    Ok(match outcome {
        FireOutcome::Fired {
            fired_count,
            fired_at,
            events,
        } => {
            let published =
                pipeline::dispatch(state, &guard, Actor::trigger(trigger_id), events).await;
            FireTriggerResponse::Fired {
                fired_count,
                fired_at: format_timestamp(fired_at),
                published,
            }
        }
        FireOutcome::Noop {
            reason,
            original_fired_at,
            events,
        } => {
            let published =
                pipeline::dispatch(state, &guard, Actor::trigger(trigger_id), events).await;
            FireTriggerResponse::Noop {
                reason,
                original_fired_at: format_optional(original_fired_at),
                published,
            }
        }
    })
}

async fn set_status_locked(
    state: &SharedState,
    guard: &SessionGuard,
    trigger_id: Uuid,
    arm: bool,
) -> Result<(TriggerEntity, Option<PlayEvent>), ServiceError> {
    let mut trigger = trigger_in(&*guard.read().await, trigger_id)?;
    let next = if arm {
        trigger::status_after_arm(&trigger)
    } else {
        TriggerStatus::Disabled
    };
    if next == trigger.status {
        return Ok((trigger, None));
    }

    state
        .gateway_call(move |gateway| gateway.set_trigger_status(trigger_id, next))
        .await?;
    trigger.status = next;
    guard
        .write()
        .await
        .triggers
        .insert(trigger_id, trigger.clone());
    info!(session_id = %guard.session_id(), trigger_id = %trigger_id, status = %next, "trigger status changed");
    Ok((
        trigger,
        Some(PlayEvent::TriggerStatusChanged {
            trigger_id,
            status: next,
        }),
    ))
}

/// Arm or disable one trigger. The fire count is preserved either way.
pub async fn set_status(
    state: &SharedState,
    host: Uuid,
    session_id: Uuid,
    trigger_id: Uuid,
    arm: bool,
) -> Result<TriggerStatusResponse, ServiceError> {
    let actor = state.session(session_id).await?;
    let guard = actor.lock().await;
    ensure_host(&*guard.read().await, host)?;

    let (trigger, event) = set_status_locked(state, &guard, trigger_id, arm).await?;
    let published =
        pipeline::dispatch(state, &guard, Actor::host(host), event.into_iter().collect()).await;
    Ok(TriggerStatusResponse {
        triggers: vec![TriggerView::from(&trigger)],
        published,
    })
}

/// Kill switch: disable every trigger of the session.
pub async fn disable_all(
    state: &SharedState,
    host: Uuid,
    session_id: Uuid,
) -> Result<TriggerStatusResponse, ServiceError> {
    let actor = state.session(session_id).await?;
    let guard = actor.lock().await;
    let ids: Vec<Uuid> = {
        let live = guard.read().await;
        ensure_host(&live, host)?;
        live.triggers.keys().copied().collect()
    };

    let mut triggers = Vec::with_capacity(ids.len());
    let mut events = Vec::new();
    for trigger_id in ids {
        match set_status_locked(state, &guard, trigger_id, false).await {
            Ok((trigger, event)) => {
                triggers.push(TriggerView::from(&trigger));
                events.extend(event);
            }
            Err(err) => {
                warn!(session_id = %session_id, disabled = events.len(), error = %err, "kill switch interrupted");
                pipeline::dispatch(state, &guard, Actor::host(host), events).await;
                return Err(err);
            }
        }
    }
    warn!(session_id = %session_id, disabled = events.len(), "all triggers disabled");

    let published = pipeline::dispatch(state, &guard, Actor::host(host), events).await;
    Ok(TriggerStatusResponse {
        triggers,
        published,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::{
            gateway::PlayGateway,
            models::{CurrencyTransactionKind, CurrencyTransactionRequest},
        },
        dto::session::CreateSessionRequest,
        services::{
            session_service,
            test_support::{TestSession, active_with_triggers, app_state},
        },
        state::{
            artifact::ArtifactState,
            session::PlayMode,
            timer::TimerDirection,
            trigger::{TriggerCondition, TriggerDefinition},
        },
    };

    fn definition(
        condition: TriggerCondition,
        actions: Vec<TriggerAction>,
        execute_once: bool,
    ) -> TriggerDefinition {
        TriggerDefinition {
            name: "Rule".into(),
            condition,
            actions,
            execute_once,
            delay_seconds: 0,
            enabled: true,
        }
    }

    fn manual_message(execute_once: bool) -> TriggerDefinition {
        definition(
            TriggerCondition::Manual,
            vec![TriggerAction::SendMessage {
                text: "Look under the desk".into(),
            }],
            execute_once,
        )
    }

    async fn only_trigger(session: &TestSession) -> Uuid {
        let live = session.actor.read().await;
        *live.triggers.keys().next().unwrap()
    }

    #[tokio::test]
    async fn step_reached_reveals_artifact_after_the_step_event() {
        let session = active_with_triggers(vec![definition(
            TriggerCondition::StepReached { step: 3 },
            vec![TriggerAction::RevealArtifact {
                artifact: "map".into(),
            }],
            true,
        )])
        .await;

        let response = session_service::set_index(
            &session.state,
            session.host_id,
            session.session_id,
            IndexKind::Step,
            3,
        )
        .await
        .unwrap();

        let kinds: Vec<_> = response.published.iter().map(|m| m.kind.as_str()).collect();
        assert_eq!(kinds, ["step_changed", "trigger_fired", "artifact_changed"]);
        assert!(response.published.windows(2).all(|w| w[0].seq < w[1].seq));
        let live = session.actor.read().await;
        assert_eq!(live.artifacts["map"].state, ArtifactState::Revealed);
    }

    #[tokio::test]
    async fn execute_once_fires_exactly_once_under_concurrency() {
        let session = active_with_triggers(vec![manual_message(true)]).await;
        let trigger_id = only_trigger(&session).await;
        let fire = |key: &'static str| {
            fire_manually(
                &session.state,
                session.host_id,
                session.session_id,
                trigger_id,
                key,
            )
        };

        let (a, b) = tokio::join!(fire("a"), fire("b"));
        let outcomes = [a.unwrap(), b.unwrap()];

        let fired = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, FireTriggerResponse::Fired { .. }))
            .count();
        assert_eq!(fired, 1);
        assert!(outcomes.iter().any(|outcome| matches!(
            outcome,
            FireTriggerResponse::Noop {
                reason: NoopReason::ExecuteOnceAlreadyFired,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn manual_replay_is_a_noop_with_original_time() {
        let session = active_with_triggers(vec![manual_message(false)]).await;
        let trigger_id = only_trigger(&session).await;

        let first = fire_manually(&session.state, session.host_id, session.session_id, trigger_id, "k1")
            .await
            .unwrap();
        let second = fire_manually(&session.state, session.host_id, session.session_id, trigger_id, " k1 ")
            .await
            .unwrap();

        let FireTriggerResponse::Fired { fired_at, .. } = first else {
            panic!("first fire should apply");
        };
        match second {
            FireTriggerResponse::Noop {
                reason,
                original_fired_at,
                published,
            } => {
                assert!(published.is_empty());
                assert_eq!(reason, NoopReason::IdempotencyReplay);
                assert_eq!(original_fired_at, Some(fired_at));
            }
            other => panic!("expected noop, got {other:?}"),
        }
        let live = session.actor.read().await;
        assert_eq!(live.triggers[&trigger_id].fired_count, 1);
    }

    #[tokio::test]
    async fn blank_key_is_rejected() {
        let session = active_with_triggers(vec![manual_message(false)]).await;
        let trigger_id = only_trigger(&session).await;

        let err = fire_manually(&session.state, session.host_id, session.session_id, trigger_id, "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn disabled_trigger_refuses_fire_and_rearm_keeps_count() {
        let session = active_with_triggers(vec![manual_message(true)]).await;
        let trigger_id = only_trigger(&session).await;
        fire_manually(&session.state, session.host_id, session.session_id, trigger_id, "k")
            .await
            .unwrap();

        disable_all(&session.state, session.host_id, session.session_id)
            .await
            .unwrap();
        let err = fire_manually(&session.state, session.host_id, session.session_id, trigger_id, "k2")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { ref current, .. } if current == "disabled"));

        let rearmed = set_status(&session.state, session.host_id, session.session_id, trigger_id, true)
            .await
            .unwrap();
        assert_eq!(rearmed.triggers[0].status, TriggerStatus::Fired);
        assert_eq!(rearmed.triggers[0].fired_count, 1);
    }

    #[tokio::test]
    async fn interrupted_kill_switch_still_publishes_what_it_disabled() {
        let session = active_with_triggers(vec![manual_message(false), manual_message(false)]).await;
        let (first, second) = {
            let live = session.actor.read().await;
            let mut ids = live.triggers.keys().copied();
            (ids.next().unwrap(), ids.next().unwrap())
        };
        session.gateway.forget_trigger(second).await;
        let mut receiver = session
            .state
            .channels()
            .get(session.session_id)
            .expect("channel open while active")
            .subscribe();

        let err = disable_all(&session.state, session.host_id, session.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));

        let message = receiver.recv().await.unwrap();
        assert_eq!(message.kind, "trigger_status_changed");
        let live = session.actor.read().await;
        assert_eq!(live.triggers[&first].status, TriggerStatus::Disabled);
        assert_eq!(live.triggers[&second].status, TriggerStatus::Armed);
    }

    #[tokio::test]
    async fn grant_currency_credits_the_host_once_per_firing() {
        let session = active_with_triggers(vec![definition(
            TriggerCondition::Manual,
            vec![TriggerAction::GrantCurrency {
                amount: 5,
                user_id: None,
                reason_code: "bonus".into(),
            }],
            false,
        )])
        .await;
        let trigger_id = only_trigger(&session).await;

        for key in ["a", "a", "b"] {
            fire_manually(&session.state, session.host_id, session.session_id, trigger_id, key)
                .await
                .unwrap();
        }

        let balance = ledger_service::balance(&session.state, session.host_id, session.tenant_id)
            .await
            .unwrap();
        assert_eq!(balance.balance, 10);
    }

    #[tokio::test]
    async fn replayed_key_recovers_a_grant_that_failed_after_the_claim() {
        let session = active_with_triggers(vec![definition(
            TriggerCondition::Manual,
            vec![
                TriggerAction::SendMessage {
                    text: "Well done".into(),
                },
                TriggerAction::GrantCurrency {
                    amount: 5,
                    user_id: None,
                    reason_code: "bonus".into(),
                },
            ],
            false,
        )])
        .await;
        let trigger_id = only_trigger(&session).await;
        let nearly_full = i64::MAX - 2;
        let direct = |kind: CurrencyTransactionKind, delta: i64, key: &str| CurrencyTransactionRequest {
            user_id: session.host_id,
            tenant_id: session.tenant_id,
            kind,
            amount: delta.abs(),
            delta,
            reason_code: "seed".into(),
            idempotency_key: key.into(),
            refund_of: None,
            metadata: serde_json::Value::Null,
            created_at: OffsetDateTime::now_utc(),
        };
        session
            .gateway
            .apply_currency_transaction(direct(CurrencyTransactionKind::Earn, nearly_full, "fill"))
            .await
            .unwrap();

        // The claim commits, the credit overflows and is skipped.
        let first = fire_manually(&session.state, session.host_id, session.session_id, trigger_id, "k")
            .await
            .unwrap();
        let FireTriggerResponse::Fired { published, .. } = first else {
            panic!("first fire should apply");
        };
        assert!(published.iter().all(|m| m.kind != "currency_granted"));

        session
            .gateway
            .apply_currency_transaction(direct(CurrencyTransactionKind::Spend, -nearly_full, "drain"))
            .await
            .unwrap();

        let retry = fire_manually(&session.state, session.host_id, session.session_id, trigger_id, "k")
            .await
            .unwrap();
        let FireTriggerResponse::Noop { published, .. } = retry else {
            panic!("retry should be an idempotent replay");
        };
        let kinds: Vec<_> = published.iter().map(|m| m.kind.as_str()).collect();
        assert_eq!(kinds, ["currency_granted"]);

        // A second retry finds the grant already recorded under its action key.
        let again = fire_manually(&session.state, session.host_id, session.session_id, trigger_id, "k")
            .await
            .unwrap();
        assert!(matches!(again, FireTriggerResponse::Noop { ref published, .. } if published.is_empty()));

        let balance = ledger_service::balance(&session.state, session.host_id, session.tenant_id)
            .await
            .unwrap();
        assert_eq!(balance.balance, 5);
        let live = session.actor.read().await;
        assert_eq!(live.triggers[&trigger_id].fired_count, 1);
    }

    #[tokio::test]
    async fn oversized_timer_action_is_refused_at_import() {
        let (state, _) = app_state().await;
        let err = session_service::create(
            &state,
            Uuid::new_v4(),
            CreateSessionRequest {
                display_name: "Overflow".into(),
                tenant_id: Uuid::new_v4(),
                play_mode: PlayMode::Facilitated,
                step_count: 1,
                phase_count: 1,
                settings: Default::default(),
                artifacts: Vec::new(),
                triggers: vec![definition(
                    TriggerCondition::Manual,
                    vec![TriggerAction::StartTimer {
                        duration_seconds: i64::MAX,
                        direction: TimerDirection::Countdown,
                    }],
                    false,
                )],
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn delayed_firing_rechecks_exhaustion() {
        let session = active_with_triggers(vec![manual_message(true)]).await;
        let trigger_id = only_trigger(&session).await;
        fire_manually(&session.state, session.host_id, session.session_id, trigger_id, "now")
            .await
            .unwrap();

        fire_delayed(&session.state, session.session_id, trigger_id, "event:late".into())
            .await
            .unwrap();

        let live = session.actor.read().await;
        assert_eq!(live.triggers[&trigger_id].fired_count, 1);
    }
}
