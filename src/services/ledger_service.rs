//! Time-bank and currency ledgers.
//!
//! Both ledgers are append-only. Every balance check happens inside the gateway's atomic
//! apply, so concurrent requests can never both observe the same sufficient balance.

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dao::models::{
        CurrencyOutcome, CurrencyTransactionEntity, CurrencyTransactionKind,
        CurrencyTransactionRequest, MAX_CURRENCY_AMOUNT, MAX_TIME_BANK_DELTA_SECONDS,
        TimeBankDeltaRequest, TimeBankEntryEntity, TimeBankOutcome,
    },
    dto::{
        currency::{BalanceView, CurrencyTransactionInput, CurrencyTransactionView},
        session::{TimeBankApplyResponse, TimeBankDeltaInput, TimeBankEntryView, TimeBankLedgerView},
    },
    error::ServiceError,
    services::{
        pipeline,
        session_service::{ensure_host, ensure_live},
    },
    state::{
        SessionGuard, SharedState,
        events::{Actor, PlayEvent},
    },
};

const INITIAL_REASON: &str = "initial";
const REFUND_REASON: &str = "refund";

fn ensure_amount(amount: i64) -> Result<(), ServiceError> {
    if amount <= 0 {
        return Err(ServiceError::Validation("amount must be positive".into()));
    }
    if amount > MAX_CURRENCY_AMOUNT {
        return Err(ServiceError::Validation(format!(
            "amount must not exceed {MAX_CURRENCY_AMOUNT}"
        )));
    }
    Ok(())
}

/// A time-bank delta with optional per-call clamps.
#[derive(Debug, Clone)]
pub(crate) struct TimeBankDelta {
    pub delta_seconds: i64,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub event_id: Option<String>,
    pub min_balance: Option<i64>,
    pub max_balance: Option<i64>,
}

impl From<TimeBankDeltaInput> for TimeBankDelta {
    fn from(input: TimeBankDeltaInput) -> Self {
        Self {
            delta_seconds: input.delta_seconds,
            reason: input.reason,
            metadata: input.metadata,
            event_id: input.event_id,
            min_balance: input.min_balance,
            max_balance: input.max_balance,
        }
    }
}

/// Row written (or replayed) by a time-bank apply, with the events it causes.
#[derive(Debug)]
pub(crate) struct TimeBankApplied {
    pub entry: TimeBankEntryEntity,
    pub replayed: bool,
    pub events: Vec<PlayEvent>,
}

/// Append a time-bank entry as the facilitator. The session must have started.
pub async fn apply_time_bank(
    state: &SharedState,
    host: Uuid,
    session_id: Uuid,
    input: TimeBankDeltaInput,
) -> Result<TimeBankApplyResponse, ServiceError> {
    if !(-MAX_TIME_BANK_DELTA_SECONDS..=MAX_TIME_BANK_DELTA_SECONDS).contains(&input.delta_seconds)
    {
        return Err(ServiceError::Validation(format!(
            "delta_seconds must stay within {MAX_TIME_BANK_DELTA_SECONDS} seconds"
        )));
    }
    let actor = state.session(session_id).await?;
    let guard = actor.lock().await;
    {
        let live = guard.read().await;
        ensure_host(&live, host)?;
        ensure_live(&live)?;
        if live.session.started_at.is_none() {
            let status = live.status();
            return Err(ServiceError::invalid_transition(
                "the time bank opens when the session starts",
                status,
            ));
        }
    }

    let applied = apply_time_bank_locked(state, &guard, input.into(), Actor::host(host)).await?;
    let published = pipeline::dispatch(state, &guard, Actor::host(host), applied.events).await;
    Ok(TimeBankApplyResponse {
        balance: applied.entry.balance_after,
        entry: TimeBankEntryView::from(&applied.entry),
        replayed: applied.replayed,
        published,
    })
}

/// Apply a delta under the writer gate. Clamps default to the session's time-bank rules.
pub(crate) async fn apply_time_bank_locked(
    state: &SharedState,
    guard: &SessionGuard,
    delta: TimeBankDelta,
    actor: Actor,
) -> Result<TimeBankApplied, ServiceError> {
    let session_id = guard.session_id();
    let rules = guard.read().await.session.settings.time_bank;
    let min = delta.min_balance.unwrap_or(rules.min_balance);
    let max = delta.max_balance.unwrap_or(rules.max_balance);
    if min > max {
        return Err(ServiceError::Validation(format!(
            "min_balance {min} exceeds max_balance {max}"
        )));
    }
    let reason = delta.reason.trim().to_owned();
    if reason.is_empty() {
        return Err(ServiceError::Validation("reason must not be empty".into()));
    }

    let request = TimeBankDeltaRequest {
        session_id,
        delta_seconds: delta.delta_seconds,
        reason,
        metadata: delta.metadata,
        event_id: delta.event_id,
        actor: actor.into(),
        min_balance: min,
        max_balance: max,
        recorded_at: OffsetDateTime::now_utc(),
    };
    let outcome = state
        .gateway_call(move |gateway| gateway.apply_time_bank_delta(request))
        .await?;

    match outcome {
        TimeBankOutcome::Applied(entry) => {
            guard.write().await.time_bank_balance = Some(entry.balance_after);
            info!(
                session_id = %session_id,
                delta = entry.delta_seconds,
                balance = entry.balance_after,
                reason = %entry.reason,
                "time bank entry appended"
            );
            let mut events = vec![PlayEvent::TimeBankChanged {
                delta_seconds: entry.delta_seconds,
                balance: entry.balance_after,
                reason: entry.reason.clone(),
            }];
            if entry.delta_seconds < 0 && entry.balance_after <= min {
                events.push(PlayEvent::TimeBankExpired {
                    balance: entry.balance_after,
                });
            }
            Ok(TimeBankApplied {
                entry,
                replayed: false,
                events,
            })
        }
        TimeBankOutcome::Replayed(entry) => Ok(TimeBankApplied {
            entry,
            replayed: true,
            events: Vec::new(),
        }),
        TimeBankOutcome::OutOfBounds { balance } => Err(ServiceError::ClampViolation {
            balance,
            delta: delta.delta_seconds,
            min,
            max,
        }),
    }
}

/// Seed the `initial` entry when a session starts. Replays when it was seeded before.
pub(crate) async fn seed_time_bank(
    state: &SharedState,
    guard: &SessionGuard,
) -> Result<Vec<PlayEvent>, ServiceError> {
    let rules = guard.read().await.session.settings.time_bank;
    let delta = TimeBankDelta {
        delta_seconds: rules.initial_balance,
        reason: INITIAL_REASON.into(),
        metadata: serde_json::Value::Null,
        event_id: Some(INITIAL_REASON.into()),
        min_balance: None,
        max_balance: None,
    };
    let applied = apply_time_bank_locked(state, guard, delta, Actor::system()).await?;
    if applied.replayed {
        guard.write().await.time_bank_balance = Some(applied.entry.balance_after);
    }
    Ok(applied.events)
}

/// Entries in append order with the current balance.
pub async fn list_time_bank(
    state: &SharedState,
    host: Uuid,
    session_id: Uuid,
) -> Result<TimeBankLedgerView, ServiceError> {
    let actor = state.session(session_id).await?;
    ensure_host(&*actor.read().await, host)?;
    let entries = state
        .gateway_call(move |gateway| gateway.list_time_bank_entries(session_id))
        .await?;
    Ok(TimeBankLedgerView {
        balance: entries.last().map_or(0, |entry| entry.balance_after),
        entries: entries.iter().map(TimeBankEntryView::from).collect(),
    })
}

async fn apply_currency_request(
    state: &SharedState,
    request: CurrencyTransactionRequest,
) -> Result<(CurrencyTransactionEntity, bool), ServiceError> {
    let user_id = request.user_id;
    let key = request.idempotency_key.clone();
    let outcome = state
        .gateway_call(move |gateway| gateway.apply_currency_transaction(request))
        .await?;

    match outcome {
        CurrencyOutcome::Applied(row) => {
            info!(
                user_id = %row.user_id,
                kind = ?row.kind,
                delta = row.delta,
                balance = row.balance_after,
                "currency transaction applied"
            );
            Ok((row, false))
        }
        CurrencyOutcome::Replayed(row) => Ok((row, true)),
        CurrencyOutcome::Rejected {
            balance,
            requested,
            replay,
        } => {
            warn!(user_id = %user_id, idempotency_key = %key, balance, requested, replay, "debit rejected");
            Err(ServiceError::InsufficientBalance { balance, requested })
        }
        CurrencyOutcome::Overflow { balance } => {
            warn!(user_id = %user_id, idempotency_key = %key, balance, "credit would overflow the balance");
            Err(ServiceError::Validation(
                "credit would overflow the balance".into(),
            ))
        }
    }
}

/// Earn or spend. A retried key returns the first outcome, including a rejection.
pub async fn apply_currency(
    state: &SharedState,
    input: CurrencyTransactionInput,
) -> Result<CurrencyTransactionView, ServiceError> {
    let delta = match input.kind {
        CurrencyTransactionKind::Earn => input.amount,
        CurrencyTransactionKind::Spend => -input.amount,
        CurrencyTransactionKind::Refund => {
            return Err(ServiceError::Validation(
                "refunds reference a transaction; use the refund route".into(),
            ));
        }
    };
    ensure_amount(input.amount)?;
    let idempotency_key = input.idempotency_key.trim().to_owned();
    if idempotency_key.is_empty() {
        return Err(ServiceError::Validation(
            "idempotency_key must not be empty".into(),
        ));
    }

    let request = CurrencyTransactionRequest {
        user_id: input.user_id,
        tenant_id: input.tenant_id,
        kind: input.kind,
        amount: input.amount,
        delta,
        reason_code: input.reason_code,
        idempotency_key,
        refund_of: None,
        metadata: input.metadata,
        created_at: OffsetDateTime::now_utc(),
    };
    let (row, replayed) = apply_currency_request(state, request).await?;
    Ok(CurrencyTransactionView::new(row, replayed))
}

/// Reverse an earn or spend. Keyed `refund:{id}`, so a refund applies at most once.
pub async fn refund(
    state: &SharedState,
    transaction_id: Uuid,
) -> Result<CurrencyTransactionView, ServiceError> {
    let original = state
        .gateway_call(move |gateway| gateway.find_currency_transaction(transaction_id))
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("transaction `{transaction_id}`")))?;
    if original.kind == CurrencyTransactionKind::Refund {
        return Err(ServiceError::Validation("a refund cannot be refunded".into()));
    }

    let request = CurrencyTransactionRequest {
        user_id: original.user_id,
        tenant_id: original.tenant_id,
        kind: CurrencyTransactionKind::Refund,
        amount: original.amount,
        delta: -original.delta,
        reason_code: REFUND_REASON.into(),
        idempotency_key: format!("refund:{transaction_id}"),
        refund_of: Some(transaction_id),
        metadata: serde_json::json!({ "original_reason": original.reason_code }),
        created_at: OffsetDateTime::now_utc(),
    };
    let (row, replayed) = apply_currency_request(state, request).await?;
    Ok(CurrencyTransactionView::new(row, replayed))
}

/// Credit issued by a `grant_currency` trigger action.
pub(crate) async fn grant(
    state: &SharedState,
    user_id: Uuid,
    tenant_id: Uuid,
    amount: i64,
    reason_code: String,
    idempotency_key: String,
) -> Result<(CurrencyTransactionEntity, bool), ServiceError> {
    ensure_amount(amount)?;
    let request = CurrencyTransactionRequest {
        user_id,
        tenant_id,
        kind: CurrencyTransactionKind::Earn,
        amount,
        delta: amount,
        reason_code,
        idempotency_key,
        refund_of: None,
        metadata: serde_json::Value::Null,
        created_at: OffsetDateTime::now_utc(),
    };
    apply_currency_request(state, request).await
}

/// Balance of a user within a tenant.
pub async fn balance(
    state: &SharedState,
    user_id: Uuid,
    tenant_id: Uuid,
) -> Result<BalanceView, ServiceError> {
    let balance = state
        .gateway_call(move |gateway| gateway.currency_balance(user_id, tenant_id))
        .await?;
    Ok(BalanceView {
        user_id,
        tenant_id,
        balance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{
        TestSession, active_with_triggers, app_state, lobby_with_participant,
    };

    fn currency(
        user_id: Uuid,
        tenant_id: Uuid,
        kind: CurrencyTransactionKind,
        amount: i64,
        key: &str,
    ) -> CurrencyTransactionInput {
        CurrencyTransactionInput {
            user_id,
            tenant_id,
            kind,
            amount,
            reason_code: "test".into(),
            idempotency_key: key.into(),
            metadata: serde_json::Value::Null,
        }
    }

    fn delta(seconds: i64, event_id: Option<&str>) -> TimeBankDeltaInput {
        TimeBankDeltaInput {
            delta_seconds: seconds,
            reason: "bonus".into(),
            metadata: serde_json::Value::Null,
            event_id: event_id.map(str::to_owned),
            min_balance: None,
            max_balance: None,
        }
    }

    #[tokio::test]
    async fn rejected_spend_is_rejected_again_on_retry() {
        let (state, _) = app_state().await;
        let (user, tenant) = (Uuid::new_v4(), Uuid::new_v4());
        apply_currency(&state, currency(user, tenant, CurrencyTransactionKind::Earn, 30, "seed"))
            .await
            .unwrap();

        for _ in 0..2 {
            let err = apply_currency(
                &state,
                currency(user, tenant, CurrencyTransactionKind::Spend, 50, "buy-hint"),
            )
            .await
            .unwrap_err();
            assert!(matches!(
                err,
                ServiceError::InsufficientBalance {
                    balance: 30,
                    requested: 50
                }
            ));
        }
        assert_eq!(balance(&state, user, tenant).await.unwrap().balance, 30);
    }

    #[tokio::test]
    async fn oversized_credits_never_reach_the_ledger() {
        let (state, _) = app_state().await;
        let (user, tenant) = (Uuid::new_v4(), Uuid::new_v4());

        let err = apply_currency(
            &state,
            currency(user, tenant, CurrencyTransactionKind::Earn, i64::MAX, "huge"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        let err = grant(&state, user, tenant, i64::MAX, "bonus".into(), "g".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        apply_currency(
            &state,
            currency(user, tenant, CurrencyTransactionKind::Earn, MAX_CURRENCY_AMOUNT, "max"),
        )
        .await
        .unwrap();
        apply_currency(&state, currency(user, tenant, CurrencyTransactionKind::Earn, 1, "one"))
            .await
            .unwrap();
        assert_eq!(
            balance(&state, user, tenant).await.unwrap().balance,
            MAX_CURRENCY_AMOUNT + 1
        );
    }

    #[tokio::test]
    async fn concurrent_spends_only_one_succeeds() {
        let (state, _) = app_state().await;
        let (user, tenant) = (Uuid::new_v4(), Uuid::new_v4());
        apply_currency(&state, currency(user, tenant, CurrencyTransactionKind::Earn, 100, "seed"))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            apply_currency(
                &state,
                currency(user, tenant, CurrencyTransactionKind::Spend, 70, "a")
            ),
            apply_currency(
                &state,
                currency(user, tenant, CurrencyTransactionKind::Spend, 70, "b")
            ),
        );

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(balance(&state, user, tenant).await.unwrap().balance, 30);
    }

    #[tokio::test]
    async fn retried_earn_returns_the_original_row() {
        let (state, _) = app_state().await;
        let (user, tenant) = (Uuid::new_v4(), Uuid::new_v4());
        let input = || currency(user, tenant, CurrencyTransactionKind::Earn, 10, "daily");

        let first = apply_currency(&state, input()).await.unwrap();
        let second = apply_currency(&state, input()).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.id, second.id);
        assert_eq!(balance(&state, user, tenant).await.unwrap().balance, 10);
    }

    #[tokio::test]
    async fn balances_are_scoped_per_tenant() {
        let (state, _) = app_state().await;
        let user = Uuid::new_v4();
        let (home, other) = (Uuid::new_v4(), Uuid::new_v4());
        apply_currency(&state, currency(user, home, CurrencyTransactionKind::Earn, 40, "k"))
            .await
            .unwrap();

        assert_eq!(balance(&state, user, home).await.unwrap().balance, 40);
        assert_eq!(balance(&state, user, other).await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn refund_reverses_once_and_cannot_be_refunded() {
        let (state, _) = app_state().await;
        let (user, tenant) = (Uuid::new_v4(), Uuid::new_v4());
        let earned = apply_currency(&state, currency(user, tenant, CurrencyTransactionKind::Earn, 25, "k"))
            .await
            .unwrap();

        let refunded = refund(&state, earned.id).await.unwrap();
        let again = refund(&state, earned.id).await.unwrap();

        assert_eq!(refunded.delta, -25);
        assert_eq!(refunded.refund_of, Some(earned.id));
        assert!(again.replayed);
        assert_eq!(balance(&state, user, tenant).await.unwrap().balance, 0);
        let err = refund(&state, refunded.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn time_bank_is_closed_before_start() {
        let TestSession {
            state,
            host_id,
            session_id,
            ..
        } = lobby_with_participant().await;

        let err = apply_time_bank(&state, host_id, session_id, delta(30, None))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { ref current, .. } if current == "lobby"));
    }

    #[tokio::test]
    async fn time_bank_delta_beyond_a_day_is_refused() {
        let TestSession {
            state,
            host_id,
            session_id,
            ..
        } = active_with_triggers(Vec::new()).await;
        let initial = state.config().time_bank.initial_balance;
        let mut input = delta(i64::MAX, None);
        input.max_balance = Some(i64::MAX);

        let err = apply_time_bank(&state, host_id, session_id, input)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        let ledger = list_time_bank(&state, host_id, session_id).await.unwrap();
        assert_eq!(ledger.balance, initial);
    }

    #[tokio::test]
    async fn time_bank_event_id_replays_without_reapplying() {
        let TestSession {
            state,
            host_id,
            session_id,
            ..
        } = active_with_triggers(Vec::new()).await;
        let initial = state.config().time_bank.initial_balance;

        let first = apply_time_bank(&state, host_id, session_id, delta(30, Some("bonus-1")))
            .await
            .unwrap();
        let second = apply_time_bank(&state, host_id, session_id, delta(30, Some("bonus-1")))
            .await
            .unwrap();

        assert_eq!(first.balance, initial + 30);
        assert!(second.replayed);
        assert!(second.published.is_empty());
        let ledger = list_time_bank(&state, host_id, session_id).await.unwrap();
        assert_eq!(ledger.entries.len(), 2);
        assert_eq!(ledger.balance, initial + 30);
    }

    #[tokio::test]
    async fn time_bank_clamps_and_expires() {
        let TestSession {
            state,
            host_id,
            session_id,
            ..
        } = active_with_triggers(Vec::new()).await;
        let rules = state.config().time_bank;

        let err = apply_time_bank(&state, host_id, session_id, delta(rules.max_balance + 1, None))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ClampViolation { .. }));

        let drained = apply_time_bank(
            &state,
            host_id,
            session_id,
            delta(rules.min_balance - rules.initial_balance, None),
        )
        .await
        .unwrap();
        let kinds: Vec<_> = drained.published.iter().map(|m| m.kind.as_str()).collect();
        assert_eq!(kinds, ["time_bank_changed", "time_bank_expired"]);
    }
}
