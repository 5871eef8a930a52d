//! In-process gateway backend.
//!
//! Every operation runs under one table lock, which makes the atomic operations trivially
//! atomic. Used when no database is configured and throughout the test suite.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    dao::{
        gateway::PlayGateway,
        models::{
            ArtifactEntity, CurrencyOutcome, CurrencyRejectionEntity, CurrencyTransactionEntity,
            CurrencyTransactionRequest, ParticipantEntity, SessionEntity, SessionEventEntity,
            TimeBankDeltaRequest, TimeBankEntryEntity, TimeBankOutcome, TriggerEntity,
            TriggerFireClaim, TriggerFireEntity, TriggerFireOutcome,
        },
        storage::{StorageError, StorageResult},
    },
    state::trigger::TriggerStatus,
};

/// Failures of the in-memory backend.
#[derive(Debug, Error)]
pub enum MemoryGatewayError {
    /// Simulated outage.
    #[error("in-memory gateway is offline")]
    Offline,
    /// A write referenced a record that does not exist.
    #[error("{kind} `{id}` does not exist")]
    MissingRecord {
        /// Record kind.
        kind: &'static str,
        /// Record id.
        id: Uuid,
    },
}

impl From<MemoryGatewayError> for StorageError {
    fn from(err: MemoryGatewayError) -> Self {
        StorageError::unavailable(err.to_string(), err)
    }
}

enum CurrencyKeyOutcome {
    Applied(usize),
    Rejected(CurrencyRejectionEntity),
}

#[derive(Default)]
struct Tables {
    join_codes: HashMap<String, Uuid>,
    sessions: HashMap<Uuid, SessionEntity>,
    sequences: HashMap<Uuid, u64>,
    participants: HashMap<Uuid, ParticipantEntity>,
    tokens: HashMap<String, Uuid>,
    artifacts: HashMap<Uuid, ArtifactEntity>,
    triggers: HashMap<Uuid, TriggerEntity>,
    trigger_fires: HashMap<(Uuid, String), TriggerFireEntity>,
    time_bank: HashMap<Uuid, Vec<TimeBankEntryEntity>>,
    time_bank_events: HashMap<(Uuid, String), usize>,
    currency: Vec<CurrencyTransactionEntity>,
    currency_keys: HashMap<(Uuid, String), CurrencyKeyOutcome>,
    balances: HashMap<(Uuid, Uuid), i64>,
    events: HashMap<Uuid, Vec<SessionEventEntity>>,
}

#[derive(Default)]
struct MemoryInner {
    tables: RwLock<Tables>,
    offline: AtomicBool,
}

/// Gateway keeping every table in process memory.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    inner: Arc<MemoryInner>,
}

impl MemoryGateway {
    /// Create an empty gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage; every call fails until switched back.
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of currency rows, for ledger assertions.
    #[cfg(test)]
    pub async fn currency_row_count(&self) -> usize {
        self.inner.tables.read().await.currency.len()
    }

    /// Drop a stored trigger so later writes against it fail.
    #[cfg(test)]
    pub async fn forget_trigger(&self, trigger_id: Uuid) {
        self.inner.tables.write().await.triggers.remove(&trigger_id);
    }

    fn ensure_online(&self) -> Result<(), MemoryGatewayError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(MemoryGatewayError::Offline);
        }
        Ok(())
    }

    async fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> StorageResult<T> {
        self.ensure_online()?;
        let tables = self.inner.tables.read().await;
        Ok(f(&tables))
    }

    async fn write<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, MemoryGatewayError>,
    ) -> StorageResult<T> {
        self.ensure_online()?;
        let mut tables = self.inner.tables.write().await;
        Ok(f(&mut tables)?)
    }
}

fn apply_time_bank(tables: &mut Tables, request: TimeBankDeltaRequest) -> TimeBankOutcome {
    let session_id = request.session_id;
    if let Some(event_id) = &request.event_id {
        if let Some(&position) = tables.time_bank_events.get(&(session_id, event_id.clone())) {
            if let Some(entry) = tables
                .time_bank
                .get(&session_id)
                .and_then(|entries| entries.get(position))
            {
                return TimeBankOutcome::Replayed(entry.clone());
            }
        }
    }

    let entries = tables.time_bank.entry(session_id).or_default();
    let balance = entries.last().map_or(0, |entry| entry.balance_after);
    let next = match balance.checked_add(request.delta_seconds) {
        Some(next) if (request.min_balance..=request.max_balance).contains(&next) => next,
        _ => return TimeBankOutcome::OutOfBounds { balance },
    };

    let position = entries.len();
    let entry = TimeBankEntryEntity {
        id: Uuid::new_v4(),
        session_id,
        position: position as u64,
        delta_seconds: request.delta_seconds,
        reason: request.reason,
        metadata: request.metadata,
        event_id: request.event_id.clone(),
        actor: request.actor,
        balance_after: next,
        recorded_at: request.recorded_at,
    };
    entries.push(entry.clone());
    if let Some(event_id) = request.event_id {
        tables
            .time_bank_events
            .insert((session_id, event_id), position);
    }
    TimeBankOutcome::Applied(entry)
}

fn apply_currency(tables: &mut Tables, request: CurrencyTransactionRequest) -> CurrencyOutcome {
    let key = (request.user_id, request.idempotency_key.clone());
    match tables.currency_keys.get(&key) {
        Some(CurrencyKeyOutcome::Applied(index)) => {
            if let Some(row) = tables.currency.get(*index) {
                return CurrencyOutcome::Replayed(row.clone());
            }
        }
        Some(CurrencyKeyOutcome::Rejected(rejection)) => {
            return CurrencyOutcome::Rejected {
                balance: rejection.balance,
                requested: rejection.requested,
                replay: true,
            };
        }
        None => {}
    }

    let scope = (request.user_id, request.tenant_id);
    let balance = tables.balances.get(&scope).copied().unwrap_or(0);
    let Some(next) = balance.checked_add(request.delta) else {
        return CurrencyOutcome::Overflow { balance };
    };
    if request.delta < 0 && next < 0 {
        let rejection = CurrencyRejectionEntity {
            user_id: request.user_id,
            idempotency_key: request.idempotency_key,
            balance,
            requested: request.amount,
        };
        tables
            .currency_keys
            .insert(key, CurrencyKeyOutcome::Rejected(rejection));
        return CurrencyOutcome::Rejected {
            balance,
            requested: request.amount,
            replay: false,
        };
    }

    let row = CurrencyTransactionEntity {
        id: Uuid::new_v4(),
        user_id: request.user_id,
        tenant_id: request.tenant_id,
        kind: request.kind,
        amount: request.amount,
        delta: request.delta,
        reason_code: request.reason_code,
        idempotency_key: request.idempotency_key,
        refund_of: request.refund_of,
        metadata: request.metadata,
        balance_after: next,
        created_at: request.created_at,
    };
    tables.currency.push(row.clone());
    tables
        .currency_keys
        .insert(key, CurrencyKeyOutcome::Applied(tables.currency.len() - 1));
    tables.balances.insert(scope, next);
    CurrencyOutcome::Applied(row)
}

fn claim_fire(
    tables: &mut Tables,
    claim: TriggerFireClaim,
) -> Result<TriggerFireOutcome, MemoryGatewayError> {
    let Some(trigger) = tables.triggers.get_mut(&claim.trigger_id) else {
        return Err(MemoryGatewayError::MissingRecord {
            kind: "trigger",
            id: claim.trigger_id,
        });
    };

    let key = (claim.trigger_id, claim.idempotency_key.clone());
    if let Some(previous) = tables.trigger_fires.get(&key) {
        return Ok(TriggerFireOutcome::Replay {
            fired_count: trigger.fired_count,
            original_fired_at: previous.fired_at,
        });
    }
    if claim.execute_once && trigger.fired_count >= 1 {
        return Ok(TriggerFireOutcome::Exhausted {
            fired_count: trigger.fired_count,
        });
    }

    trigger.fired_count += 1;
    trigger.last_fired_at = Some(claim.fired_at);
    trigger.status = claim.status_after;
    let fired_count = trigger.fired_count;
    tables.trigger_fires.insert(
        key,
        TriggerFireEntity {
            trigger_id: claim.trigger_id,
            session_id: claim.session_id,
            idempotency_key: claim.idempotency_key,
            fired_count,
            fired_at: claim.fired_at,
        },
    );
    Ok(TriggerFireOutcome::Fired {
        fired_count,
        fired_at: claim.fired_at,
    })
}

impl PlayGateway for MemoryGateway {
    fn reserve_join_code(
        &self,
        code: String,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .write(|tables| {
                    if tables.join_codes.contains_key(&code) {
                        return Ok(false);
                    }
                    tables.join_codes.insert(code, session_id);
                    Ok(true)
                })
                .await
        })
    }

    fn save_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .write(|tables| {
                    tables.sessions.insert(session.id, session);
                    Ok(())
                })
                .await
        })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let gateway = self.clone();
        Box::pin(async move { gateway.read(|tables| tables.sessions.get(&id).cloned()).await })
    }

    fn find_session_by_code(
        &self,
        code: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .read(|tables| {
                    tables
                        .join_codes
                        .get(&code)
                        .and_then(|id| tables.sessions.get(id))
                        .cloned()
                })
                .await
        })
    }

    fn increment_broadcast_seq(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<u64>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .write(|tables| {
                    let seq = tables.sequences.entry(session_id).or_insert(0);
                    *seq += 1;
                    Ok(*seq)
                })
                .await
        })
    }

    fn current_broadcast_seq(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<u64>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .read(|tables| tables.sequences.get(&session_id).copied().unwrap_or(0))
                .await
        })
    }

    fn save_participant(
        &self,
        participant: ParticipantEntity,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .write(|tables| {
                    if let Some(previous) = tables.participants.get(&participant.id) {
                        if previous.token != participant.token {
                            tables.tokens.remove(&previous.token);
                        }
                    }
                    tables
                        .tokens
                        .insert(participant.token.clone(), participant.id);
                    tables.participants.insert(participant.id, participant);
                    Ok(())
                })
                .await
        })
    }

    fn list_participants(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .read(|tables| {
                    tables
                        .participants
                        .values()
                        .filter(|participant| participant.session_id == session_id)
                        .cloned()
                        .collect()
                })
                .await
        })
    }

    fn find_participant_by_token(
        &self,
        token: String,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .read(|tables| {
                    tables
                        .tokens
                        .get(&token)
                        .and_then(|id| tables.participants.get(id))
                        .cloned()
                })
                .await
        })
    }

    fn save_artifact(&self, artifact: ArtifactEntity) -> BoxFuture<'static, StorageResult<()>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .write(|tables| {
                    tables.artifacts.insert(artifact.id, artifact);
                    Ok(())
                })
                .await
        })
    }

    fn list_artifacts(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ArtifactEntity>>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .read(|tables| {
                    tables
                        .artifacts
                        .values()
                        .filter(|artifact| artifact.session_id == session_id)
                        .cloned()
                        .collect()
                })
                .await
        })
    }

    fn insert_triggers(
        &self,
        triggers: Vec<TriggerEntity>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .write(|tables| {
                    for trigger in triggers {
                        tables.triggers.insert(trigger.id, trigger);
                    }
                    Ok(())
                })
                .await
        })
    }

    fn set_trigger_status(
        &self,
        trigger_id: Uuid,
        status: TriggerStatus,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .write(|tables| match tables.triggers.get_mut(&trigger_id) {
                    Some(trigger) => {
                        trigger.status = status;
                        Ok(())
                    }
                    None => Err(MemoryGatewayError::MissingRecord {
                        kind: "trigger",
                        id: trigger_id,
                    }),
                })
                .await
        })
    }

    fn list_triggers(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<TriggerEntity>>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .read(|tables| {
                    tables
                        .triggers
                        .values()
                        .filter(|trigger| trigger.session_id == session_id)
                        .cloned()
                        .collect()
                })
                .await
        })
    }

    fn claim_trigger_fire(
        &self,
        claim: TriggerFireClaim,
    ) -> BoxFuture<'static, StorageResult<TriggerFireOutcome>> {
        let gateway = self.clone();
        Box::pin(async move { gateway.write(|tables| claim_fire(tables, claim)).await })
    }

    fn apply_time_bank_delta(
        &self,
        request: TimeBankDeltaRequest,
    ) -> BoxFuture<'static, StorageResult<TimeBankOutcome>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .write(|tables| Ok(apply_time_bank(tables, request)))
                .await
        })
    }

    fn list_time_bank_entries(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<TimeBankEntryEntity>>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .read(|tables| tables.time_bank.get(&session_id).cloned().unwrap_or_default())
                .await
        })
    }

    fn apply_currency_transaction(
        &self,
        request: CurrencyTransactionRequest,
    ) -> BoxFuture<'static, StorageResult<CurrencyOutcome>> {
        let gateway = self.clone();
        Box::pin(async move { gateway.write(|tables| Ok(apply_currency(tables, request))).await })
    }

    fn find_currency_transaction(
        &self,
        id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<CurrencyTransactionEntity>>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .read(|tables| tables.currency.iter().find(|row| row.id == id).cloned())
                .await
        })
    }

    fn currency_balance(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<i64>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .read(|tables| {
                    tables
                        .balances
                        .get(&(user_id, tenant_id))
                        .copied()
                        .unwrap_or(0)
                })
                .await
        })
    }

    fn append_session_event(
        &self,
        event: SessionEventEntity,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .write(|tables| {
                    tables
                        .events
                        .entry(event.session_id)
                        .or_default()
                        .push(event);
                    Ok(())
                })
                .await
        })
    }

    fn list_session_events(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<SessionEventEntity>>> {
        let gateway = self.clone();
        Box::pin(async move {
            gateway
                .read(|tables| {
                    let events = tables.events.get(&session_id).map(Vec::as_slice).unwrap_or(&[]);
                    let skip = events.len().saturating_sub(limit);
                    events[skip..].to_vec()
                })
                .await
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let gateway = self.clone();
        Box::pin(async move { gateway.read(|_| ()).await })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let gateway = self.clone();
        Box::pin(async move { gateway.read(|_| ()).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::models::{CurrencyTransactionKind, LedgerActor},
        state::events::ActorKind,
    };
    use time::OffsetDateTime;

    fn time_bank_request(session_id: Uuid, delta: i64, event_id: Option<&str>) -> TimeBankDeltaRequest {
        TimeBankDeltaRequest {
            session_id,
            delta_seconds: delta,
            reason: "test".into(),
            metadata: serde_json::Value::Null,
            event_id: event_id.map(str::to_owned),
            actor: LedgerActor {
                kind: ActorKind::System,
                id: None,
            },
            min_balance: 0,
            max_balance: 600,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }

    fn spend(user_id: Uuid, tenant_id: Uuid, amount: i64, key: &str) -> CurrencyTransactionRequest {
        CurrencyTransactionRequest {
            user_id,
            tenant_id,
            kind: CurrencyTransactionKind::Spend,
            amount,
            delta: -amount,
            reason_code: "shop".into(),
            idempotency_key: key.into(),
            refund_of: None,
            metadata: serde_json::Value::Null,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn broadcast_seq_only_increments() {
        let gateway = MemoryGateway::new();
        let session = Uuid::new_v4();
        let mut last = 0;
        for _ in 0..5 {
            let seq = gateway.increment_broadcast_seq(session).await.unwrap();
            assert_eq!(seq, last + 1);
            last = seq;
        }
        assert_eq!(gateway.current_broadcast_seq(session).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn time_bank_replay_returns_the_original_row() {
        let gateway = MemoryGateway::new();
        let session = Uuid::new_v4();
        let first = gateway
            .apply_time_bank_delta(time_bank_request(session, 120, Some("evt-1")))
            .await
            .unwrap();
        let second = gateway
            .apply_time_bank_delta(time_bank_request(session, 120, Some("evt-1")))
            .await
            .unwrap();

        match (first, second) {
            (TimeBankOutcome::Applied(a), TimeBankOutcome::Replayed(b)) => assert_eq!(a, b),
            other => panic!("unexpected outcomes: {other:?}"),
        }
        assert_eq!(gateway.list_time_bank_entries(session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn time_bank_clamp_rejects_without_append() {
        let gateway = MemoryGateway::new();
        let session = Uuid::new_v4();
        let outcome = gateway
            .apply_time_bank_delta(time_bank_request(session, -1, None))
            .await
            .unwrap();
        assert_eq!(outcome, TimeBankOutcome::OutOfBounds { balance: 0 });
        assert!(gateway.list_time_bank_entries(session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn time_bank_balance_past_i64_is_out_of_bounds() {
        let gateway = MemoryGateway::new();
        let session = Uuid::new_v4();
        let mut request = time_bank_request(session, i64::MAX, None);
        request.max_balance = i64::MAX;
        let first = gateway.apply_time_bank_delta(request.clone()).await.unwrap();
        assert!(matches!(first, TimeBankOutcome::Applied(_)));

        request.delta_seconds = 1;
        let outcome = gateway.apply_time_bank_delta(request).await.unwrap();
        assert_eq!(outcome, TimeBankOutcome::OutOfBounds { balance: i64::MAX });
        assert_eq!(gateway.list_time_bank_entries(session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn credit_past_i64_is_refused() {
        let gateway = MemoryGateway::new();
        let (user, tenant) = (Uuid::new_v4(), Uuid::new_v4());
        let earn = |amount: i64, key: &str| CurrencyTransactionRequest {
            kind: CurrencyTransactionKind::Earn,
            delta: amount,
            ..spend(user, tenant, amount, key)
        };

        let first = gateway
            .apply_currency_transaction(earn(i64::MAX, "E1"))
            .await
            .unwrap();
        assert!(matches!(first, CurrencyOutcome::Applied(_)));
        let second = gateway
            .apply_currency_transaction(earn(1, "E2"))
            .await
            .unwrap();
        assert_eq!(second, CurrencyOutcome::Overflow { balance: i64::MAX });
        assert_eq!(gateway.currency_row_count().await, 1);
    }

    #[tokio::test]
    async fn rejected_spend_is_remembered_under_its_key() {
        let gateway = MemoryGateway::new();
        let (user, tenant) = (Uuid::new_v4(), Uuid::new_v4());

        let first = gateway
            .apply_currency_transaction(spend(user, tenant, 50, "K"))
            .await
            .unwrap();
        let second = gateway
            .apply_currency_transaction(spend(user, tenant, 50, "K"))
            .await
            .unwrap();

        assert_eq!(
            first,
            CurrencyOutcome::Rejected {
                balance: 0,
                requested: 50,
                replay: false
            }
        );
        assert_eq!(
            second,
            CurrencyOutcome::Rejected {
                balance: 0,
                requested: 50,
                replay: true
            }
        );
        assert_eq!(gateway.currency_row_count().await, 0);
    }

    #[tokio::test]
    async fn offline_gateway_fails_every_call() {
        let gateway = MemoryGateway::new();
        gateway.set_offline(true);
        assert!(gateway.increment_broadcast_seq(Uuid::new_v4()).await.is_err());
        assert!(gateway.health_check().await.is_err());
        gateway.set_offline(false);
        assert!(gateway.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn join_codes_are_unique() {
        let gateway = MemoryGateway::new();
        assert!(gateway.reserve_join_code("ABC234".into(), Uuid::new_v4()).await.unwrap());
        assert!(!gateway.reserve_join_code("ABC234".into(), Uuid::new_v4()).await.unwrap());
    }
}
