//! Persistence gateway: the single writer of durable truth.

pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::dao::{
    models::{
        ArtifactEntity, CurrencyOutcome, CurrencyTransactionEntity, CurrencyTransactionRequest,
        ParticipantEntity, SessionEntity, SessionEventEntity, TimeBankDeltaRequest,
        TimeBankEntryEntity, TimeBankOutcome, TriggerEntity, TriggerFireClaim, TriggerFireOutcome,
    },
    storage::StorageResult,
};
use crate::state::trigger::TriggerStatus;

/// Typed reads and writes per entity plus the atomic operations the runtime relies on.
///
/// Every atomic operation (`increment_broadcast_seq`, `claim_trigger_fire`,
/// `apply_time_bank_delta`, `apply_currency_transaction`, `reserve_join_code`) decides its
/// outcome in one unit at the backend. Idempotency keys are unique constraints, never an
/// application-side check followed by a separate write.
pub trait PlayGateway: Send + Sync {
    /// Claim a join code for a session; `false` when the code is taken.
    fn reserve_join_code(&self, code: String, session_id: Uuid)
    -> BoxFuture<'static, StorageResult<bool>>;
    fn save_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    fn find_session_by_code(
        &self,
        code: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;

    /// Atomically increment and return the session's broadcast counter.
    fn increment_broadcast_seq(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<u64>>;
    fn current_broadcast_seq(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<u64>>;

    fn save_participant(
        &self,
        participant: ParticipantEntity,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn list_participants(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>>;
    fn find_participant_by_token(
        &self,
        token: String,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>>;

    fn save_artifact(&self, artifact: ArtifactEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn list_artifacts(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ArtifactEntity>>>;

    fn insert_triggers(&self, triggers: Vec<TriggerEntity>)
    -> BoxFuture<'static, StorageResult<()>>;
    fn set_trigger_status(
        &self,
        trigger_id: Uuid,
        status: TriggerStatus,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn list_triggers(&self, session_id: Uuid)
    -> BoxFuture<'static, StorageResult<Vec<TriggerEntity>>>;
    /// Record a firing, enforcing `execute_once` and key uniqueness atomically.
    fn claim_trigger_fire(
        &self,
        claim: TriggerFireClaim,
    ) -> BoxFuture<'static, StorageResult<TriggerFireOutcome>>;

    /// Append a time-bank row with its clamp check and `event_id` uniqueness as one unit.
    fn apply_time_bank_delta(
        &self,
        request: TimeBankDeltaRequest,
    ) -> BoxFuture<'static, StorageResult<TimeBankOutcome>>;
    fn list_time_bank_entries(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<TimeBankEntryEntity>>>;

    /// Append a currency row with its balance check and `(user, key)` uniqueness as one unit.
    fn apply_currency_transaction(
        &self,
        request: CurrencyTransactionRequest,
    ) -> BoxFuture<'static, StorageResult<CurrencyOutcome>>;
    fn find_currency_transaction(
        &self,
        id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<CurrencyTransactionEntity>>>;
    fn currency_balance(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<i64>>;

    fn append_session_event(
        &self,
        event: SessionEventEntity,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn list_session_events(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<SessionEventEntity>>>;

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}
