use std::sync::Arc;

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Client, ClientSession, Collection, Database, IndexModel,
    bson::{Document, doc},
    error::{Error as MongoError, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT},
    options::{IndexOptions, ReturnDocument},
};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult, is_duplicate_key},
    models::{
        JoinCodeDocument, LedgerHeadDocument, SequenceDocument, Stored, currency_scope, keyed,
    },
};
use crate::{
    dao::{
        gateway::PlayGateway,
        models::{
            ArtifactEntity, CurrencyOutcome, CurrencyRejectionEntity, CurrencyTransactionEntity,
            CurrencyTransactionRequest, ParticipantEntity, SessionEntity, SessionEventEntity,
            TimeBankDeltaRequest, TimeBankEntryEntity, TimeBankOutcome, TriggerEntity,
            TriggerFireClaim, TriggerFireEntity, TriggerFireOutcome,
        },
        storage::StorageResult,
    },
    state::trigger::TriggerStatus,
};

const SESSIONS: &str = "sessions";
const JOIN_CODES: &str = "join_codes";
const SEQUENCES: &str = "session_sequences";
const PARTICIPANTS: &str = "participants";
const ARTIFACTS: &str = "artifacts";
const TRIGGERS: &str = "triggers";
const TRIGGER_FIRES: &str = "trigger_fires";
const TIME_BANK_ENTRIES: &str = "time_bank_entries";
const TIME_BANK_HEADS: &str = "time_bank_heads";
const CURRENCY_TRANSACTIONS: &str = "currency_transactions";
const CURRENCY_REJECTIONS: &str = "currency_rejections";
const CURRENCY_BALANCES: &str = "currency_balances";
const SESSION_EVENTS: &str = "session_events";

const MAX_TRANSACTION_ATTEMPTS: u32 = 5;

type TxnFuture<'a, T> = BoxFuture<'a, Result<T, MongoError>>;

/// MongoDB implementation of [`PlayGateway`].
///
/// The atomic operations run inside multi-document transactions, so the deployment must be a
/// replica set.
#[derive(Clone)]
pub struct MongoPlayGateway {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    client: Client,
    database: Database,
}

struct Collections {
    sessions: Collection<Stored<SessionEntity>>,
    join_codes: Collection<JoinCodeDocument>,
    sequences: Collection<SequenceDocument>,
    participants: Collection<Stored<ParticipantEntity>>,
    artifacts: Collection<Stored<ArtifactEntity>>,
    triggers: Collection<Stored<TriggerEntity>>,
    trigger_fires: Collection<Stored<TriggerFireEntity>>,
    time_bank_entries: Collection<Stored<TimeBankEntryEntity>>,
    time_bank_heads: Collection<LedgerHeadDocument>,
    currency_transactions: Collection<Stored<CurrencyTransactionEntity>>,
    currency_rejections: Collection<Stored<CurrencyRejectionEntity>>,
    currency_balances: Collection<LedgerHeadDocument>,
    session_events: Collection<Stored<SessionEventEntity>>,
}

impl Collections {
    fn new(database: &Database) -> Self {
        Self {
            sessions: database.collection(SESSIONS),
            join_codes: database.collection(JOIN_CODES),
            sequences: database.collection(SEQUENCES),
            participants: database.collection(PARTICIPANTS),
            artifacts: database.collection(ARTIFACTS),
            triggers: database.collection(TRIGGERS),
            trigger_fires: database.collection(TRIGGER_FIRES),
            time_bank_entries: database.collection(TIME_BANK_ENTRIES),
            time_bank_heads: database.collection(TIME_BANK_HEADS),
            currency_transactions: database.collection(CURRENCY_TRANSACTIONS),
            currency_rejections: database.collection(CURRENCY_REJECTIONS),
            currency_balances: database.collection(CURRENCY_BALANCES),
            session_events: database.collection(SESSION_EVENTS),
        }
    }
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }
}

fn op_error(
    operation: &'static str,
    collection: &'static str,
) -> impl FnOnce(MongoError) -> MongoDaoError {
    move |source| MongoDaoError::Operation {
        operation,
        collection,
        source,
    }
}

fn by_key(key: impl Into<String>) -> Document {
    doc! { "_id": key.into() }
}

fn by_session(session_id: Uuid) -> Document {
    doc! { "session": session_id.to_string() }
}

struct IndexSpec {
    collection: &'static str,
    name: &'static str,
    keys: Document,
    unique: bool,
    partial: Option<Document>,
}

impl MongoPlayGateway {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            establish_connection(&config.options, &config.database_name).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { client, database }),
            config,
        });

        let gateway = Self { inner };
        gateway.ensure_indexes().await?;
        Ok(gateway)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let specs = [
            IndexSpec {
                collection: PARTICIPANTS,
                name: "participant_token_idx",
                keys: doc! { "lookup": 1 },
                unique: true,
                partial: None,
            },
            IndexSpec {
                collection: PARTICIPANTS,
                name: "participant_session_idx",
                keys: doc! { "session": 1 },
                unique: false,
                partial: None,
            },
            IndexSpec {
                collection: SESSIONS,
                name: "session_join_code_idx",
                keys: doc! { "lookup": 1 },
                unique: true,
                partial: None,
            },
            IndexSpec {
                collection: ARTIFACTS,
                name: "artifact_session_idx",
                keys: doc! { "session": 1 },
                unique: false,
                partial: None,
            },
            IndexSpec {
                collection: TRIGGERS,
                name: "trigger_session_idx",
                keys: doc! { "session": 1 },
                unique: false,
                partial: None,
            },
            IndexSpec {
                collection: TIME_BANK_ENTRIES,
                name: "time_bank_event_idx",
                keys: doc! { "session": 1, "lookup": 1 },
                unique: true,
                partial: Some(doc! { "lookup": { "$type": "string" } }),
            },
            IndexSpec {
                collection: TIME_BANK_ENTRIES,
                name: "time_bank_position_idx",
                keys: doc! { "session": 1, "body.position": 1 },
                unique: true,
                partial: None,
            },
            IndexSpec {
                collection: CURRENCY_TRANSACTIONS,
                name: "currency_idempotency_idx",
                keys: doc! { "lookup": 1 },
                unique: true,
                partial: None,
            },
            IndexSpec {
                collection: SESSION_EVENTS,
                name: "session_event_seq_idx",
                keys: doc! { "session": 1, "body.seq": 1 },
                unique: false,
                partial: None,
            },
        ];

        let database = self.database().await;
        for spec in specs {
            let options = IndexOptions::builder()
                .name(Some(spec.name.to_owned()))
                .unique(Some(spec.unique))
                .partial_filter_expression(spec.partial)
                .build();
            let index = IndexModel::builder().keys(spec.keys).options(options).build();
            database
                .collection::<Document>(spec.collection)
                .create_index(index)
                .await
                .map_err(|source| MongoDaoError::EnsureIndex {
                    collection: spec.collection,
                    index: spec.name,
                    source,
                })?;
        }

        Ok(())
    }

    async fn database(&self) -> Database {
        let guard = self.inner.state.read().await;
        guard.database.clone()
    }

    async fn collections(&self) -> Collections {
        let guard = self.inner.state.read().await;
        Collections::new(&guard.database)
    }

    /// Run `op` in a transaction, retrying transient conflicts.
    async fn transact<A, T>(
        &self,
        operation: &'static str,
        arg: &A,
        op: for<'a> fn(&'a Collections, &'a mut ClientSession, &'a A) -> TxnFuture<'a, T>,
    ) -> MongoResult<T>
    where
        A: Sync,
        T: Send + 'static,
    {
        let (client, collections) = {
            let guard = self.inner.state.read().await;
            (guard.client.clone(), Collections::new(&guard.database))
        };
        let txn_error = |source| MongoDaoError::Transaction { operation, source };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut session = client.start_session().await.map_err(txn_error)?;
            session.start_transaction().await.map_err(txn_error)?;

            let result = match op(&collections, &mut session, arg).await {
                Ok(value) => commit(&mut session).await.map(|()| value),
                Err(err) => {
                    let _ = session.abort_transaction().await;
                    Err(err)
                }
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err)
                    if attempt < MAX_TRANSACTION_ATTEMPTS
                        && err.contains_label(TRANSIENT_TRANSACTION_ERROR) =>
                {
                    debug!(operation, attempt, "retrying transient transaction conflict");
                }
                Err(source) => return Err(txn_error(source)),
            }
        }
    }

    async fn reserve_join_code(&self, code: String, session_id: Uuid) -> MongoResult<bool> {
        let collections = self.collections().await;
        let document = JoinCodeDocument {
            code,
            session: session_id.to_string(),
        };
        match collections.join_codes.insert_one(&document).await {
            Ok(_) => Ok(true),
            Err(err) if is_duplicate_key(&err) => Ok(false),
            Err(source) => Err(op_error("reserve join code", JOIN_CODES)(source)),
        }
    }

    async fn save_session(&self, session: SessionEntity) -> MongoResult<()> {
        let collections = self.collections().await;
        let document = Stored::new(session.id, None, session.clone()).with_lookup(session.join_code);
        collections
            .sessions
            .replace_one(by_key(document.key.clone()), &document)
            .upsert(true)
            .await
            .map_err(op_error("save session", SESSIONS))?;
        Ok(())
    }

    async fn find_session(&self, filter: Document) -> MongoResult<Option<SessionEntity>> {
        let collections = self.collections().await;
        let document = collections
            .sessions
            .find_one(filter)
            .await
            .map_err(op_error("load session", SESSIONS))?;
        Ok(document.map(|stored| stored.body))
    }

    async fn increment_broadcast_seq(&self, session_id: Uuid) -> MongoResult<u64> {
        let collections = self.collections().await;
        let document = collections
            .sequences
            .find_one_and_update(by_key(session_id.to_string()), doc! { "$inc": { "seq": 1_i64 } })
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(op_error("increment broadcast seq", SEQUENCES))?;
        Ok(document.map_or(0, |sequence| sequence.seq.max(0) as u64))
    }

    async fn current_broadcast_seq(&self, session_id: Uuid) -> MongoResult<u64> {
        let collections = self.collections().await;
        let document = collections
            .sequences
            .find_one(by_key(session_id.to_string()))
            .await
            .map_err(op_error("load broadcast seq", SEQUENCES))?;
        Ok(document.map_or(0, |sequence| sequence.seq.max(0) as u64))
    }

    async fn save_participant(&self, participant: ParticipantEntity) -> MongoResult<()> {
        let collections = self.collections().await;
        let token = participant.token.clone();
        let document =
            Stored::new(participant.id, Some(participant.session_id), participant).with_lookup(token);
        collections
            .participants
            .replace_one(by_key(document.key.clone()), &document)
            .upsert(true)
            .await
            .map_err(op_error("save participant", PARTICIPANTS))?;
        Ok(())
    }

    async fn list_by_session<T>(
        collection: &Collection<Stored<T>>,
        name: &'static str,
        session_id: Uuid,
    ) -> MongoResult<Vec<T>>
    where
        T: serde::de::DeserializeOwned + Unpin + Send + Sync,
    {
        let documents: Vec<Stored<T>> = collection
            .find(by_session(session_id))
            .await
            .map_err(op_error("list", name))?
            .try_collect()
            .await
            .map_err(op_error("list", name))?;
        Ok(documents.into_iter().map(|stored| stored.body).collect())
    }

    async fn find_participant_by_token(
        &self,
        token: String,
    ) -> MongoResult<Option<ParticipantEntity>> {
        let collections = self.collections().await;
        let document = collections
            .participants
            .find_one(doc! { "lookup": token })
            .await
            .map_err(op_error("load participant", PARTICIPANTS))?;
        Ok(document.map(|stored| stored.body))
    }

    async fn save_artifact(&self, artifact: ArtifactEntity) -> MongoResult<()> {
        let collections = self.collections().await;
        let document = Stored::new(artifact.id, Some(artifact.session_id), artifact);
        collections
            .artifacts
            .replace_one(by_key(document.key.clone()), &document)
            .upsert(true)
            .await
            .map_err(op_error("save artifact", ARTIFACTS))?;
        Ok(())
    }

    async fn insert_triggers(&self, triggers: Vec<TriggerEntity>) -> MongoResult<()> {
        if triggers.is_empty() {
            return Ok(());
        }
        let collections = self.collections().await;
        let documents: Vec<_> = triggers
            .into_iter()
            .map(|trigger| Stored::new(trigger.id, Some(trigger.session_id), trigger))
            .collect();
        collections
            .triggers
            .insert_many(&documents)
            .await
            .map_err(op_error("insert triggers", TRIGGERS))?;
        Ok(())
    }

    async fn set_trigger_status(&self, trigger_id: Uuid, status: TriggerStatus) -> MongoResult<()> {
        let collections = self.collections().await;
        let filter = by_key(trigger_id.to_string());
        let Some(mut document) = collections
            .triggers
            .find_one(filter.clone())
            .await
            .map_err(op_error("load trigger", TRIGGERS))?
        else {
            return Err(MongoDaoError::MissingRecord {
                kind: "trigger",
                id: trigger_id,
            });
        };
        document.body.status = status;
        collections
            .triggers
            .replace_one(filter, &document)
            .await
            .map_err(op_error("save trigger", TRIGGERS))?;
        Ok(())
    }

    async fn find_currency_transaction(
        &self,
        id: Uuid,
    ) -> MongoResult<Option<CurrencyTransactionEntity>> {
        let collections = self.collections().await;
        let document = collections
            .currency_transactions
            .find_one(by_key(id.to_string()))
            .await
            .map_err(op_error("load transaction", CURRENCY_TRANSACTIONS))?;
        Ok(document.map(|stored| stored.body))
    }

    async fn currency_balance(&self, user_id: Uuid, tenant_id: Uuid) -> MongoResult<i64> {
        let collections = self.collections().await;
        let head = collections
            .currency_balances
            .find_one(by_key(currency_scope(user_id, tenant_id)))
            .await
            .map_err(op_error("load balance", CURRENCY_BALANCES))?;
        Ok(head.map_or(0, |head| head.balance))
    }

    async fn list_time_bank_entries(&self, session_id: Uuid) -> MongoResult<Vec<TimeBankEntryEntity>> {
        let collections = self.collections().await;
        let documents: Vec<Stored<TimeBankEntryEntity>> = collections
            .time_bank_entries
            .find(by_session(session_id))
            .sort(doc! { "body.position": 1 })
            .await
            .map_err(op_error("list entries", TIME_BANK_ENTRIES))?
            .try_collect()
            .await
            .map_err(op_error("list entries", TIME_BANK_ENTRIES))?;
        Ok(documents.into_iter().map(|stored| stored.body).collect())
    }

    async fn append_session_event(&self, event: SessionEventEntity) -> MongoResult<()> {
        let collections = self.collections().await;
        let document = Stored::new(event.id, Some(event.session_id), event);
        collections
            .session_events
            .insert_one(&document)
            .await
            .map_err(op_error("append event", SESSION_EVENTS))?;
        Ok(())
    }

    async fn list_session_events(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> MongoResult<Vec<SessionEventEntity>> {
        let collections = self.collections().await;
        let mut documents: Vec<Stored<SessionEventEntity>> = collections
            .session_events
            .find(by_session(session_id))
            .sort(doc! { "body.seq": -1 })
            .limit(limit as i64)
            .await
            .map_err(op_error("list events", SESSION_EVENTS))?
            .try_collect()
            .await
            .map_err(op_error("list events", SESSION_EVENTS))?;
        documents.reverse();
        Ok(documents.into_iter().map(|stored| stored.body).collect())
    }
}

async fn commit(session: &mut ClientSession) -> Result<(), MongoError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match session.commit_transaction().await {
            Err(err)
                if attempt < MAX_TRANSACTION_ATTEMPTS
                    && err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) => {}
            other => return other,
        }
    }
}

fn claim_fire<'a>(
    collections: &'a Collections,
    session: &'a mut ClientSession,
    claim: &'a TriggerFireClaim,
) -> TxnFuture<'a, Option<TriggerFireOutcome>> {
    Box::pin(async move {
        let trigger_filter = by_key(claim.trigger_id.to_string());
        let Some(mut trigger) = collections
            .triggers
            .find_one(trigger_filter.clone())
            .session(&mut *session)
            .await?
        else {
            return Ok(None);
        };

        let fire_key = keyed(claim.trigger_id, &claim.idempotency_key);
        if let Some(previous) = collections
            .trigger_fires
            .find_one(by_key(fire_key.clone()))
            .session(&mut *session)
            .await?
        {
            return Ok(Some(TriggerFireOutcome::Replay {
                fired_count: trigger.body.fired_count,
                original_fired_at: previous.body.fired_at,
            }));
        }
        if claim.execute_once && trigger.body.fired_count >= 1 {
            return Ok(Some(TriggerFireOutcome::Exhausted {
                fired_count: trigger.body.fired_count,
            }));
        }

        trigger.body.fired_count += 1;
        trigger.body.last_fired_at = Some(claim.fired_at);
        trigger.body.status = claim.status_after;
        let fired_count = trigger.body.fired_count;
        collections
            .triggers
            .replace_one(trigger_filter, &trigger)
            .session(&mut *session)
            .await?;

        let fire = Stored {
            key: fire_key,
            session: Some(claim.session_id.to_string()),
            lookup: None,
            body: TriggerFireEntity {
                trigger_id: claim.trigger_id,
                session_id: claim.session_id,
                idempotency_key: claim.idempotency_key.clone(),
                fired_count,
                fired_at: claim.fired_at,
            },
        };
        collections
            .trigger_fires
            .insert_one(&fire)
            .session(&mut *session)
            .await?;

        Ok(Some(TriggerFireOutcome::Fired {
            fired_count,
            fired_at: claim.fired_at,
        }))
    })
}

fn apply_time_bank<'a>(
    collections: &'a Collections,
    session: &'a mut ClientSession,
    request: &'a TimeBankDeltaRequest,
) -> TxnFuture<'a, TimeBankOutcome> {
    Box::pin(async move {
        let session_key = request.session_id.to_string();
        if let Some(event_id) = &request.event_id {
            if let Some(previous) = collections
                .time_bank_entries
                .find_one(doc! { "session": session_key.as_str(), "lookup": event_id.as_str() })
                .session(&mut *session)
                .await?
            {
                return Ok(TimeBankOutcome::Replayed(previous.body));
            }
        }

        let head = collections
            .time_bank_heads
            .find_one(by_key(session_key.clone()))
            .session(&mut *session)
            .await?
            .unwrap_or_else(|| LedgerHeadDocument {
                key: session_key.clone(),
                ..LedgerHeadDocument::default()
            });

        let next = match head.balance.checked_add(request.delta_seconds) {
            Some(next) if (request.min_balance..=request.max_balance).contains(&next) => next,
            _ => {
                return Ok(TimeBankOutcome::OutOfBounds {
                    balance: head.balance,
                });
            }
        };

        let entry = TimeBankEntryEntity {
            id: Uuid::new_v4(),
            session_id: request.session_id,
            position: head.count.max(0) as u64,
            delta_seconds: request.delta_seconds,
            reason: request.reason.clone(),
            metadata: request.metadata.clone(),
            event_id: request.event_id.clone(),
            actor: request.actor,
            balance_after: next,
            recorded_at: request.recorded_at,
        };
        let mut document = Stored::new(entry.id, Some(entry.session_id), entry.clone());
        document.lookup = request.event_id.clone();
        collections
            .time_bank_entries
            .insert_one(&document)
            .session(&mut *session)
            .await?;

        let head = LedgerHeadDocument {
            key: session_key,
            balance: next,
            count: head.count + 1,
        };
        collections
            .time_bank_heads
            .replace_one(by_key(head.key.clone()), &head)
            .upsert(true)
            .session(&mut *session)
            .await?;

        Ok(TimeBankOutcome::Applied(entry))
    })
}

fn apply_currency<'a>(
    collections: &'a Collections,
    session: &'a mut ClientSession,
    request: &'a CurrencyTransactionRequest,
) -> TxnFuture<'a, CurrencyOutcome> {
    Box::pin(async move {
        let idempotency = keyed(request.user_id, &request.idempotency_key);
        if let Some(previous) = collections
            .currency_transactions
            .find_one(doc! { "lookup": idempotency.as_str() })
            .session(&mut *session)
            .await?
        {
            return Ok(CurrencyOutcome::Replayed(previous.body));
        }
        if let Some(rejection) = collections
            .currency_rejections
            .find_one(by_key(idempotency.clone()))
            .session(&mut *session)
            .await?
        {
            return Ok(CurrencyOutcome::Rejected {
                balance: rejection.body.balance,
                requested: rejection.body.requested,
                replay: true,
            });
        }

        let scope = currency_scope(request.user_id, request.tenant_id);
        let head = collections
            .currency_balances
            .find_one(by_key(scope.clone()))
            .session(&mut *session)
            .await?
            .unwrap_or_else(|| LedgerHeadDocument {
                key: scope.clone(),
                ..LedgerHeadDocument::default()
            });

        let Some(next) = head.balance.checked_add(request.delta) else {
            return Ok(CurrencyOutcome::Overflow {
                balance: head.balance,
            });
        };
        if request.delta < 0 && next < 0 {
            let rejection = Stored {
                key: idempotency,
                session: None,
                lookup: None,
                body: CurrencyRejectionEntity {
                    user_id: request.user_id,
                    idempotency_key: request.idempotency_key.clone(),
                    balance: head.balance,
                    requested: request.amount,
                },
            };
            collections
                .currency_rejections
                .insert_one(&rejection)
                .session(&mut *session)
                .await?;
            return Ok(CurrencyOutcome::Rejected {
                balance: head.balance,
                requested: request.amount,
                replay: false,
            });
        }

        let row = CurrencyTransactionEntity {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            tenant_id: request.tenant_id,
            kind: request.kind,
            amount: request.amount,
            delta: request.delta,
            reason_code: request.reason_code.clone(),
            idempotency_key: request.idempotency_key.clone(),
            refund_of: request.refund_of,
            metadata: request.metadata.clone(),
            balance_after: next,
            created_at: request.created_at,
        };
        let document = Stored::new(row.id, None, row.clone()).with_lookup(idempotency);
        collections
            .currency_transactions
            .insert_one(&document)
            .session(&mut *session)
            .await?;

        let head = LedgerHeadDocument {
            key: scope,
            balance: next,
            count: head.count + 1,
        };
        collections
            .currency_balances
            .replace_one(by_key(head.key.clone()), &head)
            .upsert(true)
            .session(&mut *session)
            .await?;

        Ok(CurrencyOutcome::Applied(row))
    })
}

impl PlayGateway for MongoPlayGateway {
    fn reserve_join_code(
        &self,
        code: String,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .reserve_join_code(code, session_id)
                .await
                .map_err(Into::into)
        })
    }

    fn save_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.save_session(session).await.map_err(Into::into) })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_session(by_key(id.to_string()))
                .await
                .map_err(Into::into)
        })
    }

    fn find_session_by_code(
        &self,
        code: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_session(doc! { "lookup": code })
                .await
                .map_err(Into::into)
        })
    }

    fn increment_broadcast_seq(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .increment_broadcast_seq(session_id)
                .await
                .map_err(Into::into)
        })
    }

    fn current_broadcast_seq(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .current_broadcast_seq(session_id)
                .await
                .map_err(Into::into)
        })
    }

    fn save_participant(
        &self,
        participant: ParticipantEntity,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.save_participant(participant).await.map_err(Into::into) })
    }

    fn list_participants(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let collections = store.collections().await;
            Self::list_by_session(&collections.participants, PARTICIPANTS, session_id)
                .await
                .map_err(Into::into)
        })
    }

    fn find_participant_by_token(
        &self,
        token: String,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_participant_by_token(token)
                .await
                .map_err(Into::into)
        })
    }

    fn save_artifact(&self, artifact: ArtifactEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.save_artifact(artifact).await.map_err(Into::into) })
    }

    fn list_artifacts(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ArtifactEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let collections = store.collections().await;
            Self::list_by_session(&collections.artifacts, ARTIFACTS, session_id)
                .await
                .map_err(Into::into)
        })
    }

    fn insert_triggers(
        &self,
        triggers: Vec<TriggerEntity>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.insert_triggers(triggers).await.map_err(Into::into) })
    }

    fn set_trigger_status(
        &self,
        trigger_id: Uuid,
        status: TriggerStatus,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .set_trigger_status(trigger_id, status)
                .await
                .map_err(Into::into)
        })
    }

    fn list_triggers(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<TriggerEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let collections = store.collections().await;
            Self::list_by_session(&collections.triggers, TRIGGERS, session_id)
                .await
                .map_err(Into::into)
        })
    }

    fn claim_trigger_fire(
        &self,
        claim: TriggerFireClaim,
    ) -> BoxFuture<'static, StorageResult<TriggerFireOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            let outcome = store.transact("claim trigger fire", &claim, claim_fire).await?;
            outcome
                .ok_or(MongoDaoError::MissingRecord {
                    kind: "trigger",
                    id: claim.trigger_id,
                })
                .map_err(Into::into)
        })
    }

    fn apply_time_bank_delta(
        &self,
        request: TimeBankDeltaRequest,
    ) -> BoxFuture<'static, StorageResult<TimeBankOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .transact("apply time bank delta", &request, apply_time_bank)
                .await
                .map_err(Into::into)
        })
    }

    fn list_time_bank_entries(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<TimeBankEntryEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .list_time_bank_entries(session_id)
                .await
                .map_err(Into::into)
        })
    }

    fn apply_currency_transaction(
        &self,
        request: CurrencyTransactionRequest,
    ) -> BoxFuture<'static, StorageResult<CurrencyOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .transact("apply currency transaction", &request, apply_currency)
                .await
                .map_err(Into::into)
        })
    }

    fn find_currency_transaction(
        &self,
        id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<CurrencyTransactionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_currency_transaction(id).await.map_err(Into::into) })
    }

    fn currency_balance(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<i64>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .currency_balance(user_id, tenant_id)
                .await
                .map_err(Into::into)
        })
    }

    fn append_session_event(
        &self,
        event: SessionEventEntity,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.append_session_event(event).await.map_err(Into::into) })
    }

    fn list_session_events(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<SessionEventEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .list_session_events(session_id, limit)
                .await
                .map_err(Into::into)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
