use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::models::TriggerEntity,
    dto::{format_optional, validation::validate_idempotency_key},
    state::{
        RealtimeMessage,
        trigger::{TriggerAction, TriggerCondition, TriggerStatus},
    },
};

/// Trigger as seen by the facilitator.
#[derive(Debug, Serialize, ToSchema, Clone)]
pub struct TriggerView {
    pub id: Uuid,
    pub name: String,
    pub condition: TriggerCondition,
    pub actions: Vec<TriggerAction>,
    pub execute_once: bool,
    pub delay_seconds: u32,
    pub status: TriggerStatus,
    pub fired_count: u32,
    pub last_fired_at: Option<String>,
}

impl From<&TriggerEntity> for TriggerView {
    fn from(trigger: &TriggerEntity) -> Self {
        Self {
            id: trigger.id,
            name: trigger.name.clone(),
            condition: trigger.condition.clone(),
            actions: trigger.actions.clone(),
            execute_once: trigger.execute_once,
            delay_seconds: trigger.delay_seconds,
            status: trigger.status,
            fired_count: trigger.fired_count,
            last_fired_at: format_optional(trigger.last_fired_at),
        }
    }
}

/// Manual fire request.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct FireTriggerRequest {
    /// Client-chosen key; retries with the same key never fire twice.
    #[validate(length(max = 128), custom(function = validate_idempotency_key))]
    pub idempotency_key: String,
}

/// Why a manual fire did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NoopReason {
    /// An `execute_once` trigger had fired before.
    ExecuteOnceAlreadyFired,
    /// The idempotency key was used before.
    IdempotencyReplay,
}

/// Manual fire result.
#[derive(Debug, Serialize, ToSchema)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FireTriggerResponse {
    /// Actions ran.
    Fired {
        fired_count: u32,
        fired_at: String,
        published: Vec<RealtimeMessage>,
    },
    /// Nothing happened.
    Noop {
        reason: NoopReason,
        /// First fire time under the replayed key.
        original_fired_at: Option<String>,
        /// Ledger actions recovered by the replay; usually empty.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        published: Vec<RealtimeMessage>,
    },
}

/// Result of arm, disable or disable-all.
#[derive(Debug, Serialize, ToSchema)]
pub struct TriggerStatusResponse {
    pub triggers: Vec<TriggerView>,
    pub published: Vec<RealtimeMessage>,
}
