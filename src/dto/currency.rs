use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::models::{CurrencyTransactionEntity, CurrencyTransactionKind},
    dto::{format_timestamp, validation::validate_idempotency_key},
};

/// Earn or spend request.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CurrencyTransactionInput {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    /// `earn` or `spend`; refunds go through the refund route.
    pub kind: CurrencyTransactionKind,
    #[validate(range(min = 1, max = 1_000_000_000))]
    pub amount: i64,
    #[validate(length(min = 1, max = 64))]
    pub reason_code: String,
    #[validate(length(max = 128), custom(function = validate_idempotency_key))]
    pub idempotency_key: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
}

/// Currency ledger row.
#[derive(Debug, Serialize, ToSchema, Clone)]
pub struct CurrencyTransactionView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub kind: CurrencyTransactionKind,
    pub amount: i64,
    pub delta: i64,
    pub reason_code: String,
    pub idempotency_key: String,
    pub refund_of: Option<Uuid>,
    pub balance_after: i64,
    pub created_at: String,
    /// `true` when the key had been used before and nothing was appended.
    pub replayed: bool,
}

impl CurrencyTransactionView {
    pub fn new(row: CurrencyTransactionEntity, replayed: bool) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            tenant_id: row.tenant_id,
            kind: row.kind,
            amount: row.amount,
            delta: row.delta,
            reason_code: row.reason_code,
            idempotency_key: row.idempotency_key,
            refund_of: row.refund_of,
            balance_after: row.balance_after,
            created_at: format_timestamp(row.created_at),
            replayed,
        }
    }
}

/// Balance lookup.
#[derive(Debug, Deserialize, IntoParams)]
pub struct BalanceQuery {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
}

/// Balance projection.
#[derive(Debug, Serialize, ToSchema)]
pub struct BalanceView {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub balance: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn earn(amount: i64) -> CurrencyTransactionInput {
        CurrencyTransactionInput {
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            kind: CurrencyTransactionKind::Earn,
            amount,
            reason_code: "bonus".into(),
            idempotency_key: "earn-1".into(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_amount_range() {
        assert!(earn(1).validate().is_ok());
        assert!(earn(1_000_000_000).validate().is_ok());
        assert!(earn(0).validate().is_err());
        assert!(earn(i64::MAX).validate().is_err());
    }
}
