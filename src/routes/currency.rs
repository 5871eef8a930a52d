use axum::{
    Json, Router,
    extract::{Path, Query, State},
    middleware,
    routing::{get, post},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::currency::{BalanceQuery, BalanceView, CurrencyTransactionInput, CurrencyTransactionView},
    error::AppError,
    routes::identity::require_facilitator,
    services::ledger_service,
    state::SharedState,
};

/// Currency ledger endpoints, available to any identified facilitator.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/currency/transactions", post(create_transaction))
        .route("/currency/transactions/{id}/refund", post(refund_transaction))
        .route("/currency/balance", get(balance))
        .route_layer(middleware::from_fn(require_facilitator))
}

/// Earn or spend currency.
#[utoipa::path(
    post,
    path = "/currency/transactions",
    tag = "ledgers",
    params(("x-facilitator-id" = String, Header, description = "Facilitator user id")),
    request_body = CurrencyTransactionInput,
    responses(
        (status = 200, description = "Transaction applied or replayed", body = CurrencyTransactionView),
        (status = 422, description = "Spend exceeds the balance")
    )
)]
pub async fn create_transaction(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<CurrencyTransactionInput>>,
) -> Result<Json<CurrencyTransactionView>, AppError> {
    Ok(Json(ledger_service::apply_currency(&state, payload).await?))
}

/// Refund a prior transaction. Refunding twice returns the first refund.
#[utoipa::path(
    post,
    path = "/currency/transactions/{id}/refund",
    tag = "ledgers",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        ("id" = Uuid, Path, description = "Transaction to refund")
    ),
    responses(
        (status = 200, description = "Refund row", body = CurrencyTransactionView),
        (status = 404, description = "Unknown transaction"),
        (status = 422, description = "Refund would overdraw the balance")
    )
)]
pub async fn refund_transaction(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CurrencyTransactionView>, AppError> {
    Ok(Json(ledger_service::refund(&state, id).await?))
}

/// Current balance of a user within a tenant.
#[utoipa::path(
    get,
    path = "/currency/balance",
    tag = "ledgers",
    params(
        ("x-facilitator-id" = String, Header, description = "Facilitator user id"),
        BalanceQuery
    ),
    responses((status = 200, description = "Balance", body = BalanceView))
)]
pub async fn balance(
    State(state): State<SharedState>,
    Query(query): Query<BalanceQuery>,
) -> Result<Json<BalanceView>, AppError> {
    Ok(Json(
        ledger_service::balance(&state, query.user_id, query.tenant_id).await?,
    ))
}
