use axum::{
    extract::{Extension, Path},
    Json,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppResult;

use super::models::{BalanceSnapshot, LedgerEntry};
use super::service::SessionLedger;

pub async fn member_balance(
    Extension(pool): Extension<PgPool>,
    Path(member_id): Path<Uuid>,
) -> AppResult<Json<BalanceSnapshot>> {
    let ledger = SessionLedger::new(pool);
    let snapshot = ledger.read_balance(member_id).await?;
    Ok(Json(snapshot))
}

pub async fn member_history(
    Extension(pool): Extension<PgPool>,
    Path(member_id): Path<Uuid>,
) -> AppResult<Json<Vec<LedgerEntry>>> {
    let ledger = SessionLedger::new(pool.clone());
    // Surface NotFound for unknown members rather than an empty journal.
    ledger.read_balance(member_id).await?;
    let entries = ledger.history(member_id).await?;
    Ok(Json(entries))
}
