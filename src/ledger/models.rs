use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One applied balance mutation, journaled under its idempotency key.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub member_id: Uuid,
    pub idempotency_key: String,
    pub delta: i32,
    pub reason: String,
    pub remaining_after: i32,
    pub total_after: i32,
    pub created_at: DateTime<Utc>,
}

/// Authoritative balance read for a member.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BalanceSnapshot {
    pub member_id: Uuid,
    pub remaining_sessions: i32,
    pub total_sessions: i32,
}

/// Result of a credit/debit. `applied` is false when the idempotency key had
/// already been observed and the prior entry was returned untouched.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerOutcome {
    pub entry: LedgerEntry,
    pub applied: bool,
}
