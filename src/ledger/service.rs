use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{is_unique_violation, AppError, AppResult};

use super::models::{BalanceSnapshot, LedgerEntry, LedgerOutcome};

/// All session-credit balance mutations flow through this service. Every
/// mutation is journaled in `ledger_entries` under a caller-supplied
/// idempotency key; a repeated key returns the prior entry without touching
/// the balance again. Mutations take an open transaction so callers can
/// compose them with enrollment and status changes into one atomic unit.
#[derive(Clone)]
pub struct SessionLedger {
    pool: PgPool,
}

impl SessionLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn read_balance(&self, member_id: Uuid) -> AppResult<BalanceSnapshot> {
        let snapshot = sqlx::query_as::<_, BalanceSnapshot>(
            "SELECT id AS member_id, remaining_sessions, total_sessions FROM members WHERE id = $1",
        )
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?;
        snapshot.ok_or(AppError::NotFound)
    }

    pub async fn history(&self, member_id: Uuid) -> AppResult<Vec<LedgerEntry>> {
        let entries = sqlx::query_as::<_, LedgerEntry>(
            "SELECT * FROM ledger_entries WHERE member_id = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Returns remaining sessions to a member (booking cancellation).
    /// `total_sessions` is untouched; it only grows through grants.
    pub async fn credit(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        member_id: Uuid,
        amount: i32,
        reason: &str,
        idempotency_key: &str,
    ) -> AppResult<LedgerOutcome> {
        require_positive(amount)?;
        if let Some(prior) = self.find_entry(tx, idempotency_key).await? {
            return Ok(LedgerOutcome {
                entry: prior,
                applied: false,
            });
        }

        let balance = sqlx::query_as::<_, BalanceSnapshot>(
            r#"
            UPDATE members
            SET remaining_sessions = remaining_sessions + $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id AS member_id, remaining_sessions, total_sessions
            "#,
        )
        .bind(member_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;

        let entry = self
            .insert_entry(tx, member_id, idempotency_key, amount, reason, &balance)
            .await?;
        Ok(LedgerOutcome {
            entry,
            applied: true,
        })
    }

    /// Grants newly purchased sessions (approval or direct payment), raising
    /// both `remaining_sessions` and the lifetime `total_sessions`.
    pub async fn grant(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        member_id: Uuid,
        amount: i32,
        reason: &str,
        idempotency_key: &str,
    ) -> AppResult<LedgerOutcome> {
        require_positive(amount)?;
        if let Some(prior) = self.find_entry(tx, idempotency_key).await? {
            return Ok(LedgerOutcome {
                entry: prior,
                applied: false,
            });
        }

        let balance = sqlx::query_as::<_, BalanceSnapshot>(
            r#"
            UPDATE members
            SET remaining_sessions = remaining_sessions + $2,
                total_sessions = total_sessions + $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id AS member_id, remaining_sessions, total_sessions
            "#,
        )
        .bind(member_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;

        let entry = self
            .insert_entry(tx, member_id, idempotency_key, amount, reason, &balance)
            .await?;
        Ok(LedgerOutcome {
            entry,
            applied: true,
        })
    }

    /// Consumes sessions. The update is conditional on a sufficient balance,
    /// so a negative value can never be written.
    pub async fn debit(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        member_id: Uuid,
        amount: i32,
        reason: &str,
        idempotency_key: &str,
    ) -> AppResult<LedgerOutcome> {
        require_positive(amount)?;
        if let Some(prior) = self.find_entry(tx, idempotency_key).await? {
            return Ok(LedgerOutcome {
                entry: prior,
                applied: false,
            });
        }

        let balance = sqlx::query_as::<_, BalanceSnapshot>(
            r#"
            UPDATE members
            SET remaining_sessions = remaining_sessions - $2, updated_at = NOW()
            WHERE id = $1 AND remaining_sessions >= $2
            RETURNING id AS member_id, remaining_sessions, total_sessions
            "#,
        )
        .bind(member_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance) = balance else {
            let remaining: Option<i32> =
                sqlx::query_scalar("SELECT remaining_sessions FROM members WHERE id = $1")
                    .bind(member_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return match remaining {
                Some(remaining) => Err(AppError::InsufficientBalance {
                    remaining,
                    requested: amount,
                }),
                None => Err(AppError::NotFound),
            };
        };

        let entry = self
            .insert_entry(tx, member_id, idempotency_key, -amount, reason, &balance)
            .await?;
        Ok(LedgerOutcome {
            entry,
            applied: true,
        })
    }

    /// Debit variant for payment reversals: takes at most `amount`, flooring
    /// the balance at zero, and journals the delta actually applied.
    pub async fn debit_floored(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        member_id: Uuid,
        amount: i32,
        reason: &str,
        idempotency_key: &str,
    ) -> AppResult<LedgerOutcome> {
        require_positive(amount)?;
        if let Some(prior) = self.find_entry(tx, idempotency_key).await? {
            return Ok(LedgerOutcome {
                entry: prior,
                applied: false,
            });
        }

        let row = sqlx::query_as::<_, FlooredDebitRow>(
            r#"
            WITH prior AS (
                SELECT remaining_sessions FROM members WHERE id = $1 FOR UPDATE
            )
            UPDATE members m
            SET remaining_sessions = GREATEST(m.remaining_sessions - $2, 0),
                updated_at = NOW()
            FROM prior
            WHERE m.id = $1
            RETURNING m.id AS member_id,
                      m.remaining_sessions,
                      m.total_sessions,
                      prior.remaining_sessions AS prior_remaining
            "#,
        )
        .bind(member_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;

        let applied_delta = row.prior_remaining.min(amount);
        let balance = BalanceSnapshot {
            member_id: row.member_id,
            remaining_sessions: row.remaining_sessions,
            total_sessions: row.total_sessions,
        };
        let entry = self
            .insert_entry(
                tx,
                member_id,
                idempotency_key,
                -applied_delta,
                reason,
                &balance,
            )
            .await?;
        Ok(LedgerOutcome {
            entry,
            applied: true,
        })
    }

    async fn find_entry(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        idempotency_key: &str,
    ) -> AppResult<Option<LedgerEntry>> {
        let entry = sqlx::query_as::<_, LedgerEntry>(
            "SELECT * FROM ledger_entries WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&mut *tx)
        .await?;
        Ok(entry)
    }

    async fn insert_entry(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        member_id: Uuid,
        idempotency_key: &str,
        delta: i32,
        reason: &str,
        balance: &BalanceSnapshot,
    ) -> AppResult<LedgerEntry> {
        let result = sqlx::query_as::<_, LedgerEntry>(
            r#"
            INSERT INTO ledger_entries (
                id, member_id, idempotency_key, delta, reason, remaining_after, total_after
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(member_id)
        .bind(idempotency_key)
        .bind(delta)
        .bind(reason)
        .bind(balance.remaining_sessions)
        .bind(balance.total_sessions)
        .fetch_one(&mut *tx)
        .await;

        match result {
            Ok(entry) => Ok(entry),
            // A concurrent writer journaled the same key first. Abort so the
            // enclosing transaction rolls back; a retry will find the prior
            // entry and return it without re-applying.
            Err(err) if is_unique_violation(&err) => Err(AppError::StaleWrite(format!(
                "ledger entry `{idempotency_key}` was applied concurrently"
            ))),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FlooredDebitRow {
    member_id: Uuid,
    remaining_sessions: i32,
    total_sessions: i32,
    prior_remaining: i32,
}

fn require_positive(amount: i32) -> AppResult<()> {
    if amount <= 0 {
        return Err(AppError::BadRequest(
            "ledger amounts must be positive".into(),
        ));
    }
    Ok(())
}
