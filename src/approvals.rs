use axum::{
    extract::{Extension, Path},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};
use crate::ledger::{BalanceSnapshot, SessionLedger};

/// Plan catalog entry. Plans are mutable over time, which is exactly why
/// requests and payments snapshot `sessions` instead of referencing back.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MembershipPlan {
    pub code: String,
    pub name: String,
    pub sessions: i32,
    pub amount_cents: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MembershipRequest {
    pub id: Uuid,
    pub member_id: Uuid,
    pub email: String,
    pub membership_type: String,
    pub sessions: i32,
    pub requested_at: DateTime<Utc>,
    pub status: String,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub member_id: Uuid,
    pub member_name: String,
    pub amount_cents: i32,
    pub membership: String,
    pub sessions: i32,
    pub request_id: Option<Uuid>,
    pub paid_at: DateTime<Utc>,
    pub status: String,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ApprovalOutcome {
    pub request: MembershipRequest,
    pub payment: PaymentRecord,
    pub balance: BalanceSnapshot,
    /// False when the request had already been approved and nothing moved.
    pub applied: bool,
}

#[derive(Debug, Serialize)]
pub struct PaymentOutcome {
    pub payment: PaymentRecord,
    pub balance: BalanceSnapshot,
    pub applied: bool,
}

/// Turns a pending membership request into a ledger grant plus a payment
/// record, exactly once; also handles direct payments and their reversal.
#[derive(Clone)]
pub struct ApprovalWorkflow {
    pool: PgPool,
    ledger: SessionLedger,
}

impl ApprovalWorkflow {
    pub fn new(pool: PgPool) -> Self {
        let ledger = SessionLedger::new(pool.clone());
        Self { pool, ledger }
    }

    /// Creates a request with the plan's session count snapshotted at
    /// creation time. Later plan edits must not change what an approval
    /// grants.
    pub async fn create_request(
        &self,
        member_id: Uuid,
        plan_code: &str,
    ) -> AppResult<MembershipRequest> {
        let mut tx = self.pool.begin().await?;

        let member = sqlx::query_as::<_, MemberContact>(
            "SELECT email FROM members WHERE id = $1",
        )
        .bind(member_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;

        let plan = load_plan(&mut tx, plan_code).await?;
        if !plan.active {
            return Err(AppError::BadRequest(format!(
                "plan `{plan_code}` is no longer offered"
            )));
        }

        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM membership_requests WHERE member_id = $1 AND status = 'pending'",
        )
        .bind(member_id)
        .fetch_one(&mut *tx)
        .await?;
        let max_pending = *config::MAX_PENDING_REQUESTS_PER_MEMBER;
        if pending >= max_pending {
            return Err(AppError::BadRequest(format!(
                "member already has {pending} pending requests (limit {max_pending})"
            )));
        }

        let request = sqlx::query_as::<_, MembershipRequest>(
            r#"
            INSERT INTO membership_requests (
                id, member_id, email, membership_type, sessions, requested_at, status
            ) VALUES ($1, $2, $3, $4, $5, NOW(), 'pending')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(member_id)
        .bind(&member.email)
        .bind(&plan.code)
        .bind(plan.sessions)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(request)
    }

    /// Approves a pending request: grant the snapshotted session count,
    /// flip the status, and record the payment, all in one transaction
    /// keyed by the request id so a retried call cannot re-credit.
    pub async fn approve(&self, request_id: Uuid) -> AppResult<ApprovalOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let request = sqlx::query_as::<_, MembershipRequest>(
            "SELECT * FROM membership_requests WHERE id = $1 FOR UPDATE",
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;

        match request.status.as_str() {
            "pending" => {}
            "approved" => {
                drop(tx);
                return self.approved_outcome(request).await;
            }
            other => {
                return Err(AppError::StaleWrite(format!(
                    "request was already resolved as {other}"
                )))
            }
        }

        let request = sqlx::query_as::<_, MembershipRequest>(
            r#"
            UPDATE membership_requests
            SET status = 'approved', resolved_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(request_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        // The grant amount comes from the request's snapshot, never from the
        // live plan definition.
        let grant = self
            .ledger
            .grant(
                &mut tx,
                request.member_id,
                request.sessions,
                "approval",
                &format!("request:{request_id}:approval"),
            )
            .await?;

        let member_name: String = sqlx::query_scalar(
            "UPDATE members SET membership = $2, updated_at = NOW() WHERE id = $1 RETURNING name",
        )
        .bind(request.member_id)
        .bind(&request.membership_type)
        .fetch_one(&mut *tx)
        .await?;

        let amount_cents: Option<i32> =
            sqlx::query_scalar("SELECT amount_cents FROM membership_plans WHERE code = $1")
                .bind(&request.membership_type)
                .fetch_optional(&mut *tx)
                .await?;

        // `request_id` is unique on payments, so a resumed approval after a
        // mid-operation crash cannot insert a second record.
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, member_id, member_name, amount_cents, membership,
                sessions, request_id, paid_at, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'completed')
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.member_id)
        .bind(&member_name)
        .bind(amount_cents.unwrap_or(0))
        .bind(&request.membership_type)
        .bind(request.sessions)
        .bind(request_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let payment = sqlx::query_as::<_, PaymentRecord>(
            "SELECT * FROM payments WHERE request_id = $1",
        )
        .bind(request_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(
            request_id = %request.id,
            member_id = %request.member_id,
            sessions = request.sessions,
            plan = %request.membership_type,
            "membership request approved"
        );

        Ok(ApprovalOutcome {
            balance: BalanceSnapshot {
                member_id: request.member_id,
                remaining_sessions: grant.entry.remaining_after,
                total_sessions: grant.entry.total_after,
            },
            request,
            payment,
            applied: grant.applied,
        })
    }

    /// Rejecting is idempotent and never touches the ledger.
    pub async fn reject(&self, request_id: Uuid) -> AppResult<MembershipRequest> {
        let rejected = sqlx::query_as::<_, MembershipRequest>(
            r#"
            UPDATE membership_requests
            SET status = 'rejected', resolved_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(request) = rejected {
            return Ok(request);
        }

        let request = sqlx::query_as::<_, MembershipRequest>(
            "SELECT * FROM membership_requests WHERE id = $1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)?;
        match request.status.as_str() {
            "rejected" => Ok(request),
            other => Err(AppError::StaleWrite(format!(
                "request was already resolved as {other}"
            ))),
        }
    }

    /// Direct payment entry outside the request flow: grant + payment in
    /// one transaction, keyed by the payment id.
    pub async fn record_payment(
        &self,
        member_id: Uuid,
        plan_code: &str,
    ) -> AppResult<PaymentOutcome> {
        let payment_id = Uuid::new_v4();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let plan = load_plan(&mut tx, plan_code).await?;
        if !plan.active {
            return Err(AppError::BadRequest(format!(
                "plan `{plan_code}` is no longer offered"
            )));
        }

        let grant = self
            .ledger
            .grant(
                &mut tx,
                member_id,
                plan.sessions,
                "payment",
                &format!("payment:{payment_id}:grant"),
            )
            .await?;

        let member_name: String = sqlx::query_scalar(
            "UPDATE members SET membership = $2, updated_at = NOW() WHERE id = $1 RETURNING name",
        )
        .bind(member_id)
        .bind(&plan.code)
        .fetch_one(&mut *tx)
        .await?;

        let payment = sqlx::query_as::<_, PaymentRecord>(
            r#"
            INSERT INTO payments (
                id, member_id, member_name, amount_cents, membership,
                sessions, paid_at, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'completed')
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(member_id)
        .bind(&member_name)
        .bind(plan.amount_cents)
        .bind(&plan.code)
        .bind(plan.sessions)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(
            payment_id = %payment.id,
            %member_id,
            plan = %plan.code,
            sessions = plan.sessions,
            "direct payment recorded"
        );

        Ok(PaymentOutcome {
            payment,
            balance: BalanceSnapshot {
                member_id,
                remaining_sessions: grant.entry.remaining_after,
                total_sessions: grant.entry.total_after,
            },
            applied: grant.applied,
        })
    }

    /// Reverses the sessions a payment granted, floored so the balance
    /// cannot go negative. Cancelling an already-cancelled payment is a
    /// no-op.
    pub async fn cancel_payment(&self, payment_id: Uuid) -> AppResult<PaymentOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let payment = sqlx::query_as::<_, PaymentRecord>(
            r#"
            UPDATE payments
            SET status = 'cancelled', cancelled_at = $2
            WHERE id = $1 AND status = 'completed'
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(payment) = payment else {
            drop(tx);
            let payment = sqlx::query_as::<_, PaymentRecord>(
                "SELECT * FROM payments WHERE id = $1",
            )
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
            let balance = self.ledger.read_balance(payment.member_id).await?;
            return Ok(PaymentOutcome {
                payment,
                balance,
                applied: false,
            });
        };

        // Reverse the payment's own snapshot, not a re-derived live-plan
        // value.
        let debit = self
            .ledger
            .debit_floored(
                &mut tx,
                payment.member_id,
                payment.sessions,
                "payment-cancellation",
                &format!("payment:{payment_id}:cancel"),
            )
            .await?;

        tx.commit().await?;
        tracing::info!(
            payment_id = %payment.id,
            member_id = %payment.member_id,
            reversed = debit.entry.delta,
            "payment cancelled"
        );

        Ok(PaymentOutcome {
            balance: BalanceSnapshot {
                member_id: payment.member_id,
                remaining_sessions: debit.entry.remaining_after,
                total_sessions: debit.entry.total_after,
            },
            payment,
            applied: debit.applied,
        })
    }

    async fn approved_outcome(&self, request: MembershipRequest) -> AppResult<ApprovalOutcome> {
        let payment = sqlx::query_as::<_, PaymentRecord>(
            "SELECT * FROM payments WHERE request_id = $1",
        )
        .bind(request.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            AppError::Message("approved request is missing its payment record".into())
        })?;
        let balance = self.ledger.read_balance(request.member_id).await?;
        Ok(ApprovalOutcome {
            request,
            payment,
            balance,
            applied: false,
        })
    }
}

#[derive(Debug, FromRow)]
struct MemberContact {
    email: String,
}

async fn load_plan(
    tx: &mut Transaction<'_, Postgres>,
    plan_code: &str,
) -> AppResult<MembershipPlan> {
    let plan =
        sqlx::query_as::<_, MembershipPlan>("SELECT * FROM membership_plans WHERE code = $1")
            .bind(plan_code)
            .fetch_optional(&mut *tx)
            .await?;
    plan.ok_or_else(|| AppError::BadRequest(format!("unknown membership plan `{plan_code}`")))
}

pub fn routes() -> Router {
    Router::new()
        .route("/api/plans", get(list_plans))
        .route("/api/requests", post(create_request))
        .route("/api/requests/:id/approve", post(approve_request))
        .route("/api/requests/:id/reject", post(reject_request))
        .route("/api/payments", post(create_payment))
        .route("/api/payments/:id/cancel", post(cancel_payment))
}

#[derive(Debug, Deserialize)]
pub struct CreateRequestPayload {
    pub member_id: Uuid,
    pub plan_code: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentPayload {
    pub member_id: Uuid,
    pub plan_code: String,
}

async fn list_plans(Extension(pool): Extension<PgPool>) -> AppResult<Json<Vec<MembershipPlan>>> {
    let plans = sqlx::query_as::<_, MembershipPlan>(
        "SELECT * FROM membership_plans WHERE active = TRUE ORDER BY created_at ASC",
    )
    .fetch_all(&pool)
    .await?;
    Ok(Json(plans))
}

async fn create_request(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<CreateRequestPayload>,
) -> AppResult<Json<MembershipRequest>> {
    let workflow = ApprovalWorkflow::new(pool);
    let request = workflow
        .create_request(payload.member_id, &payload.plan_code)
        .await?;
    Ok(Json(request))
}

async fn approve_request(
    Extension(pool): Extension<PgPool>,
    Path(request_id): Path<Uuid>,
) -> AppResult<Json<ApprovalOutcome>> {
    let workflow = ApprovalWorkflow::new(pool);
    let outcome = workflow.approve(request_id).await?;
    Ok(Json(outcome))
}

async fn reject_request(
    Extension(pool): Extension<PgPool>,
    Path(request_id): Path<Uuid>,
) -> AppResult<Json<MembershipRequest>> {
    let workflow = ApprovalWorkflow::new(pool);
    let request = workflow.reject(request_id).await?;
    Ok(Json(request))
}

async fn create_payment(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<CreatePaymentPayload>,
) -> AppResult<Json<PaymentOutcome>> {
    let workflow = ApprovalWorkflow::new(pool);
    let outcome = workflow
        .record_payment(payload.member_id, &payload.plan_code)
        .await?;
    Ok(Json(outcome))
}

async fn cancel_payment(
    Extension(pool): Extension<PgPool>,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Json<PaymentOutcome>> {
    let workflow = ApprovalWorkflow::new(pool);
    let outcome = workflow.cancel_payment(payment_id).await?;
    Ok(Json(outcome))
}
