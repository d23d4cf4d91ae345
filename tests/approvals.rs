use gymcore::approvals::ApprovalWorkflow;
use gymcore::error::AppError;
use gymcore::ledger::SessionLedger;
use sqlx::PgPool;
use uuid::Uuid;

async fn seed_member(pool: &PgPool, remaining: i32, total: i32) -> Uuid {
    let member_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO members (id, email, name, remaining_sessions, total_sessions) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(member_id)
    .bind(format!("{member_id}@example.com"))
    .bind("Test Member")
    .bind(remaining)
    .bind(total)
    .execute(pool)
    .await
    .unwrap();
    member_id
}

async fn seed_plan(pool: &PgPool, code: &str, sessions: i32, amount_cents: i32) {
    sqlx::query(
        "INSERT INTO membership_plans (code, name, sessions, amount_cents) VALUES ($1, $2, $3, $4)",
    )
    .bind(code)
    .bind(code)
    .bind(sessions)
    .bind(amount_cents)
    .execute(pool)
    .await
    .unwrap();
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn double_approval_credits_once_and_creates_one_payment(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let member_id = seed_member(&pool, 0, 0).await;
    seed_plan(&pool, "premium", 20, 9900).await;
    let workflow = ApprovalWorkflow::new(pool.clone());

    let request = workflow.create_request(member_id, "premium").await.unwrap();
    assert_eq!(request.sessions, 20, "plan sessions are snapshotted at creation");

    let first = workflow.approve(request.id).await.unwrap();
    assert!(first.applied);
    assert_eq!(first.balance.remaining_sessions, 20);
    assert_eq!(first.balance.total_sessions, 20);
    assert_eq!(first.payment.status, "completed");

    // A retried network call replays the approval.
    let second = workflow.approve(request.id).await.unwrap();
    assert!(!second.applied);
    assert_eq!(second.payment.id, first.payment.id);
    assert_eq!(second.balance.remaining_sessions, 20);

    let payments: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM payments WHERE request_id = $1")
            .bind(request.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payments, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn approval_grants_the_snapshot_not_the_live_plan(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let member_id = seed_member(&pool, 0, 0).await;
    seed_plan(&pool, "premium", 20, 9900).await;
    let workflow = ApprovalWorkflow::new(pool.clone());

    let request = workflow.create_request(member_id, "premium").await.unwrap();

    // The plan definition changes between request and approval.
    sqlx::query("UPDATE membership_plans SET sessions = 25 WHERE code = 'premium'")
        .execute(&pool)
        .await
        .unwrap();

    let outcome = workflow.approve(request.id).await.unwrap();
    assert_eq!(outcome.balance.remaining_sessions, 20, "the snapshot wins");
    assert_eq!(outcome.payment.sessions, 20);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn rejection_is_idempotent_and_leaves_the_ledger_alone(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let member_id = seed_member(&pool, 3, 3).await;
    seed_plan(&pool, "basic", 8, 4900).await;
    let workflow = ApprovalWorkflow::new(pool.clone());

    let request = workflow.create_request(member_id, "basic").await.unwrap();
    let rejected = workflow.reject(request.id).await.unwrap();
    assert_eq!(rejected.status, "rejected");

    let again = workflow.reject(request.id).await.unwrap();
    assert_eq!(again.status, "rejected");

    // Approving a rejected request must fail, not credit.
    let err = workflow.approve(request.id).await.unwrap_err();
    assert!(matches!(err, AppError::StaleWrite(_)));

    let ledger = SessionLedger::new(pool.clone());
    let balance = ledger.read_balance(member_id).await.unwrap();
    assert_eq!(balance.remaining_sessions, 3);
    assert_eq!(balance.total_sessions, 3);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn pending_requests_are_capped_per_member(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let member_id = seed_member(&pool, 0, 0).await;
    seed_plan(&pool, "basic", 8, 4900).await;
    let workflow = ApprovalWorkflow::new(pool.clone());

    workflow.create_request(member_id, "basic").await.unwrap();
    workflow.create_request(member_id, "basic").await.unwrap();
    let err = workflow.create_request(member_id, "basic").await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn payment_cancellation_reverses_once_and_floors_at_zero(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let member_id = seed_member(&pool, 0, 0).await;
    seed_plan(&pool, "premium", 20, 9900).await;
    let workflow = ApprovalWorkflow::new(pool.clone());

    let paid = workflow.record_payment(member_id, "premium").await.unwrap();
    assert_eq!(paid.balance.remaining_sessions, 20);

    // The member consumes most of the granted sessions before the reversal.
    sqlx::query("UPDATE members SET remaining_sessions = 5 WHERE id = $1")
        .bind(member_id)
        .execute(&pool)
        .await
        .unwrap();

    let cancelled = workflow.cancel_payment(paid.payment.id).await.unwrap();
    assert!(cancelled.applied);
    assert_eq!(cancelled.payment.status, "cancelled");
    assert_eq!(
        cancelled.balance.remaining_sessions, 0,
        "reversal takes what is left and floors at zero"
    );

    // Cancelling an already-cancelled payment must not double-reverse.
    sqlx::query("UPDATE members SET remaining_sessions = 7 WHERE id = $1")
        .bind(member_id)
        .execute(&pool)
        .await
        .unwrap();
    let again = workflow.cancel_payment(paid.payment.id).await.unwrap();
    assert!(!again.applied);
    assert_eq!(again.balance.remaining_sessions, 7);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn direct_payment_updates_plan_and_is_keyed_against_replay(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let member_id = seed_member(&pool, 0, 0).await;
    seed_plan(&pool, "basic", 8, 4900).await;
    let workflow = ApprovalWorkflow::new(pool.clone());

    let outcome = workflow.record_payment(member_id, "basic").await.unwrap();
    assert_eq!(outcome.payment.membership, "basic");
    assert_eq!(outcome.payment.sessions, 8);
    assert_eq!(outcome.balance.total_sessions, 8);

    let membership: String =
        sqlx::query_scalar("SELECT membership FROM members WHERE id = $1")
            .bind(member_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(membership, "basic");
}
