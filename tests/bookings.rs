use chrono::{Duration, Utc};
use gymcore::bookings::{BookingService, CancelActor};
use gymcore::error::AppError;
use gymcore::ledger::SessionLedger;
use sqlx::PgPool;
use uuid::Uuid;

async fn seed_member(pool: &PgPool, remaining: i32) -> Uuid {
    let member_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO members (id, email, name, remaining_sessions, total_sessions) VALUES ($1, $2, $3, $4, $4)",
    )
    .bind(member_id)
    .bind(format!("{member_id}@example.com"))
    .bind("Test Member")
    .bind(remaining)
    .execute(pool)
    .await
    .unwrap();
    member_id
}

async fn seed_class(pool: &PgPool, capacity: i32, enrolled: i32, hours_from_now: i64) -> Uuid {
    let class_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO classes (id, name, schedule, capacity, enrolled, trainer) VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(class_id)
    .bind("Spin")
    .bind(Utc::now() + Duration::hours(hours_from_now))
    .bind(capacity)
    .bind(enrolled)
    .bind("Alex")
    .execute(pool)
    .await
    .unwrap();
    class_id
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn booking_debits_enrolls_and_confirms(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let member_id = seed_member(&pool, 1).await;
    let class_x = seed_class(&pool, 10, 3, 48).await;
    let class_y = seed_class(&pool, 10, 0, 48).await;
    let service = BookingService::new(pool.clone());

    let outcome = service.book(member_id, class_x).await.unwrap();
    assert_eq!(outcome.booking.status, "confirmed");
    assert_eq!(outcome.balance.remaining_sessions, 0);
    assert_eq!(outcome.enrollment.enrolled, 4);
    assert!(!outcome.already_booked);

    // The balance is spent; a second class must be refused without movement.
    let err = service.book(member_id, class_y).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::InsufficientBalance {
            remaining: 0,
            requested: 1
        }
    ));
    let ledger = SessionLedger::new(pool.clone());
    assert_eq!(ledger.read_balance(member_id).await.unwrap().remaining_sessions, 0);
    let enrolled_y: i32 = sqlx::query_scalar("SELECT enrolled FROM classes WHERE id = $1")
        .bind(class_y)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(enrolled_y, 0, "a refused booking must not hold a seat");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn book_then_cancel_restores_balance_and_enrollment(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let member_id = seed_member(&pool, 3).await;
    let class_id = seed_class(&pool, 10, 2, 48).await;
    let service = BookingService::new(pool.clone());

    let booked = service.book(member_id, class_id).await.unwrap();
    let cancelled = service
        .cancel(booked.booking.id, CancelActor::Member, false)
        .await
        .unwrap();

    assert_eq!(cancelled.booking.status, "cancelled");
    assert!(!cancelled.noop);
    assert_eq!(cancelled.balance.remaining_sessions, 3);
    assert_eq!(cancelled.enrollment.enrolled, 2);

    // Cancelling again is a no-op, not a second credit.
    let again = service
        .cancel(booked.booking.id, CancelActor::Member, false)
        .await
        .unwrap();
    assert!(again.noop);
    assert_eq!(again.balance.remaining_sessions, 3);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn duplicate_booking_is_a_noop_confirmation(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let member_id = seed_member(&pool, 5).await;
    let class_id = seed_class(&pool, 10, 0, 48).await;
    let service = BookingService::new(pool.clone());

    let first = service.book(member_id, class_id).await.unwrap();
    let second = service.book(member_id, class_id).await.unwrap();

    assert!(second.already_booked);
    assert_eq!(second.booking.id, first.booking.id);
    assert_eq!(second.balance.remaining_sessions, 4, "no second debit");
    assert_eq!(second.enrollment.enrolled, 1, "no second seat");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn last_seat_race_confirms_exactly_one_booking(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let member_a = seed_member(&pool, 1).await;
    let member_b = seed_member(&pool, 1).await;
    let class_id = seed_class(&pool, 4, 3, 48).await;
    let service_a = BookingService::new(pool.clone());
    let service_b = BookingService::new(pool.clone());

    let (a, b) = tokio::join!(
        service_a.book(member_a, class_id),
        service_b.book(member_b, class_id)
    );

    let winners = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(winners, 1, "exactly one booking may take the last seat");
    let loser_err = if a.is_err() {
        a.unwrap_err()
    } else {
        b.unwrap_err()
    };
    assert!(matches!(loser_err, AppError::ClassFull { capacity: 4 }));

    let enrolled: i32 = sqlx::query_scalar("SELECT enrolled FROM classes WHERE id = $1")
        .bind(class_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(enrolled, 4);

    // No member was debited without a confirmed booking.
    let debited: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ledger_entries WHERE member_id IN ($1, $2)",
    )
    .bind(member_a)
    .bind(member_b)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(debited, 1);
    let confirmed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bookings WHERE class_id = $1 AND status = 'confirmed'",
    )
    .bind(class_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(confirmed, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn member_cannot_cancel_inside_the_window_but_trainer_can_override(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let member_id = seed_member(&pool, 2).await;
    // Class starts in one hour, inside the default four-hour window.
    let class_id = seed_class(&pool, 10, 0, 1).await;
    let service = BookingService::new(pool.clone());

    let booked = service.book(member_id, class_id).await.unwrap();

    let err = service
        .cancel(booked.booking.id, CancelActor::Member, false)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::CancellationWindowClosed { lead_hours: 4 }));

    let err = service
        .cancel(booked.booking.id, CancelActor::Member, true)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)), "members cannot override");

    let cancelled = service
        .cancel(booked.booking.id, CancelActor::Trainer, true)
        .await
        .unwrap();
    assert_eq!(cancelled.booking.status, "cancelled");
    assert_eq!(cancelled.balance.remaining_sessions, 2);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn attendance_marking_is_idempotent_and_never_moves_the_ledger(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let member_id = seed_member(&pool, 1).await;
    let class_id = seed_class(&pool, 10, 0, 48).await;
    let service = BookingService::new(pool.clone());

    let booked = service.book(member_id, class_id).await.unwrap();

    let completed = service.mark_attendance(booked.booking.id, true).await.unwrap();
    assert_eq!(completed.status, "completed");
    assert_eq!(completed.attendance, Some(true));

    // Re-marking overwrites the flag without ledger movement.
    let remarked = service.mark_attendance(booked.booking.id, false).await.unwrap();
    assert_eq!(remarked.attendance, Some(false));

    let entries: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE member_id = $1")
            .bind(member_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(entries, 1, "only the original booking debit exists");

    // A cancelled booking cannot be marked.
    let other = service.book(seed_member(&pool, 1).await, class_id).await.unwrap();
    sqlx::query("UPDATE bookings SET status = 'cancelled' WHERE id = $1")
        .bind(other.booking.id)
        .execute(&pool)
        .await
        .unwrap();
    let err = service.mark_attendance(other.booking.id, true).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}
