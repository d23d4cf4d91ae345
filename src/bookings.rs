use axum::{
    extract::{Extension, Path},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::config;
use crate::enrollment::{EnrollmentSnapshot, EnrollmentTracker};
use crate::error::{is_unique_violation, AppError, AppResult};
use crate::ledger::{BalanceSnapshot, SessionLedger};
use crate::policy;

// Lifecycle: pending -> confirmed -> {cancelled, completed(attendance)}.
// Cancelled and completed are terminal.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" => Some(BookingStatus::Cancelled),
            "completed" => Some(BookingStatus::Completed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub member_id: Uuid,
    pub class_id: Uuid,
    pub status: String,
    pub attendance: Option<bool>,
    pub booking_date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who asked for a cancellation. Trainers acting for operations may
/// explicitly override the cancellation window; members may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelActor {
    Member,
    Trainer,
}

pub fn window_check_required(actor: CancelActor, override_window: bool) -> bool {
    !(actor == CancelActor::Trainer && override_window)
}

#[derive(Clone)]
pub struct BookingService {
    pool: PgPool,
    ledger: SessionLedger,
    enrollment: EnrollmentTracker,
}

#[derive(Debug, Serialize)]
pub struct BookingOutcome {
    pub booking: Booking,
    pub balance: BalanceSnapshot,
    pub enrollment: EnrollmentSnapshot,
    /// True when the request matched an existing active booking and was
    /// surfaced as a no-op confirmation instead of a second debit.
    pub already_booked: bool,
}

#[derive(Debug, Serialize)]
pub struct CancelOutcome {
    pub booking: Booking,
    pub balance: BalanceSnapshot,
    pub enrollment: EnrollmentSnapshot,
    /// True when the booking was already cancelled and nothing moved.
    pub noop: bool,
}

impl BookingService {
    pub fn new(pool: PgPool) -> Self {
        let ledger = SessionLedger::new(pool.clone());
        let enrollment = EnrollmentTracker::new(pool.clone());
        Self {
            pool,
            ledger,
            enrollment,
        }
    }

    /// Books a member into a class: debit one session, take one seat,
    /// confirm. Runs as one transaction, so a failed step leaves the ledger
    /// and the enrollment counter exactly as they were.
    pub async fn book(&self, member_id: Uuid, class_id: Uuid) -> AppResult<BookingOutcome> {
        let booking_id = Uuid::new_v4();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO bookings (id, member_id, class_id, status, booking_date, updated_at)
            VALUES ($1, $2, $3, 'pending', $4, $4)
            "#,
        )
        .bind(booking_id)
        .bind(member_id)
        .bind(class_id)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                // The partial unique index caught a duplicate active booking.
                drop(tx);
                return self.existing_booking_outcome(member_id, class_id).await;
            }
            if is_foreign_key_violation(&err) {
                return Err(AppError::NotFound);
            }
            return Err(err.into());
        }

        let debit = self
            .ledger
            .debit(
                &mut tx,
                member_id,
                1,
                "booking",
                &format!("booking:{booking_id}:debit"),
            )
            .await?;
        let enrollment = self.enrollment.increment(&mut tx, class_id).await?;

        let booking = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET status = 'confirmed', updated_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(booking_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(
            %member_id,
            %class_id,
            booking_id = %booking.id,
            remaining = debit.entry.remaining_after,
            enrolled = enrollment.enrolled,
            "booking confirmed"
        );

        Ok(BookingOutcome {
            booking,
            balance: BalanceSnapshot {
                member_id,
                remaining_sessions: debit.entry.remaining_after,
                total_sessions: debit.entry.total_after,
            },
            enrollment,
            already_booked: false,
        })
    }

    /// Cancels an active booking, returning the session credit and the seat.
    /// Members are gated by the cancellation window; trainers may override
    /// it explicitly. Cancelling an already-cancelled booking is a no-op.
    pub async fn cancel(
        &self,
        booking_id: Uuid,
        actor: CancelActor,
        override_window: bool,
    ) -> AppResult<CancelOutcome> {
        if actor == CancelActor::Member && override_window {
            return Err(AppError::BadRequest(
                "members cannot override the cancellation window".into(),
            ));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let booking =
            sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1 FOR UPDATE")
                .bind(booking_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(AppError::NotFound)?;

        let status = BookingStatus::parse(&booking.status)
            .ok_or_else(|| AppError::Message(format!("unknown booking status `{}`", booking.status)))?;
        if status == BookingStatus::Cancelled {
            drop(tx);
            let balance = self.ledger.read_balance(booking.member_id).await?;
            let enrollment = self.enrollment.read_enrollment(booking.class_id).await?;
            return Ok(CancelOutcome {
                booking,
                balance,
                enrollment,
                noop: true,
            });
        }
        if !status.is_active() {
            return Err(AppError::StaleWrite(
                "booking is already completed".into(),
            ));
        }

        if window_check_required(actor, override_window) {
            let class_start: DateTime<Utc> =
                sqlx::query_scalar("SELECT schedule FROM classes WHERE id = $1")
                    .bind(booking.class_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(AppError::NotFound)?;
            let lead_hours = *config::CANCELLATION_LEAD_HOURS;
            if !policy::is_allowed(class_start, now, lead_hours) {
                return Err(AppError::CancellationWindowClosed { lead_hours });
            }
        }

        let credit = self
            .ledger
            .credit(
                &mut tx,
                booking.member_id,
                1,
                "cancellation",
                &format!("booking:{booking_id}:cancel"),
            )
            .await?;
        let enrollment = self.enrollment.decrement(&mut tx, booking.class_id).await?;

        let booking = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET status = 'cancelled', updated_at = $2
            WHERE id = $1 AND status IN ('pending', 'confirmed')
            RETURNING *
            "#,
        )
        .bind(booking_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::StaleWrite("booking state changed during cancellation".into()))?;

        tx.commit().await?;
        tracing::info!(
            booking_id = %booking.id,
            member_id = %booking.member_id,
            class_id = %booking.class_id,
            actor = ?actor,
            remaining = credit.entry.remaining_after,
            enrolled = enrollment.enrolled,
            "booking cancelled"
        );

        Ok(CancelOutcome {
            balance: BalanceSnapshot {
                member_id: booking.member_id,
                remaining_sessions: credit.entry.remaining_after,
                total_sessions: credit.entry.total_after,
            },
            booking,
            enrollment,
            noop: false,
        })
    }

    /// Records attendance on a confirmed booking. The session was consumed
    /// at booking time, so there is no ledger movement; re-marking a
    /// completed booking just overwrites the flag.
    pub async fn mark_attendance(&self, booking_id: Uuid, attended: bool) -> AppResult<Booking> {
        let booking = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET status = 'completed', attendance = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('confirmed', 'completed')
            RETURNING *
            "#,
        )
        .bind(booking_id)
        .bind(attended)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(booking) = booking {
            return Ok(booking);
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM bookings WHERE id = $1")
                .bind(booking_id)
                .fetch_optional(&self.pool)
                .await?;
        match status {
            Some(status) => Err(AppError::BadRequest(format!(
                "attendance can only be marked on confirmed bookings, this one is {status}"
            ))),
            None => Err(AppError::NotFound),
        }
    }

    /// Trainer bulk-attendance action: marks each booking independently and
    /// reports the ones that could not be marked.
    pub async fn mark_attendance_bulk(&self, marks: Vec<AttendanceMark>) -> BulkAttendanceOutcome {
        let mut marked = Vec::new();
        let mut failed = Vec::new();
        for mark in marks {
            match self.mark_attendance(mark.booking_id, mark.attended).await {
                Ok(booking) => marked.push(booking),
                Err(err) => failed.push(AttendanceFailure {
                    booking_id: mark.booking_id,
                    reason: err.to_string(),
                }),
            }
        }
        BulkAttendanceOutcome { marked, failed }
    }

    /// Confirmed bookings whose class has already started and were never
    /// marked are treated as attended by default. Reporting only; the
    /// ledger is untouched.
    pub async fn auto_complete_past(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE bookings b
            SET status = 'completed', attendance = TRUE, updated_at = $1
            FROM classes c
            WHERE c.id = b.class_id
              AND b.status = 'confirmed'
              AND c.schedule < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn existing_booking_outcome(
        &self,
        member_id: Uuid,
        class_id: Uuid,
    ) -> AppResult<BookingOutcome> {
        let booking = sqlx::query_as::<_, Booking>(
            r#"
            SELECT * FROM bookings
            WHERE member_id = $1 AND class_id = $2 AND status IN ('pending', 'confirmed')
            LIMIT 1
            "#,
        )
        .bind(member_id)
        .bind(class_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::AlreadyBooked)?;

        let balance = self.ledger.read_balance(member_id).await?;
        let enrollment = self.enrollment.read_enrollment(class_id).await?;
        Ok(BookingOutcome {
            booking,
            balance,
            enrollment,
            already_booked: true,
        })
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23503"),
        _ => false,
    }
}

pub fn routes() -> Router {
    Router::new()
        .route("/api/bookings", post(create_booking))
        .route("/api/bookings/:id/cancel", post(cancel_booking))
        .route("/api/bookings/:id/attendance", post(set_attendance))
        .route("/api/bookings/attendance/bulk", post(bulk_attendance))
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub member_id: Uuid,
    pub class_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CancelBookingRequest {
    pub actor: CancelActor,
    #[serde(default)]
    pub override_window: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetAttendanceRequest {
    pub attended: bool,
}

#[derive(Debug, Deserialize)]
pub struct AttendanceMark {
    pub booking_id: Uuid,
    pub attended: bool,
}

#[derive(Debug, Deserialize)]
pub struct BulkAttendanceRequest {
    pub marks: Vec<AttendanceMark>,
}

#[derive(Debug, Serialize)]
pub struct AttendanceFailure {
    pub booking_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct BulkAttendanceOutcome {
    pub marked: Vec<Booking>,
    pub failed: Vec<AttendanceFailure>,
}

async fn create_booking(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<CreateBookingRequest>,
) -> AppResult<Json<BookingOutcome>> {
    let service = BookingService::new(pool);
    let outcome = service.book(payload.member_id, payload.class_id).await?;
    Ok(Json(outcome))
}

async fn cancel_booking(
    Extension(pool): Extension<PgPool>,
    Path(booking_id): Path<Uuid>,
    Json(payload): Json<CancelBookingRequest>,
) -> AppResult<Json<CancelOutcome>> {
    let service = BookingService::new(pool);
    let outcome = service
        .cancel(booking_id, payload.actor, payload.override_window)
        .await?;
    Ok(Json(outcome))
}

async fn set_attendance(
    Extension(pool): Extension<PgPool>,
    Path(booking_id): Path<Uuid>,
    Json(payload): Json<SetAttendanceRequest>,
) -> AppResult<Json<Booking>> {
    let service = BookingService::new(pool);
    let booking = service.mark_attendance(booking_id, payload.attended).await?;
    Ok(Json(booking))
}

async fn bulk_attendance(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<BulkAttendanceRequest>,
) -> AppResult<Json<BulkAttendanceOutcome>> {
    let service = BookingService::new(pool);
    let outcome = service.mark_attendance_bulk(payload.marks).await;
    Ok(Json(outcome))
}
