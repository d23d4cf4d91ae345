use axum::{
    extract::{Extension, Path},
    Json,
};
use serde::Serialize;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Keeps a class's `enrolled` counter in step with its active bookings.
/// Both directions are store-level conditional deltas, never a client-side
/// read-modify-write, so concurrent bookings cannot lose updates.
#[derive(Clone)]
pub struct EnrollmentTracker {
    pool: PgPool,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EnrollmentSnapshot {
    pub class_id: Uuid,
    pub enrolled: i32,
    pub capacity: i32,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EnrollmentCorrection {
    pub class_id: Uuid,
    pub enrolled: i32,
    pub active_bookings: i64,
}

impl EnrollmentTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn read_enrollment(&self, class_id: Uuid) -> AppResult<EnrollmentSnapshot> {
        let snapshot = sqlx::query_as::<_, EnrollmentSnapshot>(
            "SELECT id AS class_id, enrolled, capacity FROM classes WHERE id = $1",
        )
        .bind(class_id)
        .fetch_optional(&self.pool)
        .await?;
        snapshot.ok_or(AppError::NotFound)
    }

    /// Takes one seat. Conditional on free capacity and an active class;
    /// zero rows means the class is full (or unknown/inactive).
    pub async fn increment(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        class_id: Uuid,
    ) -> AppResult<EnrollmentSnapshot> {
        let taken = sqlx::query_as::<_, EnrollmentSnapshot>(
            r#"
            UPDATE classes
            SET enrolled = enrolled + 1, updated_at = NOW()
            WHERE id = $1 AND enrolled < capacity AND status = 'active'
            RETURNING id AS class_id, enrolled, capacity
            "#,
        )
        .bind(class_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(snapshot) = taken {
            return Ok(snapshot);
        }

        let class = sqlx::query_as::<_, ClassGate>(
            "SELECT capacity, status FROM classes WHERE id = $1",
        )
        .bind(class_id)
        .fetch_optional(&mut *tx)
        .await?;
        match class {
            Some(class) if class.status == "active" => Err(AppError::ClassFull {
                capacity: class.capacity,
            }),
            Some(_) => Err(AppError::BadRequest("class is not active".into())),
            None => Err(AppError::NotFound),
        }
    }

    /// Releases one seat, flooring at zero.
    pub async fn decrement(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        class_id: Uuid,
    ) -> AppResult<EnrollmentSnapshot> {
        let snapshot = sqlx::query_as::<_, EnrollmentSnapshot>(
            r#"
            UPDATE classes
            SET enrolled = GREATEST(enrolled - 1, 0), updated_at = NOW()
            WHERE id = $1
            RETURNING id AS class_id, enrolled, capacity
            "#,
        )
        .bind(class_id)
        .fetch_optional(&mut *tx)
        .await?;
        snapshot.ok_or(AppError::NotFound)
    }

    /// Resets `enrolled` to the authoritative count of active bookings for
    /// every class where the two disagree, returning the corrected rows.
    pub async fn reconcile_all(&self) -> AppResult<Vec<EnrollmentCorrection>> {
        let corrections = sqlx::query_as::<_, EnrollmentCorrection>(
            r#"
            UPDATE classes c
            SET enrolled = LEAST(counts.active, c.capacity)::int, updated_at = NOW()
            FROM (
                SELECT cl.id AS class_id,
                       COUNT(b.id) FILTER (WHERE b.status IN ('pending', 'confirmed')) AS active
                FROM classes cl
                LEFT JOIN bookings b ON b.class_id = cl.id
                GROUP BY cl.id
            ) counts
            WHERE c.id = counts.class_id
              AND c.enrolled <> LEAST(counts.active, c.capacity)::int
            RETURNING c.id AS class_id, c.enrolled, counts.active AS active_bookings
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(corrections)
    }

    /// Single-class variant used by the change-notification refresh path.
    pub async fn reconcile(&self, class_id: Uuid) -> AppResult<Option<EnrollmentCorrection>> {
        let correction = sqlx::query_as::<_, EnrollmentCorrection>(
            r#"
            UPDATE classes c
            SET enrolled = LEAST(counts.active, c.capacity)::int, updated_at = NOW()
            FROM (
                SELECT COUNT(*) FILTER (WHERE status IN ('pending', 'confirmed')) AS active
                FROM bookings
                WHERE class_id = $1
            ) counts
            WHERE c.id = $1
              AND c.enrolled <> LEAST(counts.active, c.capacity)::int
            RETURNING c.id AS class_id, c.enrolled, counts.active AS active_bookings
            "#,
        )
        .bind(class_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(correction)
    }
}

#[derive(Debug, FromRow)]
struct ClassGate {
    capacity: i32,
    status: String,
}

pub async fn class_enrollment(
    Extension(pool): Extension<PgPool>,
    Path(class_id): Path<Uuid>,
) -> AppResult<Json<EnrollmentSnapshot>> {
    let tracker = EnrollmentTracker::new(pool);
    let snapshot = tracker.read_enrollment(class_id).await?;
    Ok(Json(snapshot))
}
