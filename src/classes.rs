use axum::{
    extract::{Extension, Path},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ClassSession {
    pub id: Uuid,
    pub name: String,
    pub schedule: DateTime<Utc>,
    pub start_time: String,
    pub end_time: String,
    pub capacity: i32,
    pub enrolled: i32,
    pub trainer: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NewClass {
    pub name: String,
    pub schedule: DateTime<Utc>,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    pub capacity: i32,
    #[serde(default)]
    pub trainer: String,
}

pub fn routes() -> Router {
    Router::new()
        .route("/api/classes", get(list_classes).post(create_class))
        .route("/api/classes/:id", get(get_class))
}

async fn list_classes(Extension(pool): Extension<PgPool>) -> AppResult<Json<Vec<ClassSession>>> {
    let classes = sqlx::query_as::<_, ClassSession>(
        "SELECT * FROM classes WHERE status = 'active' ORDER BY schedule ASC",
    )
    .fetch_all(&pool)
    .await?;
    Ok(Json(classes))
}

async fn get_class(
    Extension(pool): Extension<PgPool>,
    Path(class_id): Path<Uuid>,
) -> AppResult<Json<ClassSession>> {
    let class = sqlx::query_as::<_, ClassSession>("SELECT * FROM classes WHERE id = $1")
        .bind(class_id)
        .fetch_optional(&pool)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(class))
}

async fn create_class(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<NewClass>,
) -> AppResult<Json<ClassSession>> {
    if payload.capacity <= 0 {
        return Err(AppError::BadRequest("capacity must be positive".into()));
    }
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("a class name is required".into()));
    }

    let class = sqlx::query_as::<_, ClassSession>(
        r#"
        INSERT INTO classes (id, name, schedule, start_time, end_time, capacity, trainer)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(payload.schedule)
    .bind(&payload.start_time)
    .bind(&payload.end_time)
    .bind(payload.capacity)
    .bind(&payload.trainer)
    .fetch_one(&pool)
    .await?;
    Ok(Json(class))
}
