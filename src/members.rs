use axum::{
    extract::{Extension, Path},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{is_unique_violation, AppError, AppResult};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub remaining_sessions: i32,
    pub total_sessions: i32,
    pub membership: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NewMember {
    pub email: String,
    pub name: String,
}

pub fn routes() -> Router {
    Router::new()
        .route("/api/members", get(list_members).post(create_member))
        .route("/api/members/:id", get(get_member))
}

async fn list_members(Extension(pool): Extension<PgPool>) -> AppResult<Json<Vec<Member>>> {
    let members =
        sqlx::query_as::<_, Member>("SELECT * FROM members ORDER BY created_at ASC")
            .fetch_all(&pool)
            .await?;
    Ok(Json(members))
}

async fn get_member(
    Extension(pool): Extension<PgPool>,
    Path(member_id): Path<Uuid>,
) -> AppResult<Json<Member>> {
    let member = sqlx::query_as::<_, Member>("SELECT * FROM members WHERE id = $1")
        .bind(member_id)
        .fetch_optional(&pool)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(member))
}

async fn create_member(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<NewMember>,
) -> AppResult<Json<Member>> {
    let email = payload.email.trim().to_ascii_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::BadRequest("a valid email is required".into()));
    }
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("a name is required".into()));
    }

    let result = sqlx::query_as::<_, Member>(
        r#"
        INSERT INTO members (id, email, name)
        VALUES ($1, $2, $3)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&email)
    .bind(name)
    .fetch_one(&pool)
    .await;

    match result {
        Ok(member) => Ok(Json(member)),
        Err(err) if is_unique_violation(&err) => Err(AppError::BadRequest(format!(
            "a member with email `{email}` already exists"
        ))),
        Err(err) => Err(err.into()),
    }
}
