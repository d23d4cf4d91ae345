use axum::{routing::get, Router};

use crate::{approvals, bookings, classes, enrollment, ledger, members};

pub fn api_routes() -> Router {
    Router::new()
        .merge(members::routes())
        .merge(classes::routes())
        .merge(bookings::routes())
        .merge(approvals::routes())
        .route(
            "/api/members/:id/balance",
            get(ledger::ledger_member_balance),
        )
        .route(
            "/api/members/:id/ledger",
            get(ledger::ledger_member_history),
        )
        .route(
            "/api/classes/:id/enrollment",
            get(enrollment::class_enrollment),
        )
}
