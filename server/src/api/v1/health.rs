//! Liveness check (spec §6.1 `files/health`), unauthenticated.

use axum::http::StatusCode;

pub(crate) async fn health() -> StatusCode {
    StatusCode::OK
}
