//! Routes under `/v1` (spec §6.1).

mod export;
mod health;
mod resumables;
mod stream;
mod upload_stream;

use axum::routing::{get, head, on, MethodFilter};
use axum::Router;

pub(crate) fn get_router() -> Router {
    let edge = MethodFilter::POST | MethodFilter::PUT | MethodFilter::PATCH;
    let internal = edge | MethodFilter::HEAD;

    Router::new()
        .route("/v1/:pnum/files/health", head(health::health))
        .route("/v1/:pnum/:backend/stream", on(edge, stream::stream))
        .route(
            "/v1/:pnum/:backend/stream/:filename",
            on(edge, stream::stream_with_filename),
        )
        .route(
            "/v1/:pnum/:backend/upload_stream",
            on(internal, upload_stream::upload_stream),
        )
        .route(
            "/v1/:pnum/:backend/upload_stream/:filename",
            on(internal, upload_stream::upload_stream_with_filename),
        )
        .route("/v1/:pnum/:backend/resumables", get(resumables::list))
        .route(
            "/v1/:pnum/:backend/resumables/:filename",
            get(resumables::info).delete(resumables::delete),
        )
        .route("/v1/:pnum/:backend/export", get(export::list))
        .route("/v1/:pnum/:backend/export/:filename", get(export::download))
}
