//! Export listing and range-aware single-file download (spec §4.7, §6.1
//! `export`).

use axum::body::StreamBody;
use axum::extract::{Extension, Path};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::Serialize;
use tokio_util::io::ReaderStream;

use filegate_core::tenant::Pnum;

use crate::access::EXPORT_ROLES;
use crate::download_streamer::{self, FileEntry};
use crate::error::{ServerError, ServerResult};
use crate::path_resolver::{self, Direction};
use crate::{RequestState, State};

#[derive(Debug, Serialize)]
struct ExportList {
    files: Vec<FileEntry>,
}

pub(crate) async fn list(
    Path((pnum, backend)): Path<(String, String)>,
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
) -> ServerResult<Json<ExportList>> {
    req_state.auth.require()?.require_any_role(EXPORT_ROLES)?;
    let pnum_v = Pnum::new(pnum.clone()).map_err(|_| ServerError::TenantInvalid)?;
    let backend_cfg = state
        .config
        .backends
        .get(&backend)
        .ok_or_else(|| ServerError::PolicyRejected(format!("unknown backend: {backend}")))?;
    let export_dir = path_resolver::resolve(backend_cfg, &pnum_v, Direction::Export);

    let href_prefix = format!("{}v1/{}/{}/export", req_state.api_endpoint()?, pnum, backend);
    let files = download_streamer::list(
        &export_dir,
        &state.config.export_policy,
        &pnum_v,
        &href_prefix,
        state.config.export_max_num_list,
    )
    .await?;

    Ok(Json(ExportList { files }))
}

pub(crate) async fn download(
    Path((pnum, backend, filename)): Path<(String, String, String)>,
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    method: Method,
    headers: HeaderMap,
) -> ServerResult<Response> {
    req_state.auth.require()?.require_any_role(EXPORT_ROLES)?;
    let pnum_v = Pnum::new(pnum).map_err(|_| ServerError::TenantInvalid)?;
    let backend_cfg = state
        .config
        .backends
        .get(&backend)
        .ok_or_else(|| ServerError::PolicyRejected(format!("unknown backend: {backend}")))?;
    let export_dir = path_resolver::resolve(backend_cfg, &pnum_v, Direction::Export);

    let (path, mime_type, total_size) =
        download_streamer::resolve(&export_dir, &filename, &state.config.export_policy, &pnum_v).await?;

    if let Some(max) = state.config.export_max_size {
        if total_size > max {
            return Err(ServerError::PolicyRejected(
                "file exceeds the configured export size ceiling".to_owned(),
            ));
        }
    }

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let if_range_header = headers.get(header::IF_RANGE).and_then(|v| v.to_str().ok());
    let range = download_streamer::negotiate_range(&path, total_size, range_header, if_range_header).await?;
    let etag = download_streamer::etag_for(&path).await?;

    let content_length = range.map(|r| r.len()).unwrap_or(total_size);

    if method == Method::HEAD {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime_type)
            .header(header::CONTENT_LENGTH, content_length)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::ETAG, etag)
            .body(axum::body::boxed(axum::body::Body::empty()))
            .map_err(ServerError::request_error);
    }

    let reader = download_streamer::open_for_streaming(&path, range).await?;
    let stream = ReaderStream::with_capacity(reader, state.config.export_chunk_size);
    let body = StreamBody::new(stream);

    let status = if range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, mime_type)
        .header(header::CONTENT_LENGTH, content_length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, etag);

    if let Some(r) = range {
        builder = builder.header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", r.start, r.end, total_size));
    }

    builder
        .body(axum::body::boxed(body))
        .map_err(ServerError::request_error)
}
