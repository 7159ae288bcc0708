//! EdgeProxy's outward-facing routes (spec §4.6, §6.1 `stream`).

use axum::extract::{BodyStream, Extension, Path, Query};
use axum::http::{header, HeaderMap, Method};
use axum::response::Response;
use futures::StreamExt;
use serde::Deserialize;

use filegate_core::filename::Filename;
use filegate_core::tenant::Pnum;

use crate::access::IMPORT_EXPORT_ROLES;
use crate::edge_proxy::{self, ForwardedHeaders, ProxyRequest};
use crate::error::{ServerError, ServerResult};
use crate::{RequestState, State};

#[derive(Debug, Deserialize)]
pub(crate) struct StreamQuery {
    group: Option<String>,
    chunk: Option<String>,
    id: Option<String>,
}

fn forwarded_headers(headers: &HeaderMap, filename: &Filename) -> ServerResult<ForwardedHeaders> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ServerError::AuthMissing)?
        .to_owned();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let aes_key = headers.get("Aes-Key").and_then(|v| v.to_str().ok()).map(str::to_owned);
    let aes_iv = headers.get("Aes-Iv").and_then(|v| v.to_str().ok()).map(str::to_owned);
    let pragma = headers
        .get(header::PRAGMA)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    Ok(ForwardedHeaders {
        authorization,
        filename: filename.as_str().to_owned(),
        content_type,
        aes_key,
        aes_iv,
        pragma,
    })
}

async fn handle(
    pnum_raw: String,
    backend: String,
    filename_segment: Option<String>,
    state: State,
    req_state: RequestState,
    method: Method,
    headers: HeaderMap,
    query: StreamQuery,
    mut body: BodyStream,
) -> ServerResult<Response> {
    let pnum = Pnum::new(pnum_raw).map_err(|_| ServerError::TenantInvalid)?;
    let claims = req_state.auth.require()?;
    claims.require_any_role(IMPORT_EXPORT_ROLES)?;

    if state.config.backends.get(&backend).is_none() {
        return Err(ServerError::PolicyRejected(format!("unknown backend: {backend}")));
    }

    let group = edge_proxy::validate_group(&pnum, query.group.as_deref(), claims.groups())?;

    let header_filename = headers.get("Filename").and_then(|v| v.to_str().ok());
    let now = chrono::Utc::now().to_rfc3339();
    let filename = edge_proxy::resolve_filename(filename_segment.as_deref(), header_filename, &now)?;

    let fwd_headers = forwarded_headers(&headers, &filename)?;

    let proxy_req = ProxyRequest {
        method: method.clone(),
        internal_port: state.config.port,
        pnum,
        backend,
        filename,
        group,
        chunk: query.chunk.clone(),
        id: query.id.clone(),
        headers: fwd_headers,
    };

    let (relay, task) = edge_proxy::begin(state.http_client.clone(), proxy_req);

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(ServerError::request_error)?;
        relay.push(chunk).await?;
    }
    drop(relay);

    let (status, response_body) = task
        .await
        .map_err(|e| ServerError::request_error(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))??;

    axum::response::Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(axum::body::boxed(axum::body::Body::from(response_body)))
        .map_err(ServerError::request_error)
}

pub(crate) async fn stream(
    Path((pnum, backend)): Path<(String, String)>,
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
    body: BodyStream,
) -> ServerResult<Response> {
    handle(pnum, backend, None, state, req_state, method, headers, query, body).await
}

pub(crate) async fn stream_with_filename(
    Path((pnum, backend, filename)): Path<(String, String, String)>,
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
    body: BodyStream,
) -> ServerResult<Response> {
    handle(
        pnum,
        backend,
        Some(filename),
        state,
        req_state,
        method,
        headers,
        query,
        body,
    )
    .await
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_forwarded_headers_requires_authorization() {
        let headers = HeaderMap::new();
        let filename = Filename::new("report.csv").unwrap();
        let err = forwarded_headers(&headers, &filename).unwrap_err();
        assert!(matches!(err, ServerError::AuthMissing));
    }

    #[test]
    fn test_forwarded_headers_carries_aes_and_pragma() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/gzip"));
        headers.insert("Aes-Key", HeaderValue::from_static("wrapped-key"));
        headers.insert("Aes-Iv", HeaderValue::from_static("deadbeef"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("decompress"));

        let filename = Filename::new("report.csv").unwrap();
        let fwd = forwarded_headers(&headers, &filename).unwrap();

        assert_eq!(fwd.authorization, "Bearer tok");
        assert_eq!(fwd.filename, "report.csv");
        assert_eq!(fwd.content_type, "application/gzip");
        assert_eq!(fwd.aes_key.as_deref(), Some("wrapped-key"));
        assert_eq!(fwd.aes_iv.as_deref(), Some("deadbeef"));
        assert_eq!(fwd.pragma.as_deref(), Some("decompress"));
    }

    #[test]
    fn test_forwarded_headers_without_optional_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));

        let filename = Filename::new("report.csv").unwrap();
        let fwd = forwarded_headers(&headers, &filename).unwrap();

        assert_eq!(fwd.content_type, "");
        assert!(fwd.aes_key.is_none());
        assert!(fwd.aes_iv.is_none());
        assert!(fwd.pragma.is_none());
    }
}
