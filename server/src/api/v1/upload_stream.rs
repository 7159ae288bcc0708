//! The internal StreamPipeline endpoint EdgeProxy relays onto (spec §4.5,
//! §6.1 `upload_stream`). Reachable on loopback via `config.port`.

use std::path::Path;

use axum::extract::{BodyStream, Extension, Path as AxumPath, Query};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use filegate_core::filename::Filename;
use filegate_core::tenant::Pnum;

use crate::access::IMPORT_EXPORT_ROLES;
use crate::aes::AesKeySource;
use crate::chunk_engine::{self, ChunkParam, Classification};
use crate::edge_proxy;
use crate::error::{ServerError, ServerResult};
use crate::path_resolver::{self, RequestHookConfig};
use crate::pgp::PgpKeyring;
use crate::request_hook;
use crate::stream_pipeline::{ContentKind, Destination, Pipeline};
use crate::{RequestState, State};

#[derive(Debug, Deserialize)]
pub(crate) struct UploadStreamQuery {
    group: Option<String>,
    chunk: Option<String>,
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct ChunkWriteResult {
    filename: String,
    id: String,
    max_chunk: u32,
}

fn json_response(status: StatusCode, body: &impl Serialize) -> ServerResult<Response> {
    let bytes = serde_json::to_vec(body).map_err(ServerError::request_error)?;
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(axum::body::boxed(axum::body::Body::from(bytes)))
        .map_err(ServerError::request_error)
}

fn decrypt_aes_key_source(
    keyring: Option<&PgpKeyring>,
    aes_key_header: &HeaderValue,
    aes_iv_header: Option<&HeaderValue>,
) -> ServerResult<AesKeySource> {
    let keyring = keyring.ok_or(ServerError::InternalServerError)?;
    let aes_key_value = aes_key_header
        .to_str()
        .map_err(|_| ServerError::PolicyRejected("malformed Aes-Key header".to_owned()))?;
    let decrypted = keyring.unwrap_aes_key(aes_key_value)?;

    match aes_iv_header {
        Some(iv) => {
            let iv_str = iv
                .to_str()
                .map_err(|_| ServerError::PolicyRejected("malformed Aes-Iv header".to_owned()))?;
            let key_hex = String::from_utf8(decrypted)
                .map_err(|_| ServerError::PolicyRejected("Aes-Key did not decrypt to valid hex".to_owned()))?;
            AesKeySource::explicit(&key_hex, iv_str)
        }
        None => Ok(AesKeySource::passphrase(decrypted)),
    }
}

async fn handle_direct(
    tenant_dir: &Path,
    user: &str,
    group: &str,
    filename: &Filename,
    kind: ContentKind,
    aes_key_source: Option<AesKeySource>,
    request_hook_cfg: &Option<RequestHookConfig>,
    api_user: &str,
    body: &mut BodyStream,
) -> ServerResult<Response> {
    let target = tenant_dir.join(filename.as_str());
    let part = tenant_dir.join(format!("{}.{}.part", filename.as_str(), Uuid::new_v4()));

    let destination = if kind.is_tar() {
        Destination::TarExtract(tenant_dir.to_owned())
    } else {
        Destination::File(part.clone())
    };

    let mut pipeline = Pipeline::prepare(kind, aes_key_source, destination)?;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(ServerError::request_error)?;
        pipeline.data_received(&chunk).await?;
    }
    pipeline.finalize().await?;

    let final_path = if kind.is_tar() {
        tenant_dir.to_owned()
    } else {
        if fs::try_exists(&target).await.unwrap_or(false) {
            let displaced = tenant_dir.join(format!("{}.{}.part", filename.as_str(), Uuid::new_v4()));
            fs::rename(&target, &displaced).await.ok();
        }
        fs::rename(&part, &target).await.map_err(ServerError::storage_error)?;
        target.clone()
    };

    if let Some(hook) = request_hook_cfg {
        request_hook::invoke(&hook.path, &final_path, user, api_user, group);
    }

    json_response(StatusCode::CREATED, &MessageResponse { message: "ok".to_owned() })
}

#[allow(clippy::too_many_arguments)]
async fn handle_chunked(
    state: &State,
    tenant_dir: &Path,
    user: &str,
    group: &str,
    filename: &Filename,
    chunk_raw: &str,
    id: Option<&str>,
    request_hook_cfg: &Option<RequestHookConfig>,
    api_user: &str,
    body: &mut BodyStream,
) -> ServerResult<Response> {
    let chunk_param = ChunkParam::parse(chunk_raw)?;

    if let ChunkParam::End = chunk_param {
        let upload_id = id.ok_or_else(|| ServerError::PolicyRejected("id is required for chunk=end".to_owned()))?;
        if !state.resumable.belongs_to(tenant_dir, user, upload_id).await? {
            return Err(ServerError::NotFound);
        }

        let final_path = chunk_engine::finalize(tenant_dir, filename.as_str(), upload_id).await?;
        state.resumable.delete(tenant_dir, user, upload_id).await?;

        if let Some(hook) = request_hook_cfg {
            request_hook::invoke(&hook.path, &final_path, user, api_user, group);
        }

        return json_response(
            StatusCode::OK,
            &serde_json::json!({ "filename": filename.as_str(), "id": upload_id, "message": "ok" }),
        );
    }

    let classification = chunk_engine::classify(tenant_dir, chunk_param, id).await?;
    let (upload_id, n) = match (classification, chunk_param) {
        (Classification::New, ChunkParam::Num(n)) => {
            let upload_id = chunk_engine::begin(&state.resumable, tenant_dir, user, group).await?;
            (upload_id, n)
        }
        (Classification::Growing { upload_id }, ChunkParam::Num(n)) => (upload_id, n),
        _ => return Err(ServerError::PolicyRejected("invalid chunk/id combination".to_owned())),
    };

    let chunks_dir_path = tenant_dir.join(&upload_id);
    fs::create_dir_all(&chunks_dir_path).await.map_err(ServerError::storage_error)?;
    let part_path = chunk_engine::chunk_part_path(&chunks_dir_path, filename.as_str(), n);

    let mut file = fs::File::create(&part_path).await.map_err(ServerError::storage_error)?;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(ServerError::request_error)?;
        file.write_all(&chunk).await.map_err(ServerError::storage_error)?;
    }
    file.flush().await.map_err(ServerError::storage_error)?;
    drop(file);

    chunk_engine::commit_chunk(&state.resumable, tenant_dir, user, &upload_id, filename.as_str(), n).await?;

    json_response(
        StatusCode::OK,
        &ChunkWriteResult {
            filename: filename.as_str().to_owned(),
            id: upload_id,
            max_chunk: n,
        },
    )
}

#[allow(clippy::too_many_arguments)]
async fn handle(
    pnum_raw: String,
    backend_name: String,
    filename_segment: Option<String>,
    state: State,
    req_state: RequestState,
    method: Method,
    headers: HeaderMap,
    query: UploadStreamQuery,
    mut body: BodyStream,
) -> ServerResult<Response> {
    if method == Method::HEAD {
        return Response::builder()
            .status(StatusCode::OK)
            .body(axum::body::boxed(axum::body::Body::empty()))
            .map_err(ServerError::request_error);
    }

    let pnum = Pnum::new(pnum_raw).map_err(|_| ServerError::TenantInvalid)?;
    let claims = req_state.auth.require()?;
    claims.require_any_role(IMPORT_EXPORT_ROLES)?;

    let backend = state
        .config
        .backends
        .get(&backend_name)
        .ok_or_else(|| ServerError::PolicyRejected(format!("unknown backend: {backend_name}")))?;

    let group = edge_proxy::validate_group(&pnum, query.group.as_deref(), claims.groups())?;

    let header_filename = headers.get("Filename").and_then(|v| v.to_str().ok()).map(str::to_owned);
    let now = chrono::Utc::now().to_rfc3339();
    let filename = edge_proxy::resolve_filename(filename_segment.as_deref(), header_filename.as_deref(), &now)?;

    let tenant_dir = path_resolver::resolve_and_create_import_dir(&backend_name, backend, &pnum).await?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let kind = ContentKind::dispatch(content_type)?;

    let aes_key_source = match headers.get("Aes-Key") {
        Some(v) => Some(decrypt_aes_key_source(state.pgp_keyring.as_ref(), v, headers.get("Aes-Iv"))?),
        None => None,
    };

    let user = claims.user().to_owned();
    let request_hook_cfg = backend.request_hook.clone();
    let api_user = state.config.api_user.clone();

    match query.chunk.as_deref() {
        Some(chunk_raw) => {
            handle_chunked(
                &state,
                &tenant_dir,
                &user,
                &group,
                &filename,
                chunk_raw,
                query.id.as_deref(),
                &request_hook_cfg,
                &api_user,
                &mut body,
            )
            .await
        }
        None => {
            handle_direct(
                &tenant_dir,
                &user,
                &group,
                &filename,
                kind,
                aes_key_source,
                &request_hook_cfg,
                &api_user,
                &mut body,
            )
            .await
        }
    }
}

pub(crate) async fn upload_stream(
    AxumPath((pnum, backend)): AxumPath<(String, String)>,
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<UploadStreamQuery>,
    body: BodyStream,
) -> ServerResult<Response> {
    handle(pnum, backend, None, state, req_state, method, headers, query, body).await
}

pub(crate) async fn upload_stream_with_filename(
    AxumPath((pnum, backend, filename)): AxumPath<(String, String, String)>,
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<UploadStreamQuery>,
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
    use axum::body::HttpBody;

    use super::*;

    #[tokio::test]
    async fn test_json_response_sets_status_and_content_type() {
        let response = json_response(StatusCode::CREATED, &MessageResponse { message: "ok".to_owned() }).unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body = response.into_body().data().await.unwrap().unwrap();
        assert_eq!(&body[..], br#"{"message":"ok"}"#);
    }

    #[test]
    fn test_decrypt_aes_key_source_without_keyring_is_internal_error() {
        let header = HeaderValue::from_static("wrapped");
        let err = decrypt_aes_key_source(None, &header, None).unwrap_err();
        assert!(matches!(err, ServerError::InternalServerError));
    }
}
