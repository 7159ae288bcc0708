//! Resumable-upload bookkeeping routes (spec §6.1 `resumables`).

use std::path::Path;

use axum::extract::{Extension, Path as AxumPath, Query};
use axum::Json;
use serde::{Deserialize, Serialize};

use filegate_core::filename::Filename;
use filegate_core::tenant::Pnum;

use crate::access::IMPORT_EXPORT_ROLES;
use crate::chunk_engine::{self, ResumableInfo};
use crate::error::{ServerError, ServerResult};
use crate::path_resolver::{self, Direction};
use crate::resumable::ResumableStore;
use crate::{RequestState, State};

#[derive(Debug, Deserialize)]
pub(crate) struct ResumableQuery {
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResumableList {
    resumables: Vec<String>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

async fn resolve_upload_id(
    resumable: &ResumableStore,
    tenant_dir: &Path,
    user: &str,
    filename: &str,
    query_id: Option<&str>,
) -> ServerResult<String> {
    let upload_id = match query_id {
        Some(id) => id.to_owned(),
        None => chunk_engine::discover_by_filename(resumable, tenant_dir, user, filename)
            .await?
            .ok_or(ServerError::NotFound)?,
    };

    if !resumable.belongs_to(tenant_dir, user, &upload_id).await? {
        return Err(ServerError::NotFound);
    }

    Ok(upload_id)
}

pub(crate) async fn list(
    AxumPath((pnum, backend)): AxumPath<(String, String)>,
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
) -> ServerResult<Json<ResumableList>> {
    let claims = req_state.auth.require()?;
    claims.require_any_role(IMPORT_EXPORT_ROLES)?;
    let pnum = Pnum::new(pnum).map_err(|_| ServerError::TenantInvalid)?;
    let backend_cfg = state
        .config
        .backends
        .get(&backend)
        .ok_or_else(|| ServerError::PolicyRejected(format!("unknown backend: {backend}")))?;
    let tenant_dir = path_resolver::resolve(backend_cfg, &pnum, Direction::Import);

    let resumables = state.resumable.list_ids(&tenant_dir, claims.user()).await?;
    Ok(Json(ResumableList { resumables }))
}

pub(crate) async fn info(
    AxumPath((pnum, backend, filename)): AxumPath<(String, String, String)>,
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Query(query): Query<ResumableQuery>,
) -> ServerResult<Json<ResumableInfo>> {
    let claims = req_state.auth.require()?;
    claims.require_any_role(IMPORT_EXPORT_ROLES)?;
    let pnum = Pnum::new(pnum).map_err(|_| ServerError::TenantInvalid)?;
    let filename = Filename::new(filename).map_err(|_| ServerError::FilenameInvalid)?;
    let backend_cfg = state
        .config
        .backends
        .get(&backend)
        .ok_or_else(|| ServerError::PolicyRejected(format!("unknown backend: {backend}")))?;
    let tenant_dir = path_resolver::resolve(backend_cfg, &pnum, Direction::Import);

    let upload_id =
        resolve_upload_id(&state.resumable, &tenant_dir, claims.user(), filename.as_str(), query.id.as_deref())
            .await?;
    let info = chunk_engine::info(&state.resumable, &tenant_dir, claims.user(), filename.as_str(), &upload_id).await?;
    Ok(Json(info))
}

pub(crate) async fn delete(
    AxumPath((pnum, backend, filename)): AxumPath<(String, String, String)>,
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Query(query): Query<ResumableQuery>,
) -> ServerResult<Json<MessageResponse>> {
    let claims = req_state.auth.require()?;
    claims.require_any_role(IMPORT_EXPORT_ROLES)?;
    let pnum = Pnum::new(pnum).map_err(|_| ServerError::TenantInvalid)?;
    let filename = Filename::new(filename).map_err(|_| ServerError::FilenameInvalid)?;
    let backend_cfg = state
        .config
        .backends
        .get(&backend)
        .ok_or_else(|| ServerError::PolicyRejected(format!("unknown backend: {backend}")))?;
    let tenant_dir = path_resolver::resolve(backend_cfg, &pnum, Direction::Import);

    let upload_id =
        resolve_upload_id(&state.resumable, &tenant_dir, claims.user(), filename.as_str(), query.id.as_deref())
            .await?;
    chunk_engine::delete(&state.resumable, &tenant_dir, claims.user(), filename.as_str(), &upload_id).await?;

    Ok(Json(MessageResponse {
        message: "deleted".to_owned(),
    }))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_resolve_upload_id_explicit() {
        let dir = tempdir().unwrap();
        let store = ResumableStore::new();
        let upload_id = chunk_engine::begin(&store, dir.path(), "alice", "p11-member-group")
            .await
            .unwrap();

        let resolved = resolve_upload_id(&store, dir.path(), "alice", "x.bin", Some(upload_id.as_str()))
            .await
            .unwrap();

        assert_eq!(resolved, upload_id);
    }

    #[tokio::test]
    async fn test_resolve_upload_id_rejects_foreign_owner() {
        let dir = tempdir().unwrap();
        let store = ResumableStore::new();
        let upload_id = chunk_engine::begin(&store, dir.path(), "alice", "p11-member-group")
            .await
            .unwrap();

        let err = resolve_upload_id(&store, dir.path(), "mallory", "x.bin", Some(upload_id.as_str()))
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::NotFound));
    }

    #[tokio::test]
    async fn test_resolve_upload_id_unknown_id_is_not_found() {
        let dir = tempdir().unwrap();
        let store = ResumableStore::new();

        let err = resolve_upload_id(&store, dir.path(), "alice", "x.bin", Some("does-not-exist"))
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::NotFound));
    }

    #[tokio::test]
    async fn test_resolve_upload_id_without_query_id_discovers_by_filename() {
        let dir = tempdir().unwrap();
        let store = ResumableStore::new();
        let upload_id = chunk_engine::begin(&store, dir.path(), "alice", "p11-member-group")
            .await
            .unwrap();
        let chunks = dir.path().join(&upload_id);
        tokio::fs::create_dir_all(&chunks).await.unwrap();
        tokio::fs::write(chunk_engine::chunk_part_path(&chunks, "x.bin", 1), b"a")
            .await
            .unwrap();
        chunk_engine::commit_chunk(&store, dir.path(), "alice", &upload_id, "x.bin", 1)
            .await
            .unwrap();

        let resolved = resolve_upload_id(&store, dir.path(), "alice", "x.bin", None).await.unwrap();

        assert_eq!(resolved, upload_id);
    }
}
