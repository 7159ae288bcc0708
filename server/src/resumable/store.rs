//! ResumableStore: the bookkeeping database behind resumable uploads.
//!
//! Each tenant user gets its own SQLite file, `.resumables-<user>.db`,
//! living under that tenant's import directory (spec §4.3). Connections are
//! opened lazily and cached for the life of the process.

use std::path::{Path, PathBuf};

use chrono::Utc;
use dashmap::DashMap;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, Database, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder,
};
use sea_orm_migration::MigratorTrait;

use crate::error::{ServerError, ServerResult};

use super::entity::{chunk, upload};
use super::migration::Migrator;

/// A cache of per-tenant-user SQLite connections.
#[derive(Debug, Default)]
pub struct ResumableStore {
    connections: DashMap<PathBuf, DatabaseConnection>,
}

impl ResumableStore {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    fn db_path(tenant_dir: &Path, user: &str) -> PathBuf {
        tenant_dir.join(format!(".resumables-{user}.db"))
    }

    async fn connection(&self, tenant_dir: &Path, user: &str) -> ServerResult<DatabaseConnection> {
        let path = Self::db_path(tenant_dir, user);

        if let Some(conn) = self.connections.get(&path) {
            return Ok(conn.clone());
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let conn = Database::connect(&url)
            .await
            .map_err(ServerError::database_error)?;
        Migrator::up(&conn, None)
            .await
            .map_err(ServerError::database_error)?;

        self.connections.insert(path, conn.clone());
        Ok(conn)
    }

    /// Creates the bookkeeping row for a new upload.
    pub async fn insert(
        &self,
        tenant_dir: &Path,
        user: &str,
        upload_id: &str,
        group: &str,
    ) -> ServerResult<()> {
        let conn = self.connection(tenant_dir, user).await?;

        let record = upload::ActiveModel {
            upload_id: Set(upload_id.to_owned()),
            owner: Set(user.to_owned()),
            group: Set(group.to_owned()),
            created_at: Set(Utc::now()),
        };
        record
            .insert(&conn)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    /// Records a chunk as received.
    pub async fn record_chunk(
        &self,
        tenant_dir: &Path,
        user: &str,
        upload_id: &str,
        chunk_num: i32,
        chunk_size: i64,
    ) -> ServerResult<()> {
        let conn = self.connection(tenant_dir, user).await?;

        let record = chunk::ActiveModel {
            upload_id: Set(upload_id.to_owned()),
            chunk_num: Set(chunk_num),
            chunk_size: Set(chunk_size),
            ..Default::default()
        };
        record
            .insert(&conn)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    /// Sums the recorded sizes of every chunk received for this upload.
    pub async fn total_size(&self, tenant_dir: &Path, user: &str, upload_id: &str) -> ServerResult<i64> {
        let conn = self.connection(tenant_dir, user).await?;

        let chunks = chunk::Entity::find()
            .filter(chunk::Column::UploadId.eq(upload_id))
            .all(&conn)
            .await
            .map_err(ServerError::database_error)?;

        Ok(chunks.iter().map(|c| c.chunk_size).sum())
    }

    /// Whether `upload_id` is owned by `user`.
    pub async fn belongs_to(&self, tenant_dir: &Path, user: &str, upload_id: &str) -> ServerResult<bool> {
        let conn = self.connection(tenant_dir, user).await?;

        let record = upload::Entity::find_by_id(upload_id.to_owned())
            .one(&conn)
            .await
            .map_err(ServerError::database_error)?;

        Ok(record.is_some_and(|r| r.owner == user))
    }

    /// Lists a user's upload ids, most recently started first.
    pub async fn list_ids(&self, tenant_dir: &Path, user: &str) -> ServerResult<Vec<String>> {
        let conn = self.connection(tenant_dir, user).await?;

        let records = upload::Entity::find()
            .filter(upload::Column::Owner.eq(user))
            .order_by_desc(upload::Column::CreatedAt)
            .all(&conn)
            .await
            .map_err(ServerError::database_error)?;

        Ok(records.into_iter().map(|r| r.upload_id).collect())
    }

    /// Returns the group an upload was started for.
    pub async fn group_of(
        &self,
        tenant_dir: &Path,
        user: &str,
        upload_id: &str,
    ) -> ServerResult<Option<String>> {
        let conn = self.connection(tenant_dir, user).await?;

        let record = upload::Entity::find_by_id(upload_id.to_owned())
            .one(&conn)
            .await
            .map_err(ServerError::database_error)?;

        Ok(record.map(|r| r.group))
    }

    /// Removes an upload's bookkeeping record and all its chunk rows.
    pub async fn delete(&self, tenant_dir: &Path, user: &str, upload_id: &str) -> ServerResult<()> {
        let conn = self.connection(tenant_dir, user).await?;

        chunk::Entity::delete_many()
            .filter(chunk::Column::UploadId.eq(upload_id))
            .exec(&conn)
            .await
            .map_err(ServerError::database_error)?;

        upload::Entity::delete_by_id(upload_id.to_owned())
            .exec(&conn)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_insert_and_list() {
        let dir = tempdir().unwrap();
        let store = ResumableStore::new();

        store
            .insert(dir.path(), "alice", "upload-1", "research")
            .await
            .unwrap();
        store
            .record_chunk(dir.path(), "alice", "upload-1", 0, 1024)
            .await
            .unwrap();
        store
            .record_chunk(dir.path(), "alice", "upload-1", 1, 2048)
            .await
            .unwrap();

        assert_eq!(
            store.total_size(dir.path(), "alice", "upload-1").await.unwrap(),
            3072
        );
        assert!(store.belongs_to(dir.path(), "alice", "upload-1").await.unwrap());
        assert!(!store.belongs_to(dir.path(), "alice", "nonexistent").await.unwrap());
        assert_eq!(
            store.list_ids(dir.path(), "alice").await.unwrap(),
            vec!["upload-1".to_owned()]
        );
        assert_eq!(
            store.group_of(dir.path(), "alice", "upload-1").await.unwrap(),
            Some("research".to_owned())
        );

        store.delete(dir.path(), "alice", "upload-1").await.unwrap();
        assert!(store.list_ids(dir.path(), "alice").await.unwrap().is_empty());
    }
}
