//! Sea-ORM entities backing the resumable-upload store.

use sea_orm::entity::prelude::*;

pub type UploadModel = upload::Model;
pub type ChunkModel = chunk::Model;

pub mod upload {
    use super::*;

    /// One resumable upload in progress (or completed) for a tenant user.
    #[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "resumable_upload")]
    pub struct Model {
        /// The client-supplied UUID identifying this upload.
        #[sea_orm(primary_key, auto_increment = false)]
        pub upload_id: String,

        /// The authenticated user that started the upload.
        #[sea_orm(indexed)]
        pub owner: String,

        /// The group the final file will be written for.
        #[sea_orm(column_name = "group_name")]
        pub group: String,

        /// When the upload was first seen.
        pub created_at: ChronoDateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(has_many = "super::chunk::Entity")]
        Chunk,
    }

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod chunk {
    use super::*;

    /// A single chunk received for an upload.
    #[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "resumable_chunk")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,

        /// The upload this chunk belongs to.
        #[sea_orm(indexed)]
        pub upload_id: String,

        /// Position of this chunk in the sequence, starting at 0.
        pub chunk_num: i32,

        /// Size in bytes of this chunk as received.
        pub chunk_size: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::upload::Entity",
            from = "Column::UploadId",
            to = "super::upload::Column::UploadId"
        )]
        Upload,
    }

    impl ActiveModelBehavior for ActiveModel {}
}
