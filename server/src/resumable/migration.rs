//! Table creation for the per-user resumable-upload database.

use sea_orm_migration::prelude::*;

use super::entity::{chunk, upload};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(Migration)]
    }
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20240101_000001_create_resumable_tables"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(upload::Entity)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(upload::Column::UploadId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(upload::Column::Owner).string().not_null())
                    .col(ColumnDef::new(upload::Column::Group).string().not_null())
                    .col(
                        ColumnDef::new(upload::Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-resumable-upload-owner")
                    .table(upload::Entity)
                    .col(upload::Column::Owner)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(chunk::Entity)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(chunk::Column::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(chunk::Column::UploadId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(chunk::Column::ChunkNum)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(chunk::Column::ChunkSize)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-resumable-chunk-upload-id")
                    .table(chunk::Entity)
                    .col(chunk::Column::UploadId)
                    .to_owned(),
            )
            .await
    }
}
