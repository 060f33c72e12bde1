use sea_orm_migration::prelude::*;

use crate::db::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Experiments::Table)
                    .if_not_exists()
                    .col(id_col(Experiments::Id).primary_key())
                    .col(ColumnDef::new(Experiments::Name).string_len(255).not_null())
                    .col(ColumnDef::new(Experiments::Owner).string_len(255).not_null())
                    .col(
                        ColumnDef::new(Experiments::Namespace)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Experiments::ExternalId)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Experiments::MlFramework)
                            .small_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Experiments::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Experiments::UpdatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Checkpoints::Table)
                    .if_not_exists()
                    .col(id_col(Checkpoints::Id).primary_key())
                    .col(id_col(Checkpoints::ExperimentId))
                    .col(ColumnDef::new(Checkpoints::Epoch).big_integer().not_null())
                    .col(ColumnDef::new(Checkpoints::Metrics).blob().not_null())
                    .col(
                        ColumnDef::new(Checkpoints::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Checkpoints::UpdatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Models::Table)
                    .if_not_exists()
                    .col(id_col(Models::Id).primary_key())
                    .col(ColumnDef::new(Models::Name).string_len(255).not_null())
                    .col(ColumnDef::new(Models::Owner).string_len(255).not_null())
                    .col(ColumnDef::new(Models::Namespace).string_len(255).not_null())
                    .col(ColumnDef::new(Models::Task).string_len(255).not_null())
                    .col(ColumnDef::new(Models::Description).text().not_null())
                    .col(ColumnDef::new(Models::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(Models::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ModelVersions::Table)
                    .if_not_exists()
                    .col(id_col(ModelVersions::Id).primary_key())
                    .col(ColumnDef::new(ModelVersions::Name).string_len(255).not_null())
                    .col(
                        ColumnDef::new(ModelVersions::ModelId)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ModelVersions::Version)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(ModelVersions::Description).text().not_null())
                    .col(
                        ColumnDef::new(ModelVersions::MlFramework)
                            .small_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ModelVersions::UniqueTags).blob().not_null())
                    .col(
                        ColumnDef::new(ModelVersions::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ModelVersions::UpdatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Files::Table)
                    .if_not_exists()
                    .col(id_col(Files::Id).primary_key())
                    .col(ColumnDef::new(Files::ParentId).string_len(255).not_null())
                    .col(ColumnDef::new(Files::FileType).small_integer().not_null())
                    .col(ColumnDef::new(Files::Path).text().not_null())
                    .col(ColumnDef::new(Files::Checksum).string_len(255).not_null())
                    .col(ColumnDef::new(Files::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(Files::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Metadata::Table)
                    .if_not_exists()
                    .col(id_col(Metadata::Id).primary_key())
                    .col(ColumnDef::new(Metadata::ParentId).string_len(255).not_null())
                    .col(ColumnDef::new(Metadata::MetaKey).text().not_null())
                    .col(ColumnDef::new(Metadata::Value).blob().not_null())
                    .col(ColumnDef::new(Metadata::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(Metadata::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Mutations::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Mutations::Namespace).string_len(255).not_null())
                    .col(ColumnDef::new(Mutations::MutationId).big_integer().not_null())
                    .col(
                        ColumnDef::new(Mutations::MutationTime)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Mutations::Action).string_len(16).not_null())
                    .col(ColumnDef::new(Mutations::ObjectId).string_len(255).not_null())
                    .col(
                        ColumnDef::new(Mutations::ObjectType)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Mutations::ParentId).string_len(255).null())
                    .col(ColumnDef::new(Mutations::Payload).blob().not_null())
                    .primary_key(
                        Index::create()
                            .name("pk_mutations")
                            .col(Mutations::Namespace)
                            .col(Mutations::MutationId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MutationHeads::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MutationHeads::Namespace)
                            .string_len(255)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(MutationHeads::LastMutationId)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        create_indexes(manager).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(MutationHeads::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(Mutations::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Metadata::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Files::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(ModelVersions::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(Models::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Checkpoints::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Experiments::Table).if_exists().to_owned())
            .await?;
        Ok(())
    }
}

async fn create_indexes(manager: &SchemaManager<'_>) -> Result<(), DbErr> {
    manager
        .create_index(
            Index::create()
                .if_not_exists()
                .name("experiments_namespace_created_idx")
                .table(Experiments::Table)
                .col(Experiments::Namespace)
                .col(Experiments::CreatedAt)
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .if_not_exists()
                .name("checkpoints_experiment_created_idx")
                .table(Checkpoints::Table)
                .col(Checkpoints::ExperimentId)
                .col(Checkpoints::CreatedAt)
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .if_not_exists()
                .name("models_namespace_created_idx")
                .table(Models::Table)
                .col(Models::Namespace)
                .col(Models::CreatedAt)
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .if_not_exists()
                .name("model_versions_model_created_idx")
                .table(ModelVersions::Table)
                .col(ModelVersions::ModelId)
                .col(ModelVersions::CreatedAt)
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .if_not_exists()
                .name("files_parent_created_idx")
                .table(Files::Table)
                .col(Files::ParentId)
                .col(Files::CreatedAt)
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .if_not_exists()
                .name("metadata_parent_idx")
                .table(Metadata::Table)
                .col(Metadata::ParentId)
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .if_not_exists()
                .name("mutations_namespace_time_idx")
                .table(Mutations::Table)
                .col(Mutations::Namespace)
                .col(Mutations::MutationTime)
                .to_owned(),
        )
        .await?;
    Ok(())
}

fn id_col(col: impl Iden) -> ColumnDef {
    let mut col_def = ColumnDef::new(col);
    col_def.string_len(32).not_null();
    col_def.to_owned()
}
