use sea_orm::sea_query;
use sea_orm_migration::prelude::Iden;

#[derive(Iden, Clone, Copy)]
pub enum Experiments {
    Table,
    Id,
    Name,
    Owner,
    Namespace,
    ExternalId,
    MlFramework,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum Checkpoints {
    Table,
    Id,
    ExperimentId,
    Epoch,
    Metrics,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum Models {
    Table,
    Id,
    Name,
    Owner,
    Namespace,
    Task,
    Description,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum ModelVersions {
    Table,
    Id,
    Name,
    ModelId,
    Version,
    Description,
    MlFramework,
    UniqueTags,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum Files {
    Table,
    Id,
    ParentId,
    FileType,
    Path,
    Checksum,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum Metadata {
    Table,
    Id,
    ParentId,
    MetaKey,
    Value,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum Mutations {
    Table,
    Namespace,
    MutationId,
    MutationTime,
    Action,
    ObjectId,
    ObjectType,
    ParentId,
    Payload,
}

#[derive(Iden, Clone, Copy)]
pub enum MutationHeads {
    Table,
    Namespace,
    LastMutationId,
}
