use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    Checkpoint, Experiment, FileMetadata, Hlc, Id, MetaResult, Model, ModelVersion,
    MutationEvent, ParentId, Value,
};

/// Outcome of an idempotent create. `exists` is true when the row was already there and
/// nothing was written.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CreateResult {
    pub id: Id,
    pub exists: bool,
}

impl CreateResult {
    pub fn created(id: Id) -> Self {
        Self { id, exists: false }
    }

    pub fn existing(id: Id) -> Self {
        Self { id, exists: true }
    }
}

#[async_trait]
pub trait ExperimentApi {
    async fn create_experiment(&self, experiment: Experiment) -> MetaResult<CreateResult>;
    async fn get_experiment(&self, id: Id) -> MetaResult<Experiment>;
    async fn list_experiments(&self, namespace: &str) -> MetaResult<Vec<Experiment>>;

    async fn create_checkpoint(&self, checkpoint: Checkpoint) -> MetaResult<CreateResult>;
    async fn get_checkpoint(&self, id: Id) -> MetaResult<Checkpoint>;
    async fn list_checkpoints(&self, experiment_id: Id) -> MetaResult<Vec<Checkpoint>>;
}

#[async_trait]
pub trait ModelApi {
    async fn create_model(&self, model: Model) -> MetaResult<CreateResult>;
    async fn get_model(&self, id: Id) -> MetaResult<Model>;
    async fn list_models(&self, namespace: &str) -> MetaResult<Vec<Model>>;

    async fn create_model_version(&self, version: ModelVersion) -> MetaResult<CreateResult>;
    async fn get_model_version(&self, id: Id) -> MetaResult<ModelVersion>;
    async fn list_model_versions(&self, model_id: &str) -> MetaResult<Vec<ModelVersion>>;
}

#[async_trait]
pub trait FileApi {
    /// Returns one result per input file, in input order.
    async fn write_files(&self, files: Vec<FileMetadata>) -> MetaResult<Vec<CreateResult>>;
    async fn get_files(&self, parent_id: &ParentId) -> MetaResult<Vec<FileMetadata>>;
    async fn get_file(&self, id: Id) -> MetaResult<FileMetadata>;
}

#[async_trait]
pub trait MetadataApi {
    /// Upserts every key under `parent_id`; returns the number of keys whose stored value
    /// actually changed.
    async fn update_metadata(
        &self,
        parent_id: &ParentId,
        metadata: BTreeMap<String, Value>,
    ) -> MetaResult<usize>;
    async fn list_metadata(&self, parent_id: &ParentId) -> MetaResult<BTreeMap<String, Value>>;
}

#[async_trait]
pub trait ChangeFeedApi {
    /// Every event in `namespace` with `mutation_time >= since`, by `mutation_id`.
    async fn list_changes(&self, namespace: &str, since: Hlc) -> MetaResult<Vec<MutationEvent>>;

    /// Cursor form for pollers that remember the last `mutation_id` they saw.
    async fn list_changes_after(
        &self,
        namespace: &str,
        after_mutation_id: Option<i64>,
        limit: u32,
    ) -> MetaResult<Vec<MutationEvent>>;
}
