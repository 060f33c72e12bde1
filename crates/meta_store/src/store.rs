use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::sea_query;
use sea_orm::sea_query::{
    Expr, ExprTrait, MysqlQueryBuilder, OnConflict, Order, PostgresQueryBuilder,
    Query, QueryStatementWriter, SqliteQueryBuilder,
};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    DatabaseTransaction, QueryResult, Statement, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;

use crate::db::*;
use crate::migration::Migrator;
use crate::{MAX_KEY_CHARS, MetaConfig, StoreLimits, ValidationMode};
use modelbox_meta_core::{
    ChangeFeedApi, Checkpoint, ColumnCodec, CreateResult, Experiment, ExperimentApi, FileApi,
    FileMetadata, FileType, HasId, Hlc, Id, MetaError, MetaResult, MetadataApi, MetadataEntry,
    Metrics, MlFramework, Model, ModelApi, ModelVersion, MutationAction, MutationEvent,
    NewMutation, ObjectType, ParentId, Payload, Tags, Value,
};

pub const FAILPOINT_AFTER_ENTITY_INSERT: &str = "after_entity_insert";
pub const FAILPOINT_AFTER_MUTATION_APPEND: &str = "after_mutation_append";

const EXPERIMENT_COLUMNS: [Experiments; 8] = [
    Experiments::Id,
    Experiments::Name,
    Experiments::Owner,
    Experiments::Namespace,
    Experiments::ExternalId,
    Experiments::MlFramework,
    Experiments::CreatedAt,
    Experiments::UpdatedAt,
];

const CHECKPOINT_COLUMNS: [Checkpoints; 6] = [
    Checkpoints::Id,
    Checkpoints::ExperimentId,
    Checkpoints::Epoch,
    Checkpoints::Metrics,
    Checkpoints::CreatedAt,
    Checkpoints::UpdatedAt,
];

const MODEL_COLUMNS: [Models; 8] = [
    Models::Id,
    Models::Name,
    Models::Owner,
    Models::Namespace,
    Models::Task,
    Models::Description,
    Models::CreatedAt,
    Models::UpdatedAt,
];

const MODEL_VERSION_COLUMNS: [ModelVersions; 9] = [
    ModelVersions::Id,
    ModelVersions::Name,
    ModelVersions::ModelId,
    ModelVersions::Version,
    ModelVersions::Description,
    ModelVersions::MlFramework,
    ModelVersions::UniqueTags,
    ModelVersions::CreatedAt,
    ModelVersions::UpdatedAt,
];

const FILE_COLUMNS: [Files; 7] = [
    Files::Id,
    Files::ParentId,
    Files::FileType,
    Files::Path,
    Files::Checksum,
    Files::CreatedAt,
    Files::UpdatedAt,
];

const MUTATION_COLUMNS: [Mutations; 8] = [
    Mutations::Namespace,
    Mutations::MutationId,
    Mutations::MutationTime,
    Mutations::Action,
    Mutations::ObjectId,
    Mutations::ObjectType,
    Mutations::ParentId,
    Mutations::Payload,
];

/// Metadata store over a `sea-orm` connection pool.
///
/// Holds no caches: every call is one database transaction, so replicas sharing a
/// database stay consistent.
#[derive(Clone)]
pub struct MetaStore {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
    limits: StoreLimits,
    validation_mode: ValidationMode,
    failpoints: HashSet<String>,
}

/// What a `ParentId` turned out to point at.
#[derive(Clone, Debug)]
struct ParentInfo {
    object_type: ObjectType,
    namespace: String,
}

impl MetaStore {
    /// Loads (or creates) `modelbox.json` in `base_dir` and connects with it.
    pub async fn open(base_dir: &Path) -> MetaResult<Self> {
        let config = MetaConfig::load_or_init(base_dir)?;
        Self::connect(&config, base_dir).await
    }

    pub async fn connect(config: &MetaConfig, base_dir: &Path) -> MetaResult<Self> {
        config.validate()?;
        let url = config.connection_url(base_dir)?;
        let mut options = ConnectOptions::new(url);
        if let Some(pool) = &config.pool {
            if let Some(max) = pool.max_connections {
                options.max_connections(max);
            }
            if let Some(min) = pool.min_connections {
                options.min_connections(min);
            }
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        options.sqlx_logging(false);
        let conn = Database::connect(options).await.map_err(MetaError::from)?;
        let backend = conn.get_database_backend();
        Migrator::up(&conn, None).await.map_err(MetaError::from)?;
        log::info!(
            "metadata store connected backend={} validation={:?}",
            config.backend_name(),
            config.validation_mode()
        );
        Ok(Self {
            conn,
            backend,
            limits: config.store_limits(),
            validation_mode: config.validation_mode(),
            failpoints: config
                .failpoints
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect(),
        })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    fn validation_failure(&self, err: MetaError) -> MetaResult<()> {
        match self.validation_mode {
            ValidationMode::Error => Err(err),
            ValidationMode::Warn => {
                log::warn!("metadata validation warning: {err}");
                Ok(())
            }
            ValidationMode::Off => Ok(()),
        }
    }

    fn maybe_failpoint(&self, key: &str) -> MetaResult<()> {
        if self.failpoints.contains(key) {
            Err(MetaError::unavailable(format!("failpoint {key}")))
        } else {
            Ok(())
        }
    }

    /// Namespace of `parent`, or an empty namespace for parents this store does not know.
    /// Unknown parents are rejected or logged according to the validation mode.
    async fn parent_namespace<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: &ParentId,
        child: ObjectType,
    ) -> MetaResult<String> {
        match resolve_parent(conn, parent).await? {
            Some(info) => {
                log::trace!("{child} parent {parent} resolved to {}", info.object_type);
                Ok(info.namespace)
            }
            None => {
                self.validation_failure(MetaError::invalid_parent(format!(
                    "{child} references unknown parent '{parent}'"
                )))?;
                Ok(String::new())
            }
        }
    }

    /// Assigns the next per-namespace mutation id and records the event inside `tx`.
    ///
    /// Ids come from the namespace's `mutation_heads` row. The increment is an `UPDATE`, so
    /// concurrent writers in one namespace queue on that row lock instead of racing.
    async fn append_mutation(
        &self,
        tx: &DatabaseTransaction,
        mutation: NewMutation,
    ) -> MetaResult<MutationEvent> {
        let payload_bytes = mutation.payload.encode()?;
        if payload_bytes.len() > self.limits.max_payload_bytes {
            return Err(MetaError::invalid(format!(
                "{} payload is {} bytes, limit {}",
                mutation.object_type,
                payload_bytes.len(),
                self.limits.max_payload_bytes
            )));
        }
        let next_id = next_mutation_id(tx, &mutation.namespace).await?;
        let mutation_time = Hlc::now();
        let insert = Query::insert()
            .into_table(Mutations::Table)
            .columns(MUTATION_COLUMNS)
            .values_panic([
                mutation.namespace.clone().into(),
                next_id.into(),
                mutation_time.as_i64().into(),
                mutation.action.as_str().into(),
                mutation.object_id.clone().into(),
                mutation.object_type.as_str().into(),
                mutation
                    .parent_id
                    .as_ref()
                    .map(|parent| parent.as_str().to_string())
                    .into(),
                payload_bytes.into(),
            ])
            .to_owned();
        exec(tx, &insert).await?;
        log::debug!(
            "mutation {} {} {} {} in namespace '{}'",
            next_id,
            mutation.action,
            mutation.object_type,
            mutation.object_id,
            mutation.namespace
        );
        Ok(MutationEvent {
            mutation_id: next_id,
            mutation_time,
            action: mutation.action,
            object_id: mutation.object_id,
            object_type: mutation.object_type,
            parent_id: mutation.parent_id,
            namespace: mutation.namespace,
            payload: mutation.payload,
        })
    }

    /// Inserts files owned by an entity that is being created in the same transaction.
    async fn insert_owned_files(
        &self,
        tx: &DatabaseTransaction,
        owner: &ParentId,
        files: &mut [FileMetadata],
    ) -> MetaResult<()> {
        if files.len() > self.limits.max_files_per_write {
            return Err(MetaError::invalid(format!(
                "{} files exceed the per-write limit of {}",
                files.len(),
                self.limits.max_files_per_write
            )));
        }
        for file in files.iter_mut() {
            if &file.parent_id != owner {
                return Err(MetaError::invalid(format!(
                    "file {} belongs to '{}', not '{owner}'",
                    file.id, file.parent_id
                )));
            }
            insert_file(tx, file).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExperimentApi for MetaStore {
    async fn create_experiment(&self, experiment: Experiment) -> MetaResult<CreateResult> {
        let mut record = experiment;
        ensure_key_lengths(
            ObjectType::Experiment,
            &[
                ("name", record.name.as_str()),
                ("owner", record.owner.as_str()),
                ("namespace", record.namespace.as_str()),
                ("external_id", record.external_id.as_str()),
            ],
        )?;
        ensure_derived(
            ObjectType::Experiment,
            record.id,
            Experiment::derive_id(
                &record.name,
                &record.owner,
                &record.namespace,
                &record.external_id,
            ),
        )?;
        let now = Hlc::now();
        record.created_at = now;
        record.updated_at = now;

        let tx = self.conn.begin().await?;
        let insert = Query::insert()
            .into_table(Experiments::Table)
            .columns(EXPERIMENT_COLUMNS)
            .values_panic([
                record.id.to_hex().into(),
                record.name.clone().into(),
                record.owner.clone().into(),
                record.namespace.clone().into(),
                record.external_id.clone().into(),
                record.framework.as_i16().into(),
                now.as_i64().into(),
                now.as_i64().into(),
            ])
            .on_conflict(OnConflict::column(Experiments::Id).do_nothing().to_owned())
            .to_owned();
        if exec(&tx, &insert).await? == 0 {
            let existing = fetch_experiment(&tx, record.id)
                .await?
                .ok_or_else(|| MetaError::unavailable("experiment insert ignored but row missing"))?;
            tx.rollback().await?;
            if !existing.same_natural_key(&record) {
                return Err(MetaError::conflict(format!(
                    "experiment id {} already names '{}' in '{}'",
                    existing.id, existing.name, existing.namespace
                )));
            }
            log::debug!("experiment {} already exists", existing.id);
            return Ok(CreateResult::existing(existing.id));
        }
        self.maybe_failpoint(FAILPOINT_AFTER_ENTITY_INSERT)?;
        let mutation = NewMutation::for_record(
            MutationAction::Create,
            ObjectType::Experiment,
            record.id.to_hex(),
            None,
            record.namespace.clone(),
            &record,
        )?;
        self.append_mutation(&tx, mutation).await?;
        self.maybe_failpoint(FAILPOINT_AFTER_MUTATION_APPEND)?;
        tx.commit().await?;
        Ok(CreateResult::created(record.id))
    }

    async fn get_experiment(&self, id: Id) -> MetaResult<Experiment> {
        fetch_experiment(&self.conn, id)
            .await?
            .ok_or_else(|| MetaError::not_found(format!("experiment {id}")))
    }

    async fn list_experiments(&self, namespace: &str) -> MetaResult<Vec<Experiment>> {
        let select = Query::select()
            .from(Experiments::Table)
            .columns(EXPERIMENT_COLUMNS)
            .and_where(Expr::col(Experiments::Namespace).eq(namespace))
            .order_by(Experiments::CreatedAt, Order::Asc)
            .order_by(Experiments::Id, Order::Asc)
            .to_owned();
        query_all(&self.conn, &select)
            .await?
            .iter()
            .map(experiment_from_row)
            .collect()
    }

    async fn create_checkpoint(&self, checkpoint: Checkpoint) -> MetaResult<CreateResult> {
        let mut record = checkpoint;
        ensure_derived(
            ObjectType::Checkpoint,
            record.id,
            Checkpoint::derive_id(record.experiment_id, record.epoch),
        )?;
        let epoch = i64::try_from(record.epoch)
            .map_err(|_| MetaError::invalid(format!("epoch {} out of range", record.epoch)))?;
        let metrics = record.metrics.encode()?;
        let now = Hlc::now();
        record.created_at = now;
        record.updated_at = now;

        let tx = self.conn.begin().await?;
        let insert = Query::insert()
            .into_table(Checkpoints::Table)
            .columns(CHECKPOINT_COLUMNS)
            .values_panic([
                record.id.to_hex().into(),
                record.experiment_id.to_hex().into(),
                epoch.into(),
                metrics.into(),
                now.as_i64().into(),
                now.as_i64().into(),
            ])
            .on_conflict(OnConflict::column(Checkpoints::Id).do_nothing().to_owned())
            .to_owned();
        if exec(&tx, &insert).await? == 0 {
            let existing = fetch_checkpoint(&tx, record.id)
                .await?
                .ok_or_else(|| MetaError::unavailable("checkpoint insert ignored but row missing"))?;
            tx.rollback().await?;
            if !existing.same_natural_key(&record) {
                return Err(MetaError::conflict(format!(
                    "checkpoint id {} already names epoch {} of {}",
                    existing.id, existing.epoch, existing.experiment_id
                )));
            }
            log::debug!("checkpoint {} already exists", existing.id);
            return Ok(CreateResult::existing(existing.id));
        }
        self.maybe_failpoint(FAILPOINT_AFTER_ENTITY_INSERT)?;
        let experiment = ParentId::from(record.experiment_id);
        let namespace = self
            .parent_namespace(&tx, &experiment, ObjectType::Checkpoint)
            .await?;
        let owner = record.parent_ref();
        self.insert_owned_files(&tx, &owner, &mut record.files).await?;
        let mutation = NewMutation::for_record(
            MutationAction::Create,
            ObjectType::Checkpoint,
            record.id.to_hex(),
            Some(experiment),
            namespace,
            &record,
        )?;
        self.append_mutation(&tx, mutation).await?;
        self.maybe_failpoint(FAILPOINT_AFTER_MUTATION_APPEND)?;
        tx.commit().await?;
        Ok(CreateResult::created(record.id))
    }

    async fn get_checkpoint(&self, id: Id) -> MetaResult<Checkpoint> {
        let mut checkpoint = fetch_checkpoint(&self.conn, id)
            .await?
            .ok_or_else(|| MetaError::not_found(format!("checkpoint {id}")))?;
        checkpoint.files = fetch_files(&self.conn, &checkpoint.parent_ref()).await?;
        Ok(checkpoint)
    }

    async fn list_checkpoints(&self, experiment_id: Id) -> MetaResult<Vec<Checkpoint>> {
        let select = Query::select()
            .from(Checkpoints::Table)
            .columns(CHECKPOINT_COLUMNS)
            .and_where(Expr::col(Checkpoints::ExperimentId).eq(experiment_id.to_hex()))
            .order_by(Checkpoints::CreatedAt, Order::Asc)
            .order_by(Checkpoints::Id, Order::Asc)
            .to_owned();
        let mut checkpoints = query_all(&self.conn, &select)
            .await?
            .iter()
            .map(checkpoint_from_row)
            .collect::<MetaResult<Vec<_>>>()?;
        let parents: Vec<ParentId> = checkpoints.iter().map(HasId::parent_ref).collect();
        let mut files = fetch_files_for_parents(&self.conn, &parents).await?;
        for checkpoint in &mut checkpoints {
            checkpoint.files = files.remove(&checkpoint.parent_ref()).unwrap_or_default();
        }
        Ok(checkpoints)
    }
}

#[async_trait]
impl ModelApi for MetaStore {
    async fn create_model(&self, model: Model) -> MetaResult<CreateResult> {
        let mut record = model;
        ensure_key_lengths(
            ObjectType::Model,
            &[
                ("name", record.name.as_str()),
                ("owner", record.owner.as_str()),
                ("namespace", record.namespace.as_str()),
                ("task", record.task.as_str()),
            ],
        )?;
        ensure_derived(
            ObjectType::Model,
            record.id,
            Model::derive_id(&record.name, &record.owner, &record.namespace),
        )?;
        let now = Hlc::now();
        record.created_at = now;
        record.updated_at = now;

        let tx = self.conn.begin().await?;
        let insert = Query::insert()
            .into_table(Models::Table)
            .columns(MODEL_COLUMNS)
            .values_panic([
                record.id.to_hex().into(),
                record.name.clone().into(),
                record.owner.clone().into(),
                record.namespace.clone().into(),
                record.task.clone().into(),
                record.description.clone().into(),
                now.as_i64().into(),
                now.as_i64().into(),
            ])
            .on_conflict(OnConflict::column(Models::Id).do_nothing().to_owned())
            .to_owned();
        if exec(&tx, &insert).await? == 0 {
            let existing = fetch_model(&tx, record.id)
                .await?
                .ok_or_else(|| MetaError::unavailable("model insert ignored but row missing"))?;
            tx.rollback().await?;
            if !existing.same_natural_key(&record) {
                return Err(MetaError::conflict(format!(
                    "model id {} already names '{}' in '{}'",
                    existing.id, existing.name, existing.namespace
                )));
            }
            log::debug!("model {} already exists", existing.id);
            return Ok(CreateResult::existing(existing.id));
        }
        self.maybe_failpoint(FAILPOINT_AFTER_ENTITY_INSERT)?;
        let owner = record.parent_ref();
        self.insert_owned_files(&tx, &owner, &mut record.files).await?;
        let mutation = NewMutation::for_record(
            MutationAction::Create,
            ObjectType::Model,
            record.id.to_hex(),
            None,
            record.namespace.clone(),
            &record,
        )?;
        self.append_mutation(&tx, mutation).await?;
        self.maybe_failpoint(FAILPOINT_AFTER_MUTATION_APPEND)?;
        tx.commit().await?;
        Ok(CreateResult::created(record.id))
    }

    async fn get_model(&self, id: Id) -> MetaResult<Model> {
        let mut model = fetch_model(&self.conn, id)
            .await?
            .ok_or_else(|| MetaError::not_found(format!("model {id}")))?;
        model.files = fetch_files(&self.conn, &model.parent_ref()).await?;
        Ok(model)
    }

    async fn list_models(&self, namespace: &str) -> MetaResult<Vec<Model>> {
        let select = Query::select()
            .from(Models::Table)
            .columns(MODEL_COLUMNS)
            .and_where(Expr::col(Models::Namespace).eq(namespace))
            .order_by(Models::CreatedAt, Order::Asc)
            .order_by(Models::Id, Order::Asc)
            .to_owned();
        let mut models = query_all(&self.conn, &select)
            .await?
            .iter()
            .map(model_from_row)
            .collect::<MetaResult<Vec<_>>>()?;
        let parents: Vec<ParentId> = models.iter().map(HasId::parent_ref).collect();
        let mut files = fetch_files_for_parents(&self.conn, &parents).await?;
        for model in &mut models {
            model.files = files.remove(&model.parent_ref()).unwrap_or_default();
        }
        Ok(models)
    }

    async fn create_model_version(&self, version: ModelVersion) -> MetaResult<CreateResult> {
        let mut record = version;
        ensure_key_lengths(
            ObjectType::ModelVersion,
            &[
                ("name", record.name.as_str()),
                ("model_id", record.model_id.as_str()),
                ("version", record.version.as_str()),
            ],
        )?;
        ensure_derived(
            ObjectType::ModelVersion,
            record.id,
            ModelVersion::derive_id(&record.model_id, &record.version),
        )?;
        let unique_tags = record.unique_tags.encode()?;
        let now = Hlc::now();
        record.created_at = now;
        record.updated_at = now;

        let tx = self.conn.begin().await?;
        let insert = Query::insert()
            .into_table(ModelVersions::Table)
            .columns(MODEL_VERSION_COLUMNS)
            .values_panic([
                record.id.to_hex().into(),
                record.name.clone().into(),
                record.model_id.clone().into(),
                record.version.clone().into(),
                record.description.clone().into(),
                record.framework.as_i16().into(),
                unique_tags.into(),
                now.as_i64().into(),
                now.as_i64().into(),
            ])
            .on_conflict(OnConflict::column(ModelVersions::Id).do_nothing().to_owned())
            .to_owned();
        if exec(&tx, &insert).await? == 0 {
            let existing = fetch_model_version(&tx, record.id)
                .await?
                .ok_or_else(|| {
                    MetaError::unavailable("model version insert ignored but row missing")
                })?;
            tx.rollback().await?;
            if !existing.same_natural_key(&record) {
                return Err(MetaError::conflict(format!(
                    "model version id {} already names version '{}' of '{}'",
                    existing.id, existing.version, existing.model_id
                )));
            }
            log::debug!("model version {} already exists", existing.id);
            return Ok(CreateResult::existing(existing.id));
        }
        self.maybe_failpoint(FAILPOINT_AFTER_ENTITY_INSERT)?;
        let model = ParentId::new(record.model_id.clone());
        let namespace = self
            .parent_namespace(&tx, &model, ObjectType::ModelVersion)
            .await?;
        let owner = record.parent_ref();
        self.insert_owned_files(&tx, &owner, &mut record.files).await?;
        let mutation = NewMutation::for_record(
            MutationAction::Create,
            ObjectType::ModelVersion,
            record.id.to_hex(),
            Some(model),
            namespace,
            &record,
        )?;
        self.append_mutation(&tx, mutation).await?;
        self.maybe_failpoint(FAILPOINT_AFTER_MUTATION_APPEND)?;
        tx.commit().await?;
        Ok(CreateResult::created(record.id))
    }

    async fn get_model_version(&self, id: Id) -> MetaResult<ModelVersion> {
        let mut version = fetch_model_version(&self.conn, id)
            .await?
            .ok_or_else(|| MetaError::not_found(format!("model version {id}")))?;
        version.files = fetch_files(&self.conn, &version.parent_ref()).await?;
        Ok(version)
    }

    async fn list_model_versions(&self, model_id: &str) -> MetaResult<Vec<ModelVersion>> {
        let select = Query::select()
            .from(ModelVersions::Table)
            .columns(MODEL_VERSION_COLUMNS)
            .and_where(Expr::col(ModelVersions::ModelId).eq(model_id))
            .order_by(ModelVersions::CreatedAt, Order::Asc)
            .order_by(ModelVersions::Id, Order::Asc)
            .to_owned();
        let mut versions = query_all(&self.conn, &select)
            .await?
            .iter()
            .map(model_version_from_row)
            .collect::<MetaResult<Vec<_>>>()?;
        let parents: Vec<ParentId> = versions.iter().map(HasId::parent_ref).collect();
        let mut files = fetch_files_for_parents(&self.conn, &parents).await?;
        for version in &mut versions {
            version.files = files.remove(&version.parent_ref()).unwrap_or_default();
        }
        Ok(versions)
    }
}

#[async_trait]
impl FileApi for MetaStore {
    async fn write_files(&self, files: Vec<FileMetadata>) -> MetaResult<Vec<CreateResult>> {
        if files.len() > self.limits.max_files_per_write {
            return Err(MetaError::invalid(format!(
                "{} files exceed the per-write limit of {}",
                files.len(),
                self.limits.max_files_per_write
            )));
        }
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self.conn.begin().await?;
        let mut namespaces: HashMap<ParentId, String> = HashMap::new();
        let mut results = Vec::with_capacity(files.len());
        for mut file in files {
            let namespace = match namespaces.get(&file.parent_id) {
                Some(namespace) => namespace.clone(),
                None => {
                    let namespace = self
                        .parent_namespace(&tx, &file.parent_id, ObjectType::File)
                        .await?;
                    namespaces.insert(file.parent_id.clone(), namespace.clone());
                    namespace
                }
            };
            if !insert_file(&tx, &mut file).await? {
                results.push(CreateResult::existing(file.id));
                continue;
            }
            self.maybe_failpoint(FAILPOINT_AFTER_ENTITY_INSERT)?;
            let mutation = NewMutation::for_record(
                MutationAction::Create,
                ObjectType::File,
                file.id.to_hex(),
                Some(file.parent_id.clone()),
                namespace,
                &file,
            )?;
            self.append_mutation(&tx, mutation).await?;
            results.push(CreateResult::created(file.id));
        }
        self.maybe_failpoint(FAILPOINT_AFTER_MUTATION_APPEND)?;
        tx.commit().await?;
        Ok(results)
    }

    async fn get_files(&self, parent_id: &ParentId) -> MetaResult<Vec<FileMetadata>> {
        fetch_files(&self.conn, parent_id).await
    }

    async fn get_file(&self, id: Id) -> MetaResult<FileMetadata> {
        fetch_file(&self.conn, id)
            .await?
            .ok_or_else(|| MetaError::not_found(format!("file {id}")))
    }
}

#[async_trait]
impl MetadataApi for MetaStore {
    async fn update_metadata(
        &self,
        parent_id: &ParentId,
        metadata: BTreeMap<String, Value>,
    ) -> MetaResult<usize> {
        ensure_key_lengths(ObjectType::Metadata, &[("parent_id", parent_id.as_str())])?;
        if metadata.len() > self.limits.max_metadata_keys {
            return Err(MetaError::invalid(format!(
                "{} metadata keys exceed the per-write limit of {}",
                metadata.len(),
                self.limits.max_metadata_keys
            )));
        }
        let mut entries = Vec::with_capacity(metadata.len());
        for (key, value) in metadata {
            let encoded = value.encode()?;
            if encoded.len() > self.limits.max_value_bytes {
                return Err(MetaError::invalid(format!(
                    "metadata '{key}' is {} bytes, limit {}",
                    encoded.len(),
                    self.limits.max_value_bytes
                )));
            }
            entries.push((MetadataEntry::new(parent_id.clone(), key, value), encoded));
        }
        if entries.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.begin().await?;
        let namespace = self
            .parent_namespace(&tx, parent_id, ObjectType::Metadata)
            .await?;
        let mut changed = 0;
        for (entry, encoded) in entries {
            let select = Query::select()
                .from(Metadata::Table)
                .column(Metadata::Value)
                .and_where(Expr::col(Metadata::Id).eq(entry.id.to_hex()))
                .limit(1)
                .to_owned();
            let action = match query_one(&tx, &select).await? {
                None => MutationAction::Create,
                Some(row) if get_bytes(&row, Metadata::Value)? == encoded => continue,
                Some(_) => MutationAction::Update,
            };
            let now = Hlc::now().as_i64();
            let upsert = Query::insert()
                .into_table(Metadata::Table)
                .columns([
                    Metadata::Id,
                    Metadata::ParentId,
                    Metadata::MetaKey,
                    Metadata::Value,
                    Metadata::CreatedAt,
                    Metadata::UpdatedAt,
                ])
                .values_panic([
                    entry.id.to_hex().into(),
                    entry.parent_id.as_str().into(),
                    entry.key.clone().into(),
                    encoded.into(),
                    now.into(),
                    now.into(),
                ])
                .on_conflict(
                    OnConflict::column(Metadata::Id)
                        .update_columns([Metadata::Value, Metadata::UpdatedAt])
                        .to_owned(),
                )
                .to_owned();
            exec(&tx, &upsert).await?;
            self.maybe_failpoint(FAILPOINT_AFTER_ENTITY_INSERT)?;
            let mutation = NewMutation::for_record(
                action,
                ObjectType::Metadata,
                entry.id.to_hex(),
                Some(parent_id.clone()),
                namespace.clone(),
                &entry,
            )?;
            self.append_mutation(&tx, mutation).await?;
            changed += 1;
        }
        self.maybe_failpoint(FAILPOINT_AFTER_MUTATION_APPEND)?;
        tx.commit().await?;
        Ok(changed)
    }

    async fn list_metadata(&self, parent_id: &ParentId) -> MetaResult<BTreeMap<String, Value>> {
        let select = Query::select()
            .from(Metadata::Table)
            .columns([Metadata::MetaKey, Metadata::Value])
            .and_where(Expr::col(Metadata::ParentId).eq(parent_id.as_str()))
            .to_owned();
        let mut metadata = BTreeMap::new();
        for row in query_all(&self.conn, &select).await? {
            let key = get_string(&row, Metadata::MetaKey)?;
            let value = decode_column::<Value>(&row, Metadata::Value)?;
            metadata.insert(key, value);
        }
        Ok(metadata)
    }
}

#[async_trait]
impl ChangeFeedApi for MetaStore {
    async fn list_changes(&self, namespace: &str, since: Hlc) -> MetaResult<Vec<MutationEvent>> {
        let select = Query::select()
            .from(Mutations::Table)
            .columns(MUTATION_COLUMNS)
            .and_where(Expr::col(Mutations::Namespace).eq(namespace))
            .and_where(Expr::col(Mutations::MutationTime).gte(since.as_i64()))
            .order_by(Mutations::MutationId, Order::Asc)
            .to_owned();
        query_all(&self.conn, &select)
            .await?
            .iter()
            .map(mutation_from_row)
            .collect()
    }

    async fn list_changes_after(
        &self,
        namespace: &str,
        after_mutation_id: Option<i64>,
        limit: u32,
    ) -> MetaResult<Vec<MutationEvent>> {
        let mut select = Query::select()
            .from(Mutations::Table)
            .columns(MUTATION_COLUMNS)
            .and_where(Expr::col(Mutations::Namespace).eq(namespace))
            .order_by(Mutations::MutationId, Order::Asc)
            .limit(limit as u64)
            .to_owned();
        if let Some(after) = after_mutation_id {
            select.and_where(Expr::col(Mutations::MutationId).gt(after));
        }
        query_all(&self.conn, &select)
            .await?
            .iter()
            .map(mutation_from_row)
            .collect()
    }
}

/// Bumps and returns the namespace's mutation counter, creating it at zero on first use.
async fn next_mutation_id(tx: &DatabaseTransaction, namespace: &str) -> MetaResult<i64> {
    let seed = Query::insert()
        .into_table(MutationHeads::Table)
        .columns([MutationHeads::Namespace, MutationHeads::LastMutationId])
        .values_panic([namespace.into(), 0_i64.into()])
        .on_conflict(
            OnConflict::column(MutationHeads::Namespace)
                .do_nothing()
                .to_owned(),
        )
        .to_owned();
    exec(tx, &seed).await?;
    let bump = Query::update()
        .table(MutationHeads::Table)
        .value(
            MutationHeads::LastMutationId,
            Expr::col(MutationHeads::LastMutationId).add(1),
        )
        .and_where(Expr::col(MutationHeads::Namespace).eq(namespace))
        .to_owned();
    if exec(tx, &bump).await? != 1 {
        return Err(MetaError::unavailable(format!(
            "mutation head for namespace '{namespace}' missing"
        )));
    }
    let select = Query::select()
        .from(MutationHeads::Table)
        .column(MutationHeads::LastMutationId)
        .and_where(Expr::col(MutationHeads::Namespace).eq(namespace))
        .limit(1)
        .to_owned();
    let row = query_one(tx, &select).await?.ok_or_else(|| {
        MetaError::unavailable(format!("mutation head for namespace '{namespace}' missing"))
    })?;
    get_i64(&row, MutationHeads::LastMutationId)
}

/// Rejects key-like text that would not fit its column.
fn ensure_key_lengths(kind: ObjectType, fields: &[(&str, &str)]) -> MetaResult<()> {
    for (field, value) in fields {
        let chars = value.chars().count();
        if chars > MAX_KEY_CHARS {
            return Err(MetaError::invalid(format!(
                "{kind} {field} is {chars} characters, limit {MAX_KEY_CHARS}"
            )));
        }
    }
    Ok(())
}

fn ensure_derived(kind: ObjectType, actual: Id, expected: Id) -> MetaResult<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(MetaError::invalid(format!(
            "{kind} id {actual} does not match its natural key (expected {expected})"
        )))
    }
}

/// Inserts one file row unless its id is already taken. Returns `true` when a row was
/// written; on an existing row `file` is replaced by the stored copy.
async fn insert_file(tx: &DatabaseTransaction, file: &mut FileMetadata) -> MetaResult<bool> {
    ensure_key_lengths(
        ObjectType::File,
        &[
            ("parent_id", file.parent_id.as_str()),
            ("checksum", file.checksum.as_str()),
        ],
    )?;
    let now = Hlc::now();
    let insert = Query::insert()
        .into_table(Files::Table)
        .columns(FILE_COLUMNS)
        .values_panic([
            file.id.to_hex().into(),
            file.parent_id.as_str().into(),
            file.file_type.as_i16().into(),
            file.path.clone().into(),
            file.checksum.clone().into(),
            now.as_i64().into(),
            now.as_i64().into(),
        ])
        .on_conflict(OnConflict::column(Files::Id).do_nothing().to_owned())
        .to_owned();
    if exec(tx, &insert).await? > 0 {
        file.created_at = now;
        file.updated_at = now;
        return Ok(true);
    }
    let existing = fetch_file(tx, file.id)
        .await?
        .ok_or_else(|| MetaError::unavailable("file insert ignored but row missing"))?;
    if !existing.same_content(file) {
        return Err(MetaError::conflict(format!(
            "file id {} already describes '{}' under '{}'",
            existing.id, existing.path, existing.parent_id
        )));
    }
    log::debug!("file {} already exists", existing.id);
    *file = existing;
    Ok(false)
}

async fn resolve_parent<C: ConnectionTrait>(
    conn: &C,
    parent: &ParentId,
) -> MetaResult<Option<ParentInfo>> {
    let Ok(id) = Id::parse(parent.as_str()) else {
        return Ok(None);
    };
    if let Some(model) = fetch_model(conn, id).await? {
        return Ok(Some(ParentInfo {
            object_type: ObjectType::Model,
            namespace: model.namespace,
        }));
    }
    if let Some(experiment) = fetch_experiment(conn, id).await? {
        return Ok(Some(ParentInfo {
            object_type: ObjectType::Experiment,
            namespace: experiment.namespace,
        }));
    }
    if let Some(version) = fetch_model_version(conn, id).await? {
        let namespace = match Id::parse(&version.model_id) {
            Ok(model_id) => fetch_model(conn, model_id)
                .await?
                .map(|model| model.namespace)
                .unwrap_or_default(),
            Err(_) => String::new(),
        };
        return Ok(Some(ParentInfo {
            object_type: ObjectType::ModelVersion,
            namespace,
        }));
    }
    if let Some(checkpoint) = fetch_checkpoint(conn, id).await? {
        let namespace = fetch_experiment(conn, checkpoint.experiment_id)
            .await?
            .map(|experiment| experiment.namespace)
            .unwrap_or_default();
        return Ok(Some(ParentInfo {
            object_type: ObjectType::Checkpoint,
            namespace,
        }));
    }
    Ok(None)
}

async fn fetch_experiment<C: ConnectionTrait>(conn: &C, id: Id) -> MetaResult<Option<Experiment>> {
    let select = Query::select()
        .from(Experiments::Table)
        .columns(EXPERIMENT_COLUMNS)
        .and_where(Expr::col(Experiments::Id).eq(id.to_hex()))
        .limit(1)
        .to_owned();
    query_one(conn, &select)
        .await?
        .as_ref()
        .map(experiment_from_row)
        .transpose()
}

async fn fetch_checkpoint<C: ConnectionTrait>(conn: &C, id: Id) -> MetaResult<Option<Checkpoint>> {
    let select = Query::select()
        .from(Checkpoints::Table)
        .columns(CHECKPOINT_COLUMNS)
        .and_where(Expr::col(Checkpoints::Id).eq(id.to_hex()))
        .limit(1)
        .to_owned();
    query_one(conn, &select)
        .await?
        .as_ref()
        .map(checkpoint_from_row)
        .transpose()
}

async fn fetch_model<C: ConnectionTrait>(conn: &C, id: Id) -> MetaResult<Option<Model>> {
    let select = Query::select()
        .from(Models::Table)
        .columns(MODEL_COLUMNS)
        .and_where(Expr::col(Models::Id).eq(id.to_hex()))
        .limit(1)
        .to_owned();
    query_one(conn, &select)
        .await?
        .as_ref()
        .map(model_from_row)
        .transpose()
}

async fn fetch_model_version<C: ConnectionTrait>(
    conn: &C,
    id: Id,
) -> MetaResult<Option<ModelVersion>> {
    let select = Query::select()
        .from(ModelVersions::Table)
        .columns(MODEL_VERSION_COLUMNS)
        .and_where(Expr::col(ModelVersions::Id).eq(id.to_hex()))
        .limit(1)
        .to_owned();
    query_one(conn, &select)
        .await?
        .as_ref()
        .map(model_version_from_row)
        .transpose()
}

async fn fetch_file<C: ConnectionTrait>(conn: &C, id: Id) -> MetaResult<Option<FileMetadata>> {
    let select = Query::select()
        .from(Files::Table)
        .columns(FILE_COLUMNS)
        .and_where(Expr::col(Files::Id).eq(id.to_hex()))
        .limit(1)
        .to_owned();
    query_one(conn, &select)
        .await?
        .as_ref()
        .map(file_from_row)
        .transpose()
}

async fn fetch_files<C: ConnectionTrait>(
    conn: &C,
    parent: &ParentId,
) -> MetaResult<Vec<FileMetadata>> {
    let select = Query::select()
        .from(Files::Table)
        .columns(FILE_COLUMNS)
        .and_where(Expr::col(Files::ParentId).eq(parent.as_str()))
        .order_by(Files::CreatedAt, Order::Asc)
        .order_by(Files::Id, Order::Asc)
        .to_owned();
    query_all(conn, &select)
        .await?
        .iter()
        .map(file_from_row)
        .collect()
}

async fn fetch_files_for_parents<C: ConnectionTrait>(
    conn: &C,
    parents: &[ParentId],
) -> MetaResult<HashMap<ParentId, Vec<FileMetadata>>> {
    let mut grouped: HashMap<ParentId, Vec<FileMetadata>> = HashMap::new();
    if parents.is_empty() {
        return Ok(grouped);
    }
    let select = Query::select()
        .from(Files::Table)
        .columns(FILE_COLUMNS)
        .and_where(
            Expr::col(Files::ParentId)
                .is_in(parents.iter().map(|parent| parent.as_str().to_string())),
        )
        .order_by(Files::CreatedAt, Order::Asc)
        .order_by(Files::Id, Order::Asc)
        .to_owned();
    for row in query_all(conn, &select).await? {
        let file = file_from_row(&row)?;
        grouped.entry(file.parent_id.clone()).or_default().push(file);
    }
    Ok(grouped)
}

fn experiment_from_row(row: &QueryResult) -> MetaResult<Experiment> {
    Ok(Experiment {
        id: read_id(row, Experiments::Id)?,
        name: get_string(row, Experiments::Name)?,
        owner: get_string(row, Experiments::Owner)?,
        namespace: get_string(row, Experiments::Namespace)?,
        external_id: get_string(row, Experiments::ExternalId)?,
        framework: read_framework(row, Experiments::MlFramework)?,
        created_at: read_hlc(row, Experiments::CreatedAt)?,
        updated_at: read_hlc(row, Experiments::UpdatedAt)?,
    })
}

fn checkpoint_from_row(row: &QueryResult) -> MetaResult<Checkpoint> {
    let epoch = get_i64(row, Checkpoints::Epoch)?;
    Ok(Checkpoint {
        id: read_id(row, Checkpoints::Id)?,
        experiment_id: read_id(row, Checkpoints::ExperimentId)?,
        epoch: u64::try_from(epoch)
            .map_err(|_| MetaError::malformed(format!("negative epoch {epoch}")))?,
        metrics: decode_column::<Metrics>(row, Checkpoints::Metrics)?,
        files: Vec::new(),
        created_at: read_hlc(row, Checkpoints::CreatedAt)?,
        updated_at: read_hlc(row, Checkpoints::UpdatedAt)?,
    })
}

fn model_from_row(row: &QueryResult) -> MetaResult<Model> {
    Ok(Model {
        id: read_id(row, Models::Id)?,
        name: get_string(row, Models::Name)?,
        owner: get_string(row, Models::Owner)?,
        namespace: get_string(row, Models::Namespace)?,
        task: get_string(row, Models::Task)?,
        description: get_string(row, Models::Description)?,
        files: Vec::new(),
        created_at: read_hlc(row, Models::CreatedAt)?,
        updated_at: read_hlc(row, Models::UpdatedAt)?,
    })
}

fn model_version_from_row(row: &QueryResult) -> MetaResult<ModelVersion> {
    Ok(ModelVersion {
        id: read_id(row, ModelVersions::Id)?,
        name: get_string(row, ModelVersions::Name)?,
        model_id: get_string(row, ModelVersions::ModelId)?,
        version: get_string(row, ModelVersions::Version)?,
        description: get_string(row, ModelVersions::Description)?,
        framework: read_framework(row, ModelVersions::MlFramework)?,
        files: Vec::new(),
        unique_tags: decode_column::<Tags>(row, ModelVersions::UniqueTags)?,
        created_at: read_hlc(row, ModelVersions::CreatedAt)?,
        updated_at: read_hlc(row, ModelVersions::UpdatedAt)?,
    })
}

fn file_from_row(row: &QueryResult) -> MetaResult<FileMetadata> {
    let code: i16 = row.try_get("", &col_name(Files::FileType))?;
    let file_type = FileType::from_i16(code)
        .ok_or_else(|| MetaError::malformed(format!("unknown file type {code}")))?;
    Ok(FileMetadata {
        id: read_id(row, Files::Id)?,
        parent_id: ParentId::new(get_string(row, Files::ParentId)?),
        file_type,
        path: get_string(row, Files::Path)?,
        checksum: get_string(row, Files::Checksum)?,
        created_at: read_hlc(row, Files::CreatedAt)?,
        updated_at: read_hlc(row, Files::UpdatedAt)?,
    })
}

fn mutation_from_row(row: &QueryResult) -> MetaResult<MutationEvent> {
    let parent_id: Option<String> = row.try_get("", &col_name(Mutations::ParentId))?;
    Ok(MutationEvent {
        mutation_id: get_i64(row, Mutations::MutationId)?,
        mutation_time: read_hlc(row, Mutations::MutationTime)?,
        action: MutationAction::parse(&get_string(row, Mutations::Action)?)?,
        object_id: get_string(row, Mutations::ObjectId)?,
        object_type: ObjectType::parse(&get_string(row, Mutations::ObjectType)?)?,
        parent_id: parent_id.map(ParentId::new),
        namespace: get_string(row, Mutations::Namespace)?,
        payload: decode_column::<Payload>(row, Mutations::Payload)?,
    })
}

fn read_framework(row: &QueryResult, column: impl sea_query::Iden) -> MetaResult<MlFramework> {
    let code: i16 = row.try_get("", &col_name(column))?;
    MlFramework::from_i16(code)
        .ok_or_else(|| MetaError::malformed(format!("unknown ml framework {code}")))
}

fn read_id(row: &QueryResult, column: impl sea_query::Iden) -> MetaResult<Id> {
    let raw = get_string(row, column)?;
    Id::parse(&raw).map_err(|_| MetaError::malformed(format!("stored id '{raw}' is not an id")))
}

fn read_hlc(row: &QueryResult, column: impl sea_query::Iden) -> MetaResult<Hlc> {
    Ok(Hlc::from_i64(get_i64(row, column)?))
}

fn decode_column<T: ColumnCodec>(row: &QueryResult, column: impl sea_query::Iden) -> MetaResult<T> {
    T::decode(&get_bytes(row, column)?)
}

fn get_i64(row: &QueryResult, column: impl sea_query::Iden) -> MetaResult<i64> {
    Ok(row.try_get("", &col_name(column))?)
}

fn get_string(row: &QueryResult, column: impl sea_query::Iden) -> MetaResult<String> {
    Ok(row.try_get("", &col_name(column))?)
}

fn get_bytes(row: &QueryResult, column: impl sea_query::Iden) -> MetaResult<Vec<u8>> {
    Ok(row.try_get("", &col_name(column))?)
}

fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

/// Executes a write and returns the number of affected rows.
async fn exec<C, S>(conn: &C, stmt: &S) -> MetaResult<u64>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let result = conn
        .execute_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(result.rows_affected())
}

async fn query_all<C, S>(conn: &C, stmt: &S) -> MetaResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let rows = conn
        .query_all_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(rows)
}

async fn query_one<C, S>(conn: &C, stmt: &S) -> MetaResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let row = conn
        .query_one_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(row)
}
