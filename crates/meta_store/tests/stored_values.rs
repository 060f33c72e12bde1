use std::collections::BTreeMap;

use modelbox_meta_store::{
    Checkpoint, Experiment, ExperimentApi, FileApi, FileMetadata, FileType, MetaConfig, MetaError,
    MetaResult, MetaStore, MetadataApi, Metrics, MlFramework, ModelApi, ModelVersion, ParentId,
    Tags, Value,
};
use sea_orm::{ConnectionTrait, DatabaseBackend, Statement};
use tempfile::{TempDir, tempdir};

async fn open_store() -> MetaResult<(TempDir, MetaStore)> {
    let dir = tempdir().expect("tempdir");
    let config = MetaConfig::default_sqlite(dir.path().join("meta.sqlite").to_string_lossy());
    let store = MetaStore::connect(&config, dir.path()).await?;
    Ok((dir, store))
}

async fn run_sql(store: &MetaStore, sql: String) -> MetaResult<()> {
    store
        .connection()
        .execute_raw(Statement::from_string(DatabaseBackend::Sqlite, sql))
        .await
        .map_err(MetaError::from)?;
    Ok(())
}

fn assert_malformed<T: std::fmt::Debug>(result: MetaResult<T>) {
    match result {
        Err(err @ MetaError::MalformedValue { .. }) => assert!(!err.is_retryable()),
        other => panic!("expected MalformedValue, got {other:?}"),
    }
}

#[tokio::test]
async fn corrupt_metrics_surface_as_malformed() -> MetaResult<()> {
    let (_dir, store) = open_store().await?;
    let experiment = Experiment::new("quake", "o", "vision", "", MlFramework::Pytorch);
    store.create_experiment(experiment.clone()).await?;
    let checkpoint = Checkpoint::new(experiment.id, 1, Metrics::from([("loss", 0.5_f32)]));
    store.create_checkpoint(checkpoint.clone()).await?;

    run_sql(
        &store,
        format!(
            "UPDATE checkpoints SET metrics = X'FFFE' WHERE id = '{}'",
            checkpoint.id.to_hex()
        ),
    )
    .await?;

    assert_malformed(store.get_checkpoint(checkpoint.id).await);
    assert_malformed(store.list_checkpoints(experiment.id).await);
    Ok(())
}

#[tokio::test]
async fn corrupt_metadata_value_surfaces_as_malformed() -> MetaResult<()> {
    let (_dir, store) = open_store().await?;
    let parent = ParentId::new("gpt3");
    let metadata = BTreeMap::from([("stage".to_string(), Value::from("training"))]);
    store.update_metadata(&parent, metadata).await?;

    run_sql(
        &store,
        "UPDATE metadata SET value = X'FFFE' WHERE parent_id = 'gpt3'".to_string(),
    )
    .await?;

    assert_malformed(store.list_metadata(&parent).await);
    Ok(())
}

#[tokio::test]
async fn corrupt_unique_tags_surface_as_malformed() -> MetaResult<()> {
    let (_dir, store) = open_store().await?;
    let version = ModelVersion::new("v1", "gpt3", "1", "", MlFramework::Keras, Tags::new(["a"]));
    store.create_model_version(version.clone()).await?;

    run_sql(
        &store,
        format!(
            "UPDATE model_versions SET unique_tags = X'7B7D' WHERE id = '{}'",
            version.id.to_hex()
        ),
    )
    .await?;

    // `{}` is valid JSON but not a tag list.
    assert_malformed(store.get_model_version(version.id).await);
    Ok(())
}

#[tokio::test]
async fn code_columns_roundtrip_and_reject_unknown_codes() -> MetaResult<()> {
    let (_dir, store) = open_store().await?;
    let experiment = Experiment::new("quake", "o", "vision", "", MlFramework::Keras);
    store.create_experiment(experiment.clone()).await?;
    let file = FileMetadata::new("gpt3", "s3://bucket/clip.mp4", "v1", FileType::Video);
    store.write_files(vec![file.clone()]).await?;

    assert_eq!(
        store.get_experiment(experiment.id).await?.framework,
        MlFramework::Keras
    );
    assert_eq!(store.get_file(file.id).await?.file_type, FileType::Video);

    run_sql(
        &store,
        format!(
            "UPDATE experiments SET ml_framework = 9 WHERE id = '{}'",
            experiment.id.to_hex()
        ),
    )
    .await?;
    run_sql(
        &store,
        format!("UPDATE files SET file_type = 42 WHERE id = '{}'", file.id.to_hex()),
    )
    .await?;

    assert_malformed(store.get_experiment(experiment.id).await);
    assert_malformed(store.list_experiments("vision").await);
    assert_malformed(store.get_file(file.id).await);
    Ok(())
}
