use modelbox_meta_store::{
    ChangeFeedApi, FileApi, FileMetadata, FileType, HasId, Hlc, MetaConfig, MetaError,
    MetaResult, MetaStore, MlFramework, Model, ModelApi, ModelVersion, ObjectType, ParentId, Tags,
    ValidationMode,
};
use tempfile::{TempDir, tempdir};

async fn open_store(mode: ValidationMode) -> MetaResult<(TempDir, MetaStore)> {
    let dir = tempdir().expect("tempdir");
    let config = MetaConfig::default_sqlite(dir.path().join("meta.sqlite").to_string_lossy())
        .with_validation_mode(mode);
    let store = MetaStore::connect(&config, dir.path()).await?;
    Ok((dir, store))
}

fn gpt() -> Model {
    Model::new("gpt", "owner@email", "langtech", "text-generation", "large language model")
}

#[tokio::test]
async fn create_model_with_files_is_idempotent() -> MetaResult<()> {
    let (_dir, store) = open_store(ValidationMode::Error).await?;
    let mut model = gpt();
    let owner = model.parent_ref();
    model.set_files(vec![
        FileMetadata::new(owner.clone(), "s3://models/gpt/weights.bin", "abc123", FileType::Model),
        FileMetadata::new(owner.clone(), "s3://models/gpt/README.md", "def456", FileType::Text),
    ])?;

    let created = store.create_model(model.clone()).await?;
    assert!(!created.exists);
    let again = store.create_model(model.clone()).await?;
    assert!(again.exists);
    assert_eq!(again.id, created.id);

    let stored = store.get_model(model.id).await?;
    assert_eq!(stored.task, "text-generation");
    let paths: Vec<&str> = stored.files.iter().map(|file| file.path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["s3://models/gpt/weights.bin", "s3://models/gpt/README.md"]
    );

    let listed = store.list_models("langtech").await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].files.len(), 2);

    // One event for the model; its files ride along in the payload.
    let changes = store.list_changes("langtech", Hlc::default()).await?;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].object_type, ObjectType::Model);
    let files = changes[0]
        .payload
        .get("files")
        .and_then(|files| files.as_array())
        .expect("files in payload");
    assert_eq!(files.len(), 2);
    Ok(())
}

#[tokio::test]
async fn model_file_with_foreign_parent_is_rejected() -> MetaResult<()> {
    let (_dir, store) = open_store(ValidationMode::Warn).await?;
    let mut model = gpt();
    model.files.push(FileMetadata::new(
        "somebody-else",
        "s3://models/gpt/weights.bin",
        "abc123",
        FileType::Model,
    ));
    let err = store.create_model(model.clone()).await.expect_err("foreign file");
    assert!(matches!(err, MetaError::InvalidInput { .. }));
    assert!(matches!(
        store.get_model(model.id).await,
        Err(MetaError::NotFound { .. })
    ));
    assert!(store.list_changes("langtech", Hlc::default()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn file_conflict_rolls_back_model_create() -> MetaResult<()> {
    let (_dir, store) = open_store(ValidationMode::Warn).await?;
    let mut model = gpt();
    let owner = model.parent_ref();
    let weights = FileMetadata::new(owner.clone(), "s3://models/gpt/weights.bin", "abc123", FileType::Model);
    store
        .write_files(vec![FileMetadata::with_id(
            weights.id,
            owner.clone(),
            "s3://models/gpt/other.bin",
            "zzz",
            FileType::Model,
        )])
        .await?;
    model.set_files(vec![weights])?;

    let err = store.create_model(model.clone()).await.expect_err("file clash");
    assert!(matches!(err, MetaError::ConflictingWrite { .. }));
    assert!(matches!(
        store.get_model(model.id).await,
        Err(MetaError::NotFound { .. })
    ));
    let model_events = store
        .list_changes("langtech", Hlc::default())
        .await?
        .into_iter()
        .filter(|event| event.object_type == ObjectType::Model)
        .count();
    assert_eq!(model_events, 0);
    Ok(())
}

#[tokio::test]
async fn model_versions_roundtrip_files_and_tags() -> MetaResult<()> {
    let (_dir, store) = open_store(ValidationMode::Warn).await?;
    let model = gpt();
    store.create_model(model.clone()).await?;

    let model_id = model.id.to_hex();
    let mut version = ModelVersion::new(
        "gpt-v1",
        model_id.clone(),
        "1",
        "first cut",
        MlFramework::Pytorch,
        Tags::new(["prod", "fp16", "prod"]),
    );
    let owner = version.parent_ref();
    version.set_files(vec![FileMetadata::new(
        owner,
        "s3://models/gpt/v1/weights.bin",
        "v1sum",
        FileType::Model,
    )])?;

    assert!(!store.create_model_version(version.clone()).await?.exists);
    assert!(store.create_model_version(version.clone()).await?.exists);

    let stored = store.get_model_version(version.id).await?;
    assert_eq!(stored.model_id, model_id);
    assert_eq!(stored.framework, MlFramework::Pytorch);
    assert_eq!(stored.unique_tags.as_slice(), ["prod", "fp16", "prod"]);
    assert_eq!(stored.files.len(), 1);
    assert_eq!(stored.files[0].checksum, "v1sum");

    let versions = store.list_model_versions(&model_id).await?;
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].files.len(), 1);

    let changes = store.list_changes("langtech", Hlc::default()).await?;
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1].object_type, ObjectType::ModelVersion);
    assert_eq!(changes[1].parent_id, Some(ParentId::new(model_id)));
    Ok(())
}

#[tokio::test]
async fn model_version_may_precede_its_model() -> MetaResult<()> {
    let (_dir, store) = open_store(ValidationMode::Warn).await?;
    let version = ModelVersion::new(
        "gpt-v2",
        "gpt3",
        "2",
        "",
        MlFramework::Unknown,
        Tags::default(),
    );
    assert!(!store.create_model_version(version.clone()).await?.exists);
    assert_eq!(store.list_model_versions("gpt3").await?.len(), 1);
    assert_eq!(store.list_changes("", Hlc::default()).await?.len(), 1);

    let (_dir, strict) = open_store(ValidationMode::Error).await?;
    let err = strict
        .create_model_version(version)
        .await
        .expect_err("unknown model");
    assert!(matches!(err, MetaError::InvalidParent { .. }));
    assert!(strict.list_model_versions("gpt3").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn missing_model_and_version_are_not_found() -> MetaResult<()> {
    let (_dir, store) = open_store(ValidationMode::Warn).await?;
    let model = gpt();
    assert!(matches!(
        store.get_model(model.id).await,
        Err(MetaError::NotFound { .. })
    ));
    let version = ModelVersion::new("v", "m", "1", "", MlFramework::Keras, Tags::default());
    assert!(matches!(
        store.get_model_version(version.id).await,
        Err(MetaError::NotFound { .. })
    ));
    assert!(store.list_models("langtech").await?.is_empty());
    Ok(())
}
