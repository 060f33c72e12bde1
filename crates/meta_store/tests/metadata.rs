use std::collections::BTreeMap;

use modelbox_meta_store::{
    ChangeFeedApi, Hlc, MetaConfig, MetaError, MetaResult, MetaStore, MetadataApi, Model,
    ModelApi, HasId, MutationAction, ObjectType, ParentId, ValidationMode, Value,
};
use tempfile::{TempDir, tempdir};

async fn open_store(mode: ValidationMode) -> MetaResult<(TempDir, MetaStore)> {
    let dir = tempdir().expect("tempdir");
    let config = MetaConfig::default_sqlite(dir.path().join("meta.sqlite").to_string_lossy())
        .with_validation_mode(mode);
    let store = MetaStore::connect(&config, dir.path()).await?;
    Ok((dir, store))
}

fn single(key: &str, value: impl Into<Value>) -> BTreeMap<String, Value> {
    BTreeMap::from([(key.to_string(), value.into())])
}

#[tokio::test]
async fn later_writes_overwrite_earlier_ones() -> MetaResult<()> {
    let (_dir, store) = open_store(ValidationMode::Warn).await?;
    let parent = ParentId::new("gpt3");

    assert_eq!(store.update_metadata(&parent, single("stage", "training")).await?, 1);
    assert_eq!(store.update_metadata(&parent, single("stage", "serving")).await?, 1);

    let metadata = store.list_metadata(&parent).await?;
    assert_eq!(metadata.len(), 1);
    assert_eq!(metadata.get("stage"), Some(&Value::from("serving")));

    let events = store.list_changes("", Hlc::default()).await?;
    let actions: Vec<MutationAction> = events.iter().map(|event| event.action).collect();
    assert_eq!(actions, vec![MutationAction::Create, MutationAction::Update]);
    assert!(events.iter().all(|event| event.object_type == ObjectType::Metadata));
    assert_eq!(
        events[1].payload.get("value").and_then(|value| value.as_str()),
        Some("serving")
    );
    Ok(())
}

#[tokio::test]
async fn unchanged_values_write_nothing() -> MetaResult<()> {
    let (_dir, store) = open_store(ValidationMode::Warn).await?;
    let parent = ParentId::new("gpt3");
    let batch = BTreeMap::from([
        ("epochs".to_string(), Value::from(12_i64)),
        ("owner".to_string(), Value::from("langtech")),
    ]);
    assert_eq!(store.update_metadata(&parent, batch.clone()).await?, 2);
    assert_eq!(store.update_metadata(&parent, batch).await?, 0);
    assert_eq!(store.update_metadata(&parent, BTreeMap::new()).await?, 0);
    assert_eq!(store.list_changes("", Hlc::default()).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn nested_values_roundtrip() -> MetaResult<()> {
    let (_dir, store) = open_store(ValidationMode::Warn).await?;
    let parent = ParentId::new("gpt3");
    let nested = Value::Map(BTreeMap::from([
        ("layers".to_string(), Value::from(96_i64)),
        ("dropout".to_string(), Value::from(0.1_f64)),
        ("tied".to_string(), Value::from(true)),
        ("notes".to_string(), Value::Null),
        (
            "datasets".to_string(),
            Value::List(vec![Value::from("books"), Value::from("web")]),
        ),
    ]));
    store.update_metadata(&parent, single("hyperparams", nested.clone())).await?;

    let metadata = store.list_metadata(&parent).await?;
    assert_eq!(metadata.get("hyperparams"), Some(&nested));
    Ok(())
}

#[tokio::test]
async fn metadata_is_scoped_to_its_parent() -> MetaResult<()> {
    let (_dir, store) = open_store(ValidationMode::Warn).await?;
    store
        .update_metadata(&ParentId::new("gpt3"), single("stage", "training"))
        .await?;
    store
        .update_metadata(&ParentId::new("bert"), single("stage", "retired"))
        .await?;

    let gpt3 = store.list_metadata(&ParentId::new("gpt3")).await?;
    assert_eq!(gpt3.get("stage"), Some(&Value::from("training")));
    assert!(store.list_metadata(&ParentId::new("t5")).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn metadata_events_follow_the_parent_namespace() -> MetaResult<()> {
    let (_dir, store) = open_store(ValidationMode::Error).await?;
    let model = Model::new("gpt", "o", "langtech", "generation", "");
    store.create_model(model.clone()).await?;
    store
        .update_metadata(&model.parent_ref(), single("license", "apache-2.0"))
        .await?;

    let events = store.list_changes("langtech", Hlc::default()).await?;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].object_type, ObjectType::Metadata);
    assert_eq!(events[1].parent_id, Some(model.parent_ref()));
    assert_eq!(
        events[1].payload.get("key").and_then(|key| key.as_str()),
        Some("license")
    );

    let err = store
        .update_metadata(&ParentId::new("gpt3"), single("stage", "training"))
        .await
        .expect_err("unknown parent");
    assert!(matches!(err, MetaError::InvalidParent { .. }));
    Ok(())
}

#[tokio::test]
async fn invalid_values_are_rejected_before_writing() -> MetaResult<()> {
    let (_dir, store) = open_store(ValidationMode::Warn).await?;
    let parent = ParentId::new("gpt3");

    let err = store
        .update_metadata(&parent, single("loss", f64::NAN))
        .await
        .expect_err("nan");
    assert!(matches!(err, MetaError::InvalidInput { .. }));

    let huge = "x".repeat(70_000);
    let err = store
        .update_metadata(&parent, single("blob", huge))
        .await
        .expect_err("too large");
    assert!(matches!(err, MetaError::InvalidInput { .. }));

    assert!(store.list_metadata(&parent).await?.is_empty());
    Ok(())
}
