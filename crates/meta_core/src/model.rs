use serde::{Deserialize, Serialize};

use crate::{Hlc, HasId, Id, MetaError, MetaResult, Metrics, ParentId, Tags, Value};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MlFramework {
    #[default]
    Unknown = 0,
    Pytorch = 1,
    Keras = 2,
}

impl MlFramework {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(MlFramework::Unknown),
            1 => Some(MlFramework::Pytorch),
            2 => Some(MlFramework::Keras),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    #[default]
    Undefined = 0,
    Model = 1,
    Checkpoint = 2,
    Text = 3,
    Image = 4,
    Audio = 5,
    Video = 6,
}

impl FileType {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(FileType::Undefined),
            1 => Some(FileType::Model),
            2 => Some(FileType::Checkpoint),
            3 => Some(FileType::Text),
            4 => Some(FileType::Image),
            5 => Some(FileType::Audio),
            6 => Some(FileType::Video),
            _ => None,
        }
    }
}

/// Metadata describing a blob owned by some parent entity. The bytes live elsewhere.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: Id,
    pub parent_id: ParentId,
    pub file_type: FileType,
    pub path: String,
    pub checksum: String,
    pub created_at: Hlc,
    pub updated_at: Hlc,
}

impl FileMetadata {
    /// Id is derived from `(parent_id, path, checksum)`, so re-registering the same content
    /// at the same path is idempotent.
    pub fn new(
        parent_id: impl Into<ParentId>,
        path: impl Into<String>,
        checksum: impl Into<String>,
        file_type: FileType,
    ) -> Self {
        let parent_id = parent_id.into();
        let path = path.into();
        let checksum = checksum.into();
        let id = Id::derive(&[parent_id.as_str(), &path, &checksum]);
        Self::with_id(id, parent_id, path, checksum, file_type)
    }

    pub fn with_id(
        id: Id,
        parent_id: impl Into<ParentId>,
        path: impl Into<String>,
        checksum: impl Into<String>,
        file_type: FileType,
    ) -> Self {
        Self {
            id,
            parent_id: parent_id.into(),
            file_type,
            path: path.into(),
            checksum: checksum.into(),
            created_at: Hlc::default(),
            updated_at: Hlc::default(),
        }
    }

    /// True when `other` describes the same file, ignoring store-assigned timestamps.
    pub fn same_content(&self, other: &FileMetadata) -> bool {
        self.id == other.id
            && self.parent_id == other.parent_id
            && self.file_type == other.file_type
            && self.path == other.path
            && self.checksum == other.checksum
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Id,
    pub name: String,
    pub owner: String,
    pub namespace: String,
    pub external_id: String,
    pub framework: MlFramework,
    pub created_at: Hlc,
    pub updated_at: Hlc,
}

impl Experiment {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        namespace: impl Into<String>,
        external_id: impl Into<String>,
        framework: MlFramework,
    ) -> Self {
        let name = name.into();
        let owner = owner.into();
        let namespace = namespace.into();
        let external_id = external_id.into();
        Self {
            id: Self::derive_id(&name, &owner, &namespace, &external_id),
            name,
            owner,
            namespace,
            external_id,
            framework,
            created_at: Hlc::default(),
            updated_at: Hlc::default(),
        }
    }

    pub fn derive_id(name: &str, owner: &str, namespace: &str, external_id: &str) -> Id {
        Id::derive(&[name, owner, namespace, external_id])
    }

    pub fn same_natural_key(&self, other: &Experiment) -> bool {
        self.name == other.name
            && self.owner == other.owner
            && self.namespace == other.namespace
            && self.external_id == other.external_id
    }
}

impl HasId for Experiment {
    fn id(&self) -> Id {
        self.id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Id,
    pub experiment_id: Id,
    pub epoch: u64,
    pub metrics: Metrics,
    pub files: Vec<FileMetadata>,
    pub created_at: Hlc,
    pub updated_at: Hlc,
}

impl Checkpoint {
    pub fn new(experiment_id: Id, epoch: u64, metrics: Metrics) -> Self {
        Self {
            id: Self::derive_id(experiment_id, epoch),
            experiment_id,
            epoch,
            metrics,
            files: Vec::new(),
            created_at: Hlc::default(),
            updated_at: Hlc::default(),
        }
    }

    pub fn derive_id(experiment_id: Id, epoch: u64) -> Id {
        Id::derive(&[&experiment_id.to_hex(), &epoch.to_string()])
    }

    pub fn same_natural_key(&self, other: &Checkpoint) -> bool {
        self.experiment_id == other.experiment_id && self.epoch == other.epoch
    }
}

impl HasId for Checkpoint {
    fn id(&self) -> Id {
        self.id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: Id,
    pub name: String,
    pub owner: String,
    pub namespace: String,
    pub task: String,
    pub description: String,
    pub files: Vec<FileMetadata>,
    pub created_at: Hlc,
    pub updated_at: Hlc,
}

impl Model {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        namespace: impl Into<String>,
        task: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let owner = owner.into();
        let namespace = namespace.into();
        Self {
            id: Self::derive_id(&name, &owner, &namespace),
            name,
            owner,
            namespace,
            task: task.into(),
            description: description.into(),
            files: Vec::new(),
            created_at: Hlc::default(),
            updated_at: Hlc::default(),
        }
    }

    pub fn derive_id(name: &str, owner: &str, namespace: &str) -> Id {
        Id::derive(&[name, owner, namespace])
    }

    pub fn same_natural_key(&self, other: &Model) -> bool {
        self.name == other.name && self.owner == other.owner && self.namespace == other.namespace
    }

    /// Attaches files, re-parenting them onto this model.
    pub fn set_files(&mut self, files: Vec<FileMetadata>) -> MetaResult<()> {
        self.files = reparent_files(self.parent_ref(), files)?;
        Ok(())
    }
}

impl HasId for Model {
    fn id(&self) -> Id {
        self.id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: Id,
    pub name: String,
    pub model_id: String,
    pub version: String,
    pub description: String,
    pub framework: MlFramework,
    pub files: Vec<FileMetadata>,
    pub unique_tags: Tags,
    pub created_at: Hlc,
    pub updated_at: Hlc,
}

impl ModelVersion {
    /// `model_id` is kept as text because versions may be registered before (or without)
    /// the owning model row.
    pub fn new(
        name: impl Into<String>,
        model_id: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        framework: MlFramework,
        unique_tags: Tags,
    ) -> Self {
        let model_id = model_id.into();
        let version = version.into();
        Self {
            id: Self::derive_id(&model_id, &version),
            name: name.into(),
            model_id,
            version,
            description: description.into(),
            framework,
            files: Vec::new(),
            unique_tags,
            created_at: Hlc::default(),
            updated_at: Hlc::default(),
        }
    }

    pub fn derive_id(model_id: &str, version: &str) -> Id {
        Id::derive(&[model_id, version])
    }

    pub fn same_natural_key(&self, other: &ModelVersion) -> bool {
        self.model_id == other.model_id && self.version == other.version
    }

    pub fn set_files(&mut self, files: Vec<FileMetadata>) -> MetaResult<()> {
        self.files = reparent_files(self.parent_ref(), files)?;
        Ok(())
    }
}

impl HasId for ModelVersion {
    fn id(&self) -> Id {
        self.id
    }
}

fn reparent_files(parent: ParentId, files: Vec<FileMetadata>) -> MetaResult<Vec<FileMetadata>> {
    files
        .into_iter()
        .map(|file| {
            if file.parent_id == parent {
                Ok(file)
            } else {
                Err(MetaError::invalid(format!(
                    "file {} belongs to {}, not {}",
                    file.id, file.parent_id, parent
                )))
            }
        })
        .collect()
}

/// One `(parent_id, key)` annotation row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub id: Id,
    pub parent_id: ParentId,
    pub key: String,
    pub value: Value,
}

impl MetadataEntry {
    pub fn new(parent_id: impl Into<ParentId>, key: impl Into<String>, value: Value) -> Self {
        let parent_id = parent_id.into();
        let key = key.into();
        Self {
            id: Self::derive_id(&parent_id, &key),
            parent_id,
            key,
            value,
        }
    }

    pub fn derive_id(parent_id: &ParentId, key: &str) -> Id {
        Id::derive(&[parent_id.as_str(), key])
    }
}

#[cfg(test)]
mod tests {
    use super::{Checkpoint, Experiment, FileMetadata, FileType, MetadataEntry, MlFramework, Model};
    use crate::{HasId, Metrics, ParentId};

    #[test]
    fn experiment_id_depends_only_on_natural_key() {
        let a = Experiment::new("gpt3", "owner", "ns", "xyz", MlFramework::Pytorch);
        let b = Experiment::new("gpt3", "owner", "ns", "xyz", MlFramework::Keras);
        let c = Experiment::new("gpt3", "owner", "ns", "abc", MlFramework::Pytorch);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn checkpoint_id_is_unique_per_epoch() {
        let experiment = Experiment::new("lid", "owner", "ns", "xyz", MlFramework::Pytorch);
        let first = Checkpoint::new(experiment.id, 45, Metrics::default());
        let again = Checkpoint::new(experiment.id, 45, Metrics::from([("loss", 1.0)]));
        let next = Checkpoint::new(experiment.id, 46, Metrics::default());
        assert_eq!(first.id, again.id);
        assert_ne!(first.id, next.id);
    }

    #[test]
    fn model_set_files_rejects_foreign_parents() {
        let mut model = Model::new("blender", "owner", "ns", "translate", "desc");
        let own = FileMetadata::new(model.parent_ref(), "/foo/bar", "c1", FileType::Text);
        let foreign = FileMetadata::new("someone-else", "/foo/pipe", "c2", FileType::Model);
        assert!(model.set_files(vec![own.clone(), foreign]).is_err());
        model.set_files(vec![own]).expect("own files");
        assert_eq!(model.files.len(), 1);
    }

    #[test]
    fn metadata_entry_id_matches_parent_and_key() {
        let entry = MetadataEntry::new("parent-id1", "/tmp/foo", 1_i64.into());
        assert_eq!(
            entry.id,
            MetadataEntry::derive_id(&ParentId::from("parent-id1"), "/tmp/foo")
        );
    }

    #[test]
    fn enums_roundtrip_through_storage_codes() {
        for framework in [MlFramework::Unknown, MlFramework::Pytorch, MlFramework::Keras] {
            assert_eq!(MlFramework::from_i16(framework.as_i16()), Some(framework));
        }
        assert_eq!(FileType::from_i16(3), Some(FileType::Text));
        assert_eq!(FileType::from_i16(42), None);
    }
}
