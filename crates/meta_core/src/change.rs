use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Hlc, MetaError, MetaResult, ParentId, Payload};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Create,
    Update,
}

impl MutationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
        }
    }

    pub fn parse(value: &str) -> MetaResult<Self> {
        match value {
            "create" => Ok(MutationAction::Create),
            "update" => Ok(MutationAction::Update),
            other => Err(MetaError::malformed(format!("unknown mutation action '{other}'"))),
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Experiment,
    Checkpoint,
    Model,
    ModelVersion,
    File,
    Metadata,
}

impl ObjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::Experiment => "experiment",
            ObjectType::Checkpoint => "checkpoint",
            ObjectType::Model => "model",
            ObjectType::ModelVersion => "model_version",
            ObjectType::File => "file",
            ObjectType::Metadata => "metadata",
        }
    }

    pub fn parse(value: &str) -> MetaResult<Self> {
        match value {
            "experiment" => Ok(ObjectType::Experiment),
            "checkpoint" => Ok(ObjectType::Checkpoint),
            "model" => Ok(ObjectType::Model),
            "model_version" => Ok(ObjectType::ModelVersion),
            "file" => Ok(ObjectType::File),
            "metadata" => Ok(ObjectType::Metadata),
            other => Err(MetaError::malformed(format!("unknown object type '{other}'"))),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only change-feed record. `mutation_id` increases strictly within a namespace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub mutation_id: i64,
    pub mutation_time: Hlc,
    pub action: MutationAction,
    pub object_id: String,
    pub object_type: ObjectType,
    pub parent_id: Option<ParentId>,
    pub namespace: String,
    pub payload: Payload,
}

/// A mutation before the feed has assigned its id and time.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMutation {
    pub action: MutationAction,
    pub object_id: String,
    pub object_type: ObjectType,
    pub parent_id: Option<ParentId>,
    pub namespace: String,
    pub payload: Payload,
}

impl NewMutation {
    /// Builds a mutation whose payload is `record` serialized as a JSON object.
    pub fn for_record<T: Serialize>(
        action: MutationAction,
        object_type: ObjectType,
        object_id: impl Into<String>,
        parent_id: Option<ParentId>,
        namespace: impl Into<String>,
        record: &T,
    ) -> MetaResult<Self> {
        let payload = match serde_json::to_value(record) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(other) => {
                return Err(MetaError::invalid(format!(
                    "{object_type} payload must be an object, got {other}"
                )));
            }
            Err(err) => return Err(MetaError::invalid(format!("{object_type} payload: {err}"))),
        };
        Ok(Self {
            action,
            object_id: object_id.into(),
            object_type,
            parent_id,
            namespace: namespace.into(),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{MutationAction, NewMutation, ObjectType};
    use crate::{Experiment, MlFramework};

    #[test]
    fn labels_roundtrip() {
        for kind in [
            ObjectType::Experiment,
            ObjectType::Checkpoint,
            ObjectType::Model,
            ObjectType::ModelVersion,
            ObjectType::File,
            ObjectType::Metadata,
        ] {
            assert_eq!(ObjectType::parse(kind.as_str()).expect("parse"), kind);
        }
        for action in [MutationAction::Create, MutationAction::Update] {
            assert_eq!(MutationAction::parse(action.as_str()).expect("parse"), action);
        }
        assert!(ObjectType::parse("tombstone").is_err());
    }

    #[test]
    fn record_payload_carries_entity_fields() {
        let experiment = Experiment::new("gpt3", "owner", "ns", "xyz", MlFramework::Pytorch);
        let mutation = NewMutation::for_record(
            MutationAction::Create,
            ObjectType::Experiment,
            experiment.id.to_hex(),
            None,
            &experiment.namespace,
            &experiment,
        )
        .expect("mutation");
        assert_eq!(mutation.payload["name"], "gpt3");
        assert_eq!(mutation.payload["external_id"], "xyz");
        assert_eq!(mutation.namespace, "ns");
    }

    #[test]
    fn scalar_payloads_are_rejected() {
        let result = NewMutation::for_record(
            MutationAction::Update,
            ObjectType::Metadata,
            "id",
            None,
            "ns",
            &42,
        );
        assert!(result.is_err());
    }
}
