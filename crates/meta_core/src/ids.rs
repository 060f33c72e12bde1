use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{MetaError, MetaResult};

/// Content-addressed identifier: the leading 16 bytes of a SHA-256 digest over a natural key,
/// stamped as a version-8 UUID and rendered as 32 lowercase hex characters.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Id(pub [u8; 16]);

impl Id {
    /// Derives an id from the ordered parts of a natural key.
    ///
    /// Every part is written as an 8-byte big-endian length followed by its bytes, so
    /// `["ab", "c"]` and `["a", "bc"]` hash differently and reordering parts changes the id.
    pub fn derive(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        let mut buf = [0u8; 16];
        buf.copy_from_slice(&digest[..16]);
        Self(*Uuid::new_v8(buf).as_bytes())
    }

    /// Accepts the 32-char hex form as well as hyphenated UUIDs.
    pub fn parse(value: &str) -> MetaResult<Self> {
        let uuid = Uuid::try_parse(value)
            .map_err(|err| MetaError::invalid(format!("invalid id '{value}': {err}")))?;
        Ok(Self(*uuid.as_bytes()))
    }

    pub fn to_hex(self) -> String {
        Uuid::from_bytes(self.0).simple().to_string()
    }

    pub fn as_bytes(self) -> [u8; 16] {
        self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).simple())
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Id::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// Opaque foreign key to whatever owns a file or a metadata entry.
///
/// Parents are usually entity ids, but the column has no type link to any table; it is
/// only checked against existing entities when referential validation is enabled.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParentId(pub String);

impl ParentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Id> for ParentId {
    fn from(value: Id) -> Self {
        Self(value.to_hex())
    }
}

impl From<&str> for ParentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Anything with a stable id that files and metadata can hang off.
pub trait HasId {
    fn id(&self) -> Id;

    fn parent_ref(&self) -> ParentId {
        self.id().into()
    }
}

#[cfg(test)]
mod tests {
    use super::{Id, ParentId};

    #[test]
    fn derive_is_deterministic() {
        assert_eq!(Id::derive(&["a", "b"]), Id::derive(&["a", "b"]));
    }

    #[test]
    fn derive_is_order_sensitive() {
        assert_ne!(Id::derive(&["a", "b"]), Id::derive(&["b", "a"]));
        assert_ne!(
            Id::derive(&["parent-1", "key"]),
            Id::derive(&["key", "parent-1"])
        );
    }

    #[test]
    fn derive_separates_fields() {
        assert_ne!(Id::derive(&["ab", "c"]), Id::derive(&["a", "bc"]));
        assert_ne!(Id::derive(&["abc"]), Id::derive(&["ab", "c"]));
        assert_ne!(Id::derive(&["", "x"]), Id::derive(&["x", ""]));
    }

    #[test]
    fn hex_form_is_fixed_width_and_parses_back() {
        let id = Id::derive(&["gpt3", "unicorn@modelbox.io", "ai/langtech/translation"]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(Id::parse(&hex).expect("parse hex"), id);
        assert_eq!(hex, id.to_string());
    }

    #[test]
    fn parse_accepts_hyphenated_uuids() {
        let id = Id::parse("67e55044-10b1-426f-9247-bb680e5fe0c8").expect("uuid parse");
        assert_eq!(id.to_hex(), "67e5504410b1426f9247bb680e5fe0c8");
    }

    #[test]
    fn parse_rejects_invalid_strings() {
        assert!(Id::parse("not-an-id").is_err());
        assert!(Id::parse("").is_err());
    }

    #[test]
    fn serde_uses_hex_strings() {
        let id = Id::derive(&["model", "1"]);
        let encoded = serde_json::to_string(&id).expect("encode");
        assert_eq!(encoded, format!("\"{}\"", id.to_hex()));
        let decoded: Id = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, id);
    }

    #[test]
    fn parent_id_from_id_uses_hex() {
        let id = Id::derive(&["x"]);
        assert_eq!(ParentId::from(id).as_str(), id.to_hex());
    }
}
