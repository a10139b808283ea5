use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Composite key of every staged and committed document.
///
/// `id` is only unique inside its `type` partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

impl Identifier {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.id)
    }
}

pub trait Identifiable {
    fn identifier(&self) -> &Identifier;
}

/// A document that can be staged: an identity plus its serialized JSON payload.
///
/// The payload text is stored byte-for-byte, so implementors that already hold
/// serialized JSON should return it borrowed.
pub trait Storeable: Identifiable {
    fn payload(&self) -> serde_json::Result<Cow<'_, str>>;
}

impl Identifiable for Identifier {
    fn identifier(&self) -> &Identifier {
        self
    }
}

/// Any serializable object tagged with an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet<T> {
    pub id: Identifier,
    pub obj: T,
}

impl<T> Packet<T> {
    pub fn new(id: Identifier, obj: T) -> Self {
        Self { id, obj }
    }
}

impl<T> Identifiable for Packet<T> {
    fn identifier(&self) -> &Identifier {
        &self.id
    }
}

impl<T: Serialize> Storeable for Packet<T> {
    fn payload(&self) -> serde_json::Result<Cow<'_, str>> {
        serde_json::to_string(&self.obj).map(Cow::Owned)
    }
}

/// Identity-only record, used for deletion marks and id lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stub(pub Identifier);

impl Stub {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self(Identifier::new(id, type_name))
    }
}

impl Identifiable for Stub {
    fn identifier(&self) -> &Identifier {
        &self.0
    }
}

/// Tri-state validation outcome, stored as a nullable boolean.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    #[default]
    Unknown,
    Valid,
    Invalid,
}

impl Validity {
    pub fn from_column(v: Option<bool>) -> Self {
        match v {
            None => Self::Unknown,
            Some(true) => Self::Valid,
            Some(false) => Self::Invalid,
        }
    }

    pub fn as_column(self) -> Option<bool> {
        match self {
            Self::Unknown => None,
            Self::Valid => Some(true),
            Self::Invalid => Some(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingRecord {
    #[serde(flatten)]
    pub identifier: Identifier,
    /// Raw serialized document; `{}` for delete markers.
    pub payload: String,
    pub validity: Validity,
    pub to_delete: bool,
}

impl StagingRecord {
    pub fn new(identifier: Identifier, payload: impl Into<String>) -> Self {
        Self {
            identifier,
            payload: payload.into(),
            validity: Validity::Unknown,
            to_delete: false,
        }
    }
}

impl Identifiable for StagingRecord {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }
}

impl Storeable for StagingRecord {
    fn payload(&self) -> serde_json::Result<Cow<'_, str>> {
        Ok(Cow::Borrowed(&self.payload))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    #[serde(flatten)]
    pub identifier: Identifier,
    pub hash: String,
    /// Canonical text exactly as promoted.
    pub payload: String,
    /// Queryable (`jsonb`) form; key order is not preserved.
    pub payload_indexed: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identifiable for ResourceRecord {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }
}

impl Storeable for ResourceRecord {
    fn payload(&self) -> serde_json::Result<Cow<'_, str>> {
        Ok(Cow::Borrowed(&self.payload))
    }
}

/// Accepts or rejects a staged payload.
pub trait Validator: Send + Sync {
    fn validate(&self, payload: &str) -> bool;
}

impl<F> Validator for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn validate(&self, payload: &str) -> bool {
        self(payload)
    }
}

/// Accepts every payload that parses as a JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonObjectValidator;

impl Validator for JsonObjectValidator {
    fn validate(&self, payload: &str) -> bool {
        matches!(
            serde_json::from_str::<serde_json::Value>(payload),
            Ok(serde_json::Value::Object(_))
        )
    }
}
