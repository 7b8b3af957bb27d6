//! Schema-less document shapes exchanged with the document store.
//!
//! Documents are JSON objects carrying an `_id` identity and a `_t` array of
//! runtime type names (most derived last). Everything else is free-form.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use jobdock_core::{DocumentId, QueueName};

/// Identity field.
pub const ID_FIELD: &str = "_id";
/// Runtime type discriminators.
pub const KIND_FIELD: &str = "_t";
/// Identity-derived key used by backends that cannot index `_id` uniquely.
pub const KEY_FIELD: &str = "key";
/// Queue a job was enqueued to; set when the job becomes dequeue-able.
pub const QUEUE_FIELD: &str = "queue";
/// Current job state.
pub const STATE_NAME_FIELD: &str = "state_name";
/// Expiry timestamp for expiring documents.
pub const EXPIRE_AT_FIELD: &str = "expire_at";

/// Type name carried by job documents.
pub const JOB_KIND: &str = "job";
/// Type name carried by documents that expire.
pub const EXPIRING_KIND: &str = "expiring";

/// A schema-less stored document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, JsonValue>);

impl Document {
    /// Create an empty document with the given identity.
    pub fn new(id: DocumentId) -> Self {
        let mut map = Map::new();
        map.insert(ID_FIELD.to_string(), JsonValue::String(id.to_string()));
        Self(map)
    }

    pub fn from_map(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }

    /// Serialize a value into a document. Fails if it is not a JSON object.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            JsonValue::Object(map) => Ok(Self(map)),
            other => Err(serde::ser::Error::custom(format!(
                "document must serialize to an object, got {other}"
            ))),
        }
    }

    pub fn deserialize<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(JsonValue::Object(self.0.clone()))
    }

    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, JsonValue> {
        self.0
    }

    /// Parsed identity, if `_id` is present and well-formed.
    pub fn id(&self) -> Option<DocumentId> {
        self.0.get(ID_FIELD)?.as_str()?.parse().ok()
    }

    /// Runtime type names from `_t` (a string or an array of strings).
    pub fn kinds(&self) -> Vec<&str> {
        match self.0.get(KIND_FIELD) {
            Some(JsonValue::String(kind)) => vec![kind.as_str()],
            Some(JsonValue::Array(kinds)) => kinds.iter().filter_map(JsonValue::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn has_kind(&self, kind: &str) -> bool {
        self.kinds().contains(&kind)
    }

    pub fn with_kinds(mut self, kinds: &[&str]) -> Self {
        let kinds = kinds.iter().map(|k| JsonValue::String((*k).to_string())).collect();
        self.0.insert(KIND_FIELD.to_string(), JsonValue::Array(kinds));
        self
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Option<JsonValue> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<JsonValue> {
        self.0.remove(field)
    }
}

/// String form of an identity value, as used for derived key fields.
pub fn identity_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Document selector.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every document.
    All,
    /// The document with this identity.
    Id(DocumentId),
    /// `field` equals `value`.
    Eq(String, JsonValue),
    /// `field` is present (null counts as present).
    Exists(String),
    /// `field` is absent.
    Missing(String),
    /// `_t` contains the given type name.
    Kind(String),
    /// Every sub-filter matches.
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn kind(kind: impl Into<String>) -> Self {
        Self::Kind(kind.into())
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::Missing(field.into())
    }

    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Id(id) => document.id() == Some(*id),
            Filter::Eq(field, value) => document.get(field) == Some(value),
            Filter::Exists(field) => document.contains(field),
            Filter::Missing(field) => !document.contains(field),
            Filter::Kind(kind) => document.has_kind(kind),
            Filter::And(filters) => filters.iter().all(|f| f.matches(document)),
        }
    }
}

/// Field-level modification applied to matched documents.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Update {
    pub set: Map<String, JsonValue>,
    pub unset: Vec<String>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Apply to a document; returns whether anything changed.
    pub fn apply(&self, document: &mut Document) -> bool {
        let mut changed = false;
        for (field, value) in &self.set {
            if document.get(field) != Some(value) {
                document.insert(field.clone(), value.clone());
                changed = true;
            }
        }
        for field in &self.unset {
            changed |= document.remove(field).is_some();
        }
        changed
    }
}

/// A single pending mutation inside a write batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert(Document),
    Update { filter: Filter, update: Update },
    Delete { filter: Filter },
}

/// Counts reported by a committed bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkWriteResult {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub deleted: u64,
}

/// Secondary index on a single top-level field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSpec {
    pub field: String,
    pub unique: bool,
}

impl IndexSpec {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            unique: false,
        }
    }

    pub fn unique(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            unique: true,
        }
    }

    /// Stable index name within a collection.
    pub fn name(&self) -> String {
        if self.unique {
            format!("ux_{}", self.field)
        } else {
            format!("ix_{}", self.field)
        }
    }
}

/// Data transfer shape of a background job.
///
/// Jobs are inserted without a queue; enqueueing sets `queue`, which is the
/// transition the change feed listens for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    #[serde(rename = "_t")]
    pub kinds: Vec<String>,
    #[serde(default)]
    pub state_name: Option<String>,
    pub invocation_data: String,
    pub arguments: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueName>,
}

impl JobDocument {
    pub fn new(invocation_data: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: DocumentId::new(),
            kinds: vec![EXPIRING_KIND.to_string(), JOB_KIND.to_string()],
            state_name: None,
            invocation_data: invocation_data.into(),
            arguments: arguments.into(),
            parameters: BTreeMap::new(),
            created_at: Utc::now(),
            expire_at: None,
            queue: None,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn to_document(&self) -> Result<Document, serde_json::Error> {
        Document::from_serializable(self)
    }
}
