use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use jobdock_core::DocumentId;

/// Kind of mutation a change event describes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// A single committed mutation on one document.
///
/// For updates, `updated_fields` holds the fields that were set (with their
/// new values) and `removed_fields` the fields that were unset. Inserts carry
/// the full inserted document in `updated_fields`; deletes carry neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    collection: String,
    document_id: DocumentId,
    operation: ChangeOperation,
    #[serde(default)]
    updated_fields: Map<String, JsonValue>,
    #[serde(default)]
    removed_fields: Vec<String>,
}

impl ChangeEvent {
    pub fn insert(
        collection: impl Into<String>,
        document_id: DocumentId,
        document: Map<String, JsonValue>,
    ) -> Self {
        Self {
            collection: collection.into(),
            document_id,
            operation: ChangeOperation::Insert,
            updated_fields: document,
            removed_fields: Vec::new(),
        }
    }

    pub fn update(
        collection: impl Into<String>,
        document_id: DocumentId,
        updated_fields: Map<String, JsonValue>,
        removed_fields: Vec<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            document_id,
            operation: ChangeOperation::Update,
            updated_fields,
            removed_fields,
        }
    }

    pub fn delete(collection: impl Into<String>, document_id: DocumentId) -> Self {
        Self {
            collection: collection.into(),
            document_id,
            operation: ChangeOperation::Delete,
            updated_fields: Map::new(),
            removed_fields: Vec::new(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn operation(&self) -> ChangeOperation {
        self.operation
    }

    pub fn updated_fields(&self) -> &Map<String, JsonValue> {
        &self.updated_fields
    }

    pub fn removed_fields(&self) -> &[String] {
        &self.removed_fields
    }

    /// New value of `field` if this event set it.
    pub fn updated_field(&self, field: &str) -> Option<&JsonValue> {
        self.updated_fields.get(field)
    }
}

/// Server-side filter applied to a change feed before events are delivered.
///
/// An empty filter (only a collection) matches every event in that collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    collection: String,
    operation: Option<ChangeOperation>,
    assigned_field: Option<String>,
}

impl ChangeFilter {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            operation: None,
            assigned_field: None,
        }
    }

    /// Filter matching updates that set `queue_field` to a non-null value,
    /// i.e. a job that was just made eligible for dequeue.
    pub fn queue_assigned(collection: impl Into<String>, queue_field: impl Into<String>) -> Self {
        Self::collection(collection)
            .with_operation(ChangeOperation::Update)
            .with_assigned_field(queue_field)
    }

    pub fn with_operation(mut self, operation: ChangeOperation) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Require that `field` is among the updated fields with a non-null value.
    pub fn with_assigned_field(mut self, field: impl Into<String>) -> Self {
        self.assigned_field = Some(field.into());
        self
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    pub fn operation(&self) -> Option<ChangeOperation> {
        self.operation
    }

    pub fn assigned_field(&self) -> Option<&str> {
        self.assigned_field.as_deref()
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.collection() != self.collection {
            return false;
        }
        if let Some(op) = self.operation {
            if event.operation() != op {
                return false;
            }
        }
        match &self.assigned_field {
            Some(field) => matches!(event.updated_field(field), Some(v) if !v.is_null()),
            None => true,
        }
    }
}
