use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value as JsonValue;

use jobdock_core::{DocumentId, SchemaVersion};
use jobdock_events::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeSubscription, FeedError, InMemoryChangeFeed};

use super::{DocumentStore, SchemaMarkerStore, StoreError};
use crate::document::{BulkWriteResult, Document, Filter, ID_FIELD, IndexSpec, WriteOp};

#[derive(Debug, Clone, Default)]
struct Collection {
    documents: BTreeMap<DocumentId, Document>,
    indexes: Vec<IndexSpec>,
}

impl Collection {
    /// Check unique indexes for `document` against every other document.
    ///
    /// A missing field indexes as `null`, so two documents both lacking a
    /// uniquely indexed field collide (as on stores with strict unique indexes).
    fn check_unique(&self, id: DocumentId, document: &Document) -> Result<(), StoreError> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let key = document.get(&index.field).cloned().unwrap_or(JsonValue::Null);
            let clash = self
                .documents
                .iter()
                .any(|(other_id, other)| {
                    *other_id != id && other.get(&index.field).cloned().unwrap_or(JsonValue::Null) == key
                });
            if clash {
                return Err(StoreError::DuplicateKey {
                    index: index.name(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// In-memory document store for tests/dev.
///
/// - Bulk writes are atomic (applied to a copy, swapped on success)
/// - Unique indexes are enforced
/// - Committed changes are published to an in-memory change feed
#[derive(Debug)]
pub struct InMemoryDocumentStore {
    collections: RwLock<BTreeMap<String, Collection>>,
    schema: Mutex<Option<SchemaVersion>>,
    marker_writes: AtomicUsize,
    feed: Arc<InMemoryChangeFeed>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_feed(InMemoryChangeFeed::new())
    }

    /// A store whose deployment cannot serve change feeds.
    pub fn without_change_feed(reason: impl Into<String>) -> Self {
        Self::with_feed(InMemoryChangeFeed::unsupported(reason))
    }

    fn with_feed(feed: InMemoryChangeFeed) -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
            schema: Mutex::new(None),
            marker_writes: AtomicUsize::new(0),
            feed: Arc::new(feed),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Start from an existing schema marker without counting it as a write.
    pub fn with_schema_version(self, version: SchemaVersion) -> Self {
        *self.schema.lock().unwrap_or_else(|e| e.into_inner()) = Some(version);
        self
    }

    /// The change feed this store publishes to.
    pub fn feed(&self) -> &Arc<InMemoryChangeFeed> {
        &self.feed
    }

    /// Number of schema marker writes performed so far.
    pub fn marker_writes(&self) -> usize {
        self.marker_writes.load(Ordering::SeqCst)
    }

    /// Indexes currently defined on `collection`.
    pub fn indexes(&self, collection: &str) -> Vec<IndexSpec> {
        self.collections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    fn apply(
        collection_name: &str,
        collection: &mut Collection,
        ops: Vec<WriteOp>,
    ) -> Result<(BulkWriteResult, Vec<ChangeEvent>), StoreError> {
        let mut result = BulkWriteResult::default();
        let mut events = Vec::new();

        for (idx, op) in ops.into_iter().enumerate() {
            match op {
                WriteOp::Insert(document) => {
                    let id = document.id().ok_or_else(|| {
                        StoreError::InvalidDocument(format!("insert at index {idx} has no valid {ID_FIELD}"))
                    })?;
                    if collection.documents.contains_key(&id) {
                        return Err(StoreError::DuplicateKey {
                            index: ID_FIELD.to_string(),
                            key: id.to_string(),
                        });
                    }
                    collection.check_unique(id, &document)?;
                    events.push(ChangeEvent::insert(collection_name, id, document.as_map().clone()));
                    collection.documents.insert(id, document);
                    result.inserted += 1;
                }
                WriteOp::Update { filter, update } => {
                    let ids: Vec<DocumentId> = collection
                        .documents
                        .iter()
                        .filter(|(_, d)| filter.matches(d))
                        .map(|(id, _)| *id)
                        .collect();

                    for id in ids {
                        let mut document = collection.documents[&id].clone();
                        result.matched += 1;
                        if update.apply(&mut document) {
                            collection.check_unique(id, &document)?;
                            collection.documents.insert(id, document);
                            result.modified += 1;
                        }
                        events.push(ChangeEvent::update(
                            collection_name,
                            id,
                            update.set.clone(),
                            update.unset.clone(),
                        ));
                    }
                }
                WriteOp::Delete { filter } => {
                    let before = collection.documents.len();
                    let mut removed = Vec::new();
                    collection.documents.retain(|id, d| {
                        let hit = filter.matches(d);
                        if hit {
                            removed.push(*id);
                        }
                        !hit
                    });
                    result.deleted += (before - collection.documents.len()) as u64;
                    events.extend(removed.into_iter().map(|id| ChangeEvent::delete(collection_name, id)));
                }
            }
        }

        Ok((result, events))
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn bulk_write(&self, collection: &str, ops: Vec<WriteOp>) -> Result<BulkWriteResult, StoreError> {
        let (result, events) = {
            let mut collections = self
                .collections
                .write()
                .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

            // Apply to a copy; only swap it in if every op succeeded.
            let mut working = collections.get(collection).cloned().unwrap_or_default();
            let (result, events) = Self::apply(collection, &mut working, ops)?;
            collections.insert(collection.to_string(), working);
            (result, events)
        };

        // Publish after commit, outside the lock.
        for event in &events {
            self.feed.publish(event);
        }

        Ok(result)
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

        Ok(collections
            .get(collection)
            .map(|c| c.documents.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(collections.keys().cloned().collect())
    }

    async fn create_collection(&self, collection: &str) -> Result<(), StoreError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        collections.entry(collection.to_string()).or_default();
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<bool, StoreError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(collections.remove(collection).is_some())
    }

    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<(), StoreError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        let target = collections.entry(collection.to_string()).or_default();

        if target.indexes.iter().any(|i| i.name() == index.name()) {
            return Ok(());
        }

        if index.unique {
            let mut seen = HashSet::new();
            for document in target.documents.values() {
                let key = document.get(&index.field).cloned().unwrap_or(JsonValue::Null).to_string();
                if !seen.insert(key.clone()) {
                    return Err(StoreError::DuplicateKey { index: index.name(), key });
                }
            }
        }

        target.indexes.push(index);
        Ok(())
    }
}

#[async_trait::async_trait]
impl SchemaMarkerStore for InMemoryDocumentStore {
    async fn load_schema_version(&self) -> Result<Option<SchemaVersion>, StoreError> {
        let schema = self
            .schema
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(*schema)
    }

    async fn replace_schema_version(&self, version: SchemaVersion) -> Result<(), StoreError> {
        let mut schema = self
            .schema
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        *schema = Some(version);
        self.marker_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChangeFeed for InMemoryDocumentStore {
    async fn probe(&self) -> Result<(), FeedError> {
        self.feed.probe().await
    }

    async fn watch(&self, filter: ChangeFilter) -> Result<ChangeSubscription, FeedError> {
        self.feed.watch(filter).await
    }
}
