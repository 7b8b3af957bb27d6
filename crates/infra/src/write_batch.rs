//! Write batches and their committing executor.
//!
//! A `WriteBatch` collects document mutations owned by a single caller. The
//! `WriteBatchExecutor` commits it as one `bulk_write` request. The
//! `KeyIndexed` flavor patches job inserts first, for stores that cannot put a
//! unique index on the identity field and index `key` instead.

use serde::{Deserialize, Serialize};
use tracing::{Instrument, Span, debug, info_span};

use jobdock_core::{DocumentId, QueueName};

use crate::document::{
    BulkWriteResult, Document, Filter, ID_FIELD, JOB_KIND, JobDocument, KEY_FIELD, QUEUE_FIELD,
    STATE_NAME_FIELD, Update, WriteOp, identity_string,
};
use crate::store::{DocumentStore, StoreError};

/// Store-specific document shape requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreFlavor {
    /// Documents are committed as given.
    #[default]
    Standard,
    /// Job inserts carry a `key` field mirroring `_id`.
    KeyIndexed,
}

impl std::str::FromStr for StoreFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "key-indexed" | "key_indexed" => Ok(Self::KeyIndexed),
            other => Err(format!("unknown store flavor '{other}'")),
        }
    }
}

/// Ordered, uncommitted document mutations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, document: Document) -> &mut Self {
        self.ops.push(WriteOp::Insert(document));
        self
    }

    pub fn insert_job(&mut self, job: &JobDocument) -> Result<&mut Self, StoreError> {
        let document = job.to_document()?;
        Ok(self.insert(document))
    }

    /// Make a job dequeue-able on `queue`.
    pub fn enqueue(&mut self, job_id: DocumentId, queue: &QueueName) -> &mut Self {
        self.update(Filter::Id(job_id), Update::new().set(QUEUE_FIELD, queue.as_str()))
    }

    pub fn set_state(&mut self, job_id: DocumentId, state_name: impl Into<String>) -> &mut Self {
        self.update(
            Filter::Id(job_id),
            Update::new().set(STATE_NAME_FIELD, state_name.into()),
        )
    }

    pub fn update(&mut self, filter: Filter, update: Update) -> &mut Self {
        self.ops.push(WriteOp::Update { filter, update });
        self
    }

    pub fn delete(&mut self, filter: Filter) -> &mut Self {
        self.ops.push(WriteOp::Delete { filter });
        self
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Set `key` to the string form of `_id` on every job insert.
///
/// Updates, deletes and non-job inserts are left alone. Returns the number of
/// patched documents.
pub fn derive_job_keys(ops: &mut [WriteOp]) -> usize {
    let mut patched = 0;
    for op in ops.iter_mut() {
        let WriteOp::Insert(document) = op else {
            continue;
        };
        if !document.has_kind(JOB_KIND) {
            continue;
        }
        if let Some(key) = document.get(ID_FIELD).and_then(identity_string) {
            document.insert(KEY_FIELD, key);
            patched += 1;
        }
    }
    patched
}

/// Commits write batches against one collection.
#[derive(Debug, Clone)]
pub struct WriteBatchExecutor<S> {
    store: S,
    collection: String,
    flavor: StoreFlavor,
    span: Span,
}

impl<S> WriteBatchExecutor<S>
where
    S: DocumentStore,
{
    pub fn new(store: S, collection: impl Into<String>, flavor: StoreFlavor) -> Self {
        let collection = collection.into();
        let span = info_span!("write_batch", collection = %collection, flavor = ?flavor);
        Self {
            store,
            collection,
            flavor,
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn flavor(&self) -> StoreFlavor {
        self.flavor
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Commit `batch` as one atomic request.
    ///
    /// Store errors are returned as-is; nothing is retried.
    pub async fn commit(&self, batch: WriteBatch) -> Result<BulkWriteResult, StoreError> {
        if batch.is_empty() {
            return Ok(BulkWriteResult::default());
        }

        let mut ops = batch.into_ops();
        async {
            if self.flavor == StoreFlavor::KeyIndexed {
                let patched = derive_job_keys(&mut ops);
                debug!(patched, "derived job keys");
            }
            let result = self.store.bulk_write(&self.collection, ops).await?;
            debug!(
                inserted = result.inserted,
                modified = result.modified,
                deleted = result.deleted,
                "batch committed"
            );
            Ok::<_, StoreError>(result)
        }
        .instrument(self.span.clone())
        .await
    }
}
