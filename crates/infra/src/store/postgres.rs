//! Postgres-backed document store.
//!
//! Documents live as JSONB rows keyed by `(collection, id)`. Secondary indexes
//! are partial expression indexes per collection, and the schema marker is a
//! singleton row.
//!
//! ## Change feed
//!
//! The change feed is built on `LISTEN/NOTIFY`. `bulk_write` issues a
//! `pg_notify` inside the commit transaction for every update that assigns the
//! queue field, so notifications are only delivered if the batch commits.
//! Other mutations are not published. Notifications are transient: events
//! committed while no listener is connected are not replayed.
//!
//! ## Error Mapping
//!
//! | SQLx Error | SQLSTATE | StoreError / FeedError |
//! |------------|----------|------------------------|
//! | Database (unique violation) | `23505` | `DuplicateKey` |
//! | Database (feature not supported) | `0A000` | `Unsupported` |
//! | Database (read-only transaction, e.g. `LISTEN` on a hot standby) | `25006` | `Unsupported` |
//! | Io / PoolTimedOut / PoolClosed | N/A | `Connection` / `Disconnected` |
//! | Other | Any other | `Storage` / `Disconnected` |

use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument, warn};

use jobdock_core::SchemaVersion;
use jobdock_events::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeSubscription, FeedError};

use super::{DocumentStore, SchemaMarkerStore, StoreError};
use crate::document::{BulkWriteResult, Document, Filter, ID_FIELD, IndexSpec, KIND_FIELD, QUEUE_FIELD, WriteOp};

/// Default `NOTIFY` channel carrying change events.
pub const DEFAULT_NOTIFY_CHANNEL: &str = "jobdock_changes";

/// Postgres-backed document store, schema marker and change feed.
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    channel: String,
    queue_field: String,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            channel: DEFAULT_NOTIFY_CHANNEL.to_string(),
            queue_field: QUEUE_FIELD.to_string(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the storage tables if they do not exist.
    ///
    /// This is the storage substrate, not the document schema; document
    /// layout changes go through the migration runner.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS jobdock_collections (
                name TEXT PRIMARY KEY
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS jobdock_documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body JSONB NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS jobdock_schema (
                singleton BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (singleton),
                version INTEGER NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    fn is_queue_assignment(&self, set: &Map<String, JsonValue>) -> bool {
        matches!(set.get(&self.queue_field), Some(v) if !v.is_null())
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    match filter {
        Filter::All => {
            qb.push("TRUE");
        }
        Filter::Id(id) => {
            qb.push("id = ").push_bind(id.to_string());
        }
        Filter::Eq(field, value) => {
            qb.push("body -> ")
                .push_bind(field.clone())
                .push(" = ")
                .push_bind(Json(value.clone()))
                .push("::jsonb");
        }
        Filter::Exists(field) => {
            qb.push("jsonb_exists(body, ").push_bind(field.clone()).push(")");
        }
        Filter::Missing(field) => {
            qb.push("NOT jsonb_exists(body, ").push_bind(field.clone()).push(")");
        }
        Filter::Kind(kind) => {
            qb.push(format!("(body -> '{KIND_FIELD}' @> "))
                .push_bind(Json(JsonValue::Array(vec![JsonValue::String(kind.clone())])))
                .push(format!("::jsonb OR body ->> '{KIND_FIELD}' = "))
                .push_bind(kind.clone())
                .push(")");
        }
        Filter::And(filters) => {
            if filters.is_empty() {
                qb.push("TRUE");
                return;
            }
            qb.push("(");
            for (idx, f) in filters.iter().enumerate() {
                if idx > 0 {
                    qb.push(" AND ");
                }
                push_filter(qb, f);
            }
            qb.push(")");
        }
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Postgres identifiers: lowercase alphanumerics/underscores, max 63 bytes.
fn index_identifier(collection: &str, index: &IndexSpec) -> String {
    let raw = format!("jobdock_{}_{}", collection, index.name());
    let mut ident: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    ident.truncate(63);
    ident
}

fn sqlstate(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.to_string()),
        _ => None,
    }
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> StoreError {
    match sqlstate(&e).as_deref() {
        Some("23505") => {
            let index = match &e {
                sqlx::Error::Database(db) => db.constraint().unwrap_or("unknown").to_string(),
                _ => "unknown".to_string(),
            };
            return StoreError::DuplicateKey { index, key: e.to_string() };
        }
        Some("0A000") | Some("25006") => return StoreError::Unsupported(format!("{operation}: {e}")),
        _ => {}
    }

    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Connection(format!("{operation}: {e}"))
        }
        other => StoreError::Storage(format!("{operation}: {other}")),
    }
}

fn map_feed_error(e: sqlx::Error) -> FeedError {
    match sqlstate(&e).as_deref() {
        Some("0A000") | Some("25006") => FeedError::unsupported(e.to_string()),
        _ => FeedError::disconnected(e.to_string()),
    }
}

#[async_trait::async_trait]
impl DocumentStore for PostgresDocumentStore {
    #[instrument(skip(self, ops), fields(collection = %collection, ops = ops.len()), err)]
    async fn bulk_write(&self, collection: &str, ops: Vec<WriteOp>) -> Result<BulkWriteResult, StoreError> {
        let mut result = BulkWriteResult::default();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("bulk_write.begin", e))?;

        sqlx::query("INSERT INTO jobdock_collections (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(collection)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("bulk_write.collection", e))?;

        for (idx, op) in ops.into_iter().enumerate() {
            match op {
                WriteOp::Insert(document) => {
                    let id = document.id().ok_or_else(|| {
                        StoreError::InvalidDocument(format!("insert at index {idx} has no valid {ID_FIELD}"))
                    })?;
                    sqlx::query("INSERT INTO jobdock_documents (collection, id, body) VALUES ($1, $2, $3)")
                        .bind(collection)
                        .bind(id.to_string())
                        .bind(Json(document.into_map()))
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("bulk_write.insert", e))?;
                    result.inserted += 1;
                }
                WriteOp::Update { filter, update } => {
                    let mut qb = QueryBuilder::<Postgres>::new("UPDATE jobdock_documents SET body = (body || ");
                    qb.push_bind(Json(update.set.clone()))
                        .push("::jsonb) - ")
                        .push_bind(update.unset.clone())
                        .push("::text[] WHERE collection = ")
                        .push_bind(collection.to_string())
                        .push(" AND ");
                    push_filter(&mut qb, &filter);
                    qb.push(" RETURNING id");

                    let rows = qb
                        .build()
                        .fetch_all(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("bulk_write.update", e))?;
                    result.matched += rows.len() as u64;
                    result.modified += rows.len() as u64;

                    if self.is_queue_assignment(&update.set) {
                        for row in rows {
                            let id: String = row
                                .try_get("id")
                                .map_err(|e| map_sqlx_error("bulk_write.update", e))?;
                            let Ok(document_id) = id.parse() else {
                                warn!(id = %id, "skipping change notification for non-uuid document id");
                                continue;
                            };
                            let event = ChangeEvent::update(
                                collection,
                                document_id,
                                update.set.clone(),
                                update.unset.clone(),
                            );
                            sqlx::query("SELECT pg_notify($1, $2)")
                                .bind(&self.channel)
                                .bind(serde_json::to_string(&event)?)
                                .execute(&mut *tx)
                                .await
                                .map_err(|e| map_sqlx_error("bulk_write.notify", e))?;
                        }
                    }
                }
                WriteOp::Delete { filter } => {
                    let mut qb =
                        QueryBuilder::<Postgres>::new("DELETE FROM jobdock_documents WHERE collection = ");
                    qb.push_bind(collection.to_string()).push(" AND ");
                    push_filter(&mut qb, &filter);

                    let done = qb
                        .build()
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("bulk_write.delete", e))?;
                    result.deleted += done.rows_affected();
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("bulk_write.commit", e))?;
        Ok(result)
    }

    #[instrument(skip(self, filter), fields(collection = %collection), err)]
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT body FROM jobdock_documents WHERE collection = ");
        qb.push_bind(collection.to_string()).push(" AND ");
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id ASC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", e))?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(body): Json<Map<String, JsonValue>> =
                row.try_get("body").map_err(|e| map_sqlx_error("find", e))?;
            documents.push(Document::from_map(body));
        }
        Ok(documents)
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT name FROM jobdock_collections ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_collections", e))?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("name").map_err(|e| map_sqlx_error("list_collections", e)))
            .collect()
    }

    async fn create_collection(&self, collection: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO jobdock_collections (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(collection)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_collection", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn drop_collection(&self, collection: &str) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("drop_collection.begin", e))?;

        sqlx::query("DELETE FROM jobdock_documents WHERE collection = $1")
            .bind(collection)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("drop_collection.documents", e))?;

        let done = sqlx::query("DELETE FROM jobdock_collections WHERE name = $1")
            .bind(collection)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("drop_collection.collection", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("drop_collection.commit", e))?;
        Ok(done.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<(), StoreError> {
        self.create_collection(collection).await?;

        let statement = format!(
            "CREATE {unique}INDEX IF NOT EXISTS {name} ON jobdock_documents ((body ->> {field})) WHERE collection = {collection}",
            unique = if index.unique { "UNIQUE " } else { "" },
            name = index_identifier(collection, &index),
            field = quote_literal(&index.field),
            collection = quote_literal(collection),
        );
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_index", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SchemaMarkerStore for PostgresDocumentStore {
    async fn load_schema_version(&self) -> Result<Option<SchemaVersion>, StoreError> {
        let row = sqlx::query("SELECT version FROM jobdock_schema WHERE singleton")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_schema_version", e))?;

        match row {
            Some(row) => {
                let version: i32 = row
                    .try_get("version")
                    .map_err(|e| map_sqlx_error("load_schema_version", e))?;
                let version = u32::try_from(version)
                    .map_err(|_| StoreError::Storage(format!("negative schema version {version}")))?;
                Ok(Some(SchemaVersion::new(version)))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(version = %version), err)]
    async fn replace_schema_version(&self, version: SchemaVersion) -> Result<(), StoreError> {
        let value = i32::try_from(version.get())
            .map_err(|_| StoreError::Storage(format!("schema version {version} out of range")))?;

        sqlx::query(
            r#"
            INSERT INTO jobdock_schema (singleton, version, updated_at)
            VALUES (TRUE, $1, NOW())
            ON CONFLICT (singleton)
            DO UPDATE SET
                version = EXCLUDED.version,
                updated_at = NOW()
            "#,
        )
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("replace_schema_version", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChangeFeed for PostgresDocumentStore {
    async fn probe(&self) -> Result<(), FeedError> {
        let mut listener = PgListener::connect_with(&self.pool).await.map_err(map_feed_error)?;
        listener.listen(&self.channel).await.map_err(map_feed_error)?;
        listener.unlisten_all().await.map_err(map_feed_error)?;
        Ok(())
    }

    #[instrument(skip(self, filter), fields(channel = %self.channel), err)]
    async fn watch(&self, filter: ChangeFilter) -> Result<ChangeSubscription, FeedError> {
        let mut listener = PgListener::connect_with(&self.pool).await.map_err(map_feed_error)?;
        listener.listen(&self.channel).await.map_err(map_feed_error)?;

        let (tx, subscription) = ChangeSubscription::channel();

        // Forward notifications until the subscription is dropped or the
        // connection fails.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = listener.try_recv() => match received {
                        Ok(Some(notification)) => {
                            let event: ChangeEvent = match serde_json::from_str(notification.payload()) {
                                Ok(event) => event,
                                Err(error) => {
                                    warn!(error = %error, "cannot decode change notification");
                                    continue;
                                }
                            };
                            if filter.matches(&event) && tx.send(Ok(event)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!("listener connection lost");
                            let _ = tx.send(Err(FeedError::disconnected("listener connection lost")));
                            break;
                        }
                        Err(error) => {
                            let _ = tx.send(Err(map_feed_error(error)));
                            break;
                        }
                    }
                }
            }
        });

        Ok(subscription)
    }
}
