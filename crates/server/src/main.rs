use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use jobdock_infra::{JobStorage, PostgresDocumentStore, StorageOptions, Wakeup};

/// How long one dequeue wait blocks before it is re-armed.
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobdock_observability::init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let options = StorageOptions::from_env().context("invalid JOBDOCK_* configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = Arc::new(PostgresDocumentStore::new(pool));
    store.ensure_schema().await.context("failed to create storage tables")?;

    let storage = Arc::new(
        JobStorage::open(store, options)
            .await
            .context("failed to open job storage")?,
    );

    let watcher = {
        let storage = Arc::clone(&storage);
        tokio::spawn(async move {
            let queues = storage.options().queues.clone();
            loop {
                match storage.wait_for_work(&queues, WAIT_TIMEOUT).await {
                    Ok(Wakeup::Released(queue)) => tracing::info!(queue = %queue, "work available"),
                    Ok(Wakeup::TimedOut) => tracing::debug!("no work signalled"),
                    Ok(Wakeup::Cancelled) | Err(_) => break,
                }
            }
        })
    };

    let failure = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!("shutting down");
            None
        }
        err = storage.notifier_failed() => Some(err),
    };

    storage.cancellation_token().cancel();
    watcher.await.context("dequeue watcher panicked")?;

    let storage = Arc::try_unwrap(storage)
        .map_err(|_| anyhow::anyhow!("job storage still shared at shutdown"))?;
    let stopped = storage.shutdown().await;

    if let Some(err) = failure {
        return Err(anyhow::Error::new(err).context("notification source failed"));
    }
    stopped.context("notifier failed")?;
    Ok(())
}
