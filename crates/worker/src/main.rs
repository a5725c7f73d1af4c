use std::sync::Arc;

use anyhow::{Context, Result};
use corral_fetch::{FetchConfig, FetcherPool, FetcherPoolError, QueueStore, WorkOutcome};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corral_fetch=info,corral_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Ok(path) = dotenv {
        tracing::info!("Loaded .env from {:?}", path);
    }

    tracing::info!("corral-worker starting...");

    // Configure via environment variables:
    // - CORRAL_QUEUES: comma separated queue names, `name:weight` repeats a queue
    // - CORRAL_STRICT / CORRAL_POLL_SCHEDULE / CORRAL_NAMESPACE
    // - CORRAL_CONCURRENCY / CORRAL_SHUTDOWN_TIMEOUT_MS
    // - REDIS_URL: store address (requires the `redis` feature)
    let config = FetchConfig::from_env().context("Invalid fetch configuration")?;
    let store = connect_store().await?;

    tracing::info!(
        queues = ?config.queues,
        strict = config.strict,
        poll_schedule = config.poll_schedule,
        concurrency = config.concurrency,
        "Fetch configuration loaded"
    );

    let pool = FetcherPool::from_store(store, config);
    pool.start(|unit| async move {
        tracing::info!(queue = %unit.queue_name(), payload = %unit.payload(), "Processing unit");
        WorkOutcome::Acknowledge
    })
    .context("Failed to start fetcher pool")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    match pool.shutdown().await {
        Ok(()) => {}
        Err(FetcherPoolError::ShutdownTimeout { requeued }) => {
            tracing::warn!(requeued, "Unfinished units were put back on their queues");
        }
        Err(e) => return Err(e).context("Failed to shut down fetcher pool"),
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}

#[cfg(feature = "redis")]
async fn connect_store() -> Result<Arc<dyn QueueStore>> {
    match std::env::var("REDIS_URL") {
        Ok(url) => {
            let store = corral_fetch::RedisQueueStore::connect(&url)
                .await
                .with_context(|| format!("Failed to connect to Redis at {url}"))?;
            tracing::info!(redis_url = %url, "Connected to Redis");
            Ok(Arc::new(store))
        }
        Err(_) => {
            tracing::warn!("REDIS_URL not set, using in-memory store");
            Ok(Arc::new(corral_fetch::InMemoryQueueStore::new()))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_store() -> Result<Arc<dyn QueueStore>> {
    if std::env::var("REDIS_URL").is_ok() {
        tracing::warn!("REDIS_URL is set but the redis feature is disabled");
    }
    tracing::info!("Using in-memory store");
    Ok(Arc::new(corral_fetch::InMemoryQueueStore::new()))
}
