use image_labeler::{
    app_state::AppState,
    config::AppConfig,
    db,
    routes,
    services::{
        classifier::ClassificationClient,
        label_store::PgLabelStore,
        queue::{settle_batch, QueueError, RedisQueue},
        storage::S3Storage,
        thumbnail::ThumbnailGenerator,
        workers_ai::WorkersAiDetector,
    },
    worker::IngestionWorker,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting image ingestion worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let pipeline = config.pipeline().expect("Invalid pipeline configuration");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "ingestion_records_total",
        "Queue messages processed, by outcome"
    );
    metrics::describe_counter!("ingestion_batches_total", "Batches processed");
    metrics::describe_counter!(
        "ingestion_thumbnail_failures_total",
        "Thumbnail generations that failed"
    );
    metrics::describe_histogram!(
        "ingestion_record_seconds",
        "Time to classify and store one image"
    );
    metrics::describe_gauge!(
        "ingestion_queue_depth",
        "Messages waiting in the image queue"
    );

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, pipeline.concurrency as u32 + 1)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing services");
    let storage = Arc::new(
        S3Storage::new(
            &config.storage_endpoint,
            &config.storage_region,
            &config.storage_access_key,
            &config.storage_secret_key,
        )
        .expect("Failed to initialize storage client"),
    );

    let detector = WorkersAiDetector::new(
        storage.clone(),
        &config.cf_account_id,
        &config.cf_api_token,
        Duration::from_secs(pipeline.call_timeout_secs),
    )
    .expect("Failed to initialize Workers AI client");

    let thumbnails = ThumbnailGenerator::new(storage, config.thumbnail_settings())
        .expect("Invalid thumbnail configuration");

    let queue = Arc::new(
        RedisQueue::new(&config.redis_url, config.queue_settings())
            .expect("Failed to initialize queue"),
    );

    let worker = IngestionWorker::new(
        ClassificationClient::new(Arc::new(detector), pipeline.classification()),
        Some(Arc::new(thumbnails)),
        Arc::new(PgLabelStore::new(db_pool.clone())),
        pipeline.worker(),
    );

    let state = AppState::new(db_pool, queue.clone());
    let app = routes::ops_router(state, prometheus_handle);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind ops address");
    tracing::info!("Ops server listening on {}", config.bind_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Ops server stopped");
        }
    });

    let wait = Duration::from_secs(pipeline.wait_time_secs);
    tracing::info!(
        batch_size = pipeline.batch_size,
        concurrency = pipeline.concurrency,
        "Worker ready, starting consume loop"
    );

    loop {
        match consume_batch(&queue, &worker, pipeline.batch_size, wait).await {
            Ok(0) => tracing::trace!("No messages received"),
            Ok(count) => tracing::trace!(count, "Batch handled"),
            Err(e) => {
                tracing::error!(error = %e, "Queue error, backing off");
                sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

/// Receive one batch, process it and settle each message.
/// Returns the number of messages received.
async fn consume_batch(
    queue: &RedisQueue,
    worker: &IngestionWorker,
    batch_size: usize,
    wait: Duration,
) -> Result<usize, QueueError> {
    let messages = queue.receive_wait(batch_size, wait).await?;
    if let Ok(depth) = queue.depth().await {
        metrics::gauge!("ingestion_queue_depth").set(depth as f64);
    }
    if messages.is_empty() {
        return Ok(0);
    }

    let bodies: Vec<&str> = messages.iter().map(|m| m.body.as_str()).collect();
    let outcomes = worker.process_batch(&bodies).await;

    let summary = settle_batch(queue, &messages, &outcomes).await;
    tracing::debug!(
        acked = summary.acked,
        dead_lettered = summary.dead_lettered,
        retried = summary.retried,
        expired = summary.expired,
        failed = summary.failed,
        "Batch settled"
    );

    Ok(messages.len())
}
