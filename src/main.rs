use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use receipt_batch::{
    app_state::AppState,
    config::AppConfig,
    db::{self, credits::PgCreditLedger, receipts::PgReceiptStore},
    routes::{self, batches},
    services::{
        batch::BatchService,
        encryption::EncryptionService,
        ocr::{WorkersAiClient, WorkersAiExtractor},
        storage::R2Client,
    },
};

/// Ten images of up to 10 MB each.
const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

const BATCH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    let batch_config = config
        .batch_config()
        .expect("Invalid batch configuration");

    tracing::info!(
        concurrency = batch_config.concurrency,
        max_batch_size = batch_config.max_batch_size,
        confidence_threshold = batch_config.confidence_threshold,
        retention_secs = batch_config.retention_secs,
        "Initializing receipt-batch server"
    );

    let prometheus_handle =
        routes::metrics::install_recorder().expect("Failed to install Prometheus metrics recorder");

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing R2 storage client");
    let storage = Arc::new(
        R2Client::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
        )
        .expect("Failed to initialize R2 client"),
    );

    tracing::info!("Initializing AES-256-GCM encryption");
    let encryption = Arc::new(
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption"),
    );

    tracing::info!("Initializing Cloudflare Workers AI client");
    let ocr_client = Arc::new(
        WorkersAiClient::new(&config.cf_account_id, &config.cf_api_token)
            .expect("Failed to initialize Workers AI client"),
    );

    let batches = BatchService::new(
        batch_config,
        Arc::new(WorkersAiExtractor::new(
            storage.clone(),
            encryption.clone(),
            ocr_client,
        )),
        Arc::new(PgReceiptStore::new(db_pool.clone())),
        Arc::new(PgCreditLedger::new(db_pool.clone())),
        storage.clone(),
    );

    let state = AppState::new(db_pool, storage, encryption, batches, &config.jwt_secret);
    state.batches.spawn_sweeper(BATCH_SWEEP_INTERVAL);

    let api = Router::new()
        .route(
            "/batches",
            post(batches::submit_batch).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/batches/{id}", get(batches::get_batch))
        .route("/batches/{id}/events", get(batches::batch_events))
        .route("/batches/{id}/cancel", post(batches::cancel_batch))
        .route(
            "/batches/{id}/jobs/{job_id}/retry",
            post(batches::retry_job),
        )
        .route("/batches/{id}/review", get(batches::get_review))
        .route(
            "/batches/{id}/review/{item_id}",
            patch(batches::edit_review_item).delete(batches::discard_review_item),
        )
        .route("/batches/{id}/save", post(batches::save_batch))
        .route("/batches/{id}/insights", get(batches::get_insights));

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api/v1", api)
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES));

    tracing::info!("Starting receipt-batch on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
