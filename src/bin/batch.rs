use clap::Parser;
use image::ImageFormat;
use receipt_batch::{
    config::AppConfig,
    db::{self, credits::PgCreditLedger, receipts::PgReceiptStore},
    models::job::{ImageRef, JobStatus},
    services::{
        batch::BatchService,
        encryption::EncryptionService,
        ocr::{WorkersAiClient, WorkersAiExtractor},
        storage::{image_key, R2Client},
    },
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Arguments for a one-shot batch run.
#[derive(Debug, Parser)]
#[command(name = "batch")]
#[command(about = "Run one receipt batch from local image files", long_about = None)]
struct Args {
    /// Ledger user the batch is charged to.
    user_id: String,

    /// JPEG, PNG or WebP receipt images, at most ten.
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    let Args {
        user_id,
        images: paths,
    } = Args::parse();

    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let batch_config = config.batch_config().expect("Invalid batch configuration");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let storage = Arc::new(
        R2Client::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
        )
        .expect("Failed to initialize R2 client"),
    );
    let encryption = Arc::new(
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption"),
    );
    let ocr_client = Arc::new(
        WorkersAiClient::new(&config.cf_account_id, &config.cf_api_token)
            .expect("Failed to initialize Workers AI client"),
    );

    let service = BatchService::new(
        batch_config,
        Arc::new(WorkersAiExtractor::new(
            storage.clone(),
            encryption.clone(),
            ocr_client,
        )),
        Arc::new(PgReceiptStore::new(db_pool.clone())),
        Arc::new(PgCreditLedger::new(db_pool)),
        storage.clone(),
    );

    let admission = service
        .admit(&user_id, paths.len())
        .await
        .expect("Batch not admitted");
    tracing::info!(required = admission.required_units, "Batch admitted");

    let upload_id = Uuid::new_v4();
    let mut images = Vec::with_capacity(paths.len());
    for path in &paths {
        let data = std::fs::read(path).expect("Failed to read image");
        let format = image::guess_format(&data).expect("Unrecognized image format");
        if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP) {
            panic!("{} is not a JPEG, PNG or WebP image", path.display());
        }
        let key = image_key(upload_id, Uuid::new_v4());
        let sealed = encryption.seal(&key, &data).expect("Failed to encrypt image");
        storage.upload(&key, &sealed).await.expect("Failed to upload image");
        tracing::info!(path = %path.display(), image_key = %key, "Uploaded");
        images.push(ImageRef::new(key, format.to_mime_type()));
    }

    let batch = service
        .submit(&user_id, images)
        .await
        .expect("Failed to start batch");

    let _progress = batch.subscribe(|snapshot| {
        tracing::info!(
            batch_id = %snapshot.batch_id,
            status = %snapshot.status,
            running = snapshot.count(JobStatus::Running),
            ready = snapshot.count(JobStatus::Ready),
            failed = snapshot.count(JobStatus::Error),
            percent_complete = snapshot.percent_complete,
            "Progress"
        );
    });

    let summary = batch.run().await.expect("Batch run failed");
    tracing::info!(
        batch_id = %batch.id(),
        upload_id = %upload_id,
        ready = summary.ready,
        failed = summary.failed,
        "Extraction finished"
    );

    let outcome = batch.save_all().await.expect("Save failed");
    tracing::info!(
        saved = outcome.saved_count,
        failed = outcome.failed_ids.len(),
        "Receipts saved"
    );

    let insights = batch.insights();
    println!(
        "{}",
        serde_json::to_string_pretty(&insights).expect("Failed to encode insights")
    );
}
