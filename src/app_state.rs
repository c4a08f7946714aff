use jsonwebtoken::DecodingKey;
use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{batch::BatchService, encryption::EncryptionService, storage::R2Client};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub storage: Arc<R2Client>,
    pub encryption: Arc<EncryptionService>,
    pub batches: Arc<BatchService>,
    pub jwt_key: Arc<DecodingKey>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        storage: Arc<R2Client>,
        encryption: Arc<EncryptionService>,
        batches: BatchService,
        jwt_secret: &str,
    ) -> Self {
        Self {
            db,
            storage,
            encryption,
            batches: Arc::new(batches),
            jwt_key: Arc::new(DecodingKey::from_secret(jwt_secret.as_bytes())),
        }
    }
}
