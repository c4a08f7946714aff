use async_trait::async_trait;
use uuid::Uuid;

use crate::models::receipt::ReceiptRecord;

/// Durable home of committed receipts. Writes are per item; there is no
/// multi-item transaction.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Persist `record` and return its stable id.
    async fn save(&self, record: &ReceiptRecord) -> Result<Uuid, PersistenceError>;

    /// Remove a record written by [`save`](Self::save).
    async fn delete(&self, id: Uuid) -> Result<(), PersistenceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to encode receipt: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Receipt store unavailable: {0}")]
    Unavailable(String),
}
