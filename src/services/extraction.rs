use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{ErrorCategory, ImageRef, JobError};
use crate::models::receipt::ExtractedReceipt;
use crate::services::encryption::EncryptionError;
use crate::services::scheduler::JobTableHandle;
use crate::services::storage::StorageError;

/// Remote service turning a receipt image into a structured record.
///
/// Calls are not idempotent and cannot be cancelled once issued.
#[async_trait]
pub trait ReceiptExtractor: Send + Sync {
    async fn extract(
        &self,
        image: &ImageRef,
        ctx: &ExtractionContext,
    ) -> Result<ExtractedReceipt, ExtractionError>;
}

/// Per-call information handed to the extractor.
pub struct ExtractionContext {
    pub job_id: Uuid,
    pub attempt: u32,
    pub progress: ProgressReporter,
}

/// Reports upload sub-progress of one job back to its job table.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: Uuid,
    table: Option<JobTableHandle>,
}

impl ProgressReporter {
    pub fn new(job_id: Uuid, table: JobTableHandle) -> Self {
        Self {
            job_id,
            table: Some(table),
        }
    }

    /// A reporter that drops every update.
    pub fn detached(job_id: Uuid) -> Self {
        Self { job_id, table: None }
    }

    pub async fn report(&self, percent: u8) {
        if let Some(table) = &self.table {
            if let Err(e) = table.report_progress(self.job_id, percent).await {
                tracing::debug!(job_id = %self.job_id, error = %e, "Dropping progress update");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Extraction service returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("Failed to parse model response as a receipt: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Extracted receipt is invalid: {0}")]
    Invalid(String),

    #[error("Image unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("Image could not be decrypted: {0}")]
    Decrypt(#[from] EncryptionError),

    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),
}

impl ExtractionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ExtractionError::Timeout(_) => ErrorCategory::Timeout,
            ExtractionError::Parse(_) | ExtractionError::Invalid(_) => ErrorCategory::Validation,
            _ => ErrorCategory::Extraction,
        }
    }
}

impl From<&ExtractionError> for JobError {
    fn from(err: &ExtractionError) -> Self {
        JobError::new(err.category(), err.to_string())
    }
}
