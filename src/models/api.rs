use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::batch::BatchSnapshot;
use crate::services::admission::AdmissionDecision;

/// Response after a batch upload is admitted.
#[derive(Debug, Serialize)]
pub struct SubmitBatchResponse {
    pub batch_id: Uuid,
    pub job_ids: Vec<Uuid>,
    pub admission: AdmissionDecision,
    pub snapshot: BatchSnapshot,
}

/// JSON error body returned by every API route.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortfall: Option<i64>,
}

impl ErrorBody {
    pub fn message(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            required: None,
            available: None,
            shortfall: None,
        }
    }
}

/// Bearer token claims. `sub` is the ledger user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
}
