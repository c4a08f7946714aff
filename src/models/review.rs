use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::models::receipt::{EffectiveReceipt, ExtractedReceipt, ReceiptOverrides};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReviewStatus {
    Ready,
    NeedsReview,
    Edited,
    Discarded,
}

impl ReviewStatus {
    /// Whether the item contributes to the running total and is committed.
    pub fn is_active(self) -> bool {
        !matches!(self, ReviewStatus::Discarded)
    }
}

/// A Ready job awaiting human confirmation. The item id is the job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub job_id: Uuid,
    pub original: ExtractedReceipt,
    pub overrides: ReceiptOverrides,
    pub confidence: f64,
    pub status: ReviewStatus,
}

impl ReviewItem {
    pub fn new(job_id: Uuid, original: ExtractedReceipt, confidence_threshold: f64) -> Self {
        let confidence = original.confidence;
        let status = if confidence >= confidence_threshold {
            ReviewStatus::Ready
        } else {
            ReviewStatus::NeedsReview
        };
        Self {
            job_id,
            original,
            overrides: ReceiptOverrides::default(),
            confidence,
            status,
        }
    }

    pub fn effective(&self) -> EffectiveReceipt {
        self.overrides.apply(&self.original)
    }
}
