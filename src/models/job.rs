use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::models::receipt::ExtractedReceipt;

/// Lifecycle of a single receipt extraction job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Ready,
    Error,
    Cancelled,
    Saved,
}

impl JobStatus {
    /// No scheduler-driven transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Ready | JobStatus::Error | JobStatus::Cancelled | JobStatus::Saved
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Ready)
                | (Running, Error)
                | (Pending, Cancelled)
                | (Error, Pending)
                | (Ready, Saved)
        )
    }
}

/// Why an extraction attempt failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Extraction,
    Timeout,
    Validation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub cause: String,
    pub category: ErrorCategory,
}

impl JobError {
    pub fn new(category: ErrorCategory, cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            category,
        }
    }
}

/// Opaque handle to an uploaded receipt image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub key: String,
    pub content_type: String,
}

impl ImageRef {
    pub fn new(key: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            content_type: content_type.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A receipt extraction job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptJob {
    pub id: Uuid,
    pub image: ImageRef,
    pub status: JobStatus,
    pub result: Option<ExtractedReceipt>,
    pub error: Option<JobError>,
    /// Number of times the job has been dispatched.
    pub attempts: u32,
    pub upload_progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReceiptJob {
    pub fn new(image: ImageRef) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            image,
            status: JobStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            upload_progress: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Pending -> Running. Each start is one dispatch.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running)?;
        self.attempts += 1;
        self.upload_progress = 0;
        Ok(())
    }

    /// Running -> Ready.
    pub fn complete(&mut self, receipt: ExtractedReceipt) -> Result<(), TransitionError> {
        self.transition(JobStatus::Ready)?;
        self.result = Some(receipt);
        self.error = None;
        Ok(())
    }

    /// Running -> Error.
    pub fn fail(&mut self, error: JobError) -> Result<(), TransitionError> {
        self.transition(JobStatus::Error)?;
        self.error = Some(error);
        Ok(())
    }

    /// Pending -> Cancelled.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Cancelled)
    }

    /// Error -> Pending. Only an explicit user retry takes this edge.
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Pending)?;
        self.error = None;
        self.upload_progress = 0;
        Ok(())
    }

    /// Ready -> Saved.
    pub fn mark_saved(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Saved)
    }

    /// Record upload sub-progress. Ignored outside of Running.
    pub fn set_upload_progress(&mut self, percent: u8) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        let percent = percent.min(100);
        if percent == self.upload_progress {
            return false;
        }
        self.upload_progress = percent;
        self.updated_at = Utc::now();
        true
    }
}
