use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::models::job::{ErrorCategory, ImageRef, JobStatus, ReceiptJob};
use crate::models::receipt::ExtractedReceipt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatchStatus {
    Admitting,
    Running,
    Completed,
    Cancelled,
    Rejected,
}

/// The set of jobs submitted together under one admission check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSession {
    pub id: Uuid,
    pub user_id: String,
    /// Submission order.
    pub job_ids: Vec<Uuid>,
    pub concurrency_limit: usize,
    pub cancelled: bool,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
}

impl BatchSession {
    pub fn new(user_id: impl Into<String>, concurrency_limit: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            job_ids: Vec::new(),
            concurrency_limit,
            cancelled: false,
            status: BatchStatus::Admitting,
            created_at: Utc::now(),
        }
    }
}

/// Immutable copy of one job handed to status subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub image: ImageRef,
    pub status: JobStatus,
    pub result: Option<ExtractedReceipt>,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub attempts: u32,
    pub upload_progress: u8,
    pub updated_at: DateTime<Utc>,
}

impl From<&ReceiptJob> for JobSnapshot {
    fn from(job: &ReceiptJob) -> Self {
        Self {
            id: job.id,
            image: job.image.clone(),
            status: job.status,
            result: job.result.clone(),
            error: job.error.as_ref().map(|e| e.cause.clone()),
            error_category: job.error.as_ref().map(|e| e.category),
            attempts: job.attempts,
            upload_progress: job.upload_progress,
            updated_at: job.updated_at,
        }
    }
}

/// Full batch state as broadcast after every mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSnapshot {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    /// Jobs in submission order.
    pub jobs: Vec<JobSnapshot>,
    pub percent_complete: f64,
}

impl BatchSnapshot {
    pub fn new(batch_id: Uuid, status: BatchStatus, jobs: Vec<JobSnapshot>) -> Self {
        let percent_complete = percent_complete(&jobs);
        Self {
            batch_id,
            status,
            jobs,
            percent_complete,
        }
    }

    pub fn job(&self, id: Uuid) -> Option<&JobSnapshot> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

fn percent_complete(jobs: &[JobSnapshot]) -> f64 {
    if jobs.is_empty() {
        return 0.0;
    }
    let terminal = jobs.iter().filter(|j| j.status.is_terminal()).count();
    terminal as f64 * 100.0 / jobs.len() as f64
}
