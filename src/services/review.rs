use garde::Validate;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::models::batch::JobSnapshot;
use crate::models::job::JobStatus;
use crate::models::receipt::ReceiptOverrides;
use crate::models::review::{ReviewItem, ReviewStatus};

/// Staging area between extraction and commit.
///
/// Items are keyed by job id and kept in the order they became Ready.
pub struct ReviewQueue {
    confidence_threshold: f64,
    order: Vec<Uuid>,
    items: HashMap<Uuid, ReviewItem>,
    committed: HashSet<Uuid>,
    running_total_cents: i64,
}

/// Serializable view of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewView {
    pub items: Vec<ReviewItem>,
    pub running_total_cents: i64,
    pub needs_review: usize,
}

impl ReviewQueue {
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold,
            order: Vec::new(),
            items: HashMap::new(),
            committed: HashSet::new(),
            running_total_cents: 0,
        }
    }

    /// Add every Ready job not seen before. Returns how many were added.
    pub fn ingest(&mut self, jobs: &[JobSnapshot]) -> usize {
        let mut added = 0;
        for job in jobs {
            if job.status != JobStatus::Ready
                || self.items.contains_key(&job.id)
                || self.committed.contains(&job.id)
            {
                continue;
            }
            let Some(result) = &job.result else {
                continue;
            };
            let item = ReviewItem::new(job.id, result.clone(), self.confidence_threshold);
            tracing::debug!(job_id = %job.id, status = %item.status, "Queued for review");
            self.order.push(job.id);
            self.items.insert(job.id, item);
            added += 1;
        }
        if added > 0 {
            self.recompute();
        }
        added
    }

    pub fn get(&self, item_id: Uuid) -> Option<&ReviewItem> {
        self.items.get(&item_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &ReviewItem> {
        self.order.iter().filter_map(|id| self.items.get(id))
    }

    /// Apply user overrides. The extracted record is never touched.
    pub fn edit(
        &mut self,
        item_id: Uuid,
        overrides: ReceiptOverrides,
    ) -> Result<&ReviewItem, ReviewError> {
        overrides
            .validate()
            .map_err(|report| ReviewError::Invalid(report.to_string()))?;
        if overrides.is_empty() {
            return Err(ReviewError::EmptyEdit);
        }

        let item = self
            .items
            .get_mut(&item_id)
            .ok_or(ReviewError::NotFound(item_id))?;
        if item.status == ReviewStatus::Discarded {
            return Err(ReviewError::Discarded(item_id));
        }
        item.overrides.merge(overrides);
        item.status = ReviewStatus::Edited;

        self.recompute();
        self.items.get(&item_id).ok_or(ReviewError::NotFound(item_id))
    }

    /// Exclude an item from totals and from commit. Discarding twice is a no-op.
    pub fn discard(&mut self, item_id: Uuid) -> Result<&ReviewItem, ReviewError> {
        let item = self
            .items
            .get_mut(&item_id)
            .ok_or(ReviewError::NotFound(item_id))?;
        item.status = ReviewStatus::Discarded;

        self.recompute();
        self.items.get(&item_id).ok_or(ReviewError::NotFound(item_id))
    }

    /// Items that `save_all` should attempt, in queue order.
    pub fn commit_candidates(&self) -> Vec<ReviewItem> {
        self.items()
            .filter(|item| item.status.is_active())
            .cloned()
            .collect()
    }

    /// Drop a committed item. It will never be ingested again.
    pub fn remove_committed(&mut self, item_id: Uuid) -> Option<ReviewItem> {
        let removed = self.items.remove(&item_id)?;
        self.order.retain(|id| *id != item_id);
        self.committed.insert(item_id);
        self.recompute();
        Some(removed)
    }

    pub fn running_total_cents(&self) -> i64 {
        self.running_total_cents
    }

    pub fn view(&self) -> ReviewView {
        let items: Vec<ReviewItem> = self.items().cloned().collect();
        let needs_review = items
            .iter()
            .filter(|i| i.status == ReviewStatus::NeedsReview)
            .count();
        ReviewView {
            items,
            running_total_cents: self.running_total_cents,
            needs_review,
        }
    }

    fn recompute(&mut self) {
        self.running_total_cents = self
            .items
            .values()
            .filter(|item| item.status.is_active())
            .map(|item| item.effective().amount_cents())
            .sum();
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReviewError {
    #[error("Review item not found: {0}")]
    NotFound(Uuid),

    #[error("Review item {0} was discarded")]
    Discarded(Uuid),

    #[error("Edit contains no changes")]
    EmptyEdit,

    #[error("Invalid edit: {0}")]
    Invalid(String),
}
