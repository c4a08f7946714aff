use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::models::batch::{BatchSession, BatchSnapshot, BatchStatus};
use crate::models::job::{ImageRef, JobStatus, ReceiptJob};
use crate::models::receipt::{ReceiptOverrides, SavedReceipt};
use crate::models::review::{ReviewItem, ReviewStatus};
use crate::services::admission::{
    check_admission, check_batch_size, AdmissionDecision, AdmissionError,
};
use crate::services::commit::{CommitOutcome, Committer};
use crate::services::extraction::ReceiptExtractor;
use crate::services::insights::{summarize, InsightSummary};
use crate::services::ledger::{CreditLedger, LedgerError};
use crate::services::persistence::ReceiptStore;
use crate::services::progress::{ProgressEmitter, Subscription};
use crate::services::review::{ReviewError, ReviewQueue, ReviewView};
use crate::services::scheduler::{JobTableHandle, RunSummary, SchedulerError, WorkerPool};
use crate::services::storage::ImageStore;

/// Entry point for batch work: admission and the registry of live batches.
pub struct BatchService {
    config: BatchConfig,
    extractor: Arc<dyn ReceiptExtractor>,
    store: Arc<dyn ReceiptStore>,
    ledger: Arc<dyn CreditLedger>,
    images: Arc<dyn ImageStore>,
    batches: RwLock<HashMap<Uuid, Arc<ActiveBatch>>>,
}

impl BatchService {
    pub fn new(
        config: BatchConfig,
        extractor: Arc<dyn ReceiptExtractor>,
        store: Arc<dyn ReceiptStore>,
        ledger: Arc<dyn CreditLedger>,
        images: Arc<dyn ImageStore>,
    ) -> Self {
        Self {
            config,
            extractor,
            store,
            ledger,
            images,
            batches: RwLock::new(HashMap::new()),
        }
    }

    /// Check whether `user_id` can pay for `job_count` jobs. Nothing is
    /// reserved or debited.
    pub async fn admit(
        &self,
        user_id: &str,
        job_count: usize,
    ) -> Result<AdmissionDecision, BatchError> {
        check_batch_size(job_count, self.config.max_batch_size)?;
        let available = self.ledger.balance(user_id).await?;
        let decision = check_admission(job_count, available);
        if !decision.admitted {
            tracing::info!(
                user_id,
                status = %BatchStatus::Rejected,
                required = decision.required_units,
                available,
                shortfall = decision.shortfall,
                "Batch rejected at admission"
            );
        }
        Ok(decision.into_result(available)?)
    }

    /// Admit and register a batch over already-uploaded images. Nothing runs
    /// until [`ActiveBatch::run`] is called. Images of a rejected batch are
    /// released.
    pub async fn submit(
        &self,
        user_id: &str,
        images: Vec<ImageRef>,
    ) -> Result<Arc<ActiveBatch>, BatchError> {
        if let Err(e) = self.admit(user_id, images.len()).await {
            for image in &images {
                release_image(self.images.as_ref(), image).await;
            }
            return Err(e);
        }

        let session = BatchSession::new(user_id, self.config.concurrency);
        let batch_id = session.id;
        let jobs: Vec<ReceiptJob> = images.into_iter().map(ReceiptJob::new).collect();
        let job_count = jobs.len();

        let emitter = ProgressEmitter::new();
        let table = JobTableHandle::spawn(session, jobs, emitter.clone());
        let batch = Arc::new(ActiveBatch {
            id: batch_id,
            user_id: user_id.to_string(),
            table,
            emitter,
            pool: WorkerPool::new(
                Arc::clone(&self.extractor),
                self.config.concurrency,
                self.config.extraction_timeout(),
            ),
            committer: Committer::new(
                Arc::clone(&self.store),
                Arc::clone(&self.ledger),
                user_id,
                batch_id,
            ),
            images: Arc::clone(&self.images),
            run_lock: tokio::sync::Mutex::new(()),
            review: tokio::sync::Mutex::new(ReviewQueue::new(self.config.confidence_threshold)),
            saved: Mutex::new(Vec::new()),
            last_active: Mutex::new(Instant::now()),
        });

        self.batches.write().insert(batch_id, Arc::clone(&batch));
        tracing::info!(
            batch_id = %batch_id,
            user_id,
            jobs = job_count,
            concurrency = self.config.concurrency,
            "Batch admitted"
        );
        Ok(batch)
    }

    /// Look up a batch owned by `user_id`. Other users' batches are reported
    /// as missing. A successful lookup counts as activity on the batch.
    pub fn get(&self, batch_id: Uuid, user_id: &str) -> Result<Arc<ActiveBatch>, BatchError> {
        let batch = self
            .batches
            .read()
            .get(&batch_id)
            .filter(|batch| batch.user_id == user_id)
            .cloned()
            .ok_or(BatchError::NotFound(batch_id))?;
        batch.touch();
        Ok(batch)
    }

    /// Drop batches that have had no activity for the retention window as of
    /// `now`. Batches with queued or running jobs are kept. Images the
    /// evicted batches still hold are released.
    pub async fn evict_idle(&self, now: Instant) -> usize {
        let retention = self.config.retention();
        let evicted: Vec<Arc<ActiveBatch>> = {
            let mut batches = self.batches.write();
            let expired: Vec<Uuid> = batches
                .values()
                .filter(|batch| batch.is_idle(now, retention))
                .map(|batch| batch.id)
                .collect();
            expired
                .iter()
                .filter_map(|id| batches.remove(id))
                .collect()
        };

        for batch in &evicted {
            batch.release_held_images().await;
            tracing::info!(batch_id = %batch.id, user_id = %batch.user_id, "Evicted idle batch");
        }
        evicted.len()
    }

    /// Sweep for idle batches every `every` until the runtime shuts down.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let evicted = service.evict_idle(Instant::now()).await;
                if evicted > 0 {
                    let live = service.batches.read().len();
                    tracing::info!(evicted, live, "Batch sweep");
                }
            }
        })
    }
}

/// One admitted batch and everything needed to drive it to commit.
pub struct ActiveBatch {
    id: Uuid,
    user_id: String,
    table: JobTableHandle,
    emitter: ProgressEmitter,
    pool: WorkerPool,
    committer: Committer,
    images: Arc<dyn ImageStore>,
    run_lock: tokio::sync::Mutex<()>,
    review: tokio::sync::Mutex<ReviewQueue>,
    saved: Mutex<Vec<SavedReceipt>>,
    last_active: Mutex<Instant>,
}

impl ActiveBatch {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(BatchSnapshot) + Send + Sync + 'static,
    {
        self.emitter.subscribe(callback)
    }

    /// Most recently emitted snapshot, without a round trip to the job table.
    pub fn latest(&self) -> Option<BatchSnapshot> {
        self.emitter.latest()
    }

    pub async fn snapshot(&self) -> Result<BatchSnapshot, BatchError> {
        Ok(self.table.snapshot().await?)
    }

    /// Drain the pending queue. Runs are serialized; a run started while
    /// another is active waits for it and then picks up whatever was
    /// requeued in the meantime.
    pub async fn run(&self) -> Result<RunSummary, BatchError> {
        let _guard = self.run_lock.lock().await;
        let summary = self.pool.run(&self.table).await?;
        self.sync_review().await?;
        self.touch();
        Ok(summary)
    }

    /// Stop dispatching; queued jobs are cancelled and their images released.
    pub async fn cancel(&self) -> Result<BatchSnapshot, BatchError> {
        let cancelled = self.table.cancel().await?;
        for job in &cancelled {
            release_image(self.images.as_ref(), &job.image).await;
        }
        self.snapshot().await
    }

    pub async fn retry(&self, job_id: Uuid) -> Result<(), BatchError> {
        self.table.retry(job_id).await?;
        tracing::info!(batch_id = %self.id, job_id = %job_id, "Job requeued");
        Ok(())
    }

    pub async fn review_view(&self) -> Result<ReviewView, BatchError> {
        let review = self.synced_review().await?;
        Ok(review.view())
    }

    pub async fn edit(
        &self,
        item_id: Uuid,
        overrides: ReceiptOverrides,
    ) -> Result<ReviewItem, BatchError> {
        let mut review = self.synced_review().await?;
        let item = review.edit(item_id, overrides)?.clone();
        tracing::info!(batch_id = %self.id, item_id = %item_id, "Review item edited");
        Ok(item)
    }

    pub async fn discard(&self, item_id: Uuid) -> Result<ReviewItem, BatchError> {
        let mut review = self.synced_review().await?;
        let was_active = review
            .get(item_id)
            .map(|item| item.status.is_active())
            .unwrap_or(false);
        let item = review.discard(item_id)?.clone();
        drop(review);

        if was_active {
            if let Some(job) = self.table.snapshot().await?.job(item_id) {
                release_image(self.images.as_ref(), &job.image).await;
            }
            tracing::info!(batch_id = %self.id, item_id = %item_id, "Review item discarded");
        }
        Ok(item)
    }

    /// Commit every active review item. Concurrent calls are serialized
    /// behind the review lock, so an item is never committed twice.
    pub async fn save_all(&self) -> Result<CommitOutcome, BatchError> {
        let mut review = self.synced_review().await?;
        let report = self.committer.save_all(&mut review).await;
        drop(review);

        let snapshot = self.table.snapshot().await?;
        for saved in &report.saved {
            if let Err(e) = self.table.mark_saved(saved.job_id).await {
                tracing::error!(job_id = %saved.job_id, error = %e, "Could not mark job saved");
            }
            if let Some(job) = snapshot.job(saved.job_id) {
                release_image(self.images.as_ref(), &job.image).await;
            }
        }

        let outcome = report.outcome();
        self.saved.lock().extend(report.saved);
        Ok(outcome)
    }

    pub fn insights(&self) -> InsightSummary {
        summarize(&self.saved.lock())
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Nothing queued or running, and untouched for `retention`.
    fn is_idle(&self, now: Instant, retention: Duration) -> bool {
        let settled = self
            .latest()
            .map(|snapshot| snapshot.status != BatchStatus::Running)
            .unwrap_or(true);
        settled && now.saturating_duration_since(*self.last_active.lock()) >= retention
    }

    /// Release images of jobs that never reached Saved, Cancelled or a
    /// discarded review item.
    async fn release_held_images(&self) {
        let Some(snapshot) = self.latest() else {
            return;
        };
        let review = self.review.lock().await;
        for job in &snapshot.jobs {
            let held = match job.status {
                JobStatus::Error => true,
                JobStatus::Ready => review
                    .get(job.id)
                    .map(|item| item.status.is_active())
                    .unwrap_or(true),
                _ => false,
            };
            if held {
                release_image(self.images.as_ref(), &job.image).await;
            }
        }
    }

    async fn sync_review(&self) -> Result<(), BatchError> {
        self.synced_review().await.map(|_| ())
    }

    /// Lock the review queue after pulling in any jobs that became Ready.
    async fn synced_review(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, ReviewQueue>, BatchError> {
        let mut review = self.review.lock().await;
        let snapshot = self.table.snapshot().await?;
        let added = review.ingest(&snapshot.jobs);
        if added > 0 {
            let flagged = review
                .items()
                .filter(|item| item.status == ReviewStatus::NeedsReview)
                .count();
            tracing::debug!(batch_id = %self.id, added, flagged, "Review queue updated");
        }
        Ok(review)
    }
}

async fn release_image(images: &dyn ImageStore, image: &ImageRef) {
    if let Err(e) = images.release(image).await {
        tracing::warn!(image_key = %image.key, error = %e, "Failed to release image");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Credit ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Review(#[from] ReviewError),

    #[error("Batch not found: {0}")]
    NotFound(Uuid),
}
