//! Bounded-concurrency dispatch of receipt extraction jobs.
//!
//! The job table is owned by a single tokio task. Workers and callers talk to
//! it over an `mpsc` mailbox and get answers on `oneshot` channels, so every
//! status mutation is applied by one writer in arrival order. The table is
//! also the only place the cancellation flag is read or written: a worker
//! asking for work after cancellation simply gets nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::batch::{BatchSession, BatchSnapshot, BatchStatus, JobSnapshot};
use crate::models::job::{
    ErrorCategory, ImageRef, JobError, JobStatus, ReceiptJob, TransitionError,
};
use crate::models::receipt::ExtractedReceipt;
use crate::services::extraction::{
    ExtractionContext, ExtractionError, ProgressReporter, ReceiptExtractor,
};
use crate::services::progress::ProgressEmitter;

/// Upper bound on workers per batch.
pub const MAX_CONCURRENCY: usize = 10;

const MAILBOX_CAPACITY: usize = 64;

/// A job handed to a worker, already transitioned to Running.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub job_id: Uuid,
    pub image: ImageRef,
    pub attempt: u32,
}

enum Command {
    Dequeue {
        reply: oneshot::Sender<Option<Dispatch>>,
    },
    Progress {
        job_id: Uuid,
        percent: u8,
    },
    Finish {
        job_id: Uuid,
        outcome: Result<ExtractedReceipt, JobError>,
    },
    Cancel {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    Retry {
        job_id: Uuid,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    MarkSaved {
        job_id: Uuid,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    Snapshot {
        reply: oneshot::Sender<BatchSnapshot>,
    },
}

struct JobTable {
    session: BatchSession,
    jobs: HashMap<Uuid, ReceiptJob>,
    queue: VecDeque<Uuid>,
    in_flight: usize,
    emitter: ProgressEmitter,
}

impl JobTable {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Dequeue { reply } => {
                let dispatch = self.dequeue();
                if let Some(d) = &dispatch {
                    if reply.send(Some(d.clone())).is_err() {
                        // The worker is gone; nobody will ever finish this job.
                        tracing::error!(job_id = %d.job_id, "Worker dropped before receiving job");
                        self.finish(
                            d.job_id,
                            Err(JobError::new(
                                ErrorCategory::Extraction,
                                "worker stopped before the job was dispatched",
                            )),
                        );
                    }
                } else {
                    let _ = reply.send(None);
                }
            }
            Command::Progress { job_id, percent } => {
                let changed = self
                    .jobs
                    .get_mut(&job_id)
                    .map(|job| job.set_upload_progress(percent))
                    .unwrap_or(false);
                if changed {
                    self.emit();
                }
            }
            Command::Finish { job_id, outcome } => self.finish(job_id, outcome),
            Command::Cancel { reply } => {
                let _ = reply.send(self.cancel());
            }
            Command::Retry { job_id, reply } => {
                let _ = reply.send(self.retry(job_id));
            }
            Command::MarkSaved { job_id, reply } => {
                let _ = reply.send(self.mark_saved(job_id));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn dequeue(&mut self) -> Option<Dispatch> {
        if self.session.cancelled {
            return None;
        }
        while let Some(job_id) = self.queue.pop_front() {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if let Err(e) = job.start() {
                tracing::warn!(job_id = %job_id, error = %e, "Skipping queued job");
                continue;
            }
            let dispatch = Dispatch {
                job_id,
                image: job.image.clone(),
                attempt: job.attempts,
            };
            self.in_flight += 1;
            self.emit();
            return Some(dispatch);
        }
        None
    }

    fn finish(&mut self, job_id: Uuid, outcome: Result<ExtractedReceipt, JobError>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if let Some(job) = self.jobs.get_mut(&job_id) {
            let applied = match outcome {
                Ok(receipt) => job.complete(receipt),
                Err(error) => job.fail(error),
            };
            if let Err(e) = applied {
                tracing::warn!(job_id = %job_id, error = %e, "Ignoring extraction outcome");
            }
        }
        self.refresh_status();
        self.emit();
    }

    fn cancel(&mut self) -> Vec<JobSnapshot> {
        self.session.cancelled = true;
        let mut cancelled = Vec::new();
        for job_id in std::mem::take(&mut self.queue) {
            if let Some(job) = self.jobs.get_mut(&job_id) {
                if job.cancel().is_ok() {
                    cancelled.push(JobSnapshot::from(&*job));
                }
            }
        }
        tracing::info!(
            batch_id = %self.session.id,
            cancelled = cancelled.len(),
            in_flight = self.in_flight,
            "Batch cancelled"
        );
        self.refresh_status();
        self.emit();
        cancelled
    }

    fn retry(&mut self, job_id: Uuid) -> Result<(), SchedulerError> {
        if self.session.cancelled {
            return Err(SchedulerError::BatchCancelled);
        }
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::UnknownJob(job_id))?;
        job.retry()?;
        self.queue.push_back(job_id);
        self.session.status = BatchStatus::Running;
        self.emit();
        Ok(())
    }

    fn mark_saved(&mut self, job_id: Uuid) -> Result<(), SchedulerError> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::UnknownJob(job_id))?;
        job.mark_saved()?;
        self.emit();
        Ok(())
    }

    fn refresh_status(&mut self) {
        if self.queue.is_empty() && self.in_flight == 0 {
            self.session.status = if self.session.cancelled {
                BatchStatus::Cancelled
            } else {
                BatchStatus::Completed
            };
        }
    }

    fn snapshot(&self) -> BatchSnapshot {
        let jobs = self
            .session
            .job_ids
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .map(JobSnapshot::from)
            .collect();
        BatchSnapshot::new(self.session.id, self.session.status, jobs)
    }

    fn emit(&self) {
        self.emitter.emit(self.snapshot());
    }
}

/// Cloneable handle to a batch's job table.
#[derive(Clone)]
pub struct JobTableHandle {
    batch_id: Uuid,
    tx: mpsc::Sender<Command>,
}

impl JobTableHandle {
    /// Start the table task for `session`. Jobs are queued in the given order.
    /// The task stops once every handle is dropped.
    pub fn spawn(
        mut session: BatchSession,
        jobs: Vec<ReceiptJob>,
        emitter: ProgressEmitter,
    ) -> Self {
        session.job_ids = jobs.iter().map(|j| j.id).collect();
        session.status = BatchStatus::Running;
        let batch_id = session.id;
        let queue = session
            .job_ids
            .iter()
            .copied()
            .filter(|id| jobs.iter().any(|j| j.id == *id && j.status == JobStatus::Pending))
            .collect();
        let mut table = JobTable {
            session,
            jobs: jobs.into_iter().map(|j| (j.id, j)).collect(),
            queue,
            in_flight: 0,
            emitter,
        };
        table.emit();

        let (tx, mut rx) = mpsc::channel(MAILBOX_CAPACITY);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                table.handle(command);
            }
            tracing::debug!(batch_id = %table.session.id, "Job table closed");
        });

        Self { batch_id, tx }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    /// Next Pending job in submission order, or `None` once the queue is
    /// empty or the batch is cancelled.
    pub async fn dequeue(&self) -> Result<Option<Dispatch>, SchedulerError> {
        self.request(|reply| Command::Dequeue { reply }).await
    }

    pub async fn report_progress(&self, job_id: Uuid, percent: u8) -> Result<(), SchedulerError> {
        self.tx
            .send(Command::Progress { job_id, percent })
            .await
            .map_err(|_| SchedulerError::Closed)
    }

    pub async fn finish(
        &self,
        job_id: Uuid,
        outcome: Result<ExtractedReceipt, JobError>,
    ) -> Result<(), SchedulerError> {
        self.tx
            .send(Command::Finish { job_id, outcome })
            .await
            .map_err(|_| SchedulerError::Closed)
    }

    /// Stop dispatching. Queued jobs become Cancelled and are returned;
    /// running jobs are left to finish.
    pub async fn cancel(&self) -> Result<Vec<JobSnapshot>, SchedulerError> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Error -> Pending and requeue at the back.
    pub async fn retry(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        self.request(|reply| Command::Retry { job_id, reply }).await?
    }

    pub async fn mark_saved(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        self.request(|reply| Command::MarkSaved { job_id, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<BatchSnapshot, SchedulerError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: usize,
    pub ready: usize,
    pub failed: usize,
}

/// Fixed-size pool of cooperative workers calling the extractor.
#[derive(Clone)]
pub struct WorkerPool {
    extractor: Arc<dyn ReceiptExtractor>,
    concurrency: usize,
    extraction_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        extractor: Arc<dyn ReceiptExtractor>,
        concurrency: usize,
        extraction_timeout: Duration,
    ) -> Self {
        Self {
            extractor,
            concurrency: concurrency.clamp(1, MAX_CONCURRENCY),
            extraction_timeout,
        }
    }

    /// Drain the table's queue. Resolves once the queue is empty (or the
    /// batch is cancelled) and every job dispatched by this run is terminal.
    ///
    /// Workers are detached tasks: dropping this future stops waiting for
    /// them but does not stop them, so dispatched jobs still finish.
    pub async fn run(&self, table: &JobTableHandle) -> Result<RunSummary, SchedulerError> {
        let workers: Vec<JoinHandle<_>> = (0..self.concurrency)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    table.clone(),
                    Arc::clone(&self.extractor),
                    self.extraction_timeout,
                ))
            })
            .collect();

        let mut summary = RunSummary::default();
        let mut first_error = None;
        for worker in workers {
            match worker.await {
                Ok(Ok(stats)) => {
                    summary.dispatched += stats.dispatched;
                    summary.ready += stats.ready;
                    summary.failed += stats.failed;
                }
                Ok(Err(e)) => {
                    tracing::error!(batch_id = %table.batch_id(), error = %e, "Worker stopped");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(batch_id = %table.batch_id(), error = %e, "Worker panicked");
                    first_error.get_or_insert(SchedulerError::WorkerPanicked(e.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(
                    batch_id = %table.batch_id(),
                    dispatched = summary.dispatched,
                    ready = summary.ready,
                    failed = summary.failed,
                    "Worker pool drained"
                );
                Ok(summary)
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    table: JobTableHandle,
    extractor: Arc<dyn ReceiptExtractor>,
    timeout: Duration,
) -> Result<RunSummary, SchedulerError> {
    let mut stats = RunSummary::default();

    while let Some(dispatch) = table.dequeue().await? {
        stats.dispatched += 1;
        tracing::info!(
            worker_id,
            job_id = %dispatch.job_id,
            attempt = dispatch.attempt,
            image_key = %dispatch.image.key,
            "Dispatching extraction"
        );

        let ctx = ExtractionContext {
            job_id: dispatch.job_id,
            attempt: dispatch.attempt,
            progress: ProgressReporter::new(dispatch.job_id, table.clone()),
        };
        let start = Instant::now();
        let outcome =
            match tokio::time::timeout(timeout, extractor.extract(&dispatch.image, &ctx)).await {
                Ok(Ok(receipt)) => Ok(receipt),
                Ok(Err(e)) => Err(JobError::from(&e)),
                Err(_) => Err(JobError::from(&ExtractionError::Timeout(timeout))),
            };
        metrics::histogram!("receipt_extraction_seconds").record(start.elapsed().as_secs_f64());

        match &outcome {
            Ok(receipt) => {
                stats.ready += 1;
                metrics::counter!("receipt_jobs_ready_total").increment(1);
                tracing::info!(
                    worker_id,
                    job_id = %dispatch.job_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    merchant = %receipt.merchant,
                    amount = receipt.amount,
                    confidence = receipt.confidence,
                    "Extraction complete"
                );
            }
            Err(e) => {
                stats.failed += 1;
                metrics::counter!("receipt_jobs_failed_total").increment(1);
                tracing::warn!(
                    worker_id,
                    job_id = %dispatch.job_id,
                    category = %e.category,
                    cause = %e.cause,
                    "Extraction failed"
                );
            }
        }

        table.finish(dispatch.job_id, outcome).await?;
    }

    Ok(stats)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Job table is no longer running")]
    Closed,

    #[error("Unknown job: {0}")]
    UnknownJob(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Batch was cancelled")]
    BatchCancelled,

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),
}
