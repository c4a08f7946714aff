mod helpers;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use uuid::Uuid;

use helpers::{
    five_receipts, image_refs, Harness, MemoryStore, ScriptedExtractor, FIVE_KEYS, USER,
};
use receipt_batch::models::batch::{BatchSnapshot, BatchStatus};
use receipt_batch::models::job::{ErrorCategory, JobStatus};
use receipt_batch::models::receipt::{ReceiptCategory, ReceiptOverrides};
use receipt_batch::models::review::ReviewStatus;
use receipt_batch::services::admission::AdmissionError;
use receipt_batch::services::batch::{ActiveBatch, BatchError};
use receipt_batch::services::progress::Subscription;
use receipt_batch::services::scheduler::SchedulerError;

/// Job id for each image key, from a snapshot.
fn ids_by_key(snapshot: &BatchSnapshot) -> HashMap<String, Uuid> {
    snapshot
        .jobs
        .iter()
        .map(|job| (job.image.key.clone(), job.id))
        .collect()
}

fn record_snapshots(batch: &ActiveBatch) -> (Arc<Mutex<Vec<BatchSnapshot>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = batch.subscribe(move |snapshot| sink.lock().push(snapshot));
    (seen, subscription)
}

/// Status history of every job, consecutive repeats collapsed.
fn histories(initial: &BatchSnapshot, seen: &[BatchSnapshot]) -> HashMap<Uuid, Vec<JobStatus>> {
    let mut out: HashMap<Uuid, Vec<JobStatus>> = HashMap::new();
    for snapshot in std::iter::once(initial).chain(seen.iter()) {
        for job in &snapshot.jobs {
            out.entry(job.id).or_default().push(job.status);
        }
    }
    for history in out.values_mut() {
        history.dedup();
    }
    out
}

#[tokio::test]
async fn test_all_jobs_succeed_within_concurrency_limit() {
    let h = Harness::new(3, five_receipts(), MemoryStore::default(), 10);
    let batch = h.service.submit(USER, image_refs(&FIVE_KEYS)).await.unwrap();
    let initial = batch.latest().unwrap();
    let (seen, _subscription) = record_snapshots(&batch);

    let summary = batch.run().await.unwrap();
    assert_eq!(summary.ready, 5);
    assert!(h.extractor.max_running.load(Ordering::SeqCst) <= 3);

    let seen = seen.lock().clone();
    assert!(seen.iter().all(|s| s.count(JobStatus::Running) <= 3));
    assert_eq!(seen.last().unwrap().percent_complete, 100.0);
    for history in histories(&initial, &seen).values() {
        assert_eq!(
            history,
            &vec![JobStatus::Pending, JobStatus::Running, JobStatus::Ready]
        );
    }

    let snapshot = batch.snapshot().await.unwrap();
    assert_eq!(snapshot.status, BatchStatus::Completed);
    assert_eq!(snapshot.count(JobStatus::Ready), 5);

    let review = batch.review_view().await.unwrap();
    assert_eq!(review.items.len(), 5);
    assert_eq!(review.running_total_cents, 1500);
    assert_eq!(review.needs_review, 1);
}

#[tokio::test]
async fn test_failed_extraction_is_isolated_and_never_charged() {
    let h = Harness::new(3, five_receipts().failing("r2"), MemoryStore::default(), 10);
    let batch = h.service.submit(USER, image_refs(&FIVE_KEYS)).await.unwrap();
    let initial = batch.latest().unwrap();
    let (seen, _subscription) = record_snapshots(&batch);

    batch.run().await.unwrap();
    let snapshot = batch.snapshot().await.unwrap();
    let ids = ids_by_key(&snapshot);
    assert_eq!(snapshot.count(JobStatus::Ready), 4);
    let failed = snapshot.job(ids["r2"]).unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    assert_eq!(failed.error_category, Some(ErrorCategory::Extraction));
    assert!(failed.error.as_deref().unwrap().contains("r2"));

    let all = histories(&initial, &seen.lock());
    assert_eq!(
        all[&ids["r2"]],
        vec![JobStatus::Pending, JobStatus::Running, JobStatus::Error]
    );

    let outcome = batch.save_all().await.unwrap();
    assert_eq!(outcome.saved_count, 4);
    assert!(outcome.failed_ids.is_empty());
    assert_eq!(h.ledger.debit_count(), 4);
    assert_eq!(h.ledger.current(USER), 6);

    let snapshot = batch.snapshot().await.unwrap();
    assert_eq!(snapshot.count(JobStatus::Saved), 4);
    assert_eq!(snapshot.job(ids["r2"]).unwrap().status, JobStatus::Error);
}

#[tokio::test]
async fn test_malformed_record_fails_validation_and_is_never_charged() {
    let extractor = ScriptedExtractor::new()
        .receipt("r1", 1.0, ReceiptCategory::Groceries, 0.95)
        .receipt("r2", 2.0, ReceiptCategory::Dining, 0.95);
    let h = Harness::new(3, extractor, MemoryStore::default(), 10);
    let batch = h
        .service
        .submit(USER, image_refs(&["r1", "blurry", "r2"]))
        .await
        .unwrap();

    let summary = batch.run().await.unwrap();
    assert_eq!((summary.ready, summary.failed), (2, 1));

    let snapshot = batch.snapshot().await.unwrap();
    let ids = ids_by_key(&snapshot);
    let blurry = snapshot.job(ids["blurry"]).unwrap();
    assert_eq!(blurry.status, JobStatus::Error);
    assert_eq!(blurry.error_category, Some(ErrorCategory::Validation));
    assert!(blurry.result.is_none());

    let review = batch.review_view().await.unwrap();
    assert_eq!(review.items.len(), 2);
    assert!(review.items.iter().all(|item| item.job_id != ids["blurry"]));
    assert_eq!(review.running_total_cents, 300);

    let outcome = batch.save_all().await.unwrap();
    assert_eq!(outcome.saved_count, 2);
    assert_eq!(h.ledger.debit_count(), 2);
    assert_eq!(h.ledger.current(USER), 8);
    assert!(h
        .store
        .rows
        .lock()
        .values()
        .all(|row| row.job_id != ids["blurry"]));
}

#[tokio::test]
async fn test_insufficient_credits_reject_batch_before_dispatch() {
    let h = Harness::new(3, five_receipts(), MemoryStore::default(), 3);

    let err = h.service.admit(USER, 5).await.unwrap_err();
    assert!(matches!(
        err,
        BatchError::Admission(AdmissionError::InsufficientCredits { shortfall: 2, .. })
    ));

    let err = h
        .service
        .submit(USER, image_refs(&FIVE_KEYS))
        .await
        .err()
        .unwrap();
    match err {
        BatchError::Admission(AdmissionError::InsufficientCredits {
            required,
            available,
            shortfall,
        }) => {
            assert_eq!((required, available, shortfall), (5, 3, 2));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.ledger.debit_count(), 0);
    assert_eq!(h.images.released_keys(), FIVE_KEYS.to_vec());
}

#[tokio::test]
async fn test_oversized_and_empty_batches_are_rejected() {
    let h = Harness::new(3, five_receipts(), MemoryStore::default(), 100);
    let keys: Vec<String> = (0..11).map(|i| format!("k{i}")).collect();
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();

    assert!(matches!(
        h.service.submit(USER, image_refs(&refs)).await.err().unwrap(),
        BatchError::Admission(AdmissionError::BatchTooLarge { size: 11, max: 10 })
    ));
    assert!(matches!(
        h.service.submit(USER, Vec::new()).await.err().unwrap(),
        BatchError::Admission(AdmissionError::EmptyBatch)
    ));
}

#[tokio::test]
async fn test_cancel_lets_running_jobs_finish() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::new(
        3,
        five_receipts().gated(gate.clone()),
        MemoryStore::default(),
        10,
    );
    let mut started = h.extractor.started.subscribe();
    let batch = h.service.submit(USER, image_refs(&FIVE_KEYS)).await.unwrap();

    let run = {
        let batch = batch.clone();
        tokio::spawn(async move { batch.run().await })
    };
    started.wait_for(|n| *n >= 3).await.unwrap();

    let cancelled = batch.cancel().await.unwrap();
    assert_eq!(cancelled.count(JobStatus::Running), 3);
    assert_eq!(cancelled.count(JobStatus::Cancelled), 2);
    assert_eq!(h.images.released_keys(), vec!["r4", "r5"]);

    gate.add_permits(3);
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.dispatched, 3);

    let snapshot = batch.snapshot().await.unwrap();
    assert_eq!(snapshot.status, BatchStatus::Cancelled);
    assert_eq!(snapshot.count(JobStatus::Ready), 3);
    assert_eq!(snapshot.count(JobStatus::Cancelled), 2);
    assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 3);

    let ids = ids_by_key(&snapshot);
    assert!(matches!(
        batch.retry(ids["r4"]).await,
        Err(BatchError::Scheduler(SchedulerError::BatchCancelled))
    ));

    let outcome = batch.save_all().await.unwrap();
    assert_eq!(outcome.saved_count, 3);
    assert_eq!(h.ledger.debit_count(), 3);
}

#[tokio::test]
async fn test_persistence_failure_leaves_item_uncharged_in_review() {
    let extractor = ScriptedExtractor::new()
        .receipt("r1", 1.0, ReceiptCategory::Groceries, 0.95)
        .receipt("r2", 2.0, ReceiptCategory::Dining, 0.95)
        .receipt("r3", 3.0, ReceiptCategory::Dining, 0.95)
        .receipt("r4", 4.0, ReceiptCategory::Health, 0.95);
    let h = Harness::new(2, extractor, MemoryStore::rejecting("merchant-r2"), 10);
    let batch = h
        .service
        .submit(USER, image_refs(&["r1", "r2", "r3", "r4"]))
        .await
        .unwrap();
    batch.run().await.unwrap();
    let ids = ids_by_key(&batch.snapshot().await.unwrap());

    let outcome = batch.save_all().await.unwrap();
    assert_eq!(outcome.saved_count, 3);
    assert_eq!(outcome.failed_ids, vec![ids["r2"]]);
    assert_eq!(h.ledger.debit_count(), 3);
    assert_eq!(h.store.rows.lock().len(), 3);

    let review = batch.review_view().await.unwrap();
    assert_eq!(review.items.len(), 1);
    assert_eq!(review.items[0].job_id, ids["r2"]);
    assert_eq!(review.running_total_cents, 200);

    // Once the store recovers, the leftover item saves on the next pass.
    h.store.reject_merchants.lock().clear();
    let outcome = batch.save_all().await.unwrap();
    assert_eq!(outcome.saved_count, 1);
    assert_eq!(h.ledger.debit_count(), 4);
    assert!(batch.review_view().await.unwrap().items.is_empty());
    assert_eq!(batch.insights().item_count, 4);
}

#[tokio::test]
async fn test_review_edits_flow_into_saved_receipts_and_insights() {
    let h = Harness::new(3, five_receipts(), MemoryStore::default(), 10);
    let batch = h.service.submit(USER, image_refs(&FIVE_KEYS)).await.unwrap();
    batch.run().await.unwrap();
    let ids = ids_by_key(&batch.snapshot().await.unwrap());

    let edited = batch
        .edit(
            ids["r1"],
            ReceiptOverrides {
                amount: Some(10.0),
                notes: Some("includes tip".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.status, ReviewStatus::Edited);
    assert_eq!(edited.original.amount, 1.0);

    let discarded = batch.discard(ids["r5"]).await.unwrap();
    assert_eq!(discarded.status, ReviewStatus::Discarded);
    batch.discard(ids["r5"]).await.unwrap();
    assert_eq!(h.images.released_keys(), vec!["r5"]);

    let review = batch.review_view().await.unwrap();
    assert_eq!(review.running_total_cents, 1000 + 200 + 300 + 400);

    let outcome = batch.save_all().await.unwrap();
    assert_eq!(outcome.saved_count, 4);
    assert_eq!(h.ledger.debit_count(), 4);

    let rows = h.store.rows.lock();
    let r1 = rows.values().find(|r| r.job_id == ids["r1"]).unwrap();
    assert_eq!(r1.receipt.amount, 10.0);
    assert_eq!(r1.original.amount, 1.0);
    assert_eq!(r1.receipt.notes.as_deref(), Some("includes tip"));
    drop(rows);

    let insights = batch.insights();
    assert_eq!(insights.item_count, 4);
    assert_eq!(insights.total_cents, 1900);
    assert_eq!(insights.top_category, Some(ReceiptCategory::Groceries));
    assert_eq!(insights.by_category[&ReceiptCategory::Dining].count, 2);

    // Saving again finds nothing left to charge.
    let outcome = batch.save_all().await.unwrap();
    assert_eq!(outcome.saved_count, 0);
    assert_eq!(h.ledger.debit_count(), 4);
}

#[tokio::test]
async fn test_retry_requeues_failed_job_and_reruns() {
    let h = Harness::new(
        2,
        five_receipts().failing_once("r3"),
        MemoryStore::default(),
        10,
    );
    let batch = h.service.submit(USER, image_refs(&FIVE_KEYS)).await.unwrap();
    batch.run().await.unwrap();
    let ids = ids_by_key(&batch.snapshot().await.unwrap());
    assert_eq!(batch.review_view().await.unwrap().items.len(), 4);

    batch.retry(ids["r3"]).await.unwrap();
    let summary = batch.run().await.unwrap();
    assert_eq!(summary.dispatched, 1);

    let snapshot = batch.snapshot().await.unwrap();
    let job = snapshot.job(ids["r3"]).unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.attempts, 2);
    assert!(job.error.is_none());
    assert_eq!(batch.review_view().await.unwrap().items.len(), 5);
}

#[tokio::test]
async fn test_batches_are_private_to_their_owner() {
    let h = Harness::new(3, five_receipts(), MemoryStore::default(), 10);
    let batch = h.service.submit(USER, image_refs(&["r1"])).await.unwrap();

    assert!(h.service.get(batch.id(), USER).is_ok());
    assert!(matches!(
        h.service.get(batch.id(), "someone-else").err().unwrap(),
        BatchError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_idle_batches_are_evicted_and_release_held_images() {
    let h = Harness::new(3, five_receipts().failing("r2"), MemoryStore::default(), 10);
    let batch = h.service.submit(USER, image_refs(&FIVE_KEYS)).await.unwrap();
    batch.run().await.unwrap();
    let ids = ids_by_key(&batch.snapshot().await.unwrap());

    batch.discard(ids["r5"]).await.unwrap();
    let outcome = batch.save_all().await.unwrap();
    assert_eq!(outcome.saved_count, 3);
    assert_eq!(h.images.released_keys(), vec!["r1", "r3", "r4", "r5"]);

    // Recently used batches stay.
    assert_eq!(h.service.evict_idle(Instant::now()).await, 0);
    assert!(h.service.get(batch.id(), USER).is_ok());

    let later = Instant::now() + Duration::from_secs(2 * 3600);
    assert_eq!(h.service.evict_idle(later).await, 1);
    assert!(matches!(
        h.service.get(batch.id(), USER).err().unwrap(),
        BatchError::NotFound(_)
    ));
    // The failed job's image is the only one still held, and it goes too.
    assert_eq!(h.images.released_keys(), FIVE_KEYS.to_vec());
}

#[tokio::test]
async fn test_running_batches_are_never_evicted() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::new(
        2,
        five_receipts().gated(gate.clone()),
        MemoryStore::default(),
        10,
    );
    let mut started = h.extractor.started.subscribe();
    let batch = h.service.submit(USER, image_refs(&["r1", "r2"])).await.unwrap();
    let run = {
        let batch = batch.clone();
        tokio::spawn(async move { batch.run().await })
    };
    started.wait_for(|n| *n == 2).await.unwrap();

    let later = Instant::now() + Duration::from_secs(2 * 3600);
    assert_eq!(h.service.evict_idle(later).await, 0);
    assert!(h.service.get(batch.id(), USER).is_ok());

    gate.add_permits(2);
    run.await.unwrap().unwrap();
}
