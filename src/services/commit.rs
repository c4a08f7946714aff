//! Persisting reviewed receipts and charging for them.
//!
//! Items are committed one at a time. For each item the record is written
//! first and the credit debited second; if the debit cannot happen the
//! record is deleted again, so a stored receipt always has a matching debit.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::receipt::{ReceiptRecord, SavedReceipt};
use crate::models::review::ReviewItem;
use crate::services::admission::UNITS_PER_JOB;
use crate::services::ledger::{CreditLedger, LedgerError};
use crate::services::persistence::{PersistenceError, ReceiptStore};
use crate::services::review::ReviewQueue;

/// Result of a `save_all` pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CommitOutcome {
    pub saved_count: usize,
    pub failed_ids: Vec<Uuid>,
}

/// Commit pass result including the receipts that were saved.
#[derive(Debug, Default)]
pub struct CommitReport {
    pub saved: Vec<SavedReceipt>,
    pub failed: Vec<(Uuid, CommitError)>,
}

impl CommitReport {
    pub fn outcome(&self) -> CommitOutcome {
        CommitOutcome {
            saved_count: self.saved.len(),
            failed_ids: self.failed.iter().map(|(id, _)| *id).collect(),
        }
    }
}

pub struct Committer {
    store: Arc<dyn ReceiptStore>,
    ledger: Arc<dyn CreditLedger>,
    user_id: String,
    batch_id: Uuid,
}

impl Committer {
    pub fn new(
        store: Arc<dyn ReceiptStore>,
        ledger: Arc<dyn CreditLedger>,
        user_id: impl Into<String>,
        batch_id: Uuid,
    ) -> Self {
        Self {
            store,
            ledger,
            user_id: user_id.into(),
            batch_id,
        }
    }

    /// Commit every active item in `queue`, sequentially. Saved items leave
    /// the queue; failed ones stay for another attempt.
    pub async fn save_all(&self, queue: &mut ReviewQueue) -> CommitReport {
        let mut report = CommitReport::default();

        for item in queue.commit_candidates() {
            match self.commit_item(&item).await {
                Ok(saved) => {
                    queue.remove_committed(item.job_id);
                    report.saved.push(saved);
                }
                Err(e) => {
                    metrics::counter!("receipt_commit_failures_total").increment(1);
                    tracing::warn!(
                        batch_id = %self.batch_id,
                        job_id = %item.job_id,
                        error = %e,
                        "Receipt not saved"
                    );
                    report.failed.push((item.job_id, e));
                }
            }
        }

        tracing::info!(
            batch_id = %self.batch_id,
            saved = report.saved.len(),
            failed = report.failed.len(),
            remaining_total_cents = queue.running_total_cents(),
            "Commit pass finished"
        );
        report
    }

    /// Persist one item and debit one credit for it.
    pub async fn commit_item(&self, item: &ReviewItem) -> Result<SavedReceipt, CommitError> {
        let record = ReceiptRecord {
            job_id: item.job_id,
            batch_id: self.batch_id,
            user_id: self.user_id.clone(),
            receipt: item.effective(),
            original: item.original.clone(),
            confidence: item.confidence,
        };

        let receipt_id = self.store.save(&record).await?;

        if let Err(e) = self.charge().await {
            tracing::warn!(
                job_id = %item.job_id,
                receipt_id = %receipt_id,
                error = %e,
                "Debit failed, removing unpaid receipt"
            );
            if let Err(delete_err) = self.store.delete(receipt_id).await {
                tracing::error!(
                    job_id = %item.job_id,
                    receipt_id = %receipt_id,
                    error = %delete_err,
                    "Compensating delete failed; unpaid receipt left in store"
                );
                return Err(CommitError::CompensationFailed {
                    receipt_id,
                    debit: e,
                    delete: delete_err,
                });
            }
            return Err(CommitError::Accounting(e));
        }

        metrics::counter!("receipt_credits_debited_total").increment(UNITS_PER_JOB as u64);
        tracing::info!(
            job_id = %item.job_id,
            receipt_id = %receipt_id,
            amount = record.receipt.amount,
            "Receipt saved"
        );

        Ok(SavedReceipt {
            id: receipt_id,
            job_id: item.job_id,
            receipt: record.receipt,
        })
    }

    /// The balance seen at admission may be stale; look again before debiting.
    async fn charge(&self) -> Result<i64, LedgerError> {
        let available = self.ledger.balance(&self.user_id).await?;
        if available < UNITS_PER_JOB {
            return Err(LedgerError::InsufficientBalance {
                requested: UNITS_PER_JOB,
                available,
            });
        }
        self.ledger.debit(&self.user_id, UNITS_PER_JOB).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("Persisting receipt failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Charging for receipt failed: {0}")]
    Accounting(LedgerError),

    #[error("Charging for receipt {receipt_id} failed ({debit}) and removing it failed ({delete})")]
    CompensationFailed {
        receipt_id: Uuid,
        debit: LedgerError,
        delete: PersistenceError,
    },
}
