//! In-memory collaborators for batch flow tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use receipt_batch::config::BatchConfig;
use receipt_batch::models::job::ImageRef;
use receipt_batch::models::receipt::{ExtractedReceipt, ReceiptCategory, ReceiptRecord};
use receipt_batch::services::batch::BatchService;
use receipt_batch::services::extraction::{ExtractionContext, ExtractionError, ReceiptExtractor};
use receipt_batch::services::ledger::{CreditLedger, LedgerError};
use receipt_batch::services::persistence::{PersistenceError, ReceiptStore};
use receipt_batch::services::storage::{ImageStore, StorageError};

pub const USER: &str = "user-1";

/// Extractor answering from a table keyed by image key.
pub struct ScriptedExtractor {
    receipts: HashMap<String, ExtractedReceipt>,
    failing: HashSet<String>,
    failing_once: HashSet<String>,
    gate: Option<Arc<Semaphore>>,
    pub started: watch::Sender<usize>,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self {
            receipts: HashMap::new(),
            failing: HashSet::new(),
            failing_once: HashSet::new(),
            gate: None,
            started: watch::channel(0).0,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn receipt(
        mut self,
        key: &str,
        amount: f64,
        category: ReceiptCategory,
        confidence: f64,
    ) -> Self {
        self.receipts.insert(
            key.to_string(),
            ExtractedReceipt {
                merchant: format!("merchant-{key}"),
                amount,
                currency: "USD".to_string(),
                category,
                purchased_on: None,
                confidence,
            },
        );
        self
    }

    pub fn failing(mut self, key: &str) -> Self {
        self.failing.insert(key.to_string());
        self
    }

    /// Fail the first attempt, then answer from the table.
    pub fn failing_once(mut self, key: &str) -> Self {
        self.failing_once.insert(key.to_string());
        self
    }

    /// Hold every call until a permit is added to `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl ReceiptExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        image: &ImageRef,
        ctx: &ExtractionContext,
    ) -> Result<ExtractedReceipt, ExtractionError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.send_modify(|n| *n += 1);
        ctx.progress.report(50).await;

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        tokio::task::yield_now().await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&image.key)
            || (self.failing_once.contains(&image.key) && ctx.attempt == 1)
        {
            return Err(ExtractionError::Service {
                status: 502,
                message: format!("could not read {}", image.key),
            });
        }
        self.receipts
            .get(&image.key)
            .cloned()
            .ok_or_else(|| ExtractionError::Invalid(format!("no receipt for {}", image.key)))
    }
}

/// Receipt store that can be told to reject particular merchants.
#[derive(Default)]
pub struct MemoryStore {
    pub rows: Mutex<HashMap<Uuid, ReceiptRecord>>,
    pub reject_merchants: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn rejecting(merchant: &str) -> Self {
        let store = Self::default();
        store.reject_merchants.lock().insert(merchant.to_string());
        store
    }
}

#[async_trait]
impl ReceiptStore for MemoryStore {
    async fn save(&self, record: &ReceiptRecord) -> Result<Uuid, PersistenceError> {
        if self.reject_merchants.lock().contains(&record.receipt.merchant) {
            return Err(PersistenceError::Unavailable("write rejected".into()));
        }
        let id = Uuid::new_v4();
        self.rows.lock().insert(id, record.clone());
        Ok(id)
    }

    async fn delete(&self, id: Uuid) -> Result<(), PersistenceError> {
        self.rows.lock().remove(&id);
        Ok(())
    }
}

pub struct MemoryLedger {
    balances: Mutex<HashMap<String, i64>>,
    pub debits: AtomicUsize,
}

impl MemoryLedger {
    pub fn with_balance(user_id: &str, balance: i64) -> Self {
        Self {
            balances: Mutex::new(HashMap::from([(user_id.to_string(), balance)])),
            debits: AtomicUsize::new(0),
        }
    }

    pub fn debit_count(&self) -> usize {
        self.debits.load(Ordering::SeqCst)
    }

    pub fn current(&self, user_id: &str) -> i64 {
        self.balances.lock().get(user_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CreditLedger for MemoryLedger {
    async fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        Ok(self.current(user_id))
    }

    async fn debit(&self, user_id: &str, units: i64) -> Result<i64, LedgerError> {
        let mut balances = self.balances.lock();
        let balance = balances.entry(user_id.to_string()).or_insert(0);
        if *balance < units {
            return Err(LedgerError::InsufficientBalance {
                requested: units,
                available: *balance,
            });
        }
        *balance -= units;
        self.debits.fetch_add(1, Ordering::SeqCst);
        Ok(*balance)
    }
}

#[derive(Default)]
pub struct MemoryImages {
    pub released: Mutex<Vec<String>>,
}

impl MemoryImages {
    pub fn released_keys(&self) -> Vec<String> {
        let mut keys = self.released.lock().clone();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ImageStore for MemoryImages {
    async fn release(&self, image: &ImageRef) -> Result<(), StorageError> {
        self.released.lock().push(image.key.clone());
        Ok(())
    }
}

pub struct Harness {
    pub service: BatchService,
    pub extractor: Arc<ScriptedExtractor>,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<MemoryLedger>,
    pub images: Arc<MemoryImages>,
}

impl Harness {
    pub fn new(
        concurrency: usize,
        extractor: ScriptedExtractor,
        store: MemoryStore,
        balance: i64,
    ) -> Self {
        let config = BatchConfig {
            concurrency,
            ..Default::default()
        };
        let extractor = Arc::new(extractor);
        let store = Arc::new(store);
        let ledger = Arc::new(MemoryLedger::with_balance(USER, balance));
        let images = Arc::new(MemoryImages::default());
        let service = BatchService::new(
            config,
            extractor.clone(),
            store.clone(),
            ledger.clone(),
            images.clone(),
        );
        Self {
            service,
            extractor,
            store,
            ledger,
            images,
        }
    }
}

pub fn image_refs(keys: &[&str]) -> Vec<ImageRef> {
    keys.iter()
        .map(|key| ImageRef::new(*key, "image/jpeg"))
        .collect()
}

/// Five receipts `r1`..`r5` of 1.00, 2.00, ... 5.00.
pub fn five_receipts() -> ScriptedExtractor {
    ScriptedExtractor::new()
        .receipt("r1", 1.0, ReceiptCategory::Groceries, 0.95)
        .receipt("r2", 2.0, ReceiptCategory::Dining, 0.95)
        .receipt("r3", 3.0, ReceiptCategory::Dining, 0.60)
        .receipt("r4", 4.0, ReceiptCategory::Transport, 0.90)
        .receipt("r5", 5.0, ReceiptCategory::Travel, 0.99)
}

pub const FIVE_KEYS: [&str; 5] = ["r1", "r2", "r3", "r4", "r5"];
