use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::receipt::{ReceiptCategory, SavedReceipt};

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CategoryTotal {
    pub count: usize,
    pub amount_cents: i64,
}

/// Aggregate figures over committed receipts.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct InsightSummary {
    pub item_count: usize,
    pub total_cents: i64,
    pub by_category: BTreeMap<ReceiptCategory, CategoryTotal>,
    pub top_category: Option<ReceiptCategory>,
}

/// Summarise saved receipts. Deterministic; ties for the top category go to
/// the category declared first.
pub fn summarize(saved: &[SavedReceipt]) -> InsightSummary {
    let mut by_category: BTreeMap<ReceiptCategory, CategoryTotal> = BTreeMap::new();
    for receipt in saved {
        let entry = by_category.entry(receipt.receipt.category).or_default();
        entry.count += 1;
        entry.amount_cents += receipt.receipt.amount_cents();
    }

    let mut top_category = None;
    let mut top_amount = i64::MIN;
    for (category, total) in &by_category {
        if total.amount_cents > top_amount {
            top_amount = total.amount_cents;
            top_category = Some(*category);
        }
    }

    InsightSummary {
        item_count: saved.len(),
        total_cents: by_category.values().map(|t| t.amount_cents).sum(),
        by_category,
        top_category,
    }
}
