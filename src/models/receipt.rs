use chrono::NaiveDate;
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// Spending categories a receipt can be filed under.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    EnumString,
    EnumIter,
    Display,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ReceiptCategory {
    Groceries,
    Dining,
    Transport,
    Utilities,
    Shopping,
    Health,
    Entertainment,
    Travel,
    Other,
}

/// Fields extracted from a receipt image via Workers AI LLaVA.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ExtractedReceipt {
    #[garde(length(min = 1, max = 200))]
    pub merchant: String,

    #[garde(range(min = 0.0, max = 1_000_000.0))]
    pub amount: f64,

    #[garde(length(min = 3, max = 3))]
    pub currency: String,

    #[garde(skip)]
    pub category: ReceiptCategory,

    #[garde(skip)]
    pub purchased_on: Option<NaiveDate>,

    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence: f64,
}

impl ExtractedReceipt {
    pub fn amount_cents(&self) -> i64 {
        to_cents(self.amount)
    }
}

/// User corrections layered over an extracted receipt. Absent fields keep
/// the extracted value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, PartialEq)]
pub struct ReceiptOverrides {
    #[garde(length(min = 1, max = 200))]
    pub merchant: Option<String>,

    #[garde(range(min = 0.0, max = 1_000_000.0))]
    pub amount: Option<f64>,

    #[garde(length(min = 3, max = 3))]
    pub currency: Option<String>,

    #[garde(skip)]
    pub category: Option<ReceiptCategory>,

    #[garde(skip)]
    pub purchased_on: Option<NaiveDate>,

    #[garde(length(max = 1000))]
    pub notes: Option<String>,
}

impl ReceiptOverrides {
    /// Layer `newer` on top of these overrides; fields present in `newer` win.
    pub fn merge(&mut self, newer: ReceiptOverrides) {
        if newer.merchant.is_some() {
            self.merchant = newer.merchant;
        }
        if newer.amount.is_some() {
            self.amount = newer.amount;
        }
        if newer.currency.is_some() {
            self.currency = newer.currency;
        }
        if newer.category.is_some() {
            self.category = newer.category;
        }
        if newer.purchased_on.is_some() {
            self.purchased_on = newer.purchased_on;
        }
        if newer.notes.is_some() {
            self.notes = newer.notes;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ReceiptOverrides::default()
    }

    /// The record the user actually confirms: `original` with overrides applied.
    pub fn apply(&self, original: &ExtractedReceipt) -> EffectiveReceipt {
        EffectiveReceipt {
            merchant: self
                .merchant
                .clone()
                .unwrap_or_else(|| original.merchant.clone()),
            amount: self.amount.unwrap_or(original.amount),
            currency: self
                .currency
                .clone()
                .unwrap_or_else(|| original.currency.clone()),
            category: self.category.unwrap_or(original.category),
            purchased_on: self.purchased_on.or(original.purchased_on),
            notes: self.notes.clone(),
        }
    }
}

/// Receipt fields after user overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveReceipt {
    pub merchant: String,
    pub amount: f64,
    pub currency: String,
    pub category: ReceiptCategory,
    pub purchased_on: Option<NaiveDate>,
    pub notes: Option<String>,
}

impl EffectiveReceipt {
    pub fn amount_cents(&self) -> i64 {
        to_cents(self.amount)
    }
}

/// A reviewed receipt ready to be written to the receipt store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub job_id: Uuid,
    pub batch_id: Uuid,
    pub user_id: String,
    pub receipt: EffectiveReceipt,
    /// Extraction output as returned by the model, kept for audit.
    pub original: ExtractedReceipt,
    pub confidence: f64,
}

/// A receipt that was persisted and paid for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedReceipt {
    pub id: Uuid,
    pub job_id: Uuid,
    pub receipt: EffectiveReceipt,
}

fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExtractedReceipt {
        ExtractedReceipt {
            merchant: "Corner Deli".to_string(),
            amount: 12.34,
            currency: "USD".to_string(),
            category: ReceiptCategory::Dining,
            purchased_on: NaiveDate::from_ymd_opt(2026, 3, 14),
            confidence: 0.92,
        }
    }

    #[test]
    fn test_amount_cents_rounds() {
        let mut receipt = sample();
        receipt.amount = 0.1 + 0.2;
        assert_eq!(receipt.amount_cents(), 30);
    }

    #[test]
    fn test_overrides_apply_keeps_original_fields() {
        let overrides = ReceiptOverrides {
            amount: Some(20.0),
            notes: Some("team lunch".to_string()),
            ..Default::default()
        };
        let effective = overrides.apply(&sample());
        assert_eq!(effective.merchant, "Corner Deli");
        assert_eq!(effective.amount, 20.0);
        assert_eq!(effective.notes.as_deref(), Some("team lunch"));
    }

    #[test]
    fn test_merge_layers_newer_values() {
        let mut overrides = ReceiptOverrides {
            merchant: Some("Deli".to_string()),
            amount: Some(5.0),
            ..Default::default()
        };
        overrides.merge(ReceiptOverrides {
            amount: Some(7.5),
            ..Default::default()
        });
        assert_eq!(overrides.merchant.as_deref(), Some("Deli"));
        assert_eq!(overrides.amount, Some(7.5));
    }

    #[test]
    fn test_validation_rejects_bad_currency() {
        let mut receipt = sample();
        receipt.currency = "DOLLARS".to_string();
        assert!(receipt.validate().is_err());
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_category_parse_is_case_insensitive() {
        assert_eq!(
            "GROCERIES".parse::<ReceiptCategory>().unwrap(),
            ReceiptCategory::Groceries
        );
    }
}
