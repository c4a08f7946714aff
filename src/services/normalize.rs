//! Turns loosely-typed model output into a validated [`ExtractedReceipt`].
//!
//! Vision models return whatever JSON they feel like: amounts as strings with
//! currency symbols, free-text categories, dates in local formats. Everything
//! is coerced here, then checked with `garde`.

use chrono::NaiveDate;
use garde::Validate;
use serde::Deserialize;
use strsim::jaro_winkler;
use strum::IntoEnumIterator;

use crate::models::receipt::{ExtractedReceipt, ReceiptCategory};
use crate::services::extraction::ExtractionError;

/// Minimum similarity for a free-text category to map onto a known one.
const CATEGORY_MATCH_THRESHOLD: f64 = 0.85;

const DEFAULT_CURRENCY: &str = "USD";

/// Keywords commonly returned for each category.
const CATEGORY_KEYWORDS: &[(&str, ReceiptCategory)] = &[
    ("supermarket", ReceiptCategory::Groceries),
    ("grocery", ReceiptCategory::Groceries),
    ("restaurant", ReceiptCategory::Dining),
    ("cafe", ReceiptCategory::Dining),
    ("coffee", ReceiptCategory::Dining),
    ("bar", ReceiptCategory::Dining),
    ("meal", ReceiptCategory::Dining),
    ("taxi", ReceiptCategory::Transport),
    ("fuel", ReceiptCategory::Transport),
    ("gas station", ReceiptCategory::Transport),
    ("parking", ReceiptCategory::Transport),
    ("transit", ReceiptCategory::Transport),
    ("electric", ReceiptCategory::Utilities),
    ("internet", ReceiptCategory::Utilities),
    ("phone", ReceiptCategory::Utilities),
    ("water", ReceiptCategory::Utilities),
    ("retail", ReceiptCategory::Shopping),
    ("clothing", ReceiptCategory::Shopping),
    ("electronics", ReceiptCategory::Shopping),
    ("pharmacy", ReceiptCategory::Health),
    ("medical", ReceiptCategory::Health),
    ("doctor", ReceiptCategory::Health),
    ("cinema", ReceiptCategory::Entertainment),
    ("movie", ReceiptCategory::Entertainment),
    ("concert", ReceiptCategory::Entertainment),
    ("hotel", ReceiptCategory::Travel),
    ("flight", ReceiptCategory::Travel),
    ("airline", ReceiptCategory::Travel),
    ("lodging", ReceiptCategory::Travel),
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y", "%b %d, %Y"];

/// Receipt fields as the model returns them.
#[derive(Debug, Default, Deserialize)]
pub struct RawReceipt {
    #[serde(default, alias = "store", alias = "vendor")]
    pub merchant: Option<String>,
    #[serde(default, alias = "total", alias = "total_amount")]
    pub amount: Option<serde_json::Value>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "date")]
    pub purchased_on: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Map a free-text category onto a [`ReceiptCategory`].
pub fn canonical_category(raw: &str) -> ReceiptCategory {
    let lower = raw.trim().to_lowercase();
    if lower.is_empty() {
        return ReceiptCategory::Other;
    }

    if let Ok(category) = lower.replace([' ', '-'], "_").parse::<ReceiptCategory>() {
        return category;
    }

    if let Some((_, category)) = CATEGORY_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
    {
        return *category;
    }

    let mut best = ReceiptCategory::Other;
    let mut best_score = 0.0;
    for category in ReceiptCategory::iter() {
        let score = jaro_winkler(&lower, &category.to_string());
        if score > best_score {
            best_score = score;
            best = category;
        }
    }
    if best_score >= CATEGORY_MATCH_THRESHOLD {
        best
    } else {
        ReceiptCategory::Other
    }
}

/// Parse an amount given as a number or as text such as `"$1,234.50"`.
pub fn parse_amount(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// Coerce and validate a model response.
pub fn normalize_receipt(raw: RawReceipt) -> Result<ExtractedReceipt, ExtractionError> {
    let merchant = raw
        .merchant
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ExtractionError::Invalid("merchant missing".to_string()))?;

    let amount = raw
        .amount
        .as_ref()
        .and_then(parse_amount)
        .ok_or_else(|| ExtractionError::Invalid("amount missing or unreadable".to_string()))?;

    let currency = raw
        .currency
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let receipt = ExtractedReceipt {
        merchant,
        amount,
        currency,
        category: raw
            .category
            .as_deref()
            .map(canonical_category)
            .unwrap_or(ReceiptCategory::Other),
        purchased_on: raw.purchased_on.as_deref().and_then(parse_date),
        // No self-reported confidence means a human has to look at it.
        confidence: raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
    };

    receipt
        .validate()
        .map_err(|report| ExtractionError::Invalid(report.to_string()))?;
    Ok(receipt)
}
