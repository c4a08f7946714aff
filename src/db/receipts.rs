use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::receipt::ReceiptRecord;
use crate::services::persistence::{PersistenceError, ReceiptStore};

/// Receipts table in PostgreSQL.
#[derive(Clone)]
pub struct PgReceiptStore {
    pool: PgPool,
}

impl PgReceiptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Number of receipts stored for a user.
    pub async fn count_for_user(&self, user_id: &str) -> Result<i64, PersistenceError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM receipts WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[async_trait]
impl ReceiptStore for PgReceiptStore {
    async fn save(&self, record: &ReceiptRecord) -> Result<Uuid, PersistenceError> {
        let original = serde_json::to_value(&record.original)?;
        let row = sqlx::query(
            r#"
            INSERT INTO receipts (job_id, batch_id, user_id, merchant, amount_cents, currency,
                                  category, purchased_on, notes, confidence, original_extraction)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(record.job_id)
        .bind(record.batch_id)
        .bind(&record.user_id)
        .bind(&record.receipt.merchant)
        .bind(record.receipt.amount_cents())
        .bind(&record.receipt.currency)
        .bind(record.receipt.category.to_string())
        .bind(record.receipt.purchased_on)
        .bind(record.receipt.notes.as_deref())
        .bind(record.confidence)
        .bind(original)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn delete(&self, id: Uuid) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM receipts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
