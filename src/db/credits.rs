use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::services::ledger::{CreditLedger, LedgerError};

/// Credit balances in PostgreSQL. A user without a row has a balance of zero.
#[derive(Clone)]
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add credits to a user's balance, creating the row if needed.
    pub async fn grant(&self, user_id: &str, units: i64) -> Result<i64, LedgerError> {
        let row = sqlx::query(
            r#"
            INSERT INTO credit_balances (user_id, balance)
            VALUES ($1, $2)
            ON CONFLICT (user_id)
            DO UPDATE SET balance = credit_balances.balance + EXCLUDED.balance, updated_at = now()
            RETURNING balance
            "#,
        )
        .bind(user_id)
        .bind(units)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("balance")?)
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        let row = sqlx::query("SELECT balance FROM credit_balances WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(r.try_get("balance")?),
            None => Ok(0),
        }
    }

    async fn debit(&self, user_id: &str, units: i64) -> Result<i64, LedgerError> {
        // Conditional update: the check and the decrement are one statement.
        let row = sqlx::query(
            r#"
            UPDATE credit_balances
            SET balance = balance - $2, updated_at = now()
            WHERE user_id = $1 AND balance >= $2
            RETURNING balance
            "#,
        )
        .bind(user_id)
        .bind(units)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(r.try_get("balance")?),
            None => Err(LedgerError::InsufficientBalance {
                requested: units,
                available: self.balance(user_id).await?,
            }),
        }
    }
}
