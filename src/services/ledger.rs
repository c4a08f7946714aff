use async_trait::async_trait;

/// Credit balances, owned outside this service.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<i64, LedgerError>;

    /// Take `units` from the user's balance, returning what is left.
    /// Never drives a balance negative.
    async fn debit(&self, user_id: &str, units: i64) -> Result<i64, LedgerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient balance: {requested} requested, {available} available")]
    InsufficientBalance { requested: i64, available: i64 },

    #[error("Ledger database error: {0}")]
    Database(#[from] sqlx::Error),
}
