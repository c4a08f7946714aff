pub mod auth;
pub mod batches;
pub mod error;
pub mod health;
pub mod metrics;
