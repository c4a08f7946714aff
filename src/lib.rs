//! Batch receipt extraction.
//!
//! Users upload a handful of receipt photos at once. Each image becomes a job
//! run through Cloudflare Workers AI by a bounded pool of workers, with
//! progress streamed as snapshots. Extracted receipts wait in a review queue
//! for corrections, and are then saved one by one, each save debiting a
//! credit from the user's balance.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
