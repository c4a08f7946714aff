pub mod api;
pub mod batch;
pub mod job;
pub mod receipt;
pub mod review;
