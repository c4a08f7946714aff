pub mod admission;
pub mod batch;
pub mod commit;
pub mod encryption;
pub mod extraction;
pub mod insights;
pub mod ledger;
pub mod normalize;
pub mod ocr;
pub mod persistence;
pub mod progress;
pub mod review;
pub mod scheduler;
pub mod storage;
