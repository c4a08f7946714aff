use serde::Serialize;

/// Credits required per submitted image.
pub const UNITS_PER_JOB: i64 = 1;

/// Outcome of the pre-flight credit check. Holds no reservation.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub admitted: bool,
    pub required_units: i64,
    pub shortfall: i64,
}

impl AdmissionDecision {
    pub fn into_result(self, available_units: i64) -> Result<Self, AdmissionError> {
        if self.admitted {
            Ok(self)
        } else {
            Err(AdmissionError::InsufficientCredits {
                required: self.required_units,
                available: available_units,
                shortfall: self.shortfall,
            })
        }
    }
}

/// Decide whether a batch of `job_count` images may start given the
/// user's current balance.
pub fn check_admission(job_count: usize, available_units: i64) -> AdmissionDecision {
    let required_units = job_count as i64 * UNITS_PER_JOB;
    let shortfall = (required_units - available_units.max(0)).max(0);
    AdmissionDecision {
        admitted: shortfall == 0,
        required_units,
        shortfall,
    }
}

/// Reject empty or oversized batches before the balance is even looked up.
pub fn check_batch_size(job_count: usize, max_batch_size: usize) -> Result<(), AdmissionError> {
    if job_count == 0 {
        return Err(AdmissionError::EmptyBatch);
    }
    if job_count > max_batch_size {
        return Err(AdmissionError::BatchTooLarge {
            size: job_count,
            max: max_batch_size,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Insufficient credits: {required} required, {available} available (short by {shortfall})")]
    InsufficientCredits {
        required: i64,
        available: i64,
        shortfall: i64,
    },

    #[error("Batch contains no images")]
    EmptyBatch,

    #[error("Batch of {size} images exceeds the maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },
}
