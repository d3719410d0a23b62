use thiserror::Error;

use crate::job::JobStatus;

/// Everything the scan viewer core can fail with.
///
/// `LastImageError`, `IndexOutOfRange` and `InvalidTransition` mean a caller
/// broke a contract. The remaining variants are expected at runtime and are
/// shown to the user on the status line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewerError {
    #[error("upload rejected: {0}")]
    UploadRejected(String),
    #[error("a scan must keep at least one image")]
    LastImageError,
    #[error("image index {index} is out of range (scan has {len} images)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("analysis job {job_id} is still running")]
    AnalysisBusy { job_id: String },
    #[error("analysis job cannot move from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("remote service unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("analysis failed: {0}")]
    AnalysisFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl ViewerError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::LastImageError | Self::IndexOutOfRange { .. } | Self::InvalidTransition { .. }
        )
    }

    pub fn is_recoverable(&self) -> bool {
        !self.is_contract_violation()
    }
}

pub type ViewerResult<T> = std::result::Result<T, ViewerError>;
