use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::confidence::{self, ConfidenceBreakdown};
use crate::error::{ViewerError, ViewerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Auto,
    BrainTumor,
    Alzheimer,
    BreastCancer,
    LungDisease,
    MriToCt,
    CtToMri,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 7] = [
        AnalysisKind::Auto,
        AnalysisKind::BrainTumor,
        AnalysisKind::Alzheimer,
        AnalysisKind::BreastCancer,
        AnalysisKind::LungDisease,
        AnalysisKind::MriToCt,
        AnalysisKind::CtToMri,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::BrainTumor => "brain_tumor",
            Self::Alzheimer => "alzheimer",
            Self::BreastCancer => "breast_cancer",
            Self::LungDisease => "lung_disease",
            Self::MriToCt => "mri_to_ct",
            Self::CtToMri => "ct_to_mri",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Auto => "Automatic",
            Self::BrainTumor => "Brain tumor",
            Self::Alzheimer => "Alzheimer's",
            Self::BreastCancer => "Breast cancer",
            Self::LungDisease => "Lung disease",
            Self::MriToCt => "MRI to CT",
            Self::CtToMri => "CT to MRI",
        }
    }

    /// Modality conversions produce an output image instead of (or next to) a diagnosis.
    pub fn is_modality_conversion(self) -> bool {
        matches!(self, Self::MriToCt | Self::CtToMri)
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let token = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == token)
            .ok_or_else(|| format!("Unknown analysis kind '{}'.", value.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    fn can_move_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    #[default]
    Initializing,
    Uploading,
    Processing,
    GeneratingReport,
    Completed,
}

impl JobStage {
    pub fn label(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Uploading => "Uploading image",
            Self::Processing => "Running model",
            Self::GeneratingReport => "Generating report",
            Self::Completed => "Completed",
        }
    }
}

/// Outcome of one analysis run. Never mutated after it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub image_index: usize,
    pub kind: AnalysisKind,
    pub confidence: Option<f32>,
    pub detected_case: Option<String>,
    pub findings: Option<String>,
    pub medical_note: Option<String>,
    pub raw_confidence_scores: Option<serde_json::Value>,
    pub output_image_ref: Option<String>,
}

impl AnalysisResult {
    pub fn empty(image_index: usize, kind: AnalysisKind) -> Self {
        Self {
            image_index,
            kind,
            confidence: None,
            detected_case: None,
            findings: None,
            medical_note: None,
            raw_confidence_scores: None,
            output_image_ref: None,
        }
    }

    pub fn confidence_breakdown(&self) -> ConfidenceBreakdown {
        match self.raw_confidence_scores.as_ref() {
            Some(payload) => confidence::breakdown(payload, self.detected_case.as_deref()),
            None => ConfidenceBreakdown::default(),
        }
    }

    pub(crate) fn with_image_index(&self, image_index: usize) -> Self {
        Self {
            image_index,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub id: String,
    pub remote_id: Option<String>,
    pub image_index: usize,
    pub kind: AnalysisKind,
    status: JobStatus,
    pub progress: u8,
    pub stage: JobStage,
    pub started_at: SystemTime,
    pub completed_at: Option<SystemTime>,
    pub result: Option<Arc<AnalysisResult>>,
    pub error: Option<ViewerError>,
}

impl AnalysisJob {
    pub fn new(image_index: usize, kind: AnalysisKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_id: None,
            image_index,
            kind,
            status: JobStatus::Pending,
            progress: 0,
            stage: JobStage::Initializing,
            started_at: SystemTime::now(),
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn transition_to(&mut self, next: JobStatus) -> ViewerResult<()> {
        if !self.status.can_move_to(next) {
            return Err(ViewerError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(SystemTime::now());
        }
        if next == JobStatus::Completed {
            self.progress = 100;
            self.stage = JobStage::Completed;
        }
        Ok(())
    }

    /// Progress never moves backwards; remote services occasionally report a
    /// lower value after a stage change.
    pub fn record_progress(&mut self, progress: u8, stage: Option<JobStage>) {
        if !self.is_active() {
            return;
        }
        self.progress = self.progress.max(progress.min(100));
        if let Some(stage) = stage {
            self.stage = stage;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_loose_spellings() {
        assert_eq!("brain_tumor".parse(), Ok(AnalysisKind::BrainTumor));
        assert_eq!("Brain-Tumor".parse(), Ok(AnalysisKind::BrainTumor));
        assert_eq!(" MRI to CT ".parse(), Ok(AnalysisKind::MriToCt));
        assert!("xray".parse::<AnalysisKind>().is_err());
    }

    #[test]
    fn kind_wire_name_matches_serde() {
        for kind in AnalysisKind::ALL {
            let encoded = serde_json::to_string(&kind).expect("kind should serialize");
            assert_eq!(encoded, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn job_follows_forward_path() {
        let mut job = AnalysisJob::new(0, AnalysisKind::Auto);
        assert_eq!(job.status(), JobStatus::Pending);
        job.transition_to(JobStatus::Processing)
            .expect("pending -> processing");
        job.record_progress(40, Some(JobStage::Processing));
        job.transition_to(JobStatus::Completed)
            .expect("processing -> completed");
        assert_eq!(job.progress, 100);
        assert_eq!(job.stage, JobStage::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn finished_jobs_cannot_restart() {
        let mut job = AnalysisJob::new(2, AnalysisKind::BrainTumor);
        job.transition_to(JobStatus::Processing)
            .expect("pending -> processing");
        job.transition_to(JobStatus::Failed)
            .expect("processing -> failed");

        let err = job
            .transition_to(JobStatus::Processing)
            .expect_err("failed jobs are retried as new jobs");
        assert_eq!(
            err,
            ViewerError::InvalidTransition {
                from: JobStatus::Failed,
                to: JobStatus::Processing,
            }
        );

        let mut cancelled = AnalysisJob::new(0, AnalysisKind::Auto);
        cancelled
            .transition_to(JobStatus::Cancelled)
            .expect("pending -> cancelled");
        assert!(cancelled.transition_to(JobStatus::Completed).is_err());
    }

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let mut job = AnalysisJob::new(0, AnalysisKind::Auto);
        job.record_progress(60, None);
        job.record_progress(20, Some(JobStage::GeneratingReport));
        assert_eq!(job.progress, 60);
        assert_eq!(job.stage, JobStage::GeneratingReport);
        job.record_progress(250, None);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn new_jobs_get_distinct_ids() {
        let first = AnalysisJob::new(2, AnalysisKind::BrainTumor);
        let second = AnalysisJob::new(2, AnalysisKind::BrainTumor);
        assert_ne!(first.id, second.id);
    }
}
