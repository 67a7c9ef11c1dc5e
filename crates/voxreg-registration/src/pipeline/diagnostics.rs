//! Run and step status records.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use voxreg_core::{ResampleReport, Transform};

use crate::error::{ErrorKind, RegistrationError};
use crate::estimator::{EstimateDiagnostics, EstimatorKind};

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    /// Executing the step at this index.
    Running(usize),
    Succeeded,
    Failed,
    /// At least one optional step failed; the run still produced a transform.
    PartiallyFailed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::PartiallyFailed)
    }
}

/// How a single step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    /// Succeeded after at least one retry.
    Recovered,
    Failed,
    /// Disabled in the pipeline.
    Skipped,
    /// Not reached because the run aborted earlier.
    NotRun,
}

/// Classified error as recorded in diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&RegistrationError> for StepError {
    fn from(err: &RegistrationError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Record of one requested step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    pub kind: EstimatorKind,
    pub outcome: StepOutcome,
    /// Estimator calls made, including retries.
    pub attempts: usize,
    /// Cumulative transform after this step succeeded.
    #[serde(skip)]
    pub transform: Option<Transform>,
    pub diagnostics: Option<EstimateDiagnostics>,
    /// Last error seen, also set for recovered steps.
    pub error: Option<StepError>,
    pub duration: Duration,
}

impl StepResult {
    pub(crate) fn pending(name: &str, kind: EstimatorKind, outcome: StepOutcome) -> Self {
        Self {
            name: name.to_string(),
            kind,
            outcome,
            attempts: 0,
            transform: None,
            diagnostics: None,
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, StepOutcome::Succeeded | StepOutcome::Recovered)
    }
}

/// Serializable summary of a run for external reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RunDiagnostics {
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
    pub total_duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resample: Option<ResampleReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_resample: Option<ResampleReport>,
    /// Errors that did not change the run status (inversion, resampling).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<StepError>,
}

impl RunDiagnostics {
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_from_registration_error() {
        let err = RegistrationError::inference("backend down");
        let recorded = StepError::from(&err);
        assert_eq!(recorded.kind, ErrorKind::Inference);
        assert!(recorded.message.contains("backend down"));
    }

    #[test]
    fn test_status_json() {
        assert_eq!(serde_json::to_string(&RunStatus::PartiallyFailed).unwrap(), "\"partially_failed\"");
        assert_eq!(serde_json::to_string(&RunStatus::Running(2)).unwrap(), "{\"running\":2}");
        assert!(!RunStatus::Running(0).is_terminal());
    }
}
