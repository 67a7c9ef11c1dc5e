//! Registration estimators and pipelines.
//!
//! Estimators (rigid, affine, deformable, learned, landmark) produce transforms from a
//! moving space to a fixed space. Pipelines chain them with retries, and
//! the [`BatchRunner`] executes many independent runs in parallel.

pub mod batch;
pub mod cancel;
pub mod error;
pub mod estimator;
pub mod metric;
pub mod optimizer;
pub mod pipeline;
pub mod progress;
pub mod validation;

pub use batch::{BatchJob, BatchResult, BatchRunner, ReferenceData};
pub use cancel::CancellationToken;
pub use error::{ErrorKind, RegistrationError, Result};
pub use estimator::{
    AffineConfig, DeformableConfig, Estimate, EstimateDiagnostics, EstimateRequest, Estimator, EstimatorConfig,
    EstimatorKind, InferenceBackend, InferenceOutput, InferenceRequest, LandmarkConfig, LandmarkModel, LearnedConfig,
    OptimizerConfig, RigidConfig, VolumeSamples,
};
pub use metric::MetricKind;
pub use pipeline::{
    Orchestrator, Pipeline, PipelineBuilder, PipelineSpec, RunDiagnostics, RunInputs, RunOptions, RunReport,
    RunStatus, StepDescriptor, StepOutcome, StepResult,
};
pub use progress::{ConsoleProgressCallback, HistoryCallback, ProgressCallback, ProgressInfo, ProgressTracker};
