//! Multi-step registration pipelines.
//!
//! A [`PipelineSpec`] (JSON or a `rigid -> affine -> deformable` chain) or a
//! [`PipelineBuilder`] produces a validated [`Pipeline`]; the
//! [`Orchestrator`] runs it and always returns a [`RunReport`].

pub mod builder;
pub mod diagnostics;
pub mod orchestrator;
pub mod spec;

pub use builder::{Pipeline, PipelineBuilder, PipelineStep};
pub use diagnostics::{RunDiagnostics, RunStatus, StepError, StepOutcome, StepResult};
pub use orchestrator::{Orchestrator, RunInputs, RunOptions, RunReport};
pub use spec::{PipelineSpec, StepDescriptor};
