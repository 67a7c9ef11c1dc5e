//! Optimizers for parametric registration.

pub mod regular_step;

pub use regular_step::{RegularStepGradientDescent, StepReport, StopReason};
