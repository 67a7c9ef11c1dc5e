//! Fluent pipeline construction.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{RegistrationError, Result};
use crate::estimator::{
    AffineConfig, DeformableConfig, Estimator, EstimatorConfig, InferenceBackend, LandmarkConfig, LearnedConfig,
    RigidConfig,
};
use crate::validation::validate_relax_factor;

use super::spec::{unused_name, PipelineSpec, StepDescriptor};

/// A validated step with its estimator.
#[derive(Debug, Clone)]
pub struct PipelineStep {
    pub descriptor: StepDescriptor,
    pub estimator: Estimator,
}

/// An immutable, validated sequence of steps.
#[derive(Debug, Clone)]
pub struct Pipeline {
    steps: Vec<PipelineStep>,
}

impl Pipeline {
    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The descriptors this pipeline was built from.
    pub fn spec(&self) -> PipelineSpec {
        PipelineSpec {
            steps: self.steps.iter().map(|s| s.descriptor.clone()).collect(),
        }
    }
}

/// Builder for [`Pipeline`].
///
/// ```
/// use voxreg_registration::{PipelineBuilder, RigidConfig, DeformableConfig};
///
/// let pipeline = PipelineBuilder::new()
///     .rigid(RigidConfig::default())
///     .deformable(DeformableConfig::default())
///     .optional()
///     .build()
///     .unwrap();
/// assert_eq!(pipeline.len(), 2);
/// ```
#[derive(Default, Clone)]
pub struct PipelineBuilder {
    steps: Vec<StepDescriptor>,
    backends: HashMap<String, Arc<dyn InferenceBackend>>,
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("steps", &self.steps)
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a declarative spec.
    pub fn from_spec(spec: PipelineSpec) -> Self {
        Self {
            steps: spec.steps,
            backends: HashMap::new(),
        }
    }

    pub fn rigid(self, config: RigidConfig) -> Self {
        self.auto_named(EstimatorConfig::Rigid(config))
    }

    pub fn affine(self, config: AffineConfig) -> Self {
        self.auto_named(EstimatorConfig::Affine(config))
    }

    pub fn deformable(self, config: DeformableConfig) -> Self {
        self.auto_named(EstimatorConfig::Deformable(config))
    }

    pub fn learned(self, config: LearnedConfig) -> Self {
        self.auto_named(EstimatorConfig::Learned(config))
    }

    pub fn landmark(self, config: LandmarkConfig) -> Self {
        self.auto_named(EstimatorConfig::Landmark(config))
    }

    pub fn step(mut self, descriptor: StepDescriptor) -> Self {
        self.steps.push(descriptor);
        self
    }

    /// Mark the last added step optional.
    pub fn optional(mut self) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.mandatory = false;
        }
        self
    }

    /// Set the retry budget of the last added step.
    pub fn retries(mut self, max_retries: usize) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.max_retries = max_retries;
        }
        self
    }

    pub fn register_backend(mut self, name: impl Into<String>, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backends.insert(name.into(), backend);
        self
    }

    fn auto_named(self, config: EstimatorConfig) -> Self {
        let name = unused_name(&self.steps, config.kind().name());
        self.step(StepDescriptor::new(name, config))
    }

    /// Validate every step and resolve learned backends.
    pub fn build(self) -> Result<Pipeline> {
        if self.steps.is_empty() {
            return Err(RegistrationError::invalid_configuration("pipeline has no steps"));
        }

        let mut names = HashSet::new();
        let mut steps = Vec::with_capacity(self.steps.len());
        for descriptor in self.steps {
            if descriptor.name.trim().is_empty() {
                return Err(RegistrationError::invalid_configuration("step names must not be empty"));
            }
            if !names.insert(descriptor.name.clone()) {
                return Err(RegistrationError::invalid_configuration(format!(
                    "duplicate step name '{}'",
                    descriptor.name
                )));
            }
            validate_relax_factor(descriptor.relax_factor)?;
            let estimator = Estimator::from_config(&descriptor.estimator, &self.backends).map_err(|e| {
                RegistrationError::invalid_configuration(format!("step '{}': {}", descriptor.name, e))
            })?;
            steps.push(PipelineStep { descriptor, estimator });
        }
        Ok(Pipeline { steps })
    }
}
