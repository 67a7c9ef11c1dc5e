//! Declarative pipeline descriptions.

use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};
use crate::estimator::{EstimatorConfig, EstimatorKind, LearnedConfig};

fn default_true() -> bool {
    true
}

fn default_max_retries() -> usize {
    1
}

fn default_relax_factor() -> f64 {
    2.0
}

/// One named step of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub name: String,
    pub estimator: EstimatorConfig,
    /// A failed mandatory step fails the run; a failed optional step only degrades it.
    #[serde(default = "default_true")]
    pub mandatory: bool,
    /// Retries after the first attempt for retryable errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Tolerance multiplier applied on every retry.
    #[serde(default = "default_relax_factor")]
    pub relax_factor: f64,
    /// Disabled steps are reported as skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>, estimator: EstimatorConfig) -> Self {
        Self {
            name: name.into(),
            estimator,
            mandatory: true,
            max_retries: default_max_retries(),
            relax_factor: default_relax_factor(),
            enabled: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn with_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_relax_factor(mut self, factor: f64) -> Self {
        self.relax_factor = factor;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// `base`, or `base-2`, `base-3`, ... whichever no step uses yet.
pub(crate) fn unused_name(steps: &[StepDescriptor], base: &str) -> String {
    let taken = |name: &str| steps.iter().any(|s| s.name == name);
    if !taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|name| !taken(name))
        .unwrap_or_else(|| base.to_string())
}

/// An ordered list of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub steps: Vec<StepDescriptor>,
}

impl PipelineSpec {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RegistrationError::invalid_configuration(format!("invalid pipeline JSON: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RegistrationError::invalid_configuration(format!("pipeline not serializable: {}", e)))
    }

    /// Parse a chain such as `rigid -> affine -> deformable`.
    ///
    /// Every step gets its variant's default configuration and is named
    /// after the variant; repeated names get a numeric suffix. A learned
    /// step may name its backend as `learned:<backend>`.
    pub fn from_chain(chain: &str) -> Result<Self> {
        let mut steps: Vec<StepDescriptor> = Vec::new();
        for token in chain.split("->").map(str::trim) {
            if token.is_empty() {
                return Err(RegistrationError::invalid_configuration(format!(
                    "empty step in chain '{}'",
                    chain
                )));
            }
            let (head, backend) = match token.split_once(':') {
                Some((head, backend)) => (head, Some(backend.trim())),
                None => (token, None),
            };
            let kind = EstimatorKind::parse(head)
                .ok_or_else(|| RegistrationError::invalid_configuration(format!("unknown estimator '{}'", head)))?;

            let estimator = match (kind, backend) {
                (EstimatorKind::Learned, Some(backend)) => {
                    EstimatorConfig::Learned(LearnedConfig::default().with_backend(backend))
                }
                (_, Some(_)) => {
                    return Err(RegistrationError::invalid_configuration(format!(
                        "only learned steps take a backend, got '{}'",
                        token
                    )))
                }
                (kind, None) => EstimatorConfig::default_for(kind),
            };

            let name = unused_name(&steps, kind.name());
            steps.push(StepDescriptor::new(name, estimator));
        }
        Ok(Self { steps })
    }
}
