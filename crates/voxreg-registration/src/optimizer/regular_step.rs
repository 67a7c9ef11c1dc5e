//! Regular-step gradient descent.
//!
//! Parameters move a fixed physical distance along the normalized, scaled
//! gradient. Whenever the gradient direction reverses the step length is
//! relaxed, so the optimizer settles instead of oscillating around a
//! minimum.

use serde::{Deserialize, Serialize};

/// Why an optimizer step did not move the parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The step length fell below the minimum.
    StepTooSmall,
    /// The scaled gradient magnitude fell below the tolerance.
    GradientTooSmall,
}

/// Result of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Step length used (zero when converged).
    pub step_length: f64,
    /// Magnitude of the scaled gradient.
    pub gradient_magnitude: f64,
    /// Set when the optimizer has converged.
    pub converged: Option<StopReason>,
}

/// Regular-step gradient descent over host parameters.
///
/// Each parameter `θᵢ` is optimized as `θᵢ · scaleᵢ` so that all parameters
/// share physical units; rotations and matrix entries use a scale of the
/// image radius, translations a scale of one. Masked-out parameters keep
/// their initial value.
#[derive(Debug, Clone)]
pub struct RegularStepGradientDescent {
    scales: Vec<f64>,
    active: Vec<bool>,
    step_length: f64,
    min_step: f64,
    relaxation: f64,
    gradient_tolerance: f64,
    previous: Option<Vec<f64>>,
}

impl RegularStepGradientDescent {
    /// Create an optimizer.
    ///
    /// # Arguments
    /// * `scales` - Per-parameter scale; also fixes the parameter count
    /// * `max_step` - Initial step length
    /// * `min_step` - Convergence threshold on the step length
    /// * `relaxation` - Step multiplier applied on gradient reversal
    /// * `gradient_tolerance` - Convergence threshold on the gradient magnitude
    pub fn new(scales: Vec<f64>, max_step: f64, min_step: f64, relaxation: f64, gradient_tolerance: f64) -> Self {
        let active = vec![true; scales.len()];
        Self {
            scales,
            active,
            step_length: max_step,
            min_step,
            relaxation,
            gradient_tolerance,
            previous: None,
        }
    }

    /// Restrict optimization to parameters where `active` is true.
    pub fn with_active(mut self, active: Vec<bool>) -> Self {
        debug_assert_eq!(active.len(), self.scales.len());
        self.active = active;
        self
    }

    pub fn step_length(&self) -> f64 {
        self.step_length
    }

    /// Advance `params` against `gradient` (the derivative of the loss).
    pub fn step(&mut self, params: &mut [f64], gradient: &[f64]) -> StepReport {
        // Gradient with respect to the scaled parameters θ·s is ∂L/∂θ / s.
        let scaled: Vec<f64> = gradient
            .iter()
            .zip(&self.scales)
            .zip(&self.active)
            .map(|((g, s), &on)| if on { g / s } else { 0.0 })
            .collect();
        let magnitude = scaled.iter().map(|g| g * g).sum::<f64>().sqrt();

        if magnitude < self.gradient_tolerance {
            return StepReport {
                step_length: 0.0,
                gradient_magnitude: magnitude,
                converged: Some(StopReason::GradientTooSmall),
            };
        }

        if let Some(prev) = &self.previous {
            let dot: f64 = prev.iter().zip(&scaled).map(|(a, b)| a * b).sum();
            if dot < 0.0 {
                self.step_length *= self.relaxation;
            }
        }

        if self.step_length < self.min_step {
            return StepReport {
                step_length: 0.0,
                gradient_magnitude: magnitude,
                converged: Some(StopReason::StepTooSmall),
            };
        }

        for ((p, g), s) in params.iter_mut().zip(&scaled).zip(&self.scales) {
            *p -= self.step_length * g / magnitude / s;
        }
        self.previous = Some(scaled);

        StepReport {
            step_length: self.step_length,
            gradient_magnitude: magnitude,
            converged: None,
        }
    }
}
