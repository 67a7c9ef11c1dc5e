//! Validation utilities for registration configuration.
//!
//! Checks run once when a pipeline is built so that a bad configuration
//! surfaces before any estimator starts.

use crate::error::{RegistrationError, Result};

/// Names accepted in a rigid degrees-of-freedom list.
pub const DOF_NAMES: [&str; 6] = ["tx", "ty", "tz", "rx", "ry", "rz"];

/// Validate that a tolerance-like value is finite and strictly positive.
pub fn validate_positive(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(RegistrationError::invalid_configuration(format!(
            "{} must be positive and finite, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Validate a value that may be zero but not negative.
pub fn validate_non_negative(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(RegistrationError::invalid_configuration(format!(
            "{} must be non-negative and finite, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Validate the bounds of a regular-step optimizer.
pub fn validate_step_bounds(min_step: f64, max_step: f64) -> Result<()> {
    validate_positive("min_step", min_step)?;
    validate_positive("max_step", max_step)?;
    if min_step > max_step {
        return Err(RegistrationError::invalid_configuration(format!(
            "min_step ({}) exceeds max_step ({})",
            min_step, max_step
        )));
    }
    Ok(())
}

/// Validate a step relaxation factor in `(0, 1)`.
pub fn validate_relaxation(relaxation: f64) -> Result<()> {
    if !(relaxation > 0.0 && relaxation < 1.0) {
        return Err(RegistrationError::invalid_configuration(format!(
            "relaxation must lie in (0, 1), got {}",
            relaxation
        )));
    }
    Ok(())
}

/// Validate a retry relax factor; retries never tighten a configuration.
pub fn validate_relax_factor(factor: f64) -> Result<()> {
    if !factor.is_finite() || factor < 1.0 {
        return Err(RegistrationError::invalid_configuration(format!(
            "relax_factor must be >= 1, got {}",
            factor
        )));
    }
    Ok(())
}

/// Validate a multi-resolution schedule.
///
/// All three lists must be non-empty and of equal length; shrink factors are
/// at least one and sigmas non-negative. Iteration counts may be zero.
pub fn validate_schedule(shrink_factors: &[[usize; 3]], smoothing_sigmas: &[[f64; 3]], iterations: &[usize]) -> Result<()> {
    if shrink_factors.is_empty() {
        return Err(RegistrationError::invalid_configuration("schedule has no levels"));
    }
    if shrink_factors.len() != smoothing_sigmas.len() || shrink_factors.len() != iterations.len() {
        return Err(RegistrationError::invalid_configuration(format!(
            "inconsistent schedule: {} shrink levels, {} sigma levels, {} iteration levels",
            shrink_factors.len(),
            smoothing_sigmas.len(),
            iterations.len()
        )));
    }
    for (level, factors) in shrink_factors.iter().enumerate() {
        if factors.iter().any(|&f| f == 0) {
            return Err(RegistrationError::invalid_configuration(format!(
                "level {} has a zero shrink factor",
                level
            )));
        }
    }
    for sigmas in smoothing_sigmas {
        for &s in sigmas {
            validate_non_negative("smoothing sigma", s)?;
        }
    }
    Ok(())
}

/// Validate a degrees-of-freedom list against [`DOF_NAMES`].
pub fn validate_dof(dof: &[String]) -> Result<()> {
    if dof.is_empty() {
        return Err(RegistrationError::invalid_configuration("dof list is empty"));
    }
    for (i, name) in dof.iter().enumerate() {
        if !DOF_NAMES.contains(&name.as_str()) {
            return Err(RegistrationError::invalid_configuration(format!(
                "unknown degree of freedom '{}', expected one of {:?}",
                name, DOF_NAMES
            )));
        }
        if dof[..i].contains(name) {
            return Err(RegistrationError::invalid_configuration(format!(
                "degree of freedom '{}' listed twice",
                name
            )));
        }
    }
    Ok(())
}
