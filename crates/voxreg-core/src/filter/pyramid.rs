use burn::tensor::backend::Backend;

use super::downsample::DownsampleFilter;
use super::gaussian::GaussianFilter;
use crate::error::{Result, TransformError};
use crate::image::Volume;

/// Multi-resolution volume pyramid.
///
/// Levels are ordered from coarsest to finest; each level is the input
/// smoothed with that level's sigmas and then downsampled by its shrink
/// factors.
#[derive(Debug, Clone)]
pub struct MultiResolutionPyramid<B: Backend> {
    levels: Vec<Volume<B>>,
}

impl<B: Backend> MultiResolutionPyramid<B> {
    /// Create a pyramid from an input volume and schedules.
    ///
    /// # Arguments
    /// * `input` - The original full-resolution volume
    /// * `shrink_factors` - Shrink factors per level
    /// * `smoothing_sigmas` - Smoothing sigmas per level (physical units)
    pub fn new(input: &Volume<B>, shrink_factors: &[[usize; 3]], smoothing_sigmas: &[[f64; 3]]) -> Result<Self> {
        if shrink_factors.len() != smoothing_sigmas.len() {
            return Err(TransformError::invalid_volume(format!(
                "schedule lengths differ: {} shrink levels, {} sigma levels",
                shrink_factors.len(),
                smoothing_sigmas.len()
            )));
        }

        let mut levels = Vec::with_capacity(shrink_factors.len());
        for (factors, sigmas) in shrink_factors.iter().zip(smoothing_sigmas) {
            let smoother = GaussianFilter::new(*sigmas);
            let smoothed = if smoother.is_noop() {
                input.clone()
            } else {
                smoother.apply(input)?
            };

            let level = if factors.iter().all(|&f| f <= 1) {
                smoothed
            } else {
                DownsampleFilter::new(*factors).apply(&smoothed)?
            };
            levels.push(level);
        }

        Ok(Self { levels })
    }

    /// Get volume at a specific level.
    pub fn level(&self, level: usize) -> Option<&Volume<B>> {
        self.levels.get(level)
    }

    /// Get number of levels.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Volume<B>> {
        self.levels.iter()
    }

    /// Power-of-two schedule for `levels` levels, coarsest first.
    ///
    /// `levels = 3` gives factors `[4, 2, 1]` and sigmas `[2.0, 1.0, 0.0]`
    /// (in units of `base_spacing`).
    pub fn default_schedule(levels: usize, base_spacing: f64) -> (Vec<[usize; 3]>, Vec<[f64; 3]>) {
        let mut shrink_factors = Vec::with_capacity(levels);
        let mut smoothing_sigmas = Vec::with_capacity(levels);
        for i in 0..levels {
            let factor = 1usize << (levels - 1 - i);
            let sigma = if factor > 1 { 0.5 * factor as f64 * base_spacing } else { 0.0 };
            shrink_factors.push([factor; 3]);
            smoothing_sigmas.push([sigma; 3]);
        }
        (shrink_factors, smoothing_sigmas)
    }
}
