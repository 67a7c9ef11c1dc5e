//! Resampling of volumes through transforms.
//!
//! The transform's point map takes output (target-space) physical points to
//! input (source-space) physical points; the input is interpolated there.

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, TransformError};
use crate::geometry::GridGeometry;
use crate::image::grid::indices_to_tensor;
use crate::image::{world_points, Volume};
use crate::interpolation::Interpolation;
use crate::transform::Transform;

/// What a resampling call actually did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResampleReport {
    /// Policy used to sample the input.
    pub interpolation: Interpolation,
    /// A label volume was resampled with something other than nearest.
    pub label_override: bool,
    /// Output voxels whose source point fell outside the input grid.
    pub out_of_bounds: usize,
    pub fill_value: f32,
}

/// A resampled volume plus its report.
#[derive(Debug, Clone)]
pub struct Resampled<B: Backend> {
    pub volume: Volume<B>,
    pub report: ResampleReport,
}

/// Resamples volumes onto a reference grid through a [`Transform`].
///
/// Continuous volumes use `interpolation`. Label volumes use nearest
/// neighbour unless `label_interpolation` is set explicitly; any other
/// choice is flagged in the report.
///
/// Output samples whose source point lies outside the input voxel
/// footprint `[-0.5, n - 0.5]` are set to `fill_value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resampler {
    pub interpolation: Interpolation,
    pub label_interpolation: Option<Interpolation>,
    pub fill_value: f32,
    #[serde(skip)]
    pub reference: Option<GridGeometry>,
}

impl Default for Resampler {
    fn default() -> Self {
        Self {
            interpolation: Interpolation::Linear,
            label_interpolation: None,
            fill_value: 0.0,
            reference: None,
        }
    }
}

impl Resampler {
    pub fn new(interpolation: Interpolation) -> Self {
        Self {
            interpolation,
            ..Default::default()
        }
    }

    pub fn with_fill_value(mut self, fill_value: f32) -> Self {
        self.fill_value = fill_value;
        self
    }

    /// Force a policy for label volumes.
    pub fn with_label_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.label_interpolation = Some(interpolation);
        self
    }

    /// Output grid; defaults to the input volume's own grid.
    pub fn with_reference(mut self, reference: GridGeometry) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Policy used for a volume, and whether it overrides the label default.
    pub fn policy_for<B: Backend>(&self, volume: &Volume<B>) -> (Interpolation, bool) {
        if volume.is_label() {
            let chosen = self.label_interpolation.unwrap_or(Interpolation::Nearest);
            (chosen, chosen != Interpolation::Nearest)
        } else {
            (self.interpolation, false)
        }
    }

    /// Resample `volume` through `transform`.
    ///
    /// The output is tagged with the transform's target space (the input's
    /// space for an untagged identity) and keeps the input's kind.
    pub fn apply<B: Backend>(&self, volume: &Volume<B>, transform: &Transform) -> Result<Resampled<B>> {
        if let Some(source) = transform.source_space() {
            if source != volume.space() {
                return Err(TransformError::incompatible_space(source, volume.space()));
            }
        }

        let (interpolation, label_override) = self.policy_for(volume);
        if label_override {
            warn!(
                interpolation = interpolation.name(),
                "label volume resampled without nearest-neighbour interpolation"
            );
        }

        let reference = self.reference.as_ref().unwrap_or_else(|| volume.geometry());
        let input = volume.geometry();
        let shape = input.shape();

        let mut indices = Vec::with_capacity(reference.len());
        let mut inside = Vec::with_capacity(reference.len());
        for p in world_points(reference) {
            let q = transform.transform_point(&p);
            let idx = input.world_to_index(&q);
            inside.push((0..3).all(|a| idx[a] >= -0.5 && idx[a] <= shape[a] as f64 - 0.5));
            indices.push([idx[0], idx[1], idx[2]]);
        }

        let device = volume.device();
        let sampled = interpolation.sample(volume.data(), indices_to_tensor::<B>(&indices, &device));
        let mut values = sampled
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| TransformError::invalid_volume(format!("tensor readback failed: {:?}", e)))?;

        let mut out_of_bounds = 0;
        for (v, &ok) in values.iter_mut().zip(&inside) {
            if !ok {
                *v = self.fill_value;
                out_of_bounds += 1;
            }
        }

        let space = transform
            .target_space()
            .cloned()
            .unwrap_or_else(|| volume.space().clone());
        let out = Volume::from_vec(values, reference.clone(), space, &device)?.with_kind(volume.kind());

        debug!(
            transform = transform.kind_name(),
            interpolation = interpolation.name(),
            out_of_bounds,
            "resampled volume"
        );

        Ok(Resampled {
            volume: out,
            report: ResampleReport {
                interpolation,
                label_override,
                out_of_bounds,
                fill_value: self.fill_value,
            },
        })
    }
}

/// Resample onto the volume's own grid.
///
/// Label volumes still default to nearest neighbour when `interpolation` is
/// the continuous-image default; pass [`Resampler::with_label_interpolation`]
/// to override.
pub fn apply<B: Backend>(
    volume: &Volume<B>,
    transform: &Transform,
    interpolation: Interpolation,
    fill_value: f32,
) -> Result<Volume<B>> {
    let resampler = Resampler::new(interpolation).with_fill_value(fill_value);
    Ok(resampler.apply(volume, transform)?.volume)
}
