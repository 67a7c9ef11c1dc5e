use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::error::Result;
use crate::image::Volume;

/// Downsample filter.
///
/// Reduces the volume size by integer factors by keeping every Nth voxel
/// along each axis. The origin is unchanged (voxel 0 is kept) and spacing
/// is multiplied by the factor.
#[derive(Debug, Clone)]
pub struct DownsampleFilter {
    factors: [usize; 3],
}

impl DownsampleFilter {
    /// Create a new downsample filter; factors below 1 are treated as 1.
    pub fn new(factors: [usize; 3]) -> Self {
        Self {
            factors: factors.map(|f| f.max(1)),
        }
    }

    pub fn factors(&self) -> [usize; 3] {
        self.factors
    }

    /// Apply the filter to a volume.
    pub fn apply<B: Backend>(&self, volume: &Volume<B>) -> Result<Volume<B>> {
        let mut data = volume.data().clone();
        let device = data.device();
        let dims = data.dims();

        for axis in 0..3 {
            let factor = self.factors[axis];
            if factor <= 1 {
                continue;
            }
            // Size 10, factor 2 keeps 0, 2, 4, 6, 8.
            let keep: Vec<i32> = (0..dims[axis]).step_by(factor).map(|x| x as i32).collect();
            let keep = Tensor::<B, 1, Int>::from_ints(keep.as_slice(), &device);
            data = data.select(axis, keep);
        }

        let geometry = volume.geometry().shrink(self.factors)?;
        let out = Volume::new(data, geometry, volume.space().clone())?;
        Ok(out.with_kind(volume.kind()))
    }
}
