//! Volume type: voxel tensor plus physical grid geometry.
//!
//! A volume combines tensor data (on any burn backend) with the geometry that
//! maps voxel indices to physical coordinates and the coordinate space the
//! physical coordinates are expressed in.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformError};
use crate::geometry::{GridGeometry, Point3, Vector3};
use crate::space::CoordinateSpace;

/// Whether samples are continuous intensities or discrete class labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    #[default]
    Intensity,
    Label,
}

/// A sampled 3-D grid with physical metadata.
///
/// Volumes are values: every operation returns a new volume and never
/// mutates the input.
///
/// # Examples
/// ```rust
/// use voxreg_core::{CoordinateSpace, GridGeometry, Volume};
/// use burn_ndarray::NdArray;
///
/// type Backend = NdArray<f32>;
///
/// let device = Default::default();
/// let geometry = GridGeometry::unit([4, 4, 4]).unwrap();
/// let volume = Volume::<Backend>::zeros(geometry, CoordinateSpace::new("native"), &device);
/// assert_eq!(volume.shape(), [4, 4, 4]);
/// ```
#[derive(Debug, Clone)]
pub struct Volume<B: Backend> {
    data: Tensor<B, 3>,
    geometry: GridGeometry,
    space: CoordinateSpace,
    kind: VolumeKind,
}

impl<B: Backend> Volume<B> {
    /// Create a volume from a tensor whose shape must match the geometry.
    pub fn new(data: Tensor<B, 3>, geometry: GridGeometry, space: CoordinateSpace) -> Result<Self> {
        let dims = data.dims();
        if dims != geometry.shape() {
            return Err(TransformError::invalid_volume(format!(
                "tensor shape {:?} does not match grid shape {:?}",
                dims,
                geometry.shape()
            )));
        }
        Ok(Self {
            data,
            geometry,
            space,
            kind: VolumeKind::Intensity,
        })
    }

    /// Create a volume from row-major samples.
    pub fn from_vec(
        values: Vec<f32>,
        geometry: GridGeometry,
        space: CoordinateSpace,
        device: &B::Device,
    ) -> Result<Self> {
        if values.len() != geometry.len() {
            return Err(TransformError::invalid_volume(format!(
                "expected {} samples, got {}",
                geometry.len(),
                values.len()
            )));
        }
        let data = Tensor::<B, 3>::from_data(TensorData::new(values, geometry.shape()), device);
        Self::new(data, geometry, space)
    }

    /// Create a zero-filled volume.
    pub fn zeros(geometry: GridGeometry, space: CoordinateSpace, device: &B::Device) -> Self {
        let data = Tensor::<B, 3>::zeros(geometry.shape(), device);
        Self {
            data,
            geometry,
            space,
            kind: VolumeKind::Intensity,
        }
    }

    /// Same volume flagged as a discrete label map.
    pub fn into_label(mut self) -> Self {
        self.kind = VolumeKind::Label;
        self
    }

    /// Same volume with a different kind.
    pub fn with_kind(mut self, kind: VolumeKind) -> Self {
        self.kind = kind;
        self
    }

    /// New volume sharing this volume's geometry, space and kind.
    pub fn with_data(&self, data: Tensor<B, 3>) -> Result<Self> {
        let mut out = Self::new(data, self.geometry.clone(), self.space.clone())?;
        out.kind = self.kind;
        Ok(out)
    }

    /// New volume sharing this volume's geometry, space and kind from host samples.
    pub fn with_values(&self, values: Vec<f32>) -> Result<Self> {
        let device = self.data.device();
        let mut out = Self::from_vec(values, self.geometry.clone(), self.space.clone(), &device)?;
        out.kind = self.kind;
        Ok(out)
    }

    pub fn data(&self) -> &Tensor<B, 3> {
        &self.data
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn space(&self) -> &CoordinateSpace {
        &self.space
    }

    pub fn kind(&self) -> VolumeKind {
        self.kind
    }

    pub fn is_label(&self) -> bool {
        self.kind == VolumeKind::Label
    }

    pub fn shape(&self) -> [usize; 3] {
        self.geometry.shape()
    }

    pub fn device(&self) -> B::Device {
        self.data.device()
    }

    /// Copy the samples to the host in row-major order.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        self.data
            .clone()
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| TransformError::invalid_volume(format!("tensor readback failed: {:?}", e)))
    }

    /// Intensity-weighted centre of mass in physical coordinates.
    ///
    /// Negative samples are ignored. Returns `None` for an all-zero volume.
    pub fn center_of_mass(&self) -> Result<Option<Point3>> {
        let values = self.to_vec()?;
        let mut total = 0.0f64;
        let mut acc = Vector3::zeros();
        for (offset, &v) in values.iter().enumerate() {
            if v > 0.0 {
                let [i, j, k] = self.geometry.unravel(offset);
                acc += Vector3::new(i as f64, j as f64, k as f64) * v as f64;
                total += v as f64;
            }
        }
        if total <= 0.0 {
            return Ok(None);
        }
        Ok(Some(self.geometry.index_to_world(&(acc / total))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type Backend = NdArray<f32>;

    #[test]
    fn test_volume_creation() {
        let device = Default::default();
        let geometry = GridGeometry::unit([2, 3, 4]).unwrap();
        let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let volume = Volume::<Backend>::from_vec(values.clone(), geometry, "native".into(), &device).unwrap();

        assert_eq!(volume.shape(), [2, 3, 4]);
        assert_eq!(volume.to_vec().unwrap(), values);
        assert_eq!(volume.kind(), VolumeKind::Intensity);
    }

    #[test]
    fn test_volume_shape_mismatch() {
        let device = Default::default();
        let geometry = GridGeometry::unit([2, 2, 2]).unwrap();
        let res = Volume::<Backend>::from_vec(vec![0.0; 7], geometry, "native".into(), &device);
        assert!(matches!(res, Err(TransformError::InvalidVolume(_))));
    }

    #[test]
    fn test_center_of_mass() {
        let device = Default::default();
        let geometry = GridGeometry::unit([5, 5, 5]).unwrap();
        let mut values = vec![0.0f32; 125];
        values[geometry.offset([1, 2, 3])] = 1.0;
        values[geometry.offset([3, 2, 3])] = 1.0;
        let volume = Volume::<Backend>::from_vec(values, geometry, "native".into(), &device).unwrap();

        let com = volume.center_of_mass().unwrap().unwrap();
        assert!((com - Point3::new(2.0, 2.0, 3.0)).norm() < 1e-12);
    }

    #[test]
    fn test_label_kind_preserved() {
        let device = Default::default();
        let geometry = GridGeometry::unit([2, 2, 2]).unwrap();
        let labels = Volume::<Backend>::zeros(geometry, "native".into(), &device).into_label();
        let copy = labels.with_values(vec![1.0; 8]).unwrap();
        assert!(copy.is_label());
    }
}
