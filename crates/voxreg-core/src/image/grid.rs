use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::geometry::{GridGeometry, Point3};

/// Physical coordinates of every voxel centre, in row-major voxel order.
pub fn world_points(geometry: &GridGeometry) -> Vec<Point3> {
    (0..geometry.len()).map(|offset| geometry.voxel_to_world(offset)).collect()
}

/// Generate a tensor of physical voxel coordinates for the given grid.
///
/// Returns a tensor of shape `[N, 3]` where N is the number of voxels.
///
/// # Arguments
/// * `geometry` - The sampling grid
/// * `device` - The device to create the tensor on
pub fn generate_world_grid<B: Backend>(geometry: &GridGeometry, device: &B::Device) -> Tensor<B, 2> {
    let n = geometry.len();
    let mut flat = Vec::with_capacity(n * 3);
    for p in world_points(geometry) {
        flat.push(p.x as f32);
        flat.push(p.y as f32);
        flat.push(p.z as f32);
    }
    Tensor::<B, 2>::from_data(TensorData::new(flat, [n, 3]), device)
}

/// Pack continuous indices into an `[N, 3]` tensor.
pub fn indices_to_tensor<B: Backend>(indices: &[[f64; 3]], device: &B::Device) -> Tensor<B, 2> {
    let flat: Vec<f32> = indices.iter().flat_map(|ix| ix.iter().map(|&v| v as f32)).collect();
    Tensor::<B, 2>::from_data(TensorData::new(flat, [indices.len(), 3]), device)
}
