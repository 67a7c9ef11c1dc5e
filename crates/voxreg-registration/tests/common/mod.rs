#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use voxreg_core::image::world_points;
use voxreg_core::{GridGeometry, Point3, Spacing3, Volume};
use voxreg_registration::{InferenceBackend, InferenceOutput, InferenceRequest, RegistrationError, Result};

pub type B = Autodiff<NdArray<f32>>;

/// Anisotropic Gaussian blob on a unit-spaced cube.
pub fn blob(size: usize, center: [f64; 3], radii: [f64; 3], space: &str) -> Volume<B> {
    let geometry = GridGeometry::axis_aligned([size; 3], Point3::origin(), Spacing3::repeat(1.0)).unwrap();
    let values = world_points(&geometry)
        .iter()
        .map(|p| {
            let q: f64 = (0..3).map(|a| ((p[a] - center[a]) / radii[a]).powi(2)).sum();
            (-0.5 * q).exp() as f32
        })
        .collect();
    Volume::from_vec(values, geometry, space.into(), &Default::default()).unwrap()
}

/// Label map with one voxel per `(label, index)` on a unit-spaced cube.
pub fn landmarks(size: usize, points: &[(u32, [usize; 3])], offset: [usize; 3], space: &str) -> Volume<B> {
    let geometry = GridGeometry::axis_aligned([size; 3], Point3::origin(), Spacing3::repeat(1.0)).unwrap();
    let mut values = vec![0.0f32; geometry.len()];
    for (label, [i, j, k]) in points {
        values[geometry.offset([i + offset[0], j + offset[1], k + offset[2]])] = *label as f32;
    }
    Volume::from_vec(values, geometry, space.into(), &Default::default())
        .unwrap()
        .into_label()
}

pub const LANDMARKS: [(u32, [usize; 3]); 5] = [
    (1, [3, 3, 4]),
    (2, [10, 4, 5]),
    (3, [4, 11, 6]),
    (4, [5, 5, 12]),
    (5, [9, 10, 10]),
];

/// Mean squared intensity difference of two volumes on the same grid.
pub fn mismatch(a: &Volume<B>, b: &Volume<B>) -> f64 {
    let a = a.to_vec().unwrap();
    let b = b.to_vec().unwrap();
    assert_eq!(a.len(), b.len());
    a.iter().zip(&b).map(|(x, y)| ((x - y) as f64).powi(2)).sum::<f64>() / a.len() as f64
}

pub const IDENTITY_MATRIX: [f64; 12] = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0];

/// Fails the first `failures` calls, then answers with the identity.
pub struct Flaky {
    pub failures: usize,
    pub calls: AtomicUsize,
}

impl Flaky {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceBackend for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn infer(&self, _request: &InferenceRequest) -> Result<InferenceOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(RegistrationError::inference(format!("transient failure {}", call)));
        }
        Ok(InferenceOutput::Affine {
            matrix: IDENTITY_MATRIX.to_vec(),
        })
    }
}

/// Answers after a delay.
pub struct Slow(pub Duration);

impl InferenceBackend for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    fn infer(&self, _request: &InferenceRequest) -> Result<InferenceOutput> {
        std::thread::sleep(self.0);
        Ok(InferenceOutput::Affine {
            matrix: IDENTITY_MATRIX.to_vec(),
        })
    }
}

/// Answers with a zero field on a grid one voxel larger than the fixed one.
pub struct WrongGrid;

impl InferenceBackend for WrongGrid {
    fn name(&self) -> &str {
        "wrong-grid"
    }

    fn infer(&self, request: &InferenceRequest) -> Result<InferenceOutput> {
        let shape = request.fixed.geometry.shape();
        let geometry = GridGeometry::unit([shape[0] + 1, shape[1], shape[2]])?;
        Ok(InferenceOutput::Field {
            components: vec![0.0; geometry.len() * 3],
            geometry,
        })
    }
}

/// Answers with a constant displacement field on the fixed grid.
pub struct ConstantField(pub [f64; 3]);

impl InferenceBackend for ConstantField {
    fn name(&self) -> &str {
        "constant-field"
    }

    fn infer(&self, request: &InferenceRequest) -> Result<InferenceOutput> {
        let geometry = request.fixed.geometry.clone();
        let components = (0..geometry.len()).flat_map(|_| self.0).collect();
        Ok(InferenceOutput::Field { geometry, components })
    }
}
