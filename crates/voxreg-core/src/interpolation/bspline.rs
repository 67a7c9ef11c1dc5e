//! B-Spline interpolation implementation.
//!
//! Cubic B-spline interpolation of a volume. Samples are first converted to
//! spline coefficients with the recursive prefilter (causal and anti-causal
//! passes along each axis, mirror boundary), so the spline passes through
//! every grid sample. Evaluation then weights a 4×4×4 neighbourhood of
//! coefficients.
//!
//! Runs on the host; the result is not differentiable.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use super::trait_::Interpolator;

/// Pole of the cubic B-spline prefilter, `√3 - 2`.
const POLE: f64 = -0.267_949_192_431_122_7;

/// Cubic B-Spline basis function.
///
/// - (2/3) - |x|^2 + (1/2)|x|^3    for |x| < 1
/// - (1/6)(2 - |x|)^3              for 1 <= |x| < 2
/// - 0                             otherwise
fn cubic_bspline(x: f64) -> f64 {
    let abs_x = x.abs();
    if abs_x < 1.0 {
        (2.0 / 3.0) - abs_x * abs_x + 0.5 * abs_x.powi(3)
    } else if abs_x < 2.0 {
        let two_minus_x = 2.0 - abs_x;
        two_minus_x.powi(3) / 6.0
    } else {
        0.0
    }
}

/// Reflect an index into `[0, n)` (whole-sample mirror).
fn mirror(index: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let mut m = index.rem_euclid(period);
    if m >= n as isize {
        m = period - m;
    }
    m as usize
}

/// First causal coefficient for a mirror boundary.
fn causal_init(line: &[f64]) -> f64 {
    let n = line.len();
    let horizon = (f64::EPSILON.ln() / POLE.abs().ln()).ceil() as usize;
    if horizon < n {
        // Truncated sum; the pole's powers have vanished past the horizon.
        let mut zn = POLE;
        let mut sum = line[0];
        for v in line.iter().take(horizon).skip(1) {
            sum += zn * v;
            zn *= POLE;
        }
        return sum;
    }

    // Full mirror-symmetric sum for short lines.
    let iz = 1.0 / POLE;
    let mut zn = POLE;
    let mut z2n = POLE.powi(n as i32 - 1);
    let mut sum = line[0] + z2n * line[n - 1];
    z2n *= z2n * iz;
    for v in line.iter().take(n - 1).skip(1) {
        sum += (zn + z2n) * v;
        zn *= POLE;
        z2n *= iz;
    }
    sum / (1.0 - zn * zn)
}

/// In-place prefilter of one line of samples.
fn prefilter_line(line: &mut [f64]) {
    let n = line.len();
    if n < 2 {
        return;
    }
    let gain = (1.0 - POLE) * (1.0 - 1.0 / POLE);
    for v in line.iter_mut() {
        *v *= gain;
    }

    line[0] = causal_init(line);
    for i in 1..n {
        line[i] += POLE * line[i - 1];
    }

    // Anti-causal initialisation for a mirror boundary.
    line[n - 1] = (POLE / (POLE * POLE - 1.0)) * (POLE * line[n - 2] + line[n - 1]);
    for i in (0..n - 1).rev() {
        line[i] = POLE * (line[i + 1] - line[i]);
    }
}

/// Spline coefficients of a row-major `[n0, n1, n2]` volume.
pub fn spline_coefficients(values: &[f32], shape: [usize; 3]) -> Vec<f64> {
    let mut coeffs: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    let strides = [shape[1] * shape[2], shape[2], 1];
    for axis in 0..3 {
        let n = shape[axis];
        if n < 2 {
            continue;
        }
        let mut line = vec![0.0; n];
        let others: Vec<usize> = (0..3).filter(|&a| a != axis).collect();
        for a in 0..shape[others[0]] {
            for b in 0..shape[others[1]] {
                let base = a * strides[others[0]] + b * strides[others[1]];
                for (t, slot) in line.iter_mut().enumerate() {
                    *slot = coeffs[base + t * strides[axis]];
                }
                prefilter_line(&mut line);
                for (t, v) in line.iter().enumerate() {
                    coeffs[base + t * strides[axis]] = *v;
                }
            }
        }
    }
    coeffs
}

/// Evaluate the spline defined by `coeffs` at a continuous index.
pub fn evaluate(coeffs: &[f64], shape: [usize; 3], index: [f64; 3]) -> f64 {
    let mut weights = [[0.0f64; 4]; 3];
    let mut taps = [[0usize; 4]; 3];
    for a in 0..3 {
        let x = index[a].clamp(0.0, (shape[a] - 1) as f64);
        let start = x.floor() as isize - 1;
        for t in 0..4 {
            let pos = start + t as isize;
            weights[a][t] = cubic_bspline(x - pos as f64);
            taps[a][t] = mirror(pos, shape[a]);
        }
    }

    let mut acc = 0.0;
    for ti in 0..4 {
        let wi = weights[0][ti];
        if wi == 0.0 {
            continue;
        }
        for tj in 0..4 {
            let wij = wi * weights[1][tj];
            if wij == 0.0 {
                continue;
            }
            let row = (taps[0][ti] * shape[1] + taps[1][tj]) * shape[2];
            for tk in 0..4 {
                acc += wij * weights[2][tk] * coeffs[row + taps[2][tk]];
            }
        }
    }
    acc
}

/// Cubic B-Spline interpolator.
///
/// Interpolating: at integer indices it reproduces the samples up to
/// floating-point error.
#[derive(Debug, Clone, Copy, Default)]
pub struct BSplineInterpolator;

impl BSplineInterpolator {
    /// Create a new B-Spline interpolator.
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Interpolator<B> for BSplineInterpolator {
    fn interpolate(&self, data: &Tensor<B, 3>, indices: Tensor<B, 2>) -> Tensor<B, 1> {
        let device = indices.device();
        let shape = data.dims();
        let n = indices.dims()[0];

        // Readback of a float tensor only fails on an element type mismatch,
        // in which case there is nothing meaningful to sample.
        let values = data.clone().into_data().to_vec::<f32>().unwrap_or_default();
        let points = indices.into_data().to_vec::<f32>().unwrap_or_default();
        if values.len() != shape.iter().product::<usize>() || points.len() != n * 3 {
            return Tensor::zeros([n], &device);
        }

        let coeffs = spline_coefficients(&values, shape);
        let out: Vec<f32> = points
            .chunks_exact(3)
            .map(|p| evaluate(&coeffs, shape, [p[0] as f64, p[1] as f64, p[2] as f64]) as f32)
            .collect();
        Tensor::from_data(TensorData::new(out, [n]), &device)
    }
}
