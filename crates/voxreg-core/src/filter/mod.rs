//! Volume filters: smoothing, downsampling, pyramids and resampling.

pub mod gaussian;
pub mod downsample;
pub mod pyramid;
pub mod resample;

pub use downsample::DownsampleFilter;
pub use gaussian::GaussianFilter;
pub use pyramid::MultiResolutionPyramid;
pub use resample::{ResampleReport, Resampled, Resampler};
