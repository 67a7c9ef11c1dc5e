//! Volumes, coordinate spaces and spatial transforms for volumetric
//! image registration.
//!
//! Geometry and transforms are evaluated in `f64` on the host; voxel data
//! lives in `burn` tensors so interpolation and smoothing run on any
//! backend.

pub mod error;
pub mod space;
pub mod geometry;
pub mod image;
pub mod transform;
pub mod interpolation;
pub mod filter;

pub use error::{Result, TransformError};
pub use filter::{ResampleReport, Resampled, Resampler};
pub use geometry::{Direction3, GridGeometry, Point3, Spacing3, Vector3};
pub use image::{Volume, VolumeKind};
pub use interpolation::Interpolation;
pub use space::{CoordinateSpace, SpacePair};
pub use transform::{
    compose, compose_all, invert, AffineTransform, DisplacementField, FieldInterpolation, InversionOptions,
    RigidTransform, Transform, TransformKind,
};
