//! Volume types and voxel grids.
//!
//! This module provides the Volume type and helpers for enumerating the
//! physical coordinates of a voxel grid.

pub mod volume;
pub mod grid;

pub use volume::{Volume, VolumeKind};
pub use grid::{generate_world_grid, world_points};
