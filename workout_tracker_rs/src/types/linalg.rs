//! Planar vector aliases for the local tangent frame.
//!
//! Positions are filtered per axis in metres relative to the current estimate,
//! so a 2-vector of (north, east) is all the Kalman code ever needs.

use nalgebra::SVector;

pub const PLANAR_DIM: usize = 2;

/// (north, east) in metres
pub type PlanarVec = SVector<f64, PLANAR_DIM>;

pub const NORTH: usize = 0;
pub const EAST: usize = 1;

/// Clamp every axis of `v` to `[-bound, bound]`.
pub fn clamp_axes(v: &PlanarVec, bound: f64) -> PlanarVec {
    let bound = bound.abs();
    v.map(|c| c.clamp(-bound, bound))
}
