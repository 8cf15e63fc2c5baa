//! Linear algebra type system for the magnetometer pipeline
//!
//! Provides compile-time dimension checking and short aliases shared by
//! the orientation filter, the calibrator and the smoothing filter.

use nalgebra::{Matrix3, SMatrix, SVector, UnitQuaternion, Vector3};

// ===== Spatial Types =====
pub type Vec3 = Vector3<f64>;
pub type Mat3 = Matrix3<f64>;
pub type Quat = UnitQuaternion<f64>;

// ===== Smoothing Filter Dimensions =====
pub const SMOOTH_STATE_DIM: usize = 6; // (px, py, pz, vx, vy, vz)
pub const SMOOTH_MEASURE_DIM: usize = 3; // (px, py, pz)

pub type SmoothStateVec = SVector<f64, SMOOTH_STATE_DIM>;
pub type SmoothStateMat = SMatrix<f64, SMOOTH_STATE_DIM, SMOOTH_STATE_DIM>;
pub type SmoothMeasureMat = SMatrix<f64, SMOOTH_MEASURE_DIM, SMOOTH_STATE_DIM>; // 3×6
pub type SmoothGain = SMatrix<f64, SMOOTH_STATE_DIM, SMOOTH_MEASURE_DIM>; // 6×3

// ===== AHRS Gradient Types =====
pub type QuatGradient = SVector<f64, 4>;
pub type ReferenceJacobian = SMatrix<f64, 3, 4>;
