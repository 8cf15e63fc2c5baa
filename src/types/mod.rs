pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationStatus;
use crate::detector::MagnetReading;
use crate::motion::MotionState;
use crate::residual::ResidualReading;
use crate::units::ContractViolation;

/// One record from the transport layer, axis values in sensor LSB.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Seconds, monotonic per stream
    pub timestamp: f64,
    pub ax: i32,
    pub ay: i32,
    pub az: i32,
    pub gx: i32,
    pub gy: i32,
    pub gz: i32,
    pub mx: i32,
    pub my: i32,
    pub mz: i32,
}

impl RawSample {
    pub fn accel(&self) -> [i32; 3] {
        [self.ax, self.ay, self.az]
    }

    pub fn gyro(&self) -> [i32; 3] {
        [self.gx, self.gy, self.gz]
    }

    pub fn mag(&self) -> [i32; 3] {
        [self.mx, self.my, self.mz]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhysicalSample {
    pub accel_g: Vec3,
    pub gyro_dps: Vec3,
    pub mag_ut: Vec3,
    /// Seconds since the previous sample of the stream
    pub dt: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuaternionWxyz {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<&Quat> for QuaternionWxyz {
    fn from(q: &Quat) -> Self {
        Self { w: q.w, x: q.i, y: q.j, z: q.k }
    }
}

impl QuaternionWxyz {
    /// Returns `None` for a zero or non-finite quaternion.
    pub fn to_unit(&self) -> Option<Quat> {
        let q = nalgebra::Quaternion::new(self.w, self.x, self.y, self.z);
        let norm = q.norm();
        if !norm.is_finite() || norm < f64::EPSILON {
            return None;
        }
        Some(Quat::new_normalize(q))
    }
}

// asin(1 - 1e-12) is within 1e-4 degrees of 90
const GIMBAL_EPS: f64 = 1e-12;

/// Roll, pitch, yaw in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EulerAngles {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl EulerAngles {
    /// ZYX extraction. At the pitch singularity the asin argument is clamped
    /// and pitch is pinned to exactly ±90°.
    pub fn from_quaternion(q: &Quat) -> Self {
        let (w, x, y, z) = (q.w, q.i, q.j, q.k);

        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));

        let sin_pitch = 2.0 * (w * y - z * x);
        let pitch = if sin_pitch >= 1.0 - GIMBAL_EPS {
            90.0
        } else if sin_pitch <= -1.0 + GIMBAL_EPS {
            -90.0
        } else {
            sin_pitch.asin().to_degrees()
        };

        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));

        Self {
            roll: roll.to_degrees(),
            pitch,
            yaw: yaw.to_degrees(),
        }
    }
}

/// A raw sample plus every field appended by the pipeline stages.
///
/// `raw` is copied in once and never written again, so a record can always
/// be reprocessed with corrected conversion factors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecoratedSample {
    pub raw: RawSample,
    pub physical: PhysicalSample,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contract_violations: Vec<ContractViolation>,
    pub motion: MotionState,
    pub gyro_bias_dps: Vec3,
    pub orientation: QuaternionWxyz,
    pub euler: EulerAngles,
    pub calibration: CalibrationStatus,
    pub mag_calibrated_ut: Option<Vec3>,
    pub residual: Option<ResidualReading>,
    pub magnet: Option<MagnetReading>,
    pub smoothed_ut: Option<Vec3>,
}

/// Recorded session as written by the capture tooling.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionLog {
    #[serde(default)]
    pub device_id: Option<String>,
    pub samples: Vec<RawSample>,
}
