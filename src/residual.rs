//! Residual field: what the magnetometer sees beyond the Earth's field.

use serde::{Deserialize, Serialize};

use crate::calibration::EarthField;
use crate::config::ResidualConfig;
use crate::types::{Mat3, Quat, Vec3};

/// Which way the orientation quaternion maps between the sensor frame and
/// the reference frame the Earth field is stored in.
///
/// Capture and projection always use the same convention, so either choice
/// gives a zero residual at the capture pose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuaternionFrame {
    /// `q·v` takes sensor vectors to the reference frame
    #[default]
    SensorToWorld,
    /// `q·v` takes reference vectors to the sensor frame
    WorldToSensor,
}

impl QuaternionFrame {
    pub fn to_reference(&self, q: &Quat, sensor: &Vec3) -> Vec3 {
        match self {
            QuaternionFrame::SensorToWorld => q.transform_vector(sensor),
            QuaternionFrame::WorldToSensor => q.inverse_transform_vector(sensor),
        }
    }

    pub fn to_sensor(&self, q: &Quat, reference: &Vec3) -> Vec3 {
        match self {
            QuaternionFrame::SensorToWorld => q.inverse_transform_vector(reference),
            QuaternionFrame::WorldToSensor => q.transform_vector(reference),
        }
    }

    /// `to_sensor` as a rotation matrix.
    pub fn to_sensor_matrix(&self, q: &Quat) -> Mat3 {
        let rotation = q.to_rotation_matrix().into_inner();
        match self {
            QuaternionFrame::SensorToWorld => rotation.transpose(),
            QuaternionFrame::WorldToSensor => rotation,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResidualReading {
    pub vector_ut: Vec3,
    pub magnitude_ut: f64,
    /// Earth field as the sensor should currently see it
    pub expected_earth_ut: Vec3,
}

#[derive(Clone, Debug, Default)]
pub struct ResidualEngine {
    frame: QuaternionFrame,
}

impl ResidualEngine {
    pub fn new(config: &ResidualConfig) -> Self {
        Self { frame: config.frame }
    }

    pub fn frame(&self) -> QuaternionFrame {
        self.frame
    }

    /// `None` when the inputs are not finite.
    pub fn compute(&self, corrected_ut: &Vec3, q: &Quat, earth: &EarthField) -> Option<ResidualReading> {
        let expected = self.frame.to_sensor(q, &earth.reference_ut);
        let vector = corrected_ut - expected;
        if !vector.iter().all(|v| v.is_finite()) {
            return None;
        }
        Some(ResidualReading {
            vector_ut: vector,
            magnitude_ut: vector.norm(),
            expected_earth_ut: expected,
        })
    }
}
