pub mod ahrs;

pub use ahrs::{GradientDescent, ImuAhrs, MargAhrs};

use serde::{Deserialize, Serialize};

use crate::config::AhrsConfig;
use crate::types::{Quat, Vec3};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// Gyro + accelerometer
    #[default]
    Imu,
    /// Gyro + accelerometer + magnetometer
    Marg,
}

pub trait Ahrs {
    fn mode(&self) -> FusionMode;
    fn orientation(&self) -> Quat;
    fn set_orientation(&mut self, quat: Quat);
    /// `gyro_rad` in rad/s (bias removed), `accel_g` in g, `mag_ut` iron-corrected.
    fn update(&mut self, gyro_rad: &Vec3, accel_g: &Vec3, mag_ut: Option<&Vec3>, dt: f64) -> Quat;
}

/// The orientation filter a pipeline owns, chosen by `AhrsConfig::mode`.
#[derive(Clone, Debug)]
pub enum OrientationFilter {
    Imu(ImuAhrs),
    Marg(MargAhrs),
}

impl OrientationFilter {
    pub fn new(config: &AhrsConfig) -> Self {
        match config.mode {
            FusionMode::Imu => OrientationFilter::Imu(ImuAhrs::new(config)),
            FusionMode::Marg => OrientationFilter::Marg(MargAhrs::new(config)),
        }
    }

    /// Drop the heading correction weight, e.g. while a magnet is nearby.
    /// No effect in 6-DOF mode.
    pub fn set_mag_trust(&mut self, trust: f64) {
        if let OrientationFilter::Marg(filter) = self {
            filter.set_mag_trust(trust);
        }
    }
}

impl Ahrs for OrientationFilter {
    fn mode(&self) -> FusionMode {
        match self {
            OrientationFilter::Imu(f) => f.mode(),
            OrientationFilter::Marg(f) => f.mode(),
        }
    }

    fn orientation(&self) -> Quat {
        match self {
            OrientationFilter::Imu(f) => f.orientation(),
            OrientationFilter::Marg(f) => f.orientation(),
        }
    }

    fn set_orientation(&mut self, quat: Quat) {
        match self {
            OrientationFilter::Imu(f) => f.set_orientation(quat),
            OrientationFilter::Marg(f) => f.set_orientation(quat),
        }
    }

    fn update(&mut self, gyro_rad: &Vec3, accel_g: &Vec3, mag_ut: Option<&Vec3>, dt: f64) -> Quat {
        match self {
            OrientationFilter::Imu(f) => f.update(gyro_rad, accel_g, mag_ut, dt),
            OrientationFilter::Marg(f) => f.update(gyro_rad, accel_g, mag_ut, dt),
        }
    }
}
