use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::MotionConfig;
use crate::types::Vec3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionState {
    pub moving: bool,
    pub accel_std_g: f64,
    pub gyro_std_dps: f64,
}

impl MotionState {
    pub fn is_static(&self) -> bool {
        !self.moving
    }
}

/// Static/moving classifier over a sliding window of accel and gyro magnitudes.
///
/// Reports "moving" until the window has filled once, so nothing downstream
/// learns a bias from a half-observed startup transient.
pub struct MotionDetector {
    window: VecDeque<(f64, f64)>,
    window_size: usize,
    accel_threshold: f64,
    gyro_threshold: f64,
}

impl MotionDetector {
    pub fn new(config: &MotionConfig) -> Self {
        MotionDetector {
            window: VecDeque::with_capacity(config.window_size),
            window_size: config.window_size.max(2),
            accel_threshold: config.accel_std_threshold_g,
            gyro_threshold: config.gyro_std_threshold_dps,
        }
    }

    pub fn update(&mut self, accel_g: &Vec3, gyro_dps: &Vec3) -> MotionState {
        self.window.push_back((accel_g.norm(), gyro_dps.norm()));
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        let accel_std = std_dev(self.window.iter().map(|s| s.0));
        let gyro_std = std_dev(self.window.iter().map(|s| s.1));
        let warming_up = self.window.len() < self.window_size;

        // NaN std-devs compare false and read as moving
        MotionState {
            moving: warming_up
                || !(accel_std <= self.accel_threshold)
                || !(gyro_std <= self.gyro_threshold),
            accel_std_g: accel_std,
            gyro_std_dps: gyro_std,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

/// Population standard deviation; 0 for fewer than two values.
fn std_dev(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count();
    if n < 2 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    var.sqrt()
}
