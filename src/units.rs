//! Raw sensor counts → physical units
//!
//! Conversion is a fixed per-axis scale. Validation runs alongside it and
//! only reports: a flagged sample is still converted and processed.

use serde::{Deserialize, Serialize};

use crate::config::UnitConfig;
use crate::types::{PhysicalSample, RawSample, Vec3};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Accel,
    Gyro,
    Mag,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContractViolation {
    /// Vector too short for an LSB reading, typically data that was already
    /// converted upstream.
    BelowEnvelope {
        sensor: SensorKind,
        magnitude_lsb: f64,
        min_lsb: f64,
    },
    /// Axis beyond what the sensor's ADC can produce.
    AboveFullScale {
        sensor: SensorKind,
        axis_lsb: i32,
        full_scale_lsb: f64,
    },
}

#[derive(Clone, Debug)]
pub struct UnitConverter {
    config: UnitConfig,
}

impl UnitConverter {
    pub fn new(config: UnitConfig) -> Self {
        Self { config }
    }

    pub fn convert(&self, raw: &RawSample, dt: f64) -> PhysicalSample {
        PhysicalSample {
            accel_g: scale(raw.accel(), 1.0 / self.config.accel_lsb_per_g),
            gyro_dps: scale(raw.gyro(), 1.0 / self.config.gyro_lsb_per_dps),
            mag_ut: scale(raw.mag(), 1.0 / self.config.mag_lsb_per_ut),
            dt,
        }
    }

    pub fn validate(&self, raw: &RawSample) -> Vec<ContractViolation> {
        let mut violations = Vec::new();
        let checks = [
            (SensorKind::Accel, raw.accel(), self.config.accel_min_magnitude_lsb),
            (SensorKind::Gyro, raw.gyro(), self.config.gyro_min_magnitude_lsb),
            (SensorKind::Mag, raw.mag(), self.config.mag_min_magnitude_lsb),
        ];

        for (sensor, axes, min_lsb) in checks {
            let magnitude_lsb = lsb_magnitude(axes);
            if magnitude_lsb < min_lsb {
                violations.push(ContractViolation::BelowEnvelope {
                    sensor,
                    magnitude_lsb,
                    min_lsb,
                });
            }
            if let Some(&axis_lsb) = axes
                .iter()
                .find(|a| (**a as f64).abs() > self.config.full_scale_lsb)
            {
                violations.push(ContractViolation::AboveFullScale {
                    sensor,
                    axis_lsb,
                    full_scale_lsb: self.config.full_scale_lsb,
                });
            }
        }

        violations
    }
}

fn scale(axes: [i32; 3], factor: f64) -> Vec3 {
    Vec3::new(
        axes[0] as f64 * factor,
        axes[1] as f64 * factor,
        axes[2] as f64 * factor,
    )
}

fn lsb_magnitude(axes: [i32; 3]) -> f64 {
    let [x, y, z] = axes.map(|a| a as f64);
    (x * x + y * y + z * z).sqrt()
}

/// Derives per-sample dt from stream timestamps.
#[derive(Clone, Debug)]
pub struct SampleClock {
    nominal_dt: f64,
    max_dt: f64,
    last_timestamp: Option<f64>,
}

impl SampleClock {
    pub fn new(nominal_dt: f64, max_dt: f64) -> Self {
        Self {
            nominal_dt,
            max_dt,
            last_timestamp: None,
        }
    }

    /// Falls back to the nominal period on the first sample, on repeated or
    /// backwards timestamps, and on gaps longer than `max_dt`.
    pub fn tick(&mut self, timestamp: f64) -> f64 {
        if !timestamp.is_finite() {
            return self.nominal_dt;
        }
        let dt = match self.last_timestamp {
            Some(prev) => {
                let dt = timestamp - prev;
                if dt > 0.0 && dt <= self.max_dt {
                    dt
                } else {
                    self.nominal_dt
                }
            }
            None => self.nominal_dt,
        };
        self.last_timestamp = Some(timestamp);
        dt
    }

    pub fn reset(&mut self) {
        self.last_timestamp = None;
    }
}
