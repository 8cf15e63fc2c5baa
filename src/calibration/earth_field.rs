//! Earth-field capture: average the reference-frame projection of the
//! corrected field over a short, magnet-free window.

use super::ellipsoid::QualityShortfall;
use super::{EarthField, QualityMetric};
use crate::config::CalibrationConfig;
use crate::residual::QuaternionFrame;
use crate::types::{Quat, QuaternionWxyz, Vec3};

#[derive(Clone, Debug)]
pub struct EarthFieldCapture {
    references: Vec<Vec3>,
    sensor_sum: Vec3,
    last_orientation: Option<Quat>,
    target: usize,
    max_spread_ut: f64,
}

impl EarthFieldCapture {
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            references: Vec::with_capacity(config.earth_field_samples),
            sensor_sum: Vec3::zeros(),
            last_orientation: None,
            target: config.earth_field_samples,
            max_spread_ut: config.max_earth_field_spread_ut,
        }
    }

    pub fn add(&mut self, corrected_ut: &Vec3, q: &Quat, frame: QuaternionFrame) -> bool {
        let reference = frame.to_reference(q, corrected_ut);
        if !reference.iter().all(|v| v.is_finite()) {
            return false;
        }
        self.references.push(reference);
        self.sensor_sum += corrected_ut;
        self.last_orientation = Some(*q);
        true
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn is_full(&self) -> bool {
        self.references.len() >= self.target
    }

    /// RMS distance of the projections from their mean.
    pub fn spread_ut(&self) -> f64 {
        if self.references.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum: f64 = self.references.iter().map(|r| (r - mean).norm_squared()).sum();
        (sum / self.references.len() as f64).sqrt()
    }

    fn mean(&self) -> Vec3 {
        let n = self.references.len().max(1) as f64;
        self.references.iter().fold(Vec3::zeros(), |acc, r| acc + r) / n
    }

    pub fn solve(&self) -> Result<EarthField, QualityShortfall> {
        let Some(orientation) = self.last_orientation else {
            return Err(QualityShortfall {
                metric: QualityMetric::SampleCount,
                value: 0.0,
                threshold: 1.0,
            });
        };
        let spread = self.spread_ut();
        if spread > self.max_spread_ut {
            return Err(QualityShortfall {
                metric: QualityMetric::EarthFieldSpread,
                value: spread,
                threshold: self.max_spread_ut,
            });
        }

        let reference = self.mean();
        Ok(EarthField {
            reference_ut: reference,
            sensor_ut: self.sensor_sum / self.references.len() as f64,
            capture_orientation: QuaternionWxyz::from(&orientation),
            magnitude_ut: reference.norm(),
            samples: self.references.len(),
            spread_ut: spread,
        })
    }

    pub fn reset(&mut self) {
        self.references.clear();
        self.sensor_sum = Vec3::zeros();
        self.last_orientation = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn config(samples: usize) -> CalibrationConfig {
        CalibrationConfig {
            earth_field_samples: samples,
            ..CalibrationConfig::default()
        }
    }

    #[test]
    fn test_mean_projection_across_poses() {
        let frame = QuaternionFrame::SensorToWorld;
        let world = Vec3::new(22.0, 0.0, -38.0);
        let mut capture = EarthFieldCapture::new(&config(20));
        for i in 0..20 {
            let q = Quat::from_euler_angles(0.0, 0.0, i as f64 * 0.1);
            capture.add(&q.inverse_transform_vector(&world), &q, frame);
        }
        assert!(capture.is_full());

        let field = capture.solve().expect("consistent capture");
        assert_abs_diff_eq!(field.reference_ut, world, epsilon = 1e-9);
        assert_abs_diff_eq!(field.magnitude_ut, world.norm(), epsilon = 1e-9);
        assert_abs_diff_eq!(field.spread_ut, 0.0, epsilon = 1e-9);
        assert_eq!(field.samples, 20);
    }

    #[test]
    fn test_noisy_capture_rejected() {
        let frame = QuaternionFrame::SensorToWorld;
        let mut capture = EarthFieldCapture::new(&config(10));
        for i in 0..10 {
            let wobble = if i % 2 == 0 { 15.0 } else { -15.0 };
            capture.add(&Vec3::new(20.0 + wobble, 0.0, -40.0), &Quat::identity(), frame);
        }
        let shortfall = capture.solve().unwrap_err();
        assert_eq!(shortfall.metric, QualityMetric::EarthFieldSpread);
        assert_abs_diff_eq!(shortfall.value, 15.0, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_capture() {
        let capture = EarthFieldCapture::new(&config(10));
        assert_eq!(capture.solve().unwrap_err().metric, QualityMetric::SampleCount);
    }
}
