use crate::config::GyroBiasConfig;
use crate::types::Vec3;

/// Tracks the gyroscope zero offset with a per-axis EMA.
///
/// Updates only while the motion detector reports static; while moving the
/// estimate is frozen.
#[derive(Clone, Debug)]
pub struct GyroBiasEstimator {
    bias: Vec3,
    alpha: f64,
    static_updates: u64,
    min_static_samples: u64,
}

impl GyroBiasEstimator {
    pub fn new(config: &GyroBiasConfig) -> Self {
        Self {
            bias: Vec3::zeros(),
            alpha: config.alpha,
            static_updates: 0,
            min_static_samples: config.min_static_samples,
        }
    }

    /// Feed one gyro reading in deg/s; returns the current bias.
    pub fn update(&mut self, gyro_dps: &Vec3, is_static: bool) -> Vec3 {
        if is_static && gyro_dps.iter().all(|v| v.is_finite()) {
            self.bias += (gyro_dps - self.bias) * self.alpha;
            self.static_updates += 1;
        }
        self.bias
    }

    pub fn bias(&self) -> Vec3 {
        self.bias
    }

    pub fn corrected(&self, gyro_dps: &Vec3) -> Vec3 {
        gyro_dps - self.bias
    }

    pub fn is_converged(&self) -> bool {
        self.static_updates >= self.min_static_samples
    }

    pub fn static_updates(&self) -> u64 {
        self.static_updates
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        if alpha > 0.0 && alpha <= 1.0 {
            self.alpha = alpha;
        }
    }

    pub fn reset(&mut self) {
        self.bias = Vec3::zeros();
        self.static_updates = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn estimator(alpha: f64) -> GyroBiasEstimator {
        GyroBiasEstimator::new(&GyroBiasConfig {
            alpha,
            min_static_samples: 50,
        })
    }

    #[test]
    fn test_converges_to_static_bias() {
        // 5 deg/s for 10 s at 50 Hz, alpha = 0.1
        let mut est = estimator(0.1);
        let reading = Vec3::new(5.0, 0.0, 0.0);
        for _ in 0..500 {
            est.update(&reading, true);
        }
        assert!((est.bias().x - 5.0).abs() < 0.05);
        assert!(est.is_converged());
    }

    #[test]
    fn test_frozen_while_moving() {
        let mut est = estimator(0.1);
        for _ in 0..100 {
            est.update(&Vec3::new(1.0, -2.0, 0.5), true);
        }
        let before = est.bias();
        for _ in 0..100 {
            est.update(&Vec3::new(120.0, 40.0, -300.0), false);
        }
        assert_eq!(est.bias(), before);
    }

    #[test]
    fn test_small_alpha_is_slow() {
        let mut est = estimator(0.001);
        for _ in 0..500 {
            est.update(&Vec3::new(5.0, 0.0, 0.0), true);
        }
        // 1 - 0.999^500 ≈ 0.39
        assert!(est.bias().x < 2.5);
    }

    #[test]
    fn test_corrected_and_non_finite() {
        let mut est = estimator(1.0);
        est.update(&Vec3::new(1.0, 2.0, 3.0), true);
        est.update(&Vec3::new(f64::NAN, 0.0, 0.0), true);
        assert_abs_diff_eq!(est.corrected(&Vec3::new(1.0, 2.0, 3.0)).norm(), 0.0);
        assert_eq!(est.static_updates(), 1);
    }
}
