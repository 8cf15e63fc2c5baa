use serde::{Deserialize, Serialize};

use crate::config::SmoothingConfig;
use crate::types::{Mat3, SmoothGain, SmoothMeasureMat, SmoothStateMat, SmoothStateVec, Vec3};

/// Which 3-vector the pipeline smooths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingTarget {
    #[default]
    Residual,
    CalibratedField,
}

/// Constant-velocity Kalman filter on a 3-vector
///
/// State is `[p, v]`. Process noise is white acceleration with spectral
/// density `q`, measurement noise `r·I` on `p`. The covariance update uses the
/// Joseph form so P stays symmetric positive semi-definite.
#[derive(Clone, Debug)]
pub struct KalmanFilter3d {
    state: SmoothStateVec,
    covariance: SmoothStateMat,
    process_noise: f64,
    measurement_noise: f64,
    initialized: bool,
}

impl KalmanFilter3d {
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            state: SmoothStateVec::zeros(),
            covariance: SmoothStateMat::identity(),
            process_noise,
            measurement_noise,
            initialized: false,
        }
    }

    pub fn from_config(config: &SmoothingConfig) -> Self {
        Self::new(config.process_noise, config.measurement_noise)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn position(&self) -> Vec3 {
        self.state.fixed_rows::<3>(0).into_owned()
    }

    pub fn velocity(&self) -> Vec3 {
        self.state.fixed_rows::<3>(3).into_owned()
    }

    pub fn covariance(&self) -> &SmoothStateMat {
        &self.covariance
    }

    pub fn predict(&mut self, dt: f64) {
        if !(dt.is_finite() && dt > 0.0) {
            return;
        }
        let mut f = SmoothStateMat::identity();
        f.fixed_view_mut::<3, 3>(0, 3).copy_from(&(Mat3::identity() * dt));

        let q = self.process_noise;
        let (dt2, dt3) = (dt * dt, dt * dt * dt);
        let mut qm = SmoothStateMat::zeros();
        qm.fixed_view_mut::<3, 3>(0, 0).copy_from(&(Mat3::identity() * (q * dt3 / 3.0)));
        qm.fixed_view_mut::<3, 3>(0, 3).copy_from(&(Mat3::identity() * (q * dt2 / 2.0)));
        qm.fixed_view_mut::<3, 3>(3, 0).copy_from(&(Mat3::identity() * (q * dt2 / 2.0)));
        qm.fixed_view_mut::<3, 3>(3, 3).copy_from(&(Mat3::identity() * (q * dt)));

        self.state = f * self.state;
        self.covariance = f * self.covariance * f.transpose() + qm;
    }

    /// Returns false if the measurement was not used.
    pub fn update(&mut self, measurement: &Vec3) -> bool {
        if !measurement.iter().all(|v| v.is_finite()) {
            return false;
        }
        if !self.initialized {
            self.state = SmoothStateVec::zeros();
            self.state.fixed_rows_mut::<3>(0).copy_from(measurement);
            self.covariance = SmoothStateMat::identity() * self.measurement_noise;
            self.initialized = true;
            return true;
        }

        let mut h = SmoothMeasureMat::zeros();
        h.fixed_view_mut::<3, 3>(0, 0).copy_from(&Mat3::identity());
        let r = Mat3::identity() * self.measurement_noise;

        let innovation = measurement - h * self.state;
        let s = h * self.covariance * h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            return false; // Singular innovation covariance
        };
        let k: SmoothGain = self.covariance * h.transpose() * s_inv;

        self.state += k * innovation;

        // Joseph form
        let i_minus_kh = SmoothStateMat::identity() - k * h;
        self.covariance = i_minus_kh * self.covariance * i_minus_kh.transpose() + k * r * k.transpose();
        true
    }

    /// Predict by `dt`, then fold in `measurement`. Returns the filtered value.
    pub fn step(&mut self, measurement: &Vec3, dt: f64) -> Option<Vec3> {
        if self.initialized {
            self.predict(dt);
        }
        if self.update(measurement) || self.initialized {
            Some(self.position())
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.state = SmoothStateVec::zeros();
        self.covariance = SmoothStateMat::identity();
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_first_measurement_initializes() {
        let mut kf = KalmanFilter3d::new(1.0, 4.0);
        assert!(!kf.is_initialized());
        let out = kf.step(&Vec3::new(1.0, 2.0, 3.0), 0.02).expect("initialized");
        assert_eq!(out, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(kf.velocity(), Vec3::zeros());
    }

    #[test]
    fn test_constant_signal_converges() {
        let mut kf = KalmanFilter3d::new(1.0, 4.0);
        kf.step(&Vec3::zeros(), 0.02);
        let target = Vec3::new(10.0, -5.0, 2.0);
        let mut out = Vec3::zeros();
        for _ in 0..500 {
            out = kf.step(&target, 0.02).expect("initialized");
        }
        assert_abs_diff_eq!(out, target, epsilon = 0.05);
    }

    #[test]
    fn test_noise_is_attenuated() {
        let mut kf = KalmanFilter3d::new(0.1, 4.0);
        let mut raw_dev = 0.0;
        let mut filtered_dev = 0.0;
        for i in 0..400 {
            let noise = if i % 2 == 0 { 2.0 } else { -2.0 };
            let z = Vec3::new(30.0 + noise, 0.0, 0.0);
            let out = kf.step(&z, 0.02).expect("initialized");
            if i >= 200 {
                raw_dev += noise.abs();
                filtered_dev += (out.x - 30.0).abs();
            }
        }
        assert!(filtered_dev < raw_dev * 0.5);
    }

    #[test]
    fn test_covariance_stays_symmetric() {
        let mut kf = KalmanFilter3d::new(5.0, 0.5);
        for i in 0..300 {
            let t = i as f64 * 0.01;
            kf.step(&Vec3::new(t.sin(), t.cos(), t), 0.01);
        }
        let p = kf.covariance();
        assert_abs_diff_eq!(*p, p.transpose(), epsilon = 1e-9);
        assert!((0..6).all(|i| p[(i, i)] > 0.0));
    }

    #[test]
    fn test_nan_measurement_skipped() {
        let mut kf = KalmanFilter3d::new(1.0, 4.0);
        assert!(kf.step(&Vec3::new(f64::NAN, 0.0, 0.0), 0.02).is_none());
        kf.step(&Vec3::new(1.0, 1.0, 1.0), 0.02);
        let out = kf.step(&Vec3::new(f64::NAN, 0.0, 0.0), 0.02).expect("still initialized");
        assert!(out.iter().all(|v| v.is_finite()));
    }
}
