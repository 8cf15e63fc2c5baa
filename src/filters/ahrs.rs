//! Gradient-descent quaternion AHRS (Madgwick)
//!
//! The quaternion maps sensor-frame vectors into the world frame
//! (`v_world = q · v_sensor · q*`), world z up. Gyro integration always
//! runs; the gravity and heading corrections are each skipped on their own
//! when their input is unusable, so the filter never stalls.

use nalgebra::Quaternion;

use super::{Ahrs, FusionMode};
use crate::config::AhrsConfig;
use crate::types::{Quat, QuatGradient, ReferenceJacobian, Vec3};

const NORM_EPS: f64 = 1e-9;

#[derive(Clone, Debug)]
pub struct GradientDescent {
    quaternion: Quat,
    beta: f64,
    mag_trust: f64,
    accel_min_g: f64,
    accel_max_g: f64,
    align_pending: bool,
}

impl GradientDescent {
    pub fn new(config: &AhrsConfig) -> Self {
        Self {
            quaternion: Quat::identity(),
            beta: config.beta,
            mag_trust: config.mag_trust,
            accel_min_g: config.accel_min_g,
            accel_max_g: config.accel_max_g,
            align_pending: config.align_on_first_sample,
        }
    }

    pub fn orientation(&self) -> Quat {
        self.quaternion
    }

    pub fn set_orientation(&mut self, quat: Quat) {
        self.quaternion = quat;
        self.align_pending = false;
    }

    pub fn set_mag_trust(&mut self, trust: f64) {
        self.mag_trust = trust.clamp(0.0, 1.0);
    }

    /// Snap roll and pitch to the measured gravity direction, yaw zero.
    pub fn align_to_gravity(&mut self, accel_g: &Vec3) -> bool {
        let Some(a) = accel_g.try_normalize(NORM_EPS) else {
            return false;
        };
        let roll = a.y.atan2(a.z);
        let pitch = (-a.x).atan2((a.y * a.y + a.z * a.z).sqrt());
        self.quaternion = Quat::from_euler_angles(roll, pitch, 0.0);
        self.align_pending = false;
        true
    }

    /// One filter step. `gyro_rad` is bias-corrected, `mag_ut` is
    /// iron-corrected (or `None` for 6-DOF operation).
    pub fn step(&mut self, gyro_rad: &Vec3, accel_g: &Vec3, mag_ut: Option<&Vec3>, dt: f64) -> Quat {
        if !(dt.is_finite() && dt > 0.0) {
            return self.quaternion;
        }

        let accel_norm = accel_g.norm();
        let accel_usable = accel_norm >= self.accel_min_g && accel_norm <= self.accel_max_g;
        if self.align_pending && accel_usable {
            self.align_to_gravity(accel_g);
        }

        let gyro = if gyro_rad.iter().all(|v| v.is_finite()) {
            *gyro_rad
        } else {
            Vec3::zeros()
        };

        let q = *self.quaternion.quaternion();
        let mut q_dot = q * Quaternion::from_parts(0.0, gyro) * 0.5;

        if accel_usable {
            if let Some(a) = accel_g.try_normalize(NORM_EPS) {
                if let Some(step) = accel_gradient(&q, &a).try_normalize(NORM_EPS) {
                    q_dot -= as_quaternion(&step) * self.beta;
                }
            }
        }

        if let Some(mag) = mag_ut {
            if self.mag_trust > 0.0 {
                if let Some(m) = mag.try_normalize(NORM_EPS) {
                    let h = self.quaternion.transform_vector(&m);
                    let bx = (h.x * h.x + h.y * h.y).sqrt();
                    if let Some(step) = mag_gradient(&q, &m, bx, h.z).try_normalize(NORM_EPS) {
                        q_dot -= as_quaternion(&step) * (self.beta * self.mag_trust);
                    }
                }
            }
        }

        let integrated = q + q_dot * dt;
        if integrated.coords.iter().all(|v| v.is_finite()) {
            if let Some(unit) = Quat::try_new(integrated, NORM_EPS) {
                self.quaternion = unit;
            }
        }
        self.quaternion
    }
}

fn as_quaternion(g: &QuatGradient) -> Quaternion<f64> {
    Quaternion::new(g[0], g[1], g[2], g[3])
}

/// Jᵀf for the gravity reference [0, 0, 1]; components ordered (w, x, y, z).
fn accel_gradient(q: &Quaternion<f64>, a: &Vec3) -> QuatGradient {
    let (q0, q1, q2, q3) = (q.w, q.i, q.j, q.k);

    let f = Vec3::new(
        2.0 * (q1 * q3 - q0 * q2) - a.x,
        2.0 * (q0 * q1 + q2 * q3) - a.y,
        2.0 * (0.5 - q1 * q1 - q2 * q2) - a.z,
    );

    let j = ReferenceJacobian::new(
        -2.0 * q2, 2.0 * q3, -2.0 * q0, 2.0 * q1,
        2.0 * q1, 2.0 * q0, 2.0 * q3, 2.0 * q2,
        0.0, -4.0 * q1, -4.0 * q2, 0.0,
    );

    j.transpose() * f
}

/// Jᵀf for the Earth-field reference [bx, 0, bz].
fn mag_gradient(q: &Quaternion<f64>, m: &Vec3, bx: f64, bz: f64) -> QuatGradient {
    let (q0, q1, q2, q3) = (q.w, q.i, q.j, q.k);

    let f = Vec3::new(
        2.0 * bx * (0.5 - q2 * q2 - q3 * q3) + 2.0 * bz * (q1 * q3 - q0 * q2) - m.x,
        2.0 * bx * (q1 * q2 - q0 * q3) + 2.0 * bz * (q0 * q1 + q2 * q3) - m.y,
        2.0 * bx * (q0 * q2 + q1 * q3) + 2.0 * bz * (0.5 - q1 * q1 - q2 * q2) - m.z,
    );

    let j = ReferenceJacobian::new(
        -2.0 * bz * q2,
        2.0 * bz * q3,
        -4.0 * bx * q2 - 2.0 * bz * q0,
        -4.0 * bx * q3 + 2.0 * bz * q1,
        -2.0 * bx * q3 + 2.0 * bz * q1,
        2.0 * bx * q2 + 2.0 * bz * q0,
        2.0 * bx * q1 + 2.0 * bz * q3,
        -2.0 * bx * q0 + 2.0 * bz * q2,
        2.0 * bx * q2,
        2.0 * bx * q3 - 4.0 * bz * q1,
        2.0 * bx * q0 - 4.0 * bz * q2,
        2.0 * bx * q1,
    );

    j.transpose() * f
}

/// 6-DOF: gyro + accelerometer.
#[derive(Clone, Debug)]
pub struct ImuAhrs {
    core: GradientDescent,
}

impl ImuAhrs {
    pub fn new(config: &AhrsConfig) -> Self {
        Self {
            core: GradientDescent::new(config),
        }
    }
}

impl Ahrs for ImuAhrs {
    fn mode(&self) -> FusionMode {
        FusionMode::Imu
    }

    fn orientation(&self) -> Quat {
        self.core.orientation()
    }

    fn set_orientation(&mut self, quat: Quat) {
        self.core.set_orientation(quat);
    }

    fn update(&mut self, gyro_rad: &Vec3, accel_g: &Vec3, _mag_ut: Option<&Vec3>, dt: f64) -> Quat {
        self.core.step(gyro_rad, accel_g, None, dt)
    }
}

/// 9-DOF: adds the magnetometer heading term, weighted by `mag_trust`.
#[derive(Clone, Debug)]
pub struct MargAhrs {
    core: GradientDescent,
}

impl MargAhrs {
    pub fn new(config: &AhrsConfig) -> Self {
        Self {
            core: GradientDescent::new(config),
        }
    }

    pub fn set_mag_trust(&mut self, trust: f64) {
        self.core.set_mag_trust(trust);
    }
}

impl Ahrs for MargAhrs {
    fn mode(&self) -> FusionMode {
        FusionMode::Marg
    }

    fn orientation(&self) -> Quat {
        self.core.orientation()
    }

    fn set_orientation(&mut self, quat: Quat) {
        self.core.set_orientation(quat);
    }

    fn update(&mut self, gyro_rad: &Vec3, accel_g: &Vec3, mag_ut: Option<&Vec3>, dt: f64) -> Quat {
        self.core.step(gyro_rad, accel_g, mag_ut, dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const DT: f64 = 0.01;

    fn config(align: bool) -> AhrsConfig {
        AhrsConfig {
            align_on_first_sample: align,
            ..AhrsConfig::default()
        }
    }

    fn gravity_for(roll: f64, pitch: f64) -> Vec3 {
        Quat::from_euler_angles(roll, pitch, 0.0).inverse_transform_vector(&Vec3::z())
    }

    #[test]
    fn test_level_static_stays_identity() {
        let mut ahrs = ImuAhrs::new(&config(true));
        for _ in 0..500 {
            ahrs.update(&Vec3::zeros(), &Vec3::z(), None, DT);
        }
        assert_abs_diff_eq!(ahrs.orientation().angle(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_converges_to_tilt() {
        let roll = 30f64.to_radians();
        let accel = gravity_for(roll, 0.0);
        let mut ahrs = ImuAhrs::new(&config(false));
        for _ in 0..2000 {
            ahrs.update(&Vec3::zeros(), &accel, None, DT);
        }
        let (r, p, _) = ahrs.orientation().euler_angles();
        assert_abs_diff_eq!(r.to_degrees(), 30.0, epsilon = 0.5);
        assert_abs_diff_eq!(p.to_degrees(), 0.0, epsilon = 0.5);
    }

    #[test]
    fn test_first_sample_alignment() {
        let accel = gravity_for(0.0, 20f64.to_radians());
        let mut ahrs = ImuAhrs::new(&config(true));
        ahrs.update(&Vec3::zeros(), &accel, None, DT);
        let (r, p, y) = ahrs.orientation().euler_angles();
        assert_abs_diff_eq!(r.to_degrees(), 0.0, epsilon = 0.5);
        assert_abs_diff_eq!(p.to_degrees(), 20.0, epsilon = 0.5);
        assert_abs_diff_eq!(y.to_degrees(), 0.0, epsilon = 0.5);
    }

    #[test]
    fn test_gyro_integration_yaw() {
        let mut ahrs = ImuAhrs::new(&config(true));
        let gyro = Vec3::new(0.0, 0.0, 90f64.to_radians());
        for _ in 0..100 {
            ahrs.update(&gyro, &Vec3::z(), None, DT);
        }
        let (_, _, yaw) = ahrs.orientation().euler_angles();
        assert_abs_diff_eq!(yaw.to_degrees(), 90.0, epsilon = 0.5);
    }

    #[test]
    fn test_zero_accel_still_integrates() {
        let mut ahrs = ImuAhrs::new(&config(false));
        let gyro = Vec3::new(0.0, 0.0, 1.0);
        for _ in 0..50 {
            ahrs.update(&gyro, &Vec3::zeros(), None, DT);
        }
        let (_, _, yaw) = ahrs.orientation().euler_angles();
        assert_abs_diff_eq!(yaw, 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_degenerate_inputs_keep_last_quaternion() {
        let mut ahrs = ImuAhrs::new(&config(false));
        let before = ahrs.update(&Vec3::new(0.1, 0.0, 0.0), &Vec3::z(), None, DT);
        assert_eq!(ahrs.update(&Vec3::new(1.0, 2.0, 3.0), &Vec3::z(), None, f64::NAN), before);
        assert_eq!(ahrs.update(&Vec3::new(1.0, 2.0, 3.0), &Vec3::z(), None, 0.0), before);

        let after = ahrs.update(&Vec3::new(f64::NAN, 0.0, 0.0), &Vec3::new(0.0, 0.0, f64::NAN), None, DT);
        assert!(after.coords.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_norm_preserved() {
        let mut ahrs = MargAhrs::new(&config(true));
        for i in 0..2000 {
            let t = i as f64 * DT;
            let gyro = Vec3::new(t.sin(), (2.0 * t).cos(), 0.3 * (0.5 * t).sin());
            let accel = Vec3::new(0.2 * t.cos(), 0.1 * t.sin(), 0.98);
            let mag = Vec3::new(20.0 + t.sin(), 3.0, -40.0);
            let q = ahrs.update(&gyro, &accel, Some(&mag), DT);
            assert_abs_diff_eq!(q.quaternion().norm(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_zero_mag_trust_matches_imu() {
        let cfg = AhrsConfig {
            mag_trust: 0.0,
            ..config(true)
        };
        let mut imu = ImuAhrs::new(&cfg);
        let mut marg = MargAhrs::new(&cfg);
        let mag = Vec3::new(25.0, -5.0, -38.0);
        for i in 0..300 {
            let t = i as f64 * DT;
            let gyro = Vec3::new(0.2 * t.sin(), 0.1, -0.05);
            let accel = Vec3::new(0.05, -0.1 * t.cos(), 1.0);
            let a = imu.update(&gyro, &accel, Some(&mag), DT);
            let b = marg.update(&gyro, &accel, Some(&mag), DT);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_marg_converges_to_magnetic_heading() {
        let cfg = AhrsConfig {
            mag_trust: 1.0,
            ..config(false)
        };
        let mut marg = MargAhrs::new(&cfg);
        marg.set_orientation(Quat::from_euler_angles(0.0, 0.0, 40f64.to_radians()));
        let mag = Vec3::new(20.0, 0.0, -40.0);
        for _ in 0..3000 {
            marg.update(&Vec3::zeros(), &Vec3::z(), Some(&mag), DT);
        }
        let (r, p, y) = marg.orientation().euler_angles();
        assert_abs_diff_eq!(y.to_degrees(), 0.0, epsilon = 2.0);
        assert_abs_diff_eq!(r.to_degrees(), 0.0, epsilon = 2.0);
        assert_abs_diff_eq!(p.to_degrees(), 0.0, epsilon = 2.0);
    }
}
