//! Phase 1: bounded min/max ellipsoid fit
//!
//! Hard iron is the box centre, soft iron a diagonal scale that equalizes the
//! three axis ranges. Cheap enough to run on every sample.

use std::collections::VecDeque;

use super::QualityMetric;
use crate::config::CalibrationConfig;
use crate::types::{Mat3, Vec3};

const MIN_RANGE_UT: f64 = 1e-6;

/// Readings kept for re-binning octants when the running centre moves.
const OCTANT_HISTORY: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EllipsoidSolution {
    pub hard_iron_ut: Vec3,
    pub soft_iron: Mat3,
    pub sphericity: f64,
    pub octant_coverage: f64,
    pub samples: usize,
}

/// A failed quality gate: the metric, its value and the threshold it missed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualityShortfall {
    pub metric: QualityMetric,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Clone, Debug)]
pub struct EllipsoidFit {
    min: Vec3,
    max: Vec3,
    count: usize,
    octants: u8,
    /// Octants are taken around the last accepted offset. Without one they
    /// follow the running box centre, re-binned from `recent` when it moves.
    reference_offset: Option<Vec3>,
    recent: VecDeque<Vec3>,
    binned_centre: Option<Vec3>,
}

impl EllipsoidFit {
    pub fn new(reference_offset: Option<Vec3>) -> Self {
        Self {
            min: Vec3::repeat(f64::INFINITY),
            max: Vec3::repeat(f64::NEG_INFINITY),
            count: 0,
            octants: 0,
            reference_offset,
            recent: VecDeque::new(),
            binned_centre: None,
        }
    }

    /// Returns false (and ignores the reading) for non-finite input.
    pub fn add(&mut self, mag_ut: &Vec3) -> bool {
        if !mag_ut.iter().all(|v| v.is_finite()) {
            return false;
        }
        self.min = self.min.inf(mag_ut);
        self.max = self.max.sup(mag_ut);
        self.count += 1;

        match self.reference_offset {
            Some(reference) => self.octants |= 1 << octant(&(mag_ut - reference)),
            None => {
                if self.recent.len() == OCTANT_HISTORY {
                    self.recent.pop_front();
                }
                self.recent.push_back(*mag_ut);
                let centre = self.hard_iron();
                if self.binned_centre == Some(centre) {
                    self.octants |= 1 << octant(&(mag_ut - centre));
                } else {
                    self.octants = self
                        .recent
                        .iter()
                        .fold(0, |mask, r| mask | 1 << octant(&(r - centre)));
                    self.binned_centre = Some(centre);
                }
            }
        }
        true
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn octant_coverage(&self) -> f64 {
        self.octants.count_ones() as f64 / 8.0
    }

    pub fn ranges(&self) -> Vec3 {
        if self.count == 0 {
            return Vec3::zeros();
        }
        self.max - self.min
    }

    /// Smallest axis range over the largest; 0 until there is any spread.
    pub fn sphericity(&self) -> f64 {
        let ranges = self.ranges();
        let largest = ranges.max();
        if largest < MIN_RANGE_UT {
            return 0.0;
        }
        ranges.min() / largest
    }

    pub fn hard_iron(&self) -> Vec3 {
        if self.count == 0 {
            return Vec3::zeros();
        }
        (self.max + self.min) * 0.5
    }

    pub fn soft_iron(&self) -> Option<Mat3> {
        let ranges = self.ranges();
        if ranges.min() < MIN_RANGE_UT {
            return None;
        }
        let avg = ranges.sum() / 3.0;
        Some(Mat3::from_diagonal(&ranges.map(|r| avg / r)))
    }

    pub fn is_usable(&self, config: &CalibrationConfig) -> bool {
        self.count >= config.ellipsoid_min_samples
            && self.octant_coverage() >= config.min_octant_coverage
    }

    /// The first gate the fit currently fails, or the accepted solution.
    pub fn evaluate(&self, config: &CalibrationConfig) -> Result<EllipsoidSolution, QualityShortfall> {
        if self.count < config.ellipsoid_min_samples {
            return Err(QualityShortfall {
                metric: QualityMetric::SampleCount,
                value: self.count as f64,
                threshold: config.ellipsoid_min_samples as f64,
            });
        }
        let coverage = self.octant_coverage();
        if coverage < config.min_octant_coverage {
            return Err(QualityShortfall {
                metric: QualityMetric::OctantCoverage,
                value: coverage,
                threshold: config.min_octant_coverage,
            });
        }
        let sphericity = self.sphericity();
        let soft_iron = match self.soft_iron() {
            Some(s) if sphericity >= config.min_sphericity => s,
            _ => {
                return Err(QualityShortfall {
                    metric: QualityMetric::Sphericity,
                    value: sphericity,
                    threshold: config.min_sphericity,
                })
            }
        };

        Ok(EllipsoidSolution {
            hard_iron_ut: self.hard_iron(),
            soft_iron,
            sphericity,
            octant_coverage: coverage,
            samples: self.count,
        })
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.reference_offset);
    }
}

/// Sign octant 0..8; a zero component counts as positive.
fn octant(v: &Vec3) -> u8 {
    (v.x < 0.0) as u8 | ((v.y < 0.0) as u8) << 1 | ((v.z < 0.0) as u8) << 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn config(min_samples: usize) -> CalibrationConfig {
        CalibrationConfig {
            ellipsoid_min_samples: min_samples,
            ellipsoid_max_samples: min_samples * 10,
            ..CalibrationConfig::default()
        }
    }

    /// Points on an axis-aligned ellipsoid centred on `offset`.
    fn ellipsoid_points(offset: Vec3, radii: Vec3, n: usize) -> Vec<Vec3> {
        let mut points = Vec::with_capacity(n);
        // Fibonacci sphere, plus the six poles so the box is tight
        let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
        for i in 0..n {
            let z = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - z * z).sqrt();
            let theta = golden * i as f64;
            let unit = Vec3::new(r * theta.cos(), r * theta.sin(), z);
            points.push(offset + unit.component_mul(&radii));
        }
        for axis in 0..3 {
            for sign in [-1.0, 1.0] {
                let mut unit = Vec3::zeros();
                unit[axis] = sign;
                points.push(offset + unit.component_mul(&radii));
            }
        }
        points
    }

    #[test]
    fn test_recovers_hard_iron_and_scales() {
        let offset = Vec3::new(12.0, -8.0, 30.0);
        let radii = Vec3::new(60.0, 45.0, 50.0);
        let mut fit = EllipsoidFit::new(None);
        for p in ellipsoid_points(offset, radii, 400) {
            fit.add(&p);
        }

        let solution = fit.evaluate(&config(200)).expect("fit should pass");
        assert_abs_diff_eq!(solution.hard_iron_ut, offset, epsilon = 1e-9);

        // Scaled ranges are all equal to the average range
        let scaled = solution.soft_iron * fit.ranges();
        let avg = fit.ranges().sum() / 3.0;
        for axis in 0..3 {
            assert_abs_diff_eq!(scaled[axis], avg, epsilon = 1e-9);
        }
        assert_abs_diff_eq!(solution.sphericity, 45.0 / 60.0, epsilon = 1e-9);
    }

    #[test]
    fn test_usable_exactly_at_coverage_threshold() {
        let cfg = config(20);
        let mut fit = EllipsoidFit::new(Some(Vec3::zeros()));
        // Five of the eight octants
        let five = [
            Vec3::new(1.0, 1.0, 1.0),
            Vec3::new(1.0, -1.0, 1.0),
            Vec3::new(1.0, 1.0, -1.0),
            Vec3::new(1.0, -1.0, -1.0),
            Vec3::new(-1.0, 1.0, 1.0),
        ];
        for i in 0..40 {
            fit.add(&(five[i % 5] * 40.0));
        }
        assert_abs_diff_eq!(fit.octant_coverage(), 5.0 / 8.0);
        assert!(!fit.is_usable(&cfg));

        fit.add(&Vec3::new(-40.0, -40.0, 40.0));
        assert_abs_diff_eq!(fit.octant_coverage(), 6.0 / 8.0);
        assert!(fit.is_usable(&cfg));
    }

    #[test]
    fn test_min_samples_gate() {
        let mut fit = EllipsoidFit::new(None);
        for p in ellipsoid_points(Vec3::zeros(), Vec3::repeat(50.0), 50) {
            fit.add(&p);
        }
        let shortfall = fit.evaluate(&config(200)).unwrap_err();
        assert_eq!(shortfall.metric, QualityMetric::SampleCount);
        assert_eq!(shortfall.value, 56.0);
    }

    #[test]
    fn test_flat_cloud_fails_sphericity() {
        let mut fit = EllipsoidFit::new(None);
        for p in ellipsoid_points(Vec3::zeros(), Vec3::new(50.0, 50.0, 5.0), 300) {
            fit.add(&p);
        }
        let shortfall = fit.evaluate(&config(200)).unwrap_err();
        assert_eq!(shortfall.metric, QualityMetric::Sphericity);
        assert_abs_diff_eq!(shortfall.value, 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_octants_relative_to_reference_offset() {
        // Every reading is positive, but straddles the previous offset
        let reference = Vec3::new(100.0, 100.0, 100.0);
        let mut fit = EllipsoidFit::new(Some(reference));
        for p in ellipsoid_points(reference, Vec3::repeat(40.0), 64) {
            fit.add(&p);
        }
        assert_eq!(fit.octant_coverage(), 1.0);

        let mut stale = EllipsoidFit::new(Some(Vec3::zeros()));
        for p in ellipsoid_points(reference, Vec3::repeat(40.0), 64) {
            stale.add(&p);
        }
        assert_eq!(stale.octant_coverage(), 1.0 / 8.0);
    }

    #[test]
    fn test_fresh_fit_follows_running_centre() {
        // Offset larger than the field on x: no reading has a negative x
        let offset = Vec3::new(80.0, 0.0, 0.0);
        let mut fit = EllipsoidFit::new(None);
        for p in ellipsoid_points(offset, Vec3::repeat(50.0), 300) {
            fit.add(&p);
        }
        assert_eq!(fit.octant_coverage(), 1.0);
        let solution = fit.evaluate(&config(200)).expect("fit should pass");
        assert_abs_diff_eq!(solution.hard_iron_ut, offset, epsilon = 1e-9);
    }

    #[test]
    fn test_rebinning_limited_to_recent_history() {
        let mut fit = EllipsoidFit::new(None);
        for p in ellipsoid_points(Vec3::zeros(), Vec3::repeat(50.0), OCTANT_HISTORY * 2) {
            fit.add(&p);
        }
        assert!(fit.recent.len() <= OCTANT_HISTORY);
        assert_eq!(fit.count(), OCTANT_HISTORY * 2 + 6);
    }

    #[test]
    fn test_non_finite_ignored() {
        let mut fit = EllipsoidFit::new(None);
        assert!(!fit.add(&Vec3::new(f64::NAN, 0.0, 0.0)));
        assert_eq!(fit.count(), 0);
        assert_eq!(fit.sphericity(), 0.0);
        assert!(fit.soft_iron().is_none());
    }
}
