//! Phase 2: orientation-aware refinement
//!
//! Given iron-corrected readings `c` and the orientation each was taken at,
//! find a full correction matrix `S`, an offset `o` and a reference-frame
//! Earth field `E` such that `S(c − o) ≈ M(q)·E`, where `M(q)` rotates
//! reference vectors into the sensor frame. The optimizer works in units of the
//! mean corrected magnitude and keeps `|E| = 1`, which rules out the trivial
//! all-zero solution.

use super::ellipsoid::QualityShortfall;
use super::QualityMetric;
use crate::config::CalibrationConfig;
use crate::residual::QuaternionFrame;
use crate::types::{Mat3, Quat, Vec3};

/// Below this the optimizer has nothing to constrain a 3×3 matrix with.
pub const MIN_REFINEMENT_PAIRS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefinementPair {
    pub corrected_ut: Vec3,
    pub to_sensor: Mat3,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefinementSolution {
    pub matrix: Mat3,
    pub offset_ut: Vec3,
    pub earth_field_ut: Vec3,
    pub rms_ut: f64,
    pub iterations: usize,
}

#[derive(Clone, Debug)]
pub struct RefinementCollector {
    pairs: Vec<RefinementPair>,
    last_pose: Option<Quat>,
    min_pose_change_rad: f64,
    target: usize,
}

impl RefinementCollector {
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            pairs: Vec::with_capacity(config.refinement_pairs),
            last_pose: None,
            min_pose_change_rad: config.min_pose_change_deg.to_radians(),
            target: config.refinement_pairs,
        }
    }

    /// Keeps the pair only if the pose moved enough since the last one kept.
    pub fn add(&mut self, corrected_ut: &Vec3, orientation: &Quat, frame: QuaternionFrame) -> bool {
        if !corrected_ut.iter().all(|v| v.is_finite()) {
            return false;
        }
        if let Some(last) = &self.last_pose {
            if last.angle_to(orientation) < self.min_pose_change_rad {
                return false;
            }
        }
        self.pairs.push(RefinementPair {
            corrected_ut: *corrected_ut,
            to_sensor: frame.to_sensor_matrix(orientation),
        });
        self.last_pose = Some(*orientation);
        true
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn is_full(&self) -> bool {
        self.pairs.len() >= self.target
    }

    pub fn pairs(&self) -> &[RefinementPair] {
        &self.pairs
    }

    pub fn reset(&mut self) {
        self.pairs.clear();
        self.last_pose = None;
    }
}

/// Gradient descent over (S, o, E). Fails with `SampleCount` on too few pairs
/// and `ResidualRms` when the final fit is worse than `max_residual_rms_ut`.
pub fn optimize(
    pairs: &[RefinementPair],
    config: &CalibrationConfig,
) -> Result<RefinementSolution, QualityShortfall> {
    if pairs.len() < MIN_REFINEMENT_PAIRS {
        return Err(QualityShortfall {
            metric: QualityMetric::SampleCount,
            value: pairs.len() as f64,
            threshold: MIN_REFINEMENT_PAIRS as f64,
        });
    }

    let n = pairs.len() as f64;
    let scale = pairs.iter().map(|p| p.corrected_ut.norm()).sum::<f64>() / n;
    let too_poor = |rms: f64| QualityShortfall {
        metric: QualityMetric::ResidualRms,
        value: rms,
        threshold: config.max_residual_rms_ut,
    };
    if !(scale.is_finite() && scale > f64::EPSILON) {
        return Err(too_poor(f64::INFINITY));
    }

    let c: Vec<Vec3> = pairs.iter().map(|p| p.corrected_ut / scale).collect();
    let initial = pairs
        .iter()
        .zip(&c)
        .fold(Vec3::zeros(), |acc, (p, c)| acc + p.to_sensor.transpose() * c);
    let Some(mut e) = initial.try_normalize(f64::EPSILON) else {
        return Err(too_poor(f64::INFINITY));
    };

    let mut s = Mat3::identity();
    let mut o = Vec3::zeros();
    let lr = config.learning_rate;
    let target_loss = (config.convergence_rms_ut / scale).powi(2);

    let mut loss = mean_squared_residual(pairs, &c, &s, &o, &e);
    let mut iterations = 0;
    while iterations < config.max_iterations && loss > target_loss {
        let mut grad_s = Mat3::zeros();
        let mut grad_o = Vec3::zeros();
        let mut grad_e = Vec3::zeros();
        for (pair, c) in pairs.iter().zip(&c) {
            let centred = c - o;
            let r = s * centred - pair.to_sensor * e;
            grad_s += r * centred.transpose();
            grad_o -= s.transpose() * r;
            grad_e -= pair.to_sensor.transpose() * r;
        }
        let k = 2.0 / n;
        s -= grad_s * (k * lr);
        o -= grad_o * (k * lr);
        e -= grad_e * (k * lr);
        e = match e.try_normalize(f64::EPSILON) {
            Some(unit) => unit,
            None => return Err(too_poor(f64::INFINITY)),
        };

        loss = mean_squared_residual(pairs, &c, &s, &o, &e);
        iterations += 1;
        if !loss.is_finite() {
            return Err(too_poor(f64::INFINITY));
        }
    }

    let rms_ut = loss.sqrt() * scale;
    log::debug!("Refinement: {} pairs, {} iterations, RMS {:.3} µT", pairs.len(), iterations, rms_ut);
    if rms_ut > config.max_residual_rms_ut {
        return Err(too_poor(rms_ut));
    }

    Ok(RefinementSolution {
        matrix: s,
        offset_ut: o * scale,
        earth_field_ut: e * scale,
        rms_ut,
        iterations,
    })
}

fn mean_squared_residual(pairs: &[RefinementPair], c: &[Vec3], s: &Mat3, o: &Vec3, e: &Vec3) -> f64 {
    let sum: f64 = pairs
        .iter()
        .zip(c)
        .map(|(p, c)| (s * (c - o) - p.to_sensor * e).norm_squared())
        .sum();
    sum / pairs.len() as f64
}
