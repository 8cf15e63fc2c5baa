use crate::config::DriftConfig;
use crate::types::Vec3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DriftOutcome {
    /// Not enough background samples yet
    Warming,
    Stable { drift_ut: f64 },
    /// Small drift: move the stored field by `nudge_ut`. `started` marks the
    /// first sample of a correction run.
    Correct { drift_ut: f64, nudge_ut: Vec3, started: bool },
    /// Large drift, reported once until the drift recovers or the field is replaced
    RecalibrationRecommended { drift_ut: f64 },
}

/// Slow background estimate of the reference-frame field, compared against
/// the stored Earth field.
///
/// Fed only while the device is still and no magnet is detected, so what it
/// averages is the environment rather than the user.
#[derive(Clone, Debug)]
pub struct DriftTracker {
    config: DriftConfig,
    estimate: Option<Vec3>,
    samples: u64,
    correcting: bool,
    recommended: bool,
}

impl DriftTracker {
    pub fn new(config: &DriftConfig) -> Self {
        Self {
            config: config.clone(),
            estimate: None,
            samples: 0,
            correcting: false,
            recommended: false,
        }
    }

    pub fn observe(&mut self, reference_ut: &Vec3, stored_ut: &Vec3) -> DriftOutcome {
        if !reference_ut.iter().all(|v| v.is_finite()) {
            return DriftOutcome::Warming;
        }
        let alpha = self.config.ema_alpha;
        let estimate = match self.estimate {
            Some(prev) => prev + (reference_ut - prev) * alpha,
            None => *reference_ut,
        };
        self.estimate = Some(estimate);
        self.samples += 1;
        if self.samples < self.config.min_samples {
            return DriftOutcome::Warming;
        }

        let offset = estimate - stored_ut;
        let drift_ut = offset.norm();

        if drift_ut > self.config.recalibration_threshold_ut {
            self.correcting = false;
            if self.recommended {
                return DriftOutcome::Stable { drift_ut };
            }
            self.recommended = true;
            return DriftOutcome::RecalibrationRecommended { drift_ut };
        }

        if drift_ut < self.config.auto_correct_threshold_ut {
            self.recommended = false;
            if self.config.auto_correct_rate > 0.0 && drift_ut > f64::EPSILON {
                let started = !self.correcting;
                self.correcting = true;
                return DriftOutcome::Correct {
                    drift_ut,
                    nudge_ut: offset * self.config.auto_correct_rate,
                    started,
                };
            }
        }
        self.correcting = false;
        DriftOutcome::Stable { drift_ut }
    }

    pub fn drift_ut(&self, stored_ut: &Vec3) -> Option<f64> {
        if self.samples < self.config.min_samples {
            return None;
        }
        self.estimate.map(|e| (e - stored_ut).norm())
    }

    pub fn reset(&mut self) {
        self.estimate = None;
        self.samples = 0;
        self.correcting = false;
        self.recommended = false;
    }
}
