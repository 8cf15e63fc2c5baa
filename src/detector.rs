use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::DetectorConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagnetStatus {
    #[default]
    None,
    Possible,
    Likely,
    Confirmed,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MagnetReading {
    pub status: MagnetStatus,
    /// Where the deviation sits inside the band of the reported status: 1 deep
    /// inside, 0.5 on a threshold, 0 a half band or more outside. Scaled
    /// down while a status change is pending. Comparable across statuses.
    /// [0, 1]
    pub confidence: f64,
    /// |windowed mean − baseline| of the residual magnitude
    pub deviation_ut: f64,
    pub baseline_ut: f64,
}

/// Classifies the residual magnitude against a baseline fixed at start-up.
///
/// The baseline is the mean of the first `baseline_samples` magnitudes and is
/// only ever replaced through `rebaseline`. A new status has to win
/// `hysteresis_samples` consecutive samples before it is reported.
#[derive(Clone, Debug)]
pub struct MagnetDetector {
    config: DetectorConfig,
    baseline_sum: f64,
    baseline_count: usize,
    baseline: Option<f64>,
    window: VecDeque<f64>,
    reported: MagnetStatus,
    pending: Option<(MagnetStatus, usize)>,
    last: Option<MagnetReading>,
}

impl MagnetDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            config: config.clone(),
            baseline_sum: 0.0,
            baseline_count: 0,
            baseline: None,
            window: VecDeque::with_capacity(config.window_size),
            reported: MagnetStatus::None,
            pending: None,
            last: None,
        }
    }

    pub fn baseline_ut(&self) -> Option<f64> {
        self.baseline
    }

    pub fn status(&self) -> MagnetStatus {
        self.reported
    }

    pub fn is_magnet_present(&self) -> bool {
        self.reported != MagnetStatus::None
    }

    /// Feed one residual magnitude. `None` while the baseline is still being
    /// collected.
    pub fn update(&mut self, residual_ut: f64) -> Option<MagnetReading> {
        if !residual_ut.is_finite() {
            return self.last;
        }

        let Some(baseline) = self.baseline else {
            self.baseline_sum += residual_ut;
            self.baseline_count += 1;
            if self.baseline_count >= self.config.baseline_samples {
                let baseline = self.baseline_sum / self.baseline_count as f64;
                log::info!("Magnet detector baseline {:.2} µT", baseline);
                self.baseline = Some(baseline);
            }
            return None;
        };

        self.window.push_back(residual_ut);
        while self.window.len() > self.config.window_size {
            self.window.pop_front();
        }
        let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
        let deviation = (mean - baseline).abs();
        let candidate = self.classify(deviation);

        if candidate == self.reported {
            self.pending = None;
        } else {
            let count = match self.pending {
                Some((status, n)) if status == candidate => n + 1,
                _ => 1,
            };
            if count >= self.config.hysteresis_samples {
                log::debug!("Magnet status {:?} -> {:?} ({:.1} µT)", self.reported, candidate, deviation);
                self.reported = candidate;
                self.pending = None;
            } else {
                self.pending = Some((candidate, count));
            }
        }

        let strength = self.band_position(self.reported, deviation);
        let settled = match self.pending {
            Some((_, n)) => 1.0 - n as f64 / self.config.hysteresis_samples as f64,
            None => 1.0,
        };

        let reading = MagnetReading {
            status: self.reported,
            confidence: (strength * settled).clamp(0.0, 1.0),
            deviation_ut: deviation,
            baseline_ut: baseline,
        };
        self.last = Some(reading);
        Some(reading)
    }

    fn classify(&self, deviation: f64) -> MagnetStatus {
        if deviation < self.config.possible_ut {
            MagnetStatus::None
        } else if deviation < self.config.likely_ut {
            MagnetStatus::Possible
        } else if deviation <= self.config.confirmed_ut {
            MagnetStatus::Likely
        } else {
            MagnetStatus::Confirmed
        }
    }

    /// Signed distance to the nearest edge of `status`'s band, in half band
    /// widths, mapped to [0, 1]. The open-ended bands use their lower
    /// threshold as width.
    fn band_position(&self, status: MagnetStatus, deviation: f64) -> f64 {
        let (possible, likely, confirmed) = (self.config.possible_ut, self.config.likely_ut, self.config.confirmed_ut);
        let (margin, half_width) = match status {
            MagnetStatus::None => (possible - deviation, possible),
            MagnetStatus::Possible => ((deviation - possible).min(likely - deviation), (likely - possible) / 2.0),
            MagnetStatus::Likely => ((deviation - likely).min(confirmed - deviation), (confirmed - likely) / 2.0),
            MagnetStatus::Confirmed => (deviation - confirmed, confirmed),
        };
        0.5 + 0.5 * (margin / half_width.max(f64::EPSILON)).clamp(-1.0, 1.0)
    }

    /// Explicitly start collecting a new baseline.
    pub fn rebaseline(&mut self) {
        *self = Self::new(&self.config);
    }
}
