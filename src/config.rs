//! Tunables for every pipeline stage.
//!
//! Each section carries its documented default in `Default` and its valid
//! range in `validate`. All sections deserialize with `#[serde(default)]`, so a
//! JSON file only needs the fields it overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::filters::FusionMode;
use crate::residual::QuaternionFrame;
use crate::smoothing::SmoothingTarget;

// ─── Pipeline ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Nominal stream rate, used when timestamps cannot give a dt. [1, 1000] Hz
    pub sample_rate_hz: f64,
    /// Larger timestamp gaps fall back to the nominal period. [0.001, 10] s
    pub max_dt_s: f64,
    pub units: UnitConfig,
    pub motion: MotionConfig,
    pub gyro_bias: GyroBiasConfig,
    pub ahrs: AhrsConfig,
    pub calibration: CalibrationConfig,
    pub residual: ResidualConfig,
    pub detector: DetectorConfig,
    pub smoothing: SmoothingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 50.0,
            max_dt_s: 0.5,
            units: UnitConfig::default(),
            motion: MotionConfig::default(),
            gyro_bias: GyroBiasConfig::default(),
            ahrs: AhrsConfig::default(),
            calibration: CalibrationConfig::default(),
            residual: ResidualConfig::default(),
            detector: DetectorConfig::default(),
            smoothing: SmoothingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn nominal_dt(&self) -> f64 {
        1.0 / self.sample_rate_hz
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("sample_rate_hz", self.sample_rate_hz, 1.0, 1000.0)?;
        check_range("max_dt_s", self.max_dt_s, 0.001, 10.0)?;
        self.units.validate()?;
        self.motion.validate()?;
        self.gyro_bias.validate()?;
        self.ahrs.validate()?;
        self.calibration.validate()?;
        self.detector.validate()?;
        self.smoothing.validate()?;
        Ok(())
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }
}

// ─── Unit conversion ─────────────────────────────────────────────────────────

/// Scale factors and the raw LSB envelope.
///
/// Defaults are for ±4 g accel, 245 deg/s gyro and a ±4 gauss magnetometer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// [1, 1e6]
    pub accel_lsb_per_g: f64,
    /// [0.01, 1e6]
    pub gyro_lsb_per_dps: f64,
    /// [0.01, 1e6]
    pub mag_lsb_per_ut: f64,
    /// Accel vectors shorter than this are flagged. [0, full_scale_lsb]
    pub accel_min_magnitude_lsb: f64,
    /// Gyro reads zero at rest, so the default disables the check.
    pub gyro_min_magnitude_lsb: f64,
    /// Mag vectors shorter than this are flagged. [0, full_scale_lsb]
    pub mag_min_magnitude_lsb: f64,
    /// Any axis with a larger absolute value is flagged. [1, 2^31]
    pub full_scale_lsb: f64,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            accel_lsb_per_g: 8192.0,
            gyro_lsb_per_dps: 114.28,
            mag_lsb_per_ut: 68.42,
            accel_min_magnitude_lsb: 256.0,
            gyro_min_magnitude_lsb: 0.0,
            mag_min_magnitude_lsb: 340.0,
            full_scale_lsb: 32768.0,
        }
    }
}

impl UnitConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_range("units.accel_lsb_per_g", self.accel_lsb_per_g, 1.0, 1e6)?;
        check_range("units.gyro_lsb_per_dps", self.gyro_lsb_per_dps, 0.01, 1e6)?;
        check_range("units.mag_lsb_per_ut", self.mag_lsb_per_ut, 0.01, 1e6)?;
        check_range("units.full_scale_lsb", self.full_scale_lsb, 1.0, 2_147_483_648.0)?;
        check_range("units.accel_min_magnitude_lsb", self.accel_min_magnitude_lsb, 0.0, self.full_scale_lsb)?;
        check_range("units.gyro_min_magnitude_lsb", self.gyro_min_magnitude_lsb, 0.0, self.full_scale_lsb)?;
        check_range("units.mag_min_magnitude_lsb", self.mag_min_magnitude_lsb, 0.0, self.full_scale_lsb)?;
        Ok(())
    }
}

// ─── Motion detection ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Sliding window length in samples. [2, 1000]
    pub window_size: usize,
    /// Std-dev of |accel| above which the device is moving. (0, 2] g
    pub accel_std_threshold_g: f64,
    /// Std-dev of |gyro| above which the device is moving. (0, 500] deg/s
    pub gyro_std_threshold_dps: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            accel_std_threshold_g: 0.03,
            gyro_std_threshold_dps: 3.0,
        }
    }
}

impl MotionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_range("motion.window_size", self.window_size as f64, 2.0, 1000.0)?;
        check_range("motion.accel_std_threshold_g", self.accel_std_threshold_g, f64::MIN_POSITIVE, 2.0)?;
        check_range("motion.gyro_std_threshold_dps", self.gyro_std_threshold_dps, f64::MIN_POSITIVE, 500.0)?;
        Ok(())
    }
}

// ─── Gyro bias ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GyroBiasConfig {
    /// EMA rate per static sample. Too small and the bias takes minutes to
    /// settle, which shows up as yaw drift after power-on. (0, 1]
    pub alpha: f64,
    /// Static samples before the estimate is reported as converged. [0, 1e6]
    pub min_static_samples: u64,
}

impl Default for GyroBiasConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            min_static_samples: 50,
        }
    }
}

impl GyroBiasConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_range("gyro_bias.alpha", self.alpha, f64::MIN_POSITIVE, 1.0)?;
        check_range("gyro_bias.min_static_samples", self.min_static_samples as f64, 0.0, 1e6)?;
        Ok(())
    }
}

// ─── Orientation filter ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AhrsConfig {
    pub mode: FusionMode,
    /// Gradient-descent gain for the gravity correction. [0, 10]
    pub beta: f64,
    /// Weight of the magnetometer correction relative to beta. Finger magnets
    /// corrupt heading, so this must be able to go to zero. [0, 1]
    pub mag_trust: f64,
    /// Accel correction only runs inside [accel_min_g, accel_max_g].
    pub accel_min_g: f64,
    pub accel_max_g: f64,
    /// Seed roll/pitch from the first usable accelerometer sample.
    pub align_on_first_sample: bool,
}

impl Default for AhrsConfig {
    fn default() -> Self {
        Self {
            mode: FusionMode::Imu,
            beta: 0.1,
            mag_trust: 0.3,
            accel_min_g: 0.75,
            accel_max_g: 1.25,
            align_on_first_sample: true,
        }
    }
}

impl AhrsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_range("ahrs.beta", self.beta, 0.0, 10.0)?;
        check_range("ahrs.mag_trust", self.mag_trust, 0.0, 1.0)?;
        check_range("ahrs.accel_min_g", self.accel_min_g, 0.0, 1.0)?;
        check_range("ahrs.accel_max_g", self.accel_max_g, 1.0, 16.0)?;
        Ok(())
    }
}

// ─── Magnetometer calibration ────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Phase 1 is not usable below this many samples. [1, 1e6]
    pub ellipsoid_min_samples: usize,
    /// Phase 1 is rejected if sphericity still fails here. >= min samples
    pub ellipsoid_max_samples: usize,
    /// Fraction of the 8 sign octants that must be visited. [0.125, 1]
    pub min_octant_coverage: f64,
    /// min range / max range. [0, 1]
    pub min_sphericity: f64,

    /// Pairs collected before the Phase 2 optimizer runs. [10, 100000]
    pub refinement_pairs: usize,
    /// Rotation required between two collected pairs. [0, 90] deg
    pub min_pose_change_deg: f64,
    /// [1, 100000]
    pub max_iterations: usize,
    /// Step size in field-normalized units. (0, 1]
    pub learning_rate: f64,
    /// Optimizer stops below this residual RMS. (0, 100] µT
    pub convergence_rms_ut: f64,
    /// Phase 2 is rejected above this residual RMS. >= convergence_rms_ut
    pub max_residual_rms_ut: f64,

    /// Samples averaged into the Earth-field estimate. [1, 1e6]
    pub earth_field_samples: usize,
    /// Earth-field capture is rejected above this spread. (0, 100] µT
    pub max_earth_field_spread_ut: f64,

    /// Start the next phase automatically when one completes.
    pub auto_sequence: bool,
    /// When sequencing, run Phase 2 between Phase 1 and Earth-field capture.
    pub refine_after_ellipsoid: bool,

    pub drift: DriftConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            ellipsoid_min_samples: 200,
            ellipsoid_max_samples: 2000,
            min_octant_coverage: 0.75,
            min_sphericity: 0.6,
            refinement_pairs: 400,
            min_pose_change_deg: 3.0,
            max_iterations: 500,
            learning_rate: 0.2,
            convergence_rms_ut: 1.0,
            max_residual_rms_ut: 8.0,
            earth_field_samples: 100,
            max_earth_field_spread_ut: 6.0,
            auto_sequence: true,
            refine_after_ellipsoid: false,
            drift: DriftConfig::default(),
        }
    }
}

impl CalibrationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_range("calibration.ellipsoid_min_samples", self.ellipsoid_min_samples as f64, 1.0, 1e6)?;
        check_range(
            "calibration.ellipsoid_max_samples",
            self.ellipsoid_max_samples as f64,
            self.ellipsoid_min_samples as f64,
            1e7,
        )?;
        check_range("calibration.min_octant_coverage", self.min_octant_coverage, 0.125, 1.0)?;
        check_range("calibration.min_sphericity", self.min_sphericity, 0.0, 1.0)?;
        check_range("calibration.refinement_pairs", self.refinement_pairs as f64, 10.0, 100_000.0)?;
        check_range("calibration.min_pose_change_deg", self.min_pose_change_deg, 0.0, 90.0)?;
        check_range("calibration.max_iterations", self.max_iterations as f64, 1.0, 100_000.0)?;
        check_range("calibration.learning_rate", self.learning_rate, f64::MIN_POSITIVE, 1.0)?;
        check_range("calibration.convergence_rms_ut", self.convergence_rms_ut, f64::MIN_POSITIVE, 100.0)?;
        check_range(
            "calibration.max_residual_rms_ut",
            self.max_residual_rms_ut,
            self.convergence_rms_ut,
            1000.0,
        )?;
        check_range("calibration.earth_field_samples", self.earth_field_samples as f64, 1.0, 1e6)?;
        check_range(
            "calibration.max_earth_field_spread_ut",
            self.max_earth_field_spread_ut,
            f64::MIN_POSITIVE,
            100.0,
        )?;
        self.drift.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// EMA rate of the background field estimate. (0, 1]
    pub ema_alpha: f64,
    /// Background samples before drift is judged. [1, 1e6]
    pub min_samples: u64,
    /// Drift above this prompts the user to recalibrate. (0, 1000] µT
    pub recalibration_threshold_ut: f64,
    /// Drift below this is corrected in place. Zero disables. [0, recalibration]
    pub auto_correct_threshold_ut: f64,
    /// Per-sample fraction of the drift applied when auto-correcting. [0, 1]
    pub auto_correct_rate: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.01,
            min_samples: 200,
            recalibration_threshold_ut: 12.0,
            auto_correct_threshold_ut: 3.0,
            auto_correct_rate: 0.002,
        }
    }
}

impl DriftConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_range("calibration.drift.ema_alpha", self.ema_alpha, f64::MIN_POSITIVE, 1.0)?;
        check_range("calibration.drift.min_samples", self.min_samples as f64, 1.0, 1e6)?;
        check_range(
            "calibration.drift.recalibration_threshold_ut",
            self.recalibration_threshold_ut,
            f64::MIN_POSITIVE,
            1000.0,
        )?;
        check_range(
            "calibration.drift.auto_correct_threshold_ut",
            self.auto_correct_threshold_ut,
            0.0,
            self.recalibration_threshold_ut,
        )?;
        check_range("calibration.drift.auto_correct_rate", self.auto_correct_rate, 0.0, 1.0)?;
        Ok(())
    }
}

// ─── Residual ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidualConfig {
    /// How the orientation quaternion maps between sensor and reference frame.
    pub frame: QuaternionFrame,
}

// ─── Magnet detector ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Residual magnitudes averaged into the fixed baseline. [1, 1e6]
    pub baseline_samples: usize,
    /// Moving-average length over the residual magnitude. [1, 1000]
    pub window_size: usize,
    /// Deviation thresholds, strictly increasing. µT
    pub possible_ut: f64,
    pub likely_ut: f64,
    pub confirmed_ut: f64,
    /// Consecutive samples a new class needs before it is reported. [1, 1000]
    pub hysteresis_samples: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            baseline_samples: 100,
            window_size: 10,
            possible_ut: 10.0,
            likely_ut: 20.0,
            confirmed_ut: 50.0,
            hysteresis_samples: 5,
        }
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_range("detector.baseline_samples", self.baseline_samples as f64, 1.0, 1e6)?;
        check_range("detector.window_size", self.window_size as f64, 1.0, 1000.0)?;
        check_range("detector.possible_ut", self.possible_ut, f64::MIN_POSITIVE, 1e4)?;
        check_range("detector.likely_ut", self.likely_ut, self.possible_ut, 1e4)?;
        check_range("detector.confirmed_ut", self.confirmed_ut, self.likely_ut, 1e4)?;
        check_range("detector.hysteresis_samples", self.hysteresis_samples as f64, 1.0, 1000.0)?;
        Ok(())
    }
}

// ─── Smoothing ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    pub enabled: bool,
    pub target: SmoothingTarget,
    /// White-noise acceleration spectral density. (0, 1e6] µT²/s³
    pub process_noise: f64,
    /// Per-axis measurement variance. (0, 1e6] µT²
    pub measurement_noise: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: SmoothingTarget::Residual,
            process_noise: 1.0,
            measurement_noise: 4.0,
        }
    }
}

impl SmoothingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_range("smoothing.process_noise", self.process_noise, f64::MIN_POSITIVE, 1e6)?;
        check_range("smoothing.measurement_noise", self.measurement_noise, f64::MIN_POSITIVE, 1e6)?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, value, min, max })
    }
}
