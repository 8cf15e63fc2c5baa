use thiserror::Error;

use crate::calibration::{CalibrationPhase, QualityMetric};

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Failed to read config: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Calibration errors. "Not ready" is a state, not one of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("{phase:?} rejected: {metric:?} = {value:.3}, threshold {threshold:.3}")]
    QualityRejected {
        phase: CalibrationPhase,
        metric: QualityMetric,
        value: f64,
        threshold: f64,
    },

    #[error("No calibration phase is running")]
    NoActivePhase,

    #[error("{0:?} is already running")]
    PhaseAlreadyRunning(CalibrationPhase),

    #[error("{0:?} needs a completed hard/soft-iron calibration")]
    IronCalibrationMissing(CalibrationPhase),

    #[error("Refined parameters are active; use reset_to_ellipsoid to start over")]
    WouldDiscardRefinement,

    #[error("Invalid calibration document: {0}")]
    InvalidDocument(String),
}

/// Calibration document persistence errors
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed calibration document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported schema version {found} (current {expected})")]
    SchemaMismatch { found: u64, expected: u32 },

    #[error("Calibration units {found:?} do not match {expected:?}")]
    UnitsMismatch { found: String, expected: String },

    #[error("Persistence worker is gone")]
    Disconnected,
}

pub type CalResult<T> = Result<T, CalibrationError>;
