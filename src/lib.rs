//! Wrist-worn 9-DOF IMU processing: orientation, magnetometer calibration
//! and finger-magnet detection from the residual field.

pub mod calibration;
pub mod config;
pub mod detector;
pub mod error;
pub mod filters;
pub mod gyro_bias;
pub mod motion;
pub mod persistence;
pub mod pipeline;
pub mod residual;
pub mod smoothing;
pub mod streams;
pub mod types;
pub mod units;

pub use calibration::{CalibrationEvent, CalibrationPhase, CalibrationState, MagCalibrator};
pub use config::PipelineConfig;
pub use detector::{MagnetDetector, MagnetReading, MagnetStatus};
pub use error::{CalibrationError, ConfigError, PersistError};
pub use persistence::{BackgroundPersister, CalibrationDocument, CalibrationStore, JsonFileStore};
pub use pipeline::{Pipeline, PipelineEvent, PipelineOutput};
pub use streams::StreamRegistry;
pub use types::{DecoratedSample, RawSample, SessionLog};
