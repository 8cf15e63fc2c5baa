//! Calibration document storage
//!
//! The document is versioned JSON. Schema 1 (diagonal soft iron only) is
//! migrated on load; anything newer than this build understands is refused
//! rather than guessed at.

use crossbeam::channel::{bounded, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crate::calibration::{CalibrationQuality, CalibrationState, EarthField, IronSource};
use crate::error::PersistError;
use crate::residual::QuaternionFrame;
use crate::types::{Mat3, Quat, QuaternionWxyz, Vec3};

pub const SCHEMA_VERSION: u32 = 2;
pub const UNITS: &str = "uT";

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseFlags {
    pub hard_iron: bool,
    pub soft_iron: bool,
    pub refined: bool,
    pub earth_field: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDocument {
    pub schema_version: u32,
    pub units: String,
    pub hard_iron_ut: [f64; 3],
    /// Row-major
    pub soft_iron: [[f64; 3]; 3],
    pub iron_source: IronSource,
    pub earth_field: Option<EarthField>,
    /// Convention the Earth field was captured under
    pub frame: QuaternionFrame,
    pub phases: PhaseFlags,
    pub quality: CalibrationQuality,
    /// RFC 3339
    pub saved_at: String,
}

/// Schema 1 layout, read only for migration.
#[derive(Deserialize)]
struct DocumentV1 {
    hard_iron_ut: [f64; 3],
    soft_iron_scale: [f64; 3],
    #[serde(default)]
    earth_field_ut: Option<[f64; 3]>,
    #[serde(default)]
    saved_at: Option<String>,
}

impl CalibrationDocument {
    pub fn from_state(state: &CalibrationState, frame: QuaternionFrame) -> Self {
        let s = &state.soft_iron;
        let iron = state.iron_ready();
        Self {
            schema_version: SCHEMA_VERSION,
            units: UNITS.to_string(),
            hard_iron_ut: [state.hard_iron_ut.x, state.hard_iron_ut.y, state.hard_iron_ut.z],
            soft_iron: [
                [s[(0, 0)], s[(0, 1)], s[(0, 2)]],
                [s[(1, 0)], s[(1, 1)], s[(1, 2)]],
                [s[(2, 0)], s[(2, 1)], s[(2, 2)]],
            ],
            iron_source: state.iron_source,
            earth_field: state.earth_field,
            frame,
            phases: PhaseFlags {
                hard_iron: iron,
                soft_iron: iron,
                refined: state.iron_source == IronSource::Refined,
                earth_field: state.earth_field.is_some(),
            },
            quality: state.quality,
            saved_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn to_state(&self) -> CalibrationState {
        let m = &self.soft_iron;
        CalibrationState {
            hard_iron_ut: Vec3::from(self.hard_iron_ut),
            soft_iron: Mat3::new(
                m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
            ),
            iron_source: self.iron_source,
            earth_field: self.earth_field,
            quality: self.quality,
        }
    }

    pub fn to_json(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse any supported schema, migrating old ones.
    pub fn from_json_str(text: &str) -> Result<Self, PersistError> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        let units = value.get("units").and_then(|u| u.as_str()).unwrap_or_default();
        if units != UNITS {
            return Err(PersistError::UnitsMismatch {
                found: units.to_string(),
                expected: UNITS.to_string(),
            });
        }

        let version = value
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        match u32::try_from(version) {
            Ok(1) => {
                let v1: DocumentV1 = serde_json::from_value(value)?;
                log::info!("Migrating calibration document from schema 1");
                Ok(Self::migrate_v1(v1))
            }
            Ok(SCHEMA_VERSION) => Ok(serde_json::from_value(value)?),
            _ => Err(PersistError::SchemaMismatch {
                found: version,
                expected: SCHEMA_VERSION,
            }),
        }
    }

    fn migrate_v1(v1: DocumentV1) -> Self {
        let mut state = CalibrationState {
            hard_iron_ut: Vec3::from(v1.hard_iron_ut),
            soft_iron: Mat3::from_diagonal(&Vec3::from(v1.soft_iron_scale)),
            iron_source: IronSource::Ellipsoid,
            ..CalibrationState::default()
        };
        state.earth_field = v1.earth_field_ut.map(|e| {
            let reference = Vec3::from(e);
            EarthField {
                reference_ut: reference,
                sensor_ut: reference,
                capture_orientation: QuaternionWxyz::from(&Quat::identity()),
                magnitude_ut: reference.norm(),
                samples: 0,
                spread_ut: 0.0,
            }
        });
        let mut doc = Self::from_state(&state, QuaternionFrame::SensorToWorld);
        if let Some(saved_at) = v1.saved_at {
            doc.saved_at = saved_at;
        }
        doc
    }
}

pub trait CalibrationStore: Send {
    fn save(&mut self, doc: &CalibrationDocument) -> Result<(), PersistError>;
    fn load(&self) -> Result<Option<CalibrationDocument>, PersistError>;
}

/// One JSON file, replaced atomically on save.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CalibrationStore for JsonFileStore {
    fn save(&mut self, doc: &CalibrationDocument) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, doc.to_json()?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<CalibrationDocument>, PersistError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)?;
        CalibrationDocument::from_json_str(&text).map(Some)
    }
}

/// Writes calibration documents on a worker thread so the sample loop never
/// waits on storage.
pub struct BackgroundPersister {
    sender: Option<Sender<CalibrationDocument>>,
    handle: Option<JoinHandle<usize>>,
}

impl BackgroundPersister {
    pub fn spawn<S: CalibrationStore + 'static>(mut store: S, capacity: usize) -> Result<Self, PersistError> {
        let (tx, rx) = bounded::<CalibrationDocument>(capacity.max(1));
        let handle = thread::Builder::new()
            .name("calibration-persist".into())
            .spawn(move || {
                let mut saved = 0;
                for doc in rx {
                    match store.save(&doc) {
                        Ok(()) => {
                            saved += 1;
                            log::info!("Calibration saved ({:?})", doc.iron_source);
                        }
                        Err(e) => log::error!("Failed to save calibration: {}", e),
                    }
                }
                saved
            })?;
        Ok(Self {
            sender: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> Option<Sender<CalibrationDocument>> {
        self.sender.clone()
    }

    /// Queue a document. A full queue drops it with a warning.
    pub fn submit(&self, doc: CalibrationDocument) -> Result<(), PersistError> {
        let sender = self.sender.as_ref().ok_or(PersistError::Disconnected)?;
        match sender.try_send(doc) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::warn!("Calibration save queue full, document dropped");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(PersistError::Disconnected),
        }
    }

    /// Close the queue, wait for pending writes, return how many succeeded.
    pub fn shutdown(mut self) -> Result<usize, PersistError> {
        self.sender.take();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| PersistError::Disconnected),
            None => Ok(0),
        }
    }
}

impl Drop for BackgroundPersister {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
