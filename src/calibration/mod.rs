//! Magnetometer calibration
//!
//! Three phases, each started explicitly (or chained by `auto_sequence`):
//!
//! 1. `Ellipsoid`: min/max box fit giving hard iron and a diagonal soft iron
//! 2. `Refinement`: optional full-matrix correction using orientation
//! 3. `EarthField`: capture of the local field in the reference frame
//!
//! Parameters only ever change through an accepted phase or `restore`. Any
//! change of iron parameters drops the Earth field, which was measured through
//! the old ones.

pub mod drift;
pub mod earth_field;
pub mod ellipsoid;
pub mod refine;

use serde::{Deserialize, Serialize};

use crate::config::CalibrationConfig;
use crate::error::{CalResult, CalibrationError};
use crate::residual::QuaternionFrame;
use crate::types::{Mat3, Quat, QuaternionWxyz, Vec3};

use drift::{DriftOutcome, DriftTracker};
use earth_field::EarthFieldCapture;
use ellipsoid::{EllipsoidFit, QualityShortfall};
use refine::RefinementCollector;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    Ellipsoid,
    Refinement,
    EarthField,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityMetric {
    SampleCount,
    OctantCoverage,
    Sphericity,
    ResidualRms,
    EarthFieldSpread,
}

/// Where the active hard/soft-iron parameters came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IronSource {
    #[default]
    None,
    Ellipsoid,
    Refined,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EarthField {
    /// Mean field in the reference frame
    pub reference_ut: Vec3,
    /// Mean corrected reading in the sensor frame during capture
    pub sensor_ut: Vec3,
    pub capture_orientation: QuaternionWxyz,
    pub magnitude_ut: f64,
    pub samples: usize,
    pub spread_ut: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationQuality {
    pub ellipsoid_samples: usize,
    pub octant_coverage: f64,
    pub sphericity: f64,
    pub refinement_rms_ut: Option<f64>,
    pub earth_field_spread_ut: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationState {
    pub hard_iron_ut: Vec3,
    pub soft_iron: Mat3,
    pub iron_source: IronSource,
    pub earth_field: Option<EarthField>,
    pub quality: CalibrationQuality,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            hard_iron_ut: Vec3::zeros(),
            soft_iron: Mat3::identity(),
            iron_source: IronSource::None,
            earth_field: None,
            quality: CalibrationQuality::default(),
        }
    }
}

impl CalibrationState {
    pub fn iron_ready(&self) -> bool {
        self.iron_source != IronSource::None
    }

    pub fn earth_field_ready(&self) -> bool {
        self.earth_field.is_some()
    }

    /// `S·(m − o)`, or `None` before any iron calibration.
    pub fn correct(&self, mag_ut: &Vec3) -> Option<Vec3> {
        if !self.iron_ready() {
            return None;
        }
        Some(self.soft_iron * (mag_ut - self.hard_iron_ut))
    }

    fn set_iron(&mut self, hard_iron_ut: Vec3, soft_iron: Mat3, source: IronSource) {
        self.hard_iron_ut = hard_iron_ut;
        self.soft_iron = soft_iron;
        self.iron_source = source;
        self.earth_field = None;
        self.quality.earth_field_spread_ut = None;
    }

    /// Finite parameters and an invertible soft-iron matrix.
    pub fn check(&self) -> CalResult<()> {
        let finite = self.hard_iron_ut.iter().all(|v| v.is_finite())
            && self.soft_iron.iter().all(|v| v.is_finite());
        if !finite {
            return Err(CalibrationError::InvalidDocument("non-finite iron parameters".into()));
        }
        if self.iron_ready() && self.soft_iron.determinant().abs() < 1e-9 {
            return Err(CalibrationError::InvalidDocument("singular soft-iron matrix".into()));
        }
        if let Some(earth) = &self.earth_field {
            if !self.iron_ready() {
                return Err(CalibrationError::InvalidDocument(
                    "Earth field without iron calibration".into(),
                ));
            }
            if !earth.reference_ut.iter().all(|v| v.is_finite()) {
                return Err(CalibrationError::InvalidDocument("non-finite Earth field".into()));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase: CalibrationPhase,
    pub samples: usize,
    pub target: usize,
    /// Ellipsoid only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub octant_coverage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sphericity: Option<f64>,
    /// Thresholds met; the phase can be finished
    pub usable: bool,
}

/// Per-sample calibration summary carried in the decorated record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStatus {
    pub iron_source: IronSource,
    pub earth_field_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_phase: Option<CalibrationPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<PhaseProgress>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CalibrationEvent {
    PhaseStarted {
        phase: CalibrationPhase,
    },
    /// Sample-count and coverage thresholds are met
    PhaseReady {
        phase: CalibrationPhase,
    },
    PhaseCompleted {
        phase: CalibrationPhase,
    },
    PhaseRejected {
        phase: CalibrationPhase,
        metric: QualityMetric,
        value: f64,
        threshold: f64,
    },
    PhaseCancelled {
        phase: CalibrationPhase,
    },
    RecalibrationRecommended {
        drift_ut: f64,
    },
    EarthFieldDriftCorrected {
        drift_ut: f64,
    },
}

#[derive(Clone, Debug)]
enum ActivePhase {
    Ellipsoid { fit: EllipsoidFit, ready_reported: bool },
    Refinement(RefinementCollector),
    EarthField(EarthFieldCapture),
}

impl ActivePhase {
    fn phase(&self) -> CalibrationPhase {
        match self {
            ActivePhase::Ellipsoid { .. } => CalibrationPhase::Ellipsoid,
            ActivePhase::Refinement(_) => CalibrationPhase::Refinement,
            ActivePhase::EarthField(_) => CalibrationPhase::EarthField,
        }
    }
}

pub struct MagCalibrator {
    config: CalibrationConfig,
    frame: QuaternionFrame,
    state: CalibrationState,
    active: Option<ActivePhase>,
    drift: DriftTracker,
}

impl MagCalibrator {
    pub fn new(config: CalibrationConfig, frame: QuaternionFrame) -> Self {
        let drift = DriftTracker::new(&config.drift);
        Self {
            config,
            frame,
            state: CalibrationState::default(),
            active: None,
            drift,
        }
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn frame(&self) -> QuaternionFrame {
        self.frame
    }

    pub fn active_phase(&self) -> Option<CalibrationPhase> {
        self.active.as_ref().map(ActivePhase::phase)
    }

    pub fn correct(&self, mag_ut: &Vec3) -> Option<Vec3> {
        self.state.correct(mag_ut)
    }

    /// Begin accumulating for `phase`.
    ///
    /// Phase 1 refuses to run over refined parameters (that would silently
    /// replace them with a coarser fit); use `reset_to_ellipsoid`.
    pub fn start(&mut self, phase: CalibrationPhase) -> CalResult<CalibrationEvent> {
        if let Some(active) = &self.active {
            return Err(CalibrationError::PhaseAlreadyRunning(active.phase()));
        }
        let active = match phase {
            CalibrationPhase::Ellipsoid => {
                if self.state.iron_source == IronSource::Refined {
                    return Err(CalibrationError::WouldDiscardRefinement);
                }
                ActivePhase::Ellipsoid {
                    fit: EllipsoidFit::new(self.accepted_offset()),
                    ready_reported: false,
                }
            }
            CalibrationPhase::Refinement => {
                if !self.state.iron_ready() {
                    return Err(CalibrationError::IronCalibrationMissing(phase));
                }
                ActivePhase::Refinement(RefinementCollector::new(&self.config))
            }
            CalibrationPhase::EarthField => {
                if !self.state.iron_ready() {
                    return Err(CalibrationError::IronCalibrationMissing(phase));
                }
                ActivePhase::EarthField(EarthFieldCapture::new(&self.config))
            }
        };
        log::info!("Calibration phase {:?} started", phase);
        self.active = Some(active);
        Ok(CalibrationEvent::PhaseStarted { phase })
    }

    /// Drop all iron parameters and start Phase 1 again. Octant coverage is
    /// still measured around the offset being discarded.
    pub fn reset_to_ellipsoid(&mut self) -> CalibrationEvent {
        if let Some(active) = self.active.take() {
            log::info!("Calibration phase {:?} abandoned for reset", active.phase());
        }
        let previous_offset = self.accepted_offset();
        self.state = CalibrationState::default();
        self.drift.reset();
        self.active = Some(ActivePhase::Ellipsoid {
            fit: EllipsoidFit::new(previous_offset),
            ready_reported: false,
        });
        log::info!("Calibration reset, phase Ellipsoid started");
        CalibrationEvent::PhaseStarted {
            phase: CalibrationPhase::Ellipsoid,
        }
    }

    /// Centre for Phase 1 octant coverage. `None` until some iron fit has
    /// been accepted, in which case the fit uses its own running centre.
    fn accepted_offset(&self) -> Option<Vec3> {
        self.state.iron_ready().then_some(self.state.hard_iron_ut)
    }

    /// Stop the running phase. Completed parameters are untouched.
    pub fn cancel(&mut self) -> CalResult<CalibrationPhase> {
        let active = self.active.take().ok_or(CalibrationError::NoActivePhase)?;
        log::info!("Calibration phase {:?} cancelled", active.phase());
        Ok(active.phase())
    }

    /// Throw away what the running phase has collected and keep collecting.
    pub fn restart_phase(&mut self) -> CalResult<CalibrationPhase> {
        let active = self.active.as_mut().ok_or(CalibrationError::NoActivePhase)?;
        match active {
            ActivePhase::Ellipsoid { fit, ready_reported } => {
                fit.reset();
                *ready_reported = false;
            }
            ActivePhase::Refinement(collector) => collector.reset(),
            ActivePhase::EarthField(capture) => capture.reset(),
        }
        let phase = active.phase();
        log::info!("Calibration phase {:?} restarted", phase);
        Ok(phase)
    }

    /// Complete the running phase with what it has now.
    ///
    /// On a quality failure the phase ends, nothing is applied, and the
    /// shortfall is returned as `QualityRejected`.
    pub fn finish(&mut self) -> CalResult<Vec<CalibrationEvent>> {
        let active = self.active.take().ok_or(CalibrationError::NoActivePhase)?;
        let phase = active.phase();
        match self.solve(active) {
            Ok(mut events) => {
                self.chain_after(phase, &mut events);
                Ok(events)
            }
            Err(shortfall) => {
                Self::log_rejection(phase, &shortfall);
                Err(CalibrationError::QualityRejected {
                    phase,
                    metric: shortfall.metric,
                    value: shortfall.value,
                    threshold: shortfall.threshold,
                })
            }
        }
    }

    /// Feed one raw (unit-converted) magnetometer reading and the current
    /// orientation to the running phase.
    pub fn update(&mut self, mag_ut: &Vec3, q: &Quat) -> Vec<CalibrationEvent> {
        let mut events = Vec::new();
        let Some(active) = self.active.as_mut() else {
            return events;
        };

        let due = match active {
            ActivePhase::Ellipsoid { fit, ready_reported } => {
                fit.add(mag_ut);
                let usable = fit.is_usable(&self.config);
                if usable && !*ready_reported {
                    *ready_reported = true;
                    log::info!(
                        "Ellipsoid usable: {} samples, coverage {:.2}, sphericity {:.2}",
                        fit.count(),
                        fit.octant_coverage(),
                        fit.sphericity()
                    );
                    events.push(CalibrationEvent::PhaseReady {
                        phase: CalibrationPhase::Ellipsoid,
                    });
                }
                (usable && fit.sphericity() >= self.config.min_sphericity)
                    || fit.count() >= self.config.ellipsoid_max_samples
            }
            ActivePhase::Refinement(collector) => {
                if let Some(c) = self.state.correct(mag_ut) {
                    collector.add(&c, q, self.frame);
                }
                collector.is_full()
            }
            ActivePhase::EarthField(capture) => {
                if let Some(c) = self.state.correct(mag_ut) {
                    capture.add(&c, q, self.frame);
                }
                capture.is_full()
            }
        };

        if due {
            if let Some(active) = self.active.take() {
                let phase = active.phase();
                match self.solve(active) {
                    Ok(done) => {
                        events.extend(done);
                        self.chain_after(phase, &mut events);
                    }
                    Err(shortfall) => {
                        Self::log_rejection(phase, &shortfall);
                        events.push(CalibrationEvent::PhaseRejected {
                            phase,
                            metric: shortfall.metric,
                            value: shortfall.value,
                            threshold: shortfall.threshold,
                        });
                    }
                }
            }
        }
        events
    }

    fn solve(&mut self, active: ActivePhase) -> Result<Vec<CalibrationEvent>, QualityShortfall> {
        let phase = active.phase();
        match active {
            ActivePhase::Ellipsoid { fit, .. } => {
                let solution = fit.evaluate(&self.config)?;
                self.state
                    .set_iron(solution.hard_iron_ut, solution.soft_iron, IronSource::Ellipsoid);
                self.state.quality = CalibrationQuality {
                    ellipsoid_samples: solution.samples,
                    octant_coverage: solution.octant_coverage,
                    sphericity: solution.sphericity,
                    refinement_rms_ut: None,
                    earth_field_spread_ut: None,
                };
                log::info!(
                    "Ellipsoid accepted: hard iron [{:.2}, {:.2}, {:.2}] µT, sphericity {:.2}",
                    solution.hard_iron_ut.x,
                    solution.hard_iron_ut.y,
                    solution.hard_iron_ut.z,
                    solution.sphericity
                );
            }
            ActivePhase::Refinement(collector) => {
                let solution = refine::optimize(collector.pairs(), &self.config)?;
                let s1 = self.state.soft_iron;
                let s1_inv = s1.try_inverse().ok_or(QualityShortfall {
                    metric: QualityMetric::ResidualRms,
                    value: solution.rms_ut,
                    threshold: self.config.max_residual_rms_ut,
                })?;
                let offset = self.state.hard_iron_ut + s1_inv * solution.offset_ut;
                self.state
                    .set_iron(offset, solution.matrix * s1, IronSource::Refined);
                self.state.quality.refinement_rms_ut = Some(solution.rms_ut);
                let e = solution.earth_field_ut;
                log::info!(
                    "Refinement accepted: RMS {:.2} µT after {} iterations, field [{:.1}, {:.1}, {:.1}] µT",
                    solution.rms_ut,
                    solution.iterations,
                    e.x,
                    e.y,
                    e.z
                );
            }
            ActivePhase::EarthField(capture) => {
                let field = capture.solve()?;
                self.state.quality.earth_field_spread_ut = Some(field.spread_ut);
                self.state.earth_field = Some(field);
                log::info!(
                    "Earth field captured: {:.1} µT over {} samples, spread {:.2} µT",
                    field.magnitude_ut,
                    field.samples,
                    field.spread_ut
                );
            }
        }
        self.drift.reset();
        Ok(vec![CalibrationEvent::PhaseCompleted { phase }])
    }

    fn chain_after(&mut self, completed: CalibrationPhase, events: &mut Vec<CalibrationEvent>) {
        if !self.config.auto_sequence {
            return;
        }
        let next = match completed {
            CalibrationPhase::Ellipsoid if self.config.refine_after_ellipsoid => CalibrationPhase::Refinement,
            CalibrationPhase::Ellipsoid | CalibrationPhase::Refinement => CalibrationPhase::EarthField,
            CalibrationPhase::EarthField => return,
        };
        match self.start(next) {
            Ok(event) => events.push(event),
            Err(e) => log::warn!("Could not chain {:?} after {:?}: {}", next, completed, e),
        }
    }

    fn log_rejection(phase: CalibrationPhase, shortfall: &QualityShortfall) {
        log::warn!(
            "Calibration phase {:?} rejected: {:?} = {:.3}, threshold {:.3}",
            phase,
            shortfall.metric,
            shortfall.value,
            shortfall.threshold
        );
    }

    pub fn progress(&self) -> Option<PhaseProgress> {
        let active = self.active.as_ref()?;
        Some(match active {
            ActivePhase::Ellipsoid { fit, .. } => PhaseProgress {
                phase: CalibrationPhase::Ellipsoid,
                samples: fit.count(),
                target: self.config.ellipsoid_min_samples,
                octant_coverage: Some(fit.octant_coverage()),
                sphericity: Some(fit.sphericity()),
                usable: fit.is_usable(&self.config),
            },
            ActivePhase::Refinement(collector) => PhaseProgress {
                phase: CalibrationPhase::Refinement,
                samples: collector.len(),
                target: collector.target(),
                octant_coverage: None,
                sphericity: None,
                usable: collector.len() >= refine::MIN_REFINEMENT_PAIRS,
            },
            ActivePhase::EarthField(capture) => PhaseProgress {
                phase: CalibrationPhase::EarthField,
                samples: capture.len(),
                target: capture.target(),
                octant_coverage: None,
                sphericity: None,
                usable: !capture.is_empty(),
            },
        })
    }

    pub fn status(&self) -> CalibrationStatus {
        CalibrationStatus {
            iron_source: self.state.iron_source,
            earth_field_ready: self.state.earth_field_ready(),
            active_phase: self.active_phase(),
            progress: self.progress(),
        }
    }

    /// Replace the whole state, e.g. from a saved document. Any running phase
    /// is cancelled.
    pub fn restore(&mut self, state: CalibrationState) -> CalResult<()> {
        state.check()?;
        self.active = None;
        self.drift.reset();
        self.state = state;
        log::info!(
            "Calibration restored: iron {:?}, Earth field {}",
            self.state.iron_source,
            if self.state.earth_field_ready() { "present" } else { "absent" }
        );
        Ok(())
    }

    /// Background drift check against the stored Earth field. Only call with
    /// samples that are static and magnet-free.
    pub fn track_drift(&mut self, corrected_ut: &Vec3, q: &Quat) -> Option<CalibrationEvent> {
        if self.active.is_some() {
            return None;
        }
        let stored = self.state.earth_field.as_ref()?.reference_ut;
        let reference = self.frame.to_reference(q, corrected_ut);

        match self.drift.observe(&reference, &stored) {
            DriftOutcome::Warming | DriftOutcome::Stable { .. } => None,
            DriftOutcome::Correct { drift_ut, nudge_ut, started } => {
                if let Some(earth) = self.state.earth_field.as_mut() {
                    earth.reference_ut += nudge_ut;
                    earth.magnitude_ut = earth.reference_ut.norm();
                }
                if started {
                    log::debug!("Earth field drift {:.2} µT, correcting in place", drift_ut);
                    Some(CalibrationEvent::EarthFieldDriftCorrected { drift_ut })
                } else {
                    None
                }
            }
            DriftOutcome::RecalibrationRecommended { drift_ut } => {
                log::warn!("Earth field drifted {:.1} µT, recalibration recommended", drift_ut);
                Some(CalibrationEvent::RecalibrationRecommended { drift_ut })
            }
        }
    }

    pub fn drift_ut(&self) -> Option<f64> {
        let stored = self.state.earth_field.as_ref()?.reference_ut;
        self.drift.drift_ut(&stored)
    }
}
