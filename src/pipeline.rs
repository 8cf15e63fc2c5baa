// pipeline.rs: per-stream processing chain
//
// One Pipeline owns one instance of every stage for one sensor stream. It is
// synchronous and free of I/O: raw samples in, decorated samples and events
// out. Persistence is a channel hand-off, never a write on this thread.

use crossbeam::channel::{Sender, TrySendError};

use crate::calibration::{CalibrationEvent, CalibrationPhase, CalibrationState, MagCalibrator};
use crate::config::PipelineConfig;
use crate::detector::{MagnetDetector, MagnetStatus};
use crate::error::{CalResult, ConfigError};
use crate::filters::{Ahrs, OrientationFilter};
use crate::gyro_bias::GyroBiasEstimator;
use crate::motion::MotionDetector;
use crate::persistence::CalibrationDocument;
use crate::residual::ResidualEngine;
use crate::smoothing::{KalmanFilter3d, SmoothingTarget};
use crate::types::{DecoratedSample, EulerAngles, Quat, QuaternionWxyz, RawSample, Vec3};
use crate::units::{ContractViolation, SampleClock, UnitConverter};

/// Contract violations logged in full before switching to periodic summaries.
const VIOLATION_LOG_BURST: u64 = 10;
const VIOLATION_LOG_EVERY: u64 = 1000;

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    ContractViolation(ContractViolation),
    Calibration(CalibrationEvent),
    GyroBiasConverged { bias_dps: Vec3 },
    DetectorBaselined { baseline_ut: f64 },
    MagnetStatusChanged { from: MagnetStatus, to: MagnetStatus, deviation_ut: f64 },
    CalibrationQueued { phase: CalibrationPhase },
}

#[derive(Clone, Debug)]
pub struct PipelineOutput {
    pub sample: DecoratedSample,
    pub events: Vec<PipelineEvent>,
}

// ─── The pipeline ────────────────────────────────────────────────────────────

pub struct Pipeline {
    config: PipelineConfig,

    clock: SampleClock,
    converter: UnitConverter,
    motion: MotionDetector,
    gyro_bias: GyroBiasEstimator,
    ahrs: OrientationFilter,
    calibrator: MagCalibrator,
    residual: ResidualEngine,
    detector: Option<MagnetDetector>,
    smoother: Option<KalmanFilter3d>,

    persist_tx: Option<Sender<CalibrationDocument>>,

    samples_processed: u64,
    violations_seen: u64,
    bias_converged_reported: bool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let smoother = config
            .smoothing
            .enabled
            .then(|| KalmanFilter3d::from_config(&config.smoothing));
        Ok(Self {
            clock: SampleClock::new(config.nominal_dt(), config.max_dt_s),
            converter: UnitConverter::new(config.units.clone()),
            motion: MotionDetector::new(&config.motion),
            gyro_bias: GyroBiasEstimator::new(&config.gyro_bias),
            ahrs: OrientationFilter::new(&config.ahrs),
            calibrator: MagCalibrator::new(config.calibration.clone(), config.residual.frame),
            residual: ResidualEngine::new(&config.residual),
            detector: None,
            smoother,
            persist_tx: None,
            samples_processed: 0,
            violations_seen: 0,
            bias_converged_reported: false,
            config,
        })
    }

    /// Send a document to `tx` whenever a calibration phase is accepted.
    pub fn with_persistence(mut self, tx: Sender<CalibrationDocument>) -> Self {
        self.persist_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn calibration(&self) -> &CalibrationState {
        self.calibrator.state()
    }

    pub fn calibrator(&self) -> &MagCalibrator {
        &self.calibrator
    }

    pub fn orientation(&self) -> Quat {
        self.ahrs.orientation()
    }

    pub fn samples_processed(&self) -> u64 {
        self.samples_processed
    }

    pub fn magnet_status(&self) -> Option<MagnetStatus> {
        self.detector
            .as_ref()
            .filter(|d| d.baseline_ut().is_some())
            .map(MagnetDetector::status)
    }

    // ── Calibration control ──────────────────────────────────────────────

    pub fn start_calibration(&mut self, phase: CalibrationPhase) -> CalResult<Vec<PipelineEvent>> {
        let event = self.calibrator.start(phase)?;
        Ok(self.absorb_calibration(vec![event]))
    }

    pub fn reset_calibration(&mut self) -> Vec<PipelineEvent> {
        let event = self.calibrator.reset_to_ellipsoid();
        self.absorb_calibration(vec![event])
    }

    pub fn cancel_calibration(&mut self) -> CalResult<Vec<PipelineEvent>> {
        let phase = self.calibrator.cancel()?;
        Ok(self.absorb_calibration(vec![CalibrationEvent::PhaseCancelled { phase }]))
    }

    pub fn restart_calibration_phase(&mut self) -> CalResult<CalibrationPhase> {
        self.calibrator.restart_phase()
    }

    pub fn finish_calibration(&mut self) -> CalResult<Vec<PipelineEvent>> {
        let events = self.calibrator.finish()?;
        Ok(self.absorb_calibration(events))
    }

    /// Load saved parameters. An Earth field captured under a different frame
    /// convention is dropped rather than reinterpreted.
    pub fn restore_calibration(&mut self, doc: &CalibrationDocument) -> CalResult<()> {
        let mut state = doc.to_state();
        if doc.frame != self.residual.frame() && state.earth_field.is_some() {
            log::warn!(
                "Saved Earth field uses {:?}, pipeline uses {:?}; discarding it",
                doc.frame,
                self.residual.frame()
            );
            state.earth_field = None;
        }
        self.calibrator.restore(state)?;
        self.detector = self
            .calibrator
            .state()
            .earth_field_ready()
            .then(|| MagnetDetector::new(&self.config.detector));
        self.reset_smoother();
        Ok(())
    }

    pub fn calibration_document(&self) -> CalibrationDocument {
        CalibrationDocument::from_state(self.calibrator.state(), self.residual.frame())
    }

    // ── Per-sample processing ────────────────────────────────────────────

    pub fn process(&mut self, raw: &RawSample) -> PipelineOutput {
        let mut events = Vec::new();
        self.samples_processed += 1;

        // Units
        let dt = self.clock.tick(raw.timestamp);
        let physical = self.converter.convert(raw, dt);
        let violations = self.converter.validate(raw);
        for v in &violations {
            self.report_violation(v, raw.timestamp);
            events.push(PipelineEvent::ContractViolation(*v));
        }

        // Motion and gyro bias
        let motion = self.motion.update(&physical.accel_g, &physical.gyro_dps);
        let bias = self.gyro_bias.update(&physical.gyro_dps, motion.is_static());
        if !self.bias_converged_reported && self.gyro_bias.is_converged() {
            self.bias_converged_reported = true;
            log::info!("Gyro bias converged: [{:.3}, {:.3}, {:.3}] deg/s", bias.x, bias.y, bias.z);
            events.push(PipelineEvent::GyroBiasConverged { bias_dps: bias });
        }

        // Orientation. Heading trust drops to zero while a magnet is near.
        let magnet_near = matches!(self.magnet_status(), Some(s) if s != MagnetStatus::None);
        self.ahrs
            .set_mag_trust(if magnet_near { 0.0 } else { self.config.ahrs.mag_trust });
        let gyro_rad = (physical.gyro_dps - bias).map(f64::to_radians);
        let heading_mag = self.calibrator.correct(&physical.mag_ut);
        let q = self
            .ahrs
            .update(&gyro_rad, &physical.accel_g, heading_mag.as_ref(), dt);
        let euler = EulerAngles::from_quaternion(&q);

        // Calibration
        let cal_events = self.calibrator.update(&physical.mag_ut, &q);
        events.extend(self.absorb_calibration(cal_events));
        let mag_calibrated = self.calibrator.correct(&physical.mag_ut);

        // Residual and magnet detection
        let residual = match (&mag_calibrated, &self.calibrator.state().earth_field) {
            (Some(m), Some(earth)) => self.residual.compute(m, &q, earth),
            _ => None,
        };
        let magnet = match (&residual, self.detector.as_mut()) {
            (Some(r), Some(detector)) => {
                let before = detector.baseline_ut().map(|_| detector.status());
                let reading = detector.update(r.magnitude_ut);
                if let Some(reading) = &reading {
                    match before {
                        None => {
                            events.push(PipelineEvent::DetectorBaselined {
                                baseline_ut: reading.baseline_ut,
                            });
                        }
                        Some(from) if from != reading.status => {
                            log::info!(
                                "Magnet {:?} -> {:?} at t={:.3} ({:.1} µT)",
                                from,
                                reading.status,
                                raw.timestamp,
                                reading.deviation_ut
                            );
                            events.push(PipelineEvent::MagnetStatusChanged {
                                from,
                                to: reading.status,
                                deviation_ut: reading.deviation_ut,
                            });
                        }
                        _ => {}
                    }
                }
                reading
            }
            _ => None,
        };

        // Background drift, only on still, magnet-free samples
        if let (Some(m), Some(reading)) = (&mag_calibrated, &magnet) {
            if motion.is_static() && reading.status == MagnetStatus::None {
                if let Some(event) = self.calibrator.track_drift(m, &q) {
                    events.push(PipelineEvent::Calibration(event));
                }
            }
        }

        // Smoothing
        let target = match self.config.smoothing.target {
            SmoothingTarget::Residual => residual.map(|r| r.vector_ut),
            SmoothingTarget::CalibratedField => mag_calibrated,
        };
        let smoothed = match (target, self.smoother.as_mut()) {
            (Some(v), Some(kf)) => kf.step(&v, dt),
            _ => None,
        };

        log::trace!(
            "t={:.3} dt={:.4} moving={} |res|={:?}",
            raw.timestamp,
            dt,
            motion.moving,
            residual.map(|r| r.magnitude_ut)
        );

        PipelineOutput {
            sample: DecoratedSample {
                raw: *raw,
                physical,
                contract_violations: violations,
                motion,
                gyro_bias_dps: bias,
                orientation: QuaternionWxyz::from(&q),
                euler,
                calibration: self.calibrator.status(),
                mag_calibrated_ut: mag_calibrated,
                residual,
                magnet,
                smoothed_ut: smoothed,
            },
            events,
        }
    }

    /// Apply side effects of calibration events: persistence on acceptance,
    /// detector and smoother lifecycle when parameters change.
    fn absorb_calibration(&mut self, cal_events: Vec<CalibrationEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::with_capacity(cal_events.len());
        for event in cal_events {
            if let CalibrationEvent::PhaseCompleted { phase } = event {
                self.reset_smoother();
                if phase == CalibrationPhase::EarthField {
                    self.detector = Some(MagnetDetector::new(&self.config.detector));
                }
                if self.queue_document() {
                    events.push(PipelineEvent::Calibration(event));
                    events.push(PipelineEvent::CalibrationQueued { phase });
                    continue;
                }
            }
            events.push(PipelineEvent::Calibration(event));
        }
        if !self.calibrator.state().earth_field_ready() {
            self.detector = None;
        }
        events
    }

    fn queue_document(&mut self) -> bool {
        let Some(tx) = &self.persist_tx else {
            return false;
        };
        match tx.try_send(self.calibration_document()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Calibration save queue full, skipping save");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("Calibration persister gone, saving disabled");
                self.persist_tx = None;
                false
            }
        }
    }

    fn reset_smoother(&mut self) {
        if let Some(kf) = self.smoother.as_mut() {
            kf.reset();
        }
    }

    fn report_violation(&mut self, violation: &ContractViolation, timestamp: f64) {
        self.violations_seen += 1;
        let n = self.violations_seen;
        if n <= VIOLATION_LOG_BURST {
            log::warn!("Contract violation at t={:.3}: {:?}", timestamp, violation);
        } else if n % VIOLATION_LOG_EVERY == 0 {
            log::warn!("{} contract violations so far (latest: {:?})", n, violation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::IronSource;
    use crossbeam::channel::bounded;

    fn level_sample(t: f64, mag: [i32; 3]) -> RawSample {
        RawSample {
            timestamp: t,
            ax: 0,
            ay: 0,
            az: 8192,
            gx: 0,
            gy: 0,
            gz: 0,
            mx: mag[0],
            my: mag[1],
            mz: mag[2],
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.sample_rate_hz = 0.0;
        assert!(Pipeline::new(config).is_err());
    }

    #[test]
    fn test_uncalibrated_fields_are_none() {
        let mut pipeline = Pipeline::new(PipelineConfig::default()).expect("valid");
        let out = pipeline.process(&level_sample(0.0, [1368, 0, -2737]));
        assert!(out.sample.mag_calibrated_ut.is_none());
        assert!(out.sample.residual.is_none());
        assert!(out.sample.magnet.is_none());
        assert!(out.sample.smoothed_ut.is_none());
        assert_eq!(out.sample.calibration.iron_source, IronSource::None);
    }

    #[test]
    fn test_violations_reported_but_processed() {
        let mut pipeline = Pipeline::new(PipelineConfig::default()).expect("valid");
        let mut raw = level_sample(0.0, [20, 0, -40]);
        raw.az = 1;
        let out = pipeline.process(&raw);
        assert_eq!(out.sample.contract_violations.len(), 2);
        assert_eq!(
            out.events
                .iter()
                .filter(|e| matches!(e, PipelineEvent::ContractViolation(_)))
                .count(),
            2
        );
        assert_eq!(out.sample.raw, raw);
    }

    #[test]
    fn test_restore_creates_detector_and_queues_nothing() {
        let (tx, rx) = bounded(4);
        let mut pipeline = Pipeline::new(PipelineConfig::default())
            .expect("valid")
            .with_persistence(tx);

        let mut state = CalibrationState {
            iron_source: IronSource::Ellipsoid,
            ..CalibrationState::default()
        };
        state.earth_field = Some(crate::calibration::EarthField {
            reference_ut: Vec3::new(20.0, 0.0, -40.0),
            sensor_ut: Vec3::new(20.0, 0.0, -40.0),
            capture_orientation: QuaternionWxyz::from(&Quat::identity()),
            magnitude_ut: 44.72,
            samples: 100,
            spread_ut: 0.5,
        });
        let doc = CalibrationDocument::from_state(&state, Default::default());
        pipeline.restore_calibration(&doc).expect("valid");
        assert!(pipeline.calibration().earth_field_ready());

        let mag = [1368, 0, -2737]; // ≈ (20, 0, -40) µT
        let mut last = None;
        for i in 0..120 {
            last = Some(pipeline.process(&level_sample(i as f64 * 0.02, mag)));
        }
        let out = last.expect("processed");
        let reading = out.sample.magnet.expect("baselined");
        assert_eq!(reading.status, MagnetStatus::None);
        assert!(out.sample.residual.expect("residual").magnitude_ut < 1.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_frame_mismatch_drops_earth_field() {
        let mut pipeline = Pipeline::new(PipelineConfig::default()).expect("valid");
        let mut state = CalibrationState {
            iron_source: IronSource::Ellipsoid,
            ..CalibrationState::default()
        };
        state.earth_field = Some(crate::calibration::EarthField {
            reference_ut: Vec3::new(20.0, 0.0, -40.0),
            sensor_ut: Vec3::new(20.0, 0.0, -40.0),
            capture_orientation: QuaternionWxyz::from(&Quat::identity()),
            magnitude_ut: 44.72,
            samples: 100,
            spread_ut: 0.5,
        });
        let doc = CalibrationDocument::from_state(
            &state,
            crate::residual::QuaternionFrame::WorldToSensor,
        );
        pipeline.restore_calibration(&doc).expect("valid");
        assert!(pipeline.calibration().iron_ready());
        assert!(!pipeline.calibration().earth_field_ready());
    }
}
