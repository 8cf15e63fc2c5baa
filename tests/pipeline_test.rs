use approx::assert_abs_diff_eq;
use nalgebra::{Matrix3, Vector3};
use rstest::{fixture, rstest};
use tempfile::tempdir;

use magnet_tracker_rs::calibration::{CalibrationPhase, IronSource};
use magnet_tracker_rs::filters::FusionMode;
use magnet_tracker_rs::persistence::{BackgroundPersister, CalibrationStore, JsonFileStore};
use magnet_tracker_rs::{
    CalibrationEvent, MagnetStatus, Pipeline, PipelineConfig, PipelineEvent, RawSample,
};

const MAG_LSB_PER_UT: f64 = 68.42;
const ACCEL_LSB_PER_G: f64 = 8192.0;
const DT: f64 = 0.02;
const FIELD_UT: f64 = 50.0;

/// Sensor-side distortion applied to the synthetic field.
struct Distortion {
    gain: Matrix3<f64>,
    offset_ut: Vector3<f64>,
}

impl Distortion {
    fn apply(&self, field_ut: &Vector3<f64>) -> Vector3<f64> {
        self.gain * field_ut + self.offset_ut
    }
}

#[fixture]
fn distortion() -> Distortion {
    Distortion {
        gain: Matrix3::from_diagonal(&Vector3::new(1.2, 0.9, 1.0)),
        offset_ut: Vector3::new(12.0, -8.0, 15.0),
    }
}

#[fixture]
fn pipeline() -> Pipeline {
    Pipeline::new(PipelineConfig::default()).unwrap()
}

fn raw(t: f64, accel_g: Vector3<f64>, gyro_lsb: [i32; 3], mag_ut: Vector3<f64>) -> RawSample {
    let a = accel_g * ACCEL_LSB_PER_G;
    let m = mag_ut * MAG_LSB_PER_UT;
    RawSample {
        timestamp: t,
        ax: a.x.round() as i32,
        ay: a.y.round() as i32,
        az: a.z.round() as i32,
        gx: gyro_lsb[0],
        gy: gyro_lsb[1],
        gz: gyro_lsb[2],
        mx: m.x.round() as i32,
        my: m.y.round() as i32,
        mz: m.z.round() as i32,
    }
}

fn level(t: f64, mag_ut: Vector3<f64>) -> RawSample {
    raw(t, Vector3::new(0.0, 0.0, 1.0), [0, 0, 0], mag_ut)
}

/// Fibonacci sphere visited in a scrambled order, so any prefix is spread
/// over the whole sphere.
fn sphere_directions(n: usize) -> Vec<Vector3<f64>> {
    let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    let points: Vec<Vector3<f64>> = (0..n)
        .map(|i| {
            let z = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - z * z).sqrt();
            let phi = i as f64 * golden;
            Vector3::new(r * phi.cos(), r * phi.sin(), z)
        })
        .collect();
    (0..n).map(|k| points[(k * 77) % n]).collect()
}

fn has_calibration_event(events: &[PipelineEvent], wanted: CalibrationEvent) -> bool {
    events
        .iter()
        .any(|e| matches!(e, PipelineEvent::Calibration(c) if *c == wanted))
}

#[rstest]
#[case::nominal(raw(0.0, Vector3::new(0.02, -0.01, 0.99), [3, -2, 1], Vector3::new(20.0, -10.0, 40.0)))]
#[case::already_converted(RawSample { timestamp: 1.0, ax: 0, ay: 0, az: 1, gx: 0, gy: 0, gz: 0, mx: 20, my: -10, mz: 40 })]
#[case::beyond_full_scale(RawSample { timestamp: 2.0, ax: 0, ay: 40_000, az: 8192, gx: -50_000, gy: 0, gz: 0, mx: 1500, my: 0, mz: 2800 })]
#[case::all_zero(RawSample { timestamp: 0.0, ax: 0, ay: 0, az: 0, gx: 0, gy: 0, gz: 0, mx: 0, my: 0, mz: 0 })]
fn raw_record_is_copied_verbatim(mut pipeline: Pipeline, #[case] sample: RawSample) {
    let before = sample;
    let out = pipeline.process(&sample);
    assert_eq!(out.sample.raw, before);
    assert_eq!(out.sample.raw.timestamp.to_bits(), before.timestamp.to_bits());
    assert!(out.sample.orientation.to_unit().is_some());
}

#[rstest]
fn quaternion_stays_normalized(#[values(FusionMode::Imu, FusionMode::Marg)] mode: FusionMode) {
    let mut config = PipelineConfig::default();
    config.ahrs.mode = mode;
    let mut pipeline = Pipeline::new(config).unwrap();

    for i in 0..2000 {
        let t = i as f64 * DT;
        let gyro = [
            (2000.0 * (t * 1.3).sin()) as i32,
            (1500.0 * (t * 0.7).cos()) as i32,
            (3000.0 * (t * 0.4).sin()) as i32,
        ];
        let accel = Vector3::new(0.3 * (t * 2.0).sin(), 0.2 * t.cos(), 0.95);
        let mag = Vector3::new(20.0 * t.cos(), 20.0 * t.sin(), -40.0);
        let out = pipeline.process(&raw(t, accel, gyro, mag));

        let q = out.sample.orientation;
        let norm = (q.w * q.w + q.x * q.x + q.y * q.y + q.z * q.z).sqrt();
        assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-9);
        assert!(out.sample.euler.pitch.abs() <= 90.0);
        assert!(out.sample.euler.roll.is_finite() && out.sample.euler.yaw.is_finite());
    }
}

#[rstest]
fn calibration_end_to_end(mut pipeline: Pipeline, distortion: Distortion) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    let persister = BackgroundPersister::spawn(JsonFileStore::new(&path), 4).unwrap();
    pipeline = pipeline.with_persistence(persister.sender().unwrap());

    let events = pipeline.start_calibration(CalibrationPhase::Ellipsoid).unwrap();
    assert!(has_calibration_event(
        &events,
        CalibrationEvent::PhaseStarted { phase: CalibrationPhase::Ellipsoid }
    ));

    // Phase 1: sweep the sphere
    let mut t = 0.0;
    let mut ellipsoid_done = false;
    for d in sphere_directions(400) {
        let out = pipeline.process(&level(t, distortion.apply(&(d * FIELD_UT))));
        t += DT;
        assert!(out.sample.residual.is_none());
        if has_calibration_event(
            &out.events,
            CalibrationEvent::PhaseCompleted { phase: CalibrationPhase::Ellipsoid },
        ) {
            assert!(has_calibration_event(
                &out.events,
                CalibrationEvent::PhaseStarted { phase: CalibrationPhase::EarthField }
            ));
            assert!(out
                .events
                .iter()
                .any(|e| matches!(e, PipelineEvent::CalibrationQueued { .. })));
            ellipsoid_done = true;
            break;
        }
    }
    assert!(ellipsoid_done);
    let state = pipeline.calibration();
    assert_eq!(state.iron_source, IronSource::Ellipsoid);
    assert_abs_diff_eq!(state.hard_iron_ut, distortion.offset_ut, epsilon = 3.0);

    // Earth field at a fixed pose
    let still = distortion.apply(&(Vector3::new(0.4, 0.0, -0.9).normalize() * FIELD_UT));
    let mut captured = false;
    for _ in 0..100 {
        let out = pipeline.process(&level(t, still));
        t += DT;
        if has_calibration_event(
            &out.events,
            CalibrationEvent::PhaseCompleted { phase: CalibrationPhase::EarthField },
        ) {
            captured = true;
        }
    }
    assert!(captured);
    assert!(pipeline.calibration().earth_field_ready());

    // Same pose, Earth field only: residual vanishes, detector stays quiet
    let mut last = None;
    for _ in 0..150 {
        let out = pipeline.process(&level(t, still));
        t += DT;
        let residual = out.sample.residual.expect("Earth field is set");
        assert!(residual.magnitude_ut < 0.5);
        last = Some(out);
    }
    let reading = last.and_then(|o| o.sample.magnet).expect("detector baselined");
    assert_eq!(reading.status, MagnetStatus::None);

    // A magnet adds ~35 µT in the sensor frame
    let with_magnet = still + distortion.gain * Vector3::new(0.0, 0.0, 35.0);
    let mut statuses = Vec::new();
    for _ in 0..60 {
        let out = pipeline.process(&level(t, with_magnet));
        t += DT;
        statuses.push(out.sample.magnet.expect("detector baselined").status);
    }
    assert_eq!(statuses.last(), Some(&MagnetStatus::Likely));
    assert!(!statuses.contains(&MagnetStatus::Confirmed));

    drop(pipeline);
    let saved = persister.shutdown().unwrap();
    assert_eq!(saved, 2);

    let doc = JsonFileStore::new(&path).load().unwrap().expect("document written");
    assert!(doc.phases.hard_iron);
    assert!(doc.phases.earth_field);
    assert!(!doc.phases.refined);
}

#[rstest]
fn restored_calibration_skips_phase_one(mut pipeline: Pipeline, distortion: Distortion) {
    pipeline.start_calibration(CalibrationPhase::Ellipsoid).unwrap();
    let mut t = 0.0;
    for d in sphere_directions(400) {
        pipeline.process(&level(t, distortion.apply(&(d * FIELD_UT))));
        t += DT;
        if pipeline.calibration().iron_ready() {
            break;
        }
    }
    pipeline.cancel_calibration().unwrap();
    let doc = pipeline.calibration_document();

    let mut fresh = Pipeline::new(PipelineConfig::default()).unwrap();
    fresh.restore_calibration(&doc).unwrap();
    assert_eq!(fresh.calibration().iron_source, IronSource::Ellipsoid);
    assert!(!fresh.calibration().earth_field_ready());

    // Only Earth-field capture is left to do
    let events = fresh.start_calibration(CalibrationPhase::EarthField).unwrap();
    assert!(has_calibration_event(
        &events,
        CalibrationEvent::PhaseStarted { phase: CalibrationPhase::EarthField }
    ));

    let m = distortion.apply(&Vector3::new(0.0, 30.0, -40.0));
    let a = fresh.process(&level(0.0, m)).sample.mag_calibrated_ut.unwrap();
    let b = pipeline.process(&level(t, m)).sample.mag_calibrated_ut.unwrap();
    assert_abs_diff_eq!(a, b, epsilon = 1e-9);
}

#[rstest]
fn reset_drops_every_parameter(mut pipeline: Pipeline, distortion: Distortion) {
    pipeline.start_calibration(CalibrationPhase::Ellipsoid).unwrap();
    let mut t = 0.0;
    for d in sphere_directions(400) {
        pipeline.process(&level(t, distortion.apply(&(d * FIELD_UT))));
        t += DT;
    }
    assert!(pipeline.calibration().iron_ready());

    let events = pipeline.reset_calibration();
    assert!(has_calibration_event(
        &events,
        CalibrationEvent::PhaseStarted { phase: CalibrationPhase::Ellipsoid }
    ));
    assert!(!pipeline.calibration().iron_ready());
    let out = pipeline.process(&level(t, distortion.apply(&Vector3::new(0.0, 0.0, FIELD_UT))));
    assert!(out.sample.mag_calibrated_ut.is_none());
    assert!(out.sample.magnet.is_none());
}

#[rstest]
fn refine_requires_iron_first(mut pipeline: Pipeline) {
    assert!(pipeline.start_calibration(CalibrationPhase::Refinement).is_err());
    assert!(pipeline.start_calibration(CalibrationPhase::EarthField).is_err());
    assert!(pipeline.cancel_calibration().is_err());
}
