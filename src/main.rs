use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

use magnet_tracker_rs::calibration::CalibrationPhase;
use magnet_tracker_rs::filters::FusionMode;
use magnet_tracker_rs::persistence::{BackgroundPersister, CalibrationStore, JsonFileStore};
use magnet_tracker_rs::{CalibrationEvent, Pipeline, PipelineConfig, PipelineEvent, SessionLog};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Imu,
    Marg,
}

impl From<ModeArg> for FusionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Imu => FusionMode::Imu,
            ModeArg::Marg => FusionMode::Marg,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "magnet_tracker")]
#[command(about = "Replay a recorded IMU session through the magnet tracking pipeline", long_about = None)]
struct Args {
    /// Session log (.json or .json.gz) with raw LSB samples
    #[arg(long)]
    input: PathBuf,

    /// Write decorated samples here (.json or .json.gz)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Pipeline configuration JSON; missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start from a saved calibration document
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Save accepted calibration phases to this file
    #[arg(long)]
    save_calibration: Option<PathBuf>,

    /// Run calibration phases over the session
    #[arg(long)]
    calibrate: bool,

    /// Insert the orientation-aware refinement after the ellipsoid fit
    #[arg(long)]
    refine: bool,

    /// Orientation filter variant
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
}

fn load_session(path: &Path) -> Result<SessionLog> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let session = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        serde_json::from_reader(BufReader::new(GzDecoder::new(file)))
    } else {
        serde_json::from_reader(BufReader::new(file))
    };
    session.with_context(|| format!("parsing {}", path.display()))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let mut gz = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut gz, value)?;
        gz.finish()?.flush()?;
    } else {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
    }
    Ok(())
}

fn build_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.ahrs.mode = mode.into();
    }
    if args.refine {
        config.calibration.refine_after_ellipsoid = true;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = build_config(&args)?;
    let session = load_session(&args.input)?;
    log::info!(
        "Loaded {} samples from {} (device {})",
        session.samples.len(),
        args.input.display(),
        session.device_id.as_deref().unwrap_or("unknown")
    );

    let persister = match &args.save_calibration {
        Some(path) => Some(BackgroundPersister::spawn(JsonFileStore::new(path), 4)?),
        None => None,
    };

    let mut pipeline = Pipeline::new(config)?;
    if let Some(tx) = persister.as_ref().and_then(BackgroundPersister::sender) {
        pipeline = pipeline.with_persistence(tx);
    }

    if let Some(path) = &args.calibration {
        let store = JsonFileStore::new(path);
        match store.load()? {
            Some(doc) => pipeline.restore_calibration(&doc)?,
            None => bail!("calibration file {} not found", path.display()),
        }
    }

    if args.calibrate {
        let phase = if pipeline.calibration().iron_ready() {
            CalibrationPhase::EarthField
        } else {
            CalibrationPhase::Ellipsoid
        };
        pipeline.start_calibration(phase)?;
    }

    let mut decorated = Vec::with_capacity(if args.output.is_some() { session.samples.len() } else { 0 });
    let mut event_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut magnet_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut rejections = Vec::new();

    for raw in &session.samples {
        let out = pipeline.process(raw);
        for event in &out.events {
            *event_counts.entry(event_name(event)).or_default() += 1;
            if let PipelineEvent::Calibration(CalibrationEvent::PhaseRejected { phase, metric, value, threshold }) = event {
                rejections.push(json!({
                    "phase": phase,
                    "metric": metric,
                    "value": value,
                    "threshold": threshold,
                    "timestamp": raw.timestamp,
                }));
            }
        }
        if let Some(reading) = &out.sample.magnet {
            *magnet_counts.entry(format!("{:?}", reading.status).to_lowercase()).or_default() += 1;
        }
        if args.output.is_some() {
            decorated.push(out.sample);
        }
    }

    if let Some(path) = &args.output {
        write_json(path, &decorated)?;
        log::info!("Wrote {} decorated samples to {}", decorated.len(), path.display());
    }

    drop(pipeline);
    let saved = match persister {
        Some(p) => p.shutdown()?,
        None => 0,
    };

    let summary = json!({
        "input": args.input.display().to_string(),
        "samples": session.samples.len(),
        "events": event_counts,
        "magnet_status": magnet_counts,
        "rejections": rejections,
        "calibration_saves": saved,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn event_name(event: &PipelineEvent) -> &'static str {
    match event {
        PipelineEvent::ContractViolation(_) => "contract_violation",
        PipelineEvent::Calibration(e) => match e {
            CalibrationEvent::PhaseStarted { .. } => "phase_started",
            CalibrationEvent::PhaseReady { .. } => "phase_ready",
            CalibrationEvent::PhaseCompleted { .. } => "phase_completed",
            CalibrationEvent::PhaseRejected { .. } => "phase_rejected",
            CalibrationEvent::PhaseCancelled { .. } => "phase_cancelled",
            CalibrationEvent::RecalibrationRecommended { .. } => "recalibration_recommended",
            CalibrationEvent::EarthFieldDriftCorrected { .. } => "earth_field_drift_corrected",
        },
        PipelineEvent::GyroBiasConverged { .. } => "gyro_bias_converged",
        PipelineEvent::DetectorBaselined { .. } => "detector_baselined",
        PipelineEvent::MagnetStatusChanged { .. } => "magnet_status_changed",
        PipelineEvent::CalibrationQueued { .. } => "calibration_queued",
    }
}
