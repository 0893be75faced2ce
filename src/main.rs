//! Thin CLI over the scan orchestrator.
//!
//! Exit codes: 0 scan completed, 2 validation error, 3 hardware error,
//! 4 cancelled.

use clap::{Parser, Subcommand};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use scan_camera::calibration::{CalibrationStore, Calibrator, SyncMode};
use scan_camera::sensor::CameraSensor;
use scan_core::capabilities::{MotionControllable, StillCapture};
use scan_core::config::ScannerConfig;
use scan_core::error::ScannerError;
use scan_engine::orchestrator::{ScanOptions, ScanOrchestrator};
use scan_engine::state::ScanStatus;
use scan_lighting::FlashArray;
use scan_motion::link::PortFactory;
use scan_motion::FluidNcController;
use scan_patterns::{
    CylindricalParameters, CylindricalPattern, GridParameters, GridPattern, ScanPattern, ServoTilt,
};
use scan_sim::{SimFluidNc, SimFirmwareConfig, SimLeds, SimSensor, SimSensorConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_OK: u8 = 0;
const EXIT_VALIDATION: u8 = 2;
const EXIT_HARDWARE: u8 = 3;
const EXIT_CANCELLED: u8 = 4;

#[derive(Parser)]
#[command(name = "rust_scan", version, about = "4DOF photogrammetric scanner controller")]
struct Cli {
    /// Path to the scanner configuration file.
    #[arg(long, default_value = "scanner.toml")]
    config: PathBuf,

    /// Run against simulated hardware instead of the real controller.
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a grid pattern and run the scan.
    Grid {
        #[arg(long, default_value_t = 0.0)]
        x_min: f64,
        #[arg(long, default_value_t = 100.0)]
        x_max: f64,
        #[arg(long, default_value_t = 0.0)]
        y_min: f64,
        #[arg(long, default_value_t = 100.0)]
        y_max: f64,
        /// Grid spacing in mm; omit to derive from image overlap.
        #[arg(long)]
        spacing: Option<f64>,
        #[arg(long)]
        scan_id: Option<String>,
        /// Skip the homing cycle (positions may be inaccurate).
        #[arg(long)]
        skip_homing: bool,
    },
    /// Generate a cylindrical turntable pattern and run the scan.
    Cylindrical {
        #[arg(long, default_value_t = 100.0)]
        radius: f64,
        #[arg(long, default_value_t = 50.0)]
        y_min: f64,
        #[arg(long, default_value_t = 150.0)]
        y_max: f64,
        #[arg(long, default_value_t = 20.0)]
        y_step: f64,
        /// Turntable angles, comma separated.
        #[arg(long, value_delimiter = ',', default_value = "0,60,120,180,240,300")]
        rotations: Vec<f64>,
        /// Servo focus height in mm; omit for a level camera.
        #[arg(long)]
        y_focus: Option<f64>,
        #[arg(long)]
        scan_id: Option<String>,
        #[arg(long)]
        skip_homing: bool,
    },
    /// Home the motion system and report the verified position.
    Home,
}

fn load_config(path: &PathBuf) -> Result<ScannerConfig, ScannerError> {
    let config: ScannerConfig = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("SCAN_").split("__"))
        .extract()
        .map_err(|e| ScannerError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

struct Rig {
    motion: Arc<FluidNcController>,
    cameras: Vec<Arc<dyn StillCapture>>,
    flash: Arc<FlashArray>,
    calibrator: Arc<Calibrator>,
}

/// Wire up motion, cameras and lighting.
///
/// Camera and LED hardware bind the `SensorBackend`/`LedBackend` seams; this
/// binary ships with the simulated implementations, so only the motion link
/// talks to real hardware unless `--simulate` is given.
async fn build_rig(config: &ScannerConfig, simulate: bool) -> Result<Rig, ScannerError> {
    let motion = if simulate {
        let sim = SimFluidNc::new(SimFirmwareConfig::default());
        let factory: PortFactory = Arc::new(move || {
            let sim = Arc::clone(&sim);
            Box::pin(async move { Ok(sim.spawn_session().await) })
        });
        let mut motion_config = config.motion.clone();
        motion_config.startup_settle_ms = 50;
        Arc::new(FluidNcController::with_port_factory(motion_config, factory))
    } else {
        Arc::new(FluidNcController::open(config.motion.clone()))
    };

    if !simulate {
        warn!("camera/LED hardware backends not configured; sensors run simulated");
    }

    let store = CalibrationStore::new();
    let cameras: Vec<Arc<dyn StillCapture>> = config
        .cameras
        .iter()
        .map(|cam_config| {
            let backend = SimSensor::new(SimSensorConfig::default());
            CameraSensor::new(cam_config.clone(), backend, Arc::clone(&store))
                as Arc<dyn StillCapture>
        })
        .collect();

    let leds = SimLeds::new();
    let flash = FlashArray::new(&config.lighting, leds);
    let calibrator = Arc::new(Calibrator::new(
        store,
        Some(flash.clone() as Arc<dyn scan_core::capabilities::Flashable>),
        config.lighting.calibration_flash.clone(),
    ));

    Ok(Rig {
        motion,
        cameras,
        flash,
        calibrator,
    })
}

async fn run_scan(
    config: ScannerConfig,
    rig: Rig,
    pattern: Arc<dyn ScanPattern>,
    scan_id: Option<String>,
    homing_confirmed: bool,
) -> u8 {
    let orchestrator = match ScanOrchestrator::new(
        config,
        rig.motion.clone() as Arc<dyn MotionControllable>,
        rig.cameras,
        Some(rig.flash),
        rig.calibrator,
    ) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "orchestrator construction failed");
            return EXIT_VALIDATION;
        }
    };
    orchestrator.watch_motion_events(rig.motion.subscribe_events());

    if let Err(e) = orchestrator.initialize().await {
        error!(error = %e, "hardware initialization failed");
        return EXIT_HARDWARE;
    }

    let options = ScanOptions {
        pattern,
        scan_id,
        output_root: None,
        parameters: serde_json::json!({}),
        homing_confirmed,
        sync_mode: SyncMode::Synchronized,
    };
    if let Err(e) = orchestrator.start_scan(options).await {
        error!(error = %e, "scan rejected");
        return EXIT_VALIDATION;
    }

    // Ctrl-C requests a cooperative stop; a second one is preemptive
    let stopper = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt: stopping scan at next yield point");
            let _ = stopper.stop_scan().await;
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("second interrupt: emergency stop");
                let _ = stopper.emergency_stop().await;
            }
        }
    });

    let state = match orchestrator
        .wait_for_completion(Duration::from_secs(24 * 3600))
        .await
    {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "scan did not reach a terminal state");
            return EXIT_HARDWARE;
        }
    };

    info!(
        scan_id = %state.scan_id,
        status = ?state.status,
        images = state.progress.images_captured,
        errors = state.errors.len(),
        "scan finished"
    );
    match state.status {
        ScanStatus::Completed => EXIT_OK,
        ScanStatus::Cancelled => EXIT_CANCELLED,
        _ => EXIT_HARDWARE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            return ExitCode::from(EXIT_VALIDATION);
        }
    };

    let rig = match build_rig(&config, cli.simulate).await {
        Ok(rig) => rig,
        Err(e) => {
            error!(error = %e, "hardware setup failed");
            return ExitCode::from(EXIT_HARDWARE);
        }
    };

    let code = match cli.command {
        Command::Grid {
            x_min,
            x_max,
            y_min,
            y_max,
            spacing,
            scan_id,
            skip_homing,
        } => {
            let params = GridParameters {
                x_range: (x_min, x_max),
                y_range: (y_min, y_max),
                x_spacing: spacing,
                y_spacing: spacing,
                overlap_percent: 30.0,
                working_distance: 150.0,
                z_values: vec![0.0],
                c_values: vec![0.0],
                zigzag: true,
                bracket_exposures: false,
                exposure_steps: 3,
                dwell_ms: 500,
            };
            let pattern = Arc::new(GridPattern::new(
                format!("grid_{}", chrono_stamp()),
                params,
            ));
            run_scan(config, rig, pattern, scan_id, !skip_homing).await
        }
        Command::Cylindrical {
            radius,
            y_min,
            y_max,
            y_step,
            rotations,
            y_focus,
            scan_id,
            skip_homing,
        } => {
            let servo = match y_focus {
                Some(y_focus) => ServoTilt::FocusPoint { y_focus },
                None => ServoTilt::None,
            };
            let params = CylindricalParameters {
                radius,
                y_range: (y_min, y_max),
                y_step,
                y_positions: None,
                z_rotations: rotations,
                servo,
                dwell_ms: 500,
            };
            let pattern = Arc::new(CylindricalPattern::new(
                format!("cylindrical_{}", chrono_stamp()),
                params,
            ));
            run_scan(config, rig, pattern, scan_id, !skip_homing).await
        }
        Command::Home => {
            if let Err(e) = rig.motion.initialize(false).await {
                error!(error = %e, "initialization failed");
                return ExitCode::from(EXIT_HARDWARE);
            }
            match rig.motion.home().await {
                Ok(position) => {
                    info!(%position, "homing complete");
                    EXIT_OK
                }
                Err(e) => {
                    error!(error = %e, "homing failed");
                    EXIT_HARDWARE
                }
            }
        }
    };

    ExitCode::from(code)
}

fn chrono_stamp() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
