//! End-to-end scan scenarios over the fully simulated rig: firmware,
//! sensors and LEDs are all in-process simulations; everything else is the
//! production stack.

#![allow(clippy::unwrap_used)]

use scan_camera::calibration::{CalibrationStore, Calibrator, SyncMode};
use scan_camera::sensor::CameraSensor;
use scan_core::capabilities::{Flashable, MotionControllable, StillCapture};
use scan_core::config::{
    CalibrationFlash, CameraConfig, ExpectedHomePosition, LightingConfig, MotionConfig,
    Resolution, ScannerConfig, ScanningConfig,
};
use scan_core::lighting::FlashSettings;
use scan_core::limits::{AxisLimits, SoftLimits};
use scan_core::position::Position4D;
use scan_engine::orchestrator::{ScanOptions, ScanOrchestrator};
use scan_engine::profiles::{ExposureMode, IsoPreference, QualityProfile, SpeedProfile};
use scan_engine::state::ScanStatus;
use scan_lighting::FlashArray;
use scan_motion::link::PortFactory;
use scan_motion::FluidNcController;
use scan_patterns::{
    CylindricalParameters, CylindricalPattern, GridParameters, GridPattern, ScanPattern,
    ServoTilt,
};
use scan_sim::{SimFluidNc, SimFirmwareConfig, SimLeds, SimSensor, SimSensorConfig};
use scan_storage::PositionsFile;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn scanner_config(output_root: &Path) -> ScannerConfig {
    ScannerConfig {
        motion: MotionConfig {
            port: "sim".into(),
            baud_rate: 115_200,
            command_timeout_secs: 2,
            status_report_interval_ms: 50,
            startup_settle_ms: 20,
            limits: SoftLimits {
                x: AxisLimits::new(-5.0, 205.0, 1000.0),
                y: AxisLimits::new(-5.0, 205.0, 800.0),
                z: AxisLimits::new(-999_999.0, 999_999.0, 360.0),
                c: AxisLimits::new(-90.0, 90.0, 180.0),
                safety_margin: 0.5,
            },
            expected_home: ExpectedHomePosition::default(),
        },
        cameras: vec![camera_config(0), camera_config(1)],
        lighting: LightingConfig {
            zones: BTreeMap::from([
                ("inner".to_string(), vec![0, 1]),
                ("outer".to_string(), vec![2, 3]),
            ]),
            rise_time_ms: 10,
            default_flash: FlashSettings {
                brightness: 0.7,
                duration_ms: 20,
                fade_ms: None,
            },
            calibration_flash: CalibrationFlash {
                enabled: true,
                brightness: 0.3,
            },
        },
        scanning: ScanningConfig {
            stabilization_delay_secs: 0.0,
            output_root: output_root.to_path_buf(),
            quality_profile: "medium".into(),
            speed_profile: "medium".into(),
        },
    }
}

fn camera_config(id: u8) -> CameraConfig {
    CameraConfig {
        id,
        name: format!("camera{}", id),
        stream_resolution: Resolution {
            width: 64,
            height: 48,
        },
        capture_resolution: Resolution {
            width: 64,
            height: 48,
        },
        jpeg_quality: 85,
        mode_switch_cooldown_ms: 10,
    }
}

fn test_quality() -> QualityProfile {
    QualityProfile {
        name: "test".into(),
        description: "test".into(),
        resolution: Resolution {
            width: 64,
            height: 48,
        },
        jpeg_quality: 85,
        iso_preference: IsoPreference::Auto,
        exposure_mode: ExposureMode::Calibrated,
        exposure_time_us: None,
        analogue_gain: None,
    }
}

fn test_speed() -> SpeedProfile {
    SpeedProfile {
        name: "test".into(),
        description: "test".into(),
        feedrate_multiplier: 1.0,
        settling_delay_secs: 0.01,
        acceleration_factor: 1.0,
        capture_delay_secs: 0.0,
    }
}

struct Rig {
    sim: Arc<SimFluidNc>,
    motion: Arc<FluidNcController>,
    leds: Arc<SimLeds>,
    orchestrator: Arc<ScanOrchestrator>,
    #[allow(dead_code)]
    sensors: Vec<Arc<SimSensor>>,
    root: TempDir,
}

async fn rig_with(fw: SimFirmwareConfig, sensor_configs: [SimSensorConfig; 2]) -> Rig {
    let root = tempfile::tempdir().unwrap();
    let config = scanner_config(root.path());

    let sim = SimFluidNc::new(fw);
    let factory_sim = Arc::clone(&sim);
    let factory: PortFactory = Arc::new(move || {
        let sim = Arc::clone(&factory_sim);
        Box::pin(async move { Ok(sim.spawn_session().await) })
    });
    let motion = Arc::new(FluidNcController::with_port_factory(
        config.motion.clone(),
        factory,
    ));

    let store = CalibrationStore::new();
    let mut sensors = Vec::new();
    let mut cameras: Vec<Arc<dyn StillCapture>> = Vec::new();
    for (cam_config, sensor_config) in config.cameras.iter().zip(sensor_configs) {
        let backend = SimSensor::new(sensor_config);
        sensors.push(Arc::clone(&backend));
        cameras.push(CameraSensor::new(
            cam_config.clone(),
            backend,
            Arc::clone(&store),
        ) as Arc<dyn StillCapture>);
    }

    let leds = SimLeds::new();
    let flash = FlashArray::new(&config.lighting, leds.clone());
    let calibrator = Arc::new(Calibrator::new(
        store,
        Some(Arc::clone(&flash) as Arc<dyn Flashable>),
        config.lighting.calibration_flash.clone(),
    ));

    let orchestrator = ScanOrchestrator::new(
        config,
        Arc::clone(&motion) as Arc<dyn MotionControllable>,
        cameras,
        Some(flash),
        calibrator,
    )
    .unwrap();
    orchestrator.watch_motion_events(motion.subscribe_events());
    orchestrator.initialize().await.unwrap();
    orchestrator
        .apply_custom_profiles(test_quality(), test_speed())
        .await;

    Rig {
        sim,
        motion,
        leds,
        orchestrator,
        sensors,
        root,
    }
}

async fn rig() -> Rig {
    rig_with(SimFirmwareConfig::default(), [
        SimSensorConfig::default(),
        SimSensorConfig::default(),
    ])
    .await
}

fn grid_pattern(x_max: f64, spacing: f64) -> Arc<dyn ScanPattern> {
    Arc::new(GridPattern::new(
        "grid_test",
        GridParameters {
            x_range: (0.0, x_max),
            y_range: (0.0, 0.0),
            x_spacing: Some(spacing),
            y_spacing: Some(spacing),
            overlap_percent: 30.0,
            working_distance: 150.0,
            z_values: vec![0.0],
            c_values: vec![0.0],
            zigzag: true,
            bracket_exposures: false,
            exposure_steps: 3,
            dwell_ms: 10,
        },
    ))
}

fn options(pattern: Arc<dyn ScanPattern>, scan_id: &str, homing: bool) -> ScanOptions {
    ScanOptions {
        pattern,
        scan_id: Some(scan_id.to_string()),
        output_root: None,
        parameters: serde_json::json!({"test": true}),
        homing_confirmed: homing,
        sync_mode: SyncMode::Synchronized,
    }
}

fn count_jpgs(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().map(|x| x == "jpg").unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}

// Scenario: two-point grid on a fresh controller.
#[tokio::test]
async fn two_point_grid_completes_with_calibrated_metadata() {
    let rig = rig().await;

    rig.orchestrator
        .start_scan(options(grid_pattern(50.0, 50.0), "scan_grid2", true))
        .await
        .unwrap();
    let state = rig
        .orchestrator
        .wait_for_completion(Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(state.status, ScanStatus::Completed);
    assert!(state.errors.is_empty(), "errors: {:?}", state.errors);
    assert_eq!(state.progress.images_captured, 4);
    assert!(rig.motion.is_homed(), "homing must have run");

    // Machine ended at the second point
    assert!(rig
        .sim
        .machine_position()
        .await
        .approx_eq(&Position4D::new(50.0, 0.0, 0.0, 0.0), 0.01));

    // Four JPEGs on disk, flash was used
    let session = rig.root.path().join("scan_grid2");
    assert_eq!(count_jpgs(&session.join("images")), 4);
    assert!(rig.leds.first_assert().is_some());

    // Positions file rewritten with calibrated settings
    let positions = PositionsFile::load(&PositionsFile::path_for(&session, "scan_grid2"))
        .await
        .unwrap();
    assert_eq!(
        positions.scan_info.camera_settings_info.settings_source,
        scan_core::imaging::CalibrationSource::CameraCalibrated
    );
    assert!(!positions.scan_info.camera_settings_info.will_be_updated);
    assert_eq!(positions.scan_positions.len(), 2);
    assert_eq!(positions.scan_positions[0].position, Position4D::default());

    // State snapshot persisted alongside
    assert!(session.join("scan_grid2_state.json").exists());
}

// Scenario: cylindrical scan with focus-point servo tilt.
#[tokio::test]
async fn cylindrical_scan_tracks_focus_point() {
    let rig = rig().await;

    let pattern = Arc::new(CylindricalPattern::new(
        "cyl_test",
        CylindricalParameters {
            radius: 100.0,
            y_range: (50.0, 150.0),
            y_step: 50.0,
            y_positions: None,
            z_rotations: vec![0.0, 180.0],
            servo: ServoTilt::FocusPoint { y_focus: 100.0 },
            dwell_ms: 0,
        },
    ));

    rig.orchestrator
        .start_scan(options(pattern, "scan_cyl", true))
        .await
        .unwrap();
    let state = rig
        .orchestrator
        .wait_for_completion(Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(state.status, ScanStatus::Completed);
    assert_eq!(state.progress.total_points, 6);
    assert_eq!(state.progress.images_captured, 12);

    let session = rig.root.path().join("scan_cyl");
    let positions = PositionsFile::load(&PositionsFile::path_for(&session, "scan_cyl"))
        .await
        .unwrap();
    for entry in &positions.scan_positions {
        let expected = ((100.0 - entry.position.y) / 100.0_f64).atan().to_degrees();
        assert!(
            (entry.position.c - expected).abs() < 0.01,
            "y={} c={} expected {}",
            entry.position.y,
            entry.position.c,
            expected
        );
    }
}

// Scenario: alarm on the first move.
#[tokio::test]
async fn alarm_on_first_move_fails_scan_without_frames() {
    let rig = rig_with(
        SimFirmwareConfig {
            alarm_on_move: Some(0),
            ..Default::default()
        },
        [SimSensorConfig::default(), SimSensorConfig::default()],
    )
    .await;

    rig.orchestrator
        .start_scan(options(grid_pattern(50.0, 50.0), "scan_alarm", true))
        .await
        .unwrap();
    let state = rig
        .orchestrator
        .wait_for_completion(Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(state.status, ScanStatus::Failed);
    assert!(
        state.errors.iter().any(|e| e.error_type == "alarm_state"),
        "errors: {:?}",
        state.errors
    );

    // Feed hold and soft reset were asserted on shutdown
    let log = rig.sim.realtime_log().await;
    assert!(log.contains(&b'!'));
    assert!(log.contains(&0x18));

    // No frames persisted
    let images = rig.root.path().join("scan_alarm/images");
    assert_eq!(count_jpgs(&images), 0);
}

// Scenario: pause mid-scan, resume within the bound.
#[tokio::test]
async fn pause_finishes_inflight_point_then_resumes() {
    let rig = rig().await;

    // 5 points: x = 0, 50, 100, 150, 200
    rig.orchestrator
        .start_scan(options(grid_pattern(200.0, 50.0), "scan_pause", true))
        .await
        .unwrap();

    // Wait until two points are committed, then request a pause while the
    // third is underway
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(state) = rig.orchestrator.get_scan_status().await {
            if state.progress.current_point >= 2 {
                break;
            }
            assert!(!state.status.is_terminal(), "scan ended early: {:?}", state);
        }
        assert!(tokio::time::Instant::now() < deadline, "never reached point 2");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    rig.orchestrator.pause_scan().await.unwrap();

    // The in-flight point completes before the pause takes effect
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let paused_at = loop {
        let state = rig.orchestrator.get_scan_status().await.unwrap();
        if state.status == ScanStatus::Paused {
            break state.progress.current_point;
        }
        assert!(tokio::time::Instant::now() < deadline, "never paused");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert!(paused_at >= 3, "paused after {} points", paused_at);

    rig.orchestrator.resume_scan().await.unwrap();
    let state = rig
        .orchestrator
        .wait_for_completion(Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(state.status, ScanStatus::Completed);
    assert_eq!(state.progress.images_captured, 10);
    // Pause time is excluded from elapsed but tracked
    assert!(state.timing.total_paused_secs > 0.0);
}

// Scenario: one sensor fails at one point; the scan continues partial.
#[tokio::test]
async fn single_sensor_failure_yields_partial_point() {
    // The failure must survive the sequential fallback too, so both the
    // simultaneous attempt (capture 2) and the staggered retry (capture 3)
    // return empty pixels
    let rig = rig_with(
        SimFirmwareConfig::default(),
        [
            SimSensorConfig::default(),
            SimSensorConfig {
                empty_capture_at: vec![2, 3],
                ..Default::default()
            },
        ],
    )
    .await;

    rig.orchestrator
        .start_scan(options(grid_pattern(200.0, 50.0), "scan_partial", true))
        .await
        .unwrap();
    let state = rig
        .orchestrator
        .wait_for_completion(Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(state.status, ScanStatus::Completed);
    assert_eq!(state.progress.images_captured, 9);

    let camera_errors: Vec<_> = state
        .errors
        .iter()
        .filter(|e| e.error_type == "camera_error")
        .collect();
    assert_eq!(camera_errors.len(), 1);
    assert_eq!(camera_errors[0].camera_id, Some(1));
    assert_eq!(camera_errors[0].point_index, Some(2));

    let images = rig.root.path().join("scan_partial/images");
    assert_eq!(count_jpgs(&images), 9);
}

// A transient single-capture failure is absorbed by the bounded-delay
// sequential fallback and never surfaces as a point error.
#[tokio::test]
async fn transient_capture_failure_recovered_by_sequential_fallback() {
    let rig = rig_with(
        SimFirmwareConfig::default(),
        [
            SimSensorConfig::default(),
            SimSensorConfig {
                // Only the simultaneous attempt fails; the retry succeeds
                empty_capture_at: vec![2],
                ..Default::default()
            },
        ],
    )
    .await;

    rig.orchestrator
        .start_scan(options(grid_pattern(200.0, 50.0), "scan_retry", true))
        .await
        .unwrap();
    let state = rig
        .orchestrator
        .wait_for_completion(Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(state.status, ScanStatus::Completed);
    assert_eq!(state.progress.images_captured, 10);
    assert!(
        !state.errors.iter().any(|e| e.error_type == "camera_error"),
        "recovered capture must not be recorded as a point error: {:?}",
        state.errors
    );

    let images = rig.root.path().join("scan_retry/images");
    assert_eq!(count_jpgs(&images), 10);
}

// Scenario: recoverable link hiccup during idle.
#[tokio::test]
async fn link_hiccup_recovers_and_is_logged_with_resolution() {
    let rig = rig().await;

    rig.sim.kill_sessions().await;

    // Bounded reconnect brings the link back within ~2 s
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !rig.motion.is_connected() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "link did not reconnect"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // A move issued after reconnect succeeds
    rig.motion
        .move_to(Position4D::new(15.0, 15.0, 0.0, 0.0), None)
        .await
        .unwrap();

    // The hiccup is in the error log with a resolution timestamp
    tokio::time::sleep(Duration::from_millis(50)).await;
    let errors = rig.orchestrator.system_errors().await;
    let link_error = errors
        .iter()
        .find(|e| e.error_type == "link_error")
        .expect("link error recorded");
    assert!(link_error.resolved_at.is_some(), "no resolution timestamp");
}

#[tokio::test]
async fn busy_gate_rejects_concurrent_scans() {
    let rig = rig().await;

    rig.orchestrator
        .start_scan(options(grid_pattern(200.0, 50.0), "scan_busy", true))
        .await
        .unwrap();
    let second = rig
        .orchestrator
        .start_scan(options(grid_pattern(50.0, 50.0), "scan_busy2", true))
        .await;
    assert!(second.is_err(), "second scan must be rejected");

    let state = rig
        .orchestrator
        .wait_for_completion(Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(state.status, ScanStatus::Completed);
}

#[tokio::test]
async fn stop_scan_cancels_cooperatively() {
    let rig = rig().await;

    rig.orchestrator
        .start_scan(options(grid_pattern(200.0, 50.0), "scan_stop", true))
        .await
        .unwrap();

    // Let it commit at least one point, then stop
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(state) = rig.orchestrator.get_scan_status().await {
            if state.progress.current_point >= 1 {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    rig.orchestrator.stop_scan().await.unwrap();

    let state = rig
        .orchestrator
        .wait_for_completion(Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(state.status, ScanStatus::Cancelled);
    assert!(state.progress.current_point < 5);
}

#[tokio::test]
async fn skipping_homing_is_honored_with_warning() {
    let rig = rig().await;

    rig.orchestrator
        .start_scan(options(grid_pattern(50.0, 50.0), "scan_nohome", false))
        .await
        .unwrap();
    let state = rig
        .orchestrator
        .wait_for_completion(Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(state.status, ScanStatus::Completed);
    assert!(!rig.motion.is_homed());
}
