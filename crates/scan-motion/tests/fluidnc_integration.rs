//! Integration tests: the motion controller against the simulated firmware.

#![allow(clippy::unwrap_used)]

use scan_core::capabilities::MotionControllable;
use scan_core::config::{ExpectedHomePosition, MotionConfig};
use scan_core::error::ScannerError;
use scan_core::limits::{AxisLimits, SoftLimits};
use scan_core::motion::MotionState;
use scan_core::position::Position4D;
use scan_motion::link::PortFactory;
use scan_motion::FluidNcController;
use scan_sim::{SimFluidNc, SimFirmwareConfig};
use std::sync::Arc;
use std::time::Duration;

fn motion_config() -> MotionConfig {
    MotionConfig {
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
    }
}

fn rig(fw: SimFirmwareConfig) -> (Arc<SimFluidNc>, FluidNcController) {
    let sim = SimFluidNc::new(fw);
    let factory_sim = Arc::clone(&sim);
    let factory: PortFactory = Arc::new(move || {
        let sim = Arc::clone(&factory_sim);
        Box::pin(async move { Ok(sim.spawn_session().await) })
    });
    let controller = FluidNcController::with_port_factory(motion_config(), factory);
    (sim, controller)
}

#[tokio::test]
async fn initialize_reaches_idle() {
    let (_sim, controller) = rig(SimFirmwareConfig::default());
    controller.initialize(false).await.unwrap();
    assert!(controller.is_connected());
    assert_eq!(controller.status().await, MotionState::Idle);
}

#[tokio::test]
async fn move_completes_via_run_idle_transition() {
    let (sim, controller) = rig(SimFirmwareConfig::default());
    controller.initialize(false).await.unwrap();

    let target = Position4D::new(10.0, 20.0, 90.0, 5.0);
    let reached = controller.move_to(target, None).await.unwrap();

    assert!(reached.approx_eq(&target, 0.01), "reached {}", reached);
    assert!(sim.machine_position().await.approx_eq(&target, 0.01));
    assert_eq!(controller.status().await, MotionState::Idle);
}

#[tokio::test]
async fn out_of_limits_move_rejected_before_wire() {
    let (sim, controller) = rig(SimFirmwareConfig::default());
    controller.initialize(false).await.unwrap();
    let moves_before = sim.machine_position().await;

    let err = controller
        .move_to(Position4D::new(400.0, 0.0, 0.0, 0.0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ScannerError::Safety(_)));
    // The machine never moved
    assert!(sim.machine_position().await.approx_eq(&moves_before, 1e-9));
}

#[tokio::test]
async fn homing_completes_with_message_stream() {
    let (_sim, controller) = rig(SimFirmwareConfig::default());
    controller.initialize(false).await.unwrap();

    let home = controller.home().await.unwrap();
    assert!(controller.is_homed());
    // Y homes to its maximum near 200 mm
    assert!((home.y - 200.0).abs() <= 5.0, "home y was {}", home.y);
}

#[tokio::test]
async fn homing_clears_boot_work_offsets() {
    let (_sim, controller) = rig(SimFirmwareConfig {
        initial_wco: Position4D::new(0.0, 0.0, 54.0, 0.0),
        ..Default::default()
    });
    controller.initialize(false).await.unwrap();
    controller.home().await.unwrap();

    let snap = controller.snapshot();
    let wco = snap.wco.unwrap_or_default();
    assert!(
        wco.approx_eq(&Position4D::default(), 1e-3),
        "WCO not cleared: {:?}",
        snap.wco
    );
    // Work-frame Z reads zero after the reset
    assert!(snap.work_pos.z.abs() < 1e-3);
}

#[tokio::test]
async fn relative_move_restores_absolute_mode() {
    let (_sim, controller) = rig(SimFirmwareConfig::default());
    controller.initialize(false).await.unwrap();

    controller
        .move_to(Position4D::new(10.0, 10.0, 0.0, 0.0), None)
        .await
        .unwrap();
    let after = controller
        .move_relative(Position4D::new(5.0, 0.0, 0.0, 0.0), None)
        .await
        .unwrap();
    assert!((after.x - 15.0).abs() < 0.01);

    // A following absolute move must land exactly, proving G90 is back on
    let absolute = controller
        .move_to(Position4D::new(30.0, 10.0, 0.0, 0.0), None)
        .await
        .unwrap();
    assert!((absolute.x - 30.0).abs() < 0.01);
}

#[tokio::test]
async fn alarm_during_move_fails_and_clears_homed() {
    let (_sim, controller) = rig(SimFirmwareConfig {
        alarm_on_move: Some(0),
        ..Default::default()
    });
    controller.initialize(false).await.unwrap();
    controller.home().await.unwrap();
    assert!(controller.is_homed());

    let err = controller
        .move_to(Position4D::new(10.0, 10.0, 0.0, 0.0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ScannerError::Alarm { .. }));
    assert!(!controller.is_homed());
    assert_eq!(controller.status().await, MotionState::Alarm);
}

#[tokio::test]
async fn unlock_clears_alarm_state() {
    let (_sim, controller) = rig(SimFirmwareConfig {
        initial_alarm: true,
        ..Default::default()
    });
    controller.initialize(false).await.unwrap();
    assert_eq!(controller.status().await, MotionState::Alarm);

    controller.unlock().await.unwrap();
    assert_eq!(controller.status().await, MotionState::Idle);
}

#[tokio::test]
async fn auto_unlock_during_initialize() {
    let (_sim, controller) = rig(SimFirmwareConfig {
        initial_alarm: true,
        ..Default::default()
    });
    controller.initialize(true).await.unwrap();
    assert_eq!(controller.status().await, MotionState::Idle);
}

#[tokio::test]
async fn emergency_stop_asserts_feed_hold_then_reset() {
    let (sim, controller) = rig(SimFirmwareConfig::default());
    controller.initialize(false).await.unwrap();

    controller.emergency_stop().await.unwrap();

    let log = sim.realtime_log().await;
    let hold = log.iter().position(|&b| b == b'!').expect("feed hold sent");
    let reset = log.iter().position(|&b| b == 0x18).expect("soft reset sent");
    assert!(hold < reset, "feed hold must precede soft reset");

    // The latched state survives subsequent Idle auto-reports
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(controller.status().await, MotionState::EmergencyStop);
    // Movement requires explicit re-initialization
    assert!(controller
        .move_to(Position4D::new(10.0, 10.0, 0.0, 0.0), None)
        .await
        .is_err());

    controller.initialize(false).await.unwrap();
    controller
        .move_to(Position4D::new(10.0, 10.0, 0.0, 0.0), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn link_drop_recovers_and_next_move_succeeds() {
    let (sim, controller) = rig(SimFirmwareConfig::default());
    controller.initialize(false).await.unwrap();

    sim.kill_sessions().await;

    // Bounded reconnect with backoff: give it a moment
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !controller.is_connected() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(controller.is_connected(), "link did not recover");

    let reached = controller
        .move_to(Position4D::new(25.0, 25.0, 0.0, 0.0), None)
        .await
        .unwrap();
    assert!((reached.x - 25.0).abs() < 0.01);
}
