//! High-level FluidNC motion controller.
//!
//! Built on [`crate::link::SerialLink`] and [`crate::monitor::StatusMonitor`].
//! Every operation validates before it transmits, and every motion command
//! blocks through `wait_for_idle` so callers observe completed moves, never
//! queued ones.

use crate::link::{PortFactory, SerialLink};
use crate::monitor::{MotionEvent, StatusMonitor};
use async_trait::async_trait;
use scan_core::capabilities::MotionControllable;
use scan_core::config::MotionConfig;
use scan_core::error::{ScanResult, ScannerError};
use scan_core::motion::{ControllerSnapshot, MotionState};
use scan_core::position::Position4D;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Minimum timeout for a homing cycle.
const HOMING_TIMEOUT: Duration = Duration::from_secs(120);
/// Minimum timeout for one move to complete.
const MOVE_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for a `?` status round-trip.
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for `$X` unlock.
const UNLOCK_TIMEOUT: Duration = Duration::from_secs(15);

/// Engagement window: an `Idle` observed sooner than this after issuing a
/// motion command may be a stale pre-command snapshot and is not treated as
/// completion unless motion was observed in between.
const ENGAGEMENT_WINDOW: Duration = Duration::from_millis(500);
/// Snapshot poll interval inside `wait_for_idle`.
const IDLE_POLL: Duration = Duration::from_millis(20);
/// A snapshot older than this during a wait triggers an explicit `?` query.
const SNAPSHOT_STALE_AFTER: Duration = Duration::from_millis(600);

/// Default feedrate when the caller does not supply one (units/min).
const DEFAULT_FEEDRATE: f64 = 1000.0;

/// FluidNC-based motion controller for the 4DOF scanner.
pub struct FluidNcController {
    link: Arc<SerialLink>,
    monitor: StatusMonitor,
    config: MotionConfig,
    initialized: AtomicBool,
}

impl FluidNcController {
    /// Create a controller over an arbitrary port factory. The link is not
    /// opened until [`MotionControllable::initialize`] runs.
    pub fn with_port_factory(config: MotionConfig, factory: PortFactory) -> Self {
        let link = SerialLink::new(factory);
        let monitor = StatusMonitor::spawn(link.subscribe());
        Self {
            link,
            monitor,
            config,
            initialized: AtomicBool::new(false),
        }
    }

    /// Create a controller for a real serial device from the resolved config.
    #[cfg(feature = "serial")]
    pub fn open(config: MotionConfig) -> Self {
        use scan_core::serial::DynSerial;

        let port = config.port.clone();
        let baud = config.baud_rate;
        let factory: PortFactory = Arc::new(move || {
            let port = port.clone();
            Box::pin(async move {
                let stream = scan_core::serial::open_serial_async(&port, baud, "FluidNC").await?;
                Ok(Box::new(stream) as DynSerial)
            })
        });
        Self::with_port_factory(config, factory)
    }

    /// Latest controller snapshot.
    pub fn snapshot(&self) -> ControllerSnapshot {
        self.monitor.snapshot()
    }

    /// Subscribe to extracted motion events (homing messages, alarms, link
    /// transitions).
    pub fn subscribe_events(&self) -> broadcast::Receiver<MotionEvent> {
        self.monitor.subscribe_events()
    }

    /// Send one command line and wait for its `ok`/`error` acknowledgment.
    async fn command(&self, line: &str, timeout: Duration) -> ScanResult<()> {
        // Register before writing so a fast reply cannot race us
        let ack = self.monitor.register_ack();
        if let Err(e) = self.link.send_line(line).await {
            // The line never reached the firmware: no ack will ever come,
            // so flush the queue to keep ack bookkeeping aligned
            self.monitor.fail_pending("link write failed");
            return Err(ScannerError::Link(e));
        }
        match tokio::time::timeout(timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ScannerError::Link("monitor dropped ack channel".into())),
            Err(_) => Err(ScannerError::Timeout {
                operation: format!("command '{}'", line),
                elapsed_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Send a line without ack bookkeeping. Used for `$H`, `?` and commands
    /// issued while the firmware is in a state where acks are unreliable.
    async fn command_unacked(&self, line: &str) -> ScanResult<()> {
        self.link.send_line(line).await.map_err(ScannerError::Link)
    }

    /// Issue `?` and wait for the next status frame to land in the snapshot.
    pub async fn request_status(&self) -> ScanResult<ControllerSnapshot> {
        let before = self.monitor.snapshot().status_seq;
        let mut watch = self.monitor.watch();
        self.command_unacked("?").await?;

        let deadline = Instant::now() + STATUS_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ScannerError::Timeout {
                    operation: "status query".into(),
                    elapsed_ms: STATUS_TIMEOUT.as_millis() as u64,
                });
            }
            if tokio::time::timeout(remaining, watch.changed()).await.is_err() {
                continue; // loop re-checks the deadline
            }
            let snap = watch.borrow().clone();
            if snap.status_seq > before {
                return Ok(snap);
            }
        }
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    /// Wait until the current motion command has demonstrably completed.
    ///
    /// Completion requires one of:
    /// - motion (`Run`/`Jog`) was observed at least once and the state then
    ///   returned to `Idle`;
    /// - the state has stayed `Idle` past the engagement window on a fresh
    ///   snapshot (quick commands that finished before the first report);
    /// - the snapshot was stale, and a fresh `?` confirms `Idle` past the
    ///   engagement window.
    ///
    /// Fails on alarm, controller error, emergency stop, or timeout.
    async fn wait_for_idle(&self, timeout: Duration, operation: &str) -> ScanResult<()> {
        let issued_at = Instant::now();
        let seq_at_issue = self.monitor.snapshot().status_seq;
        let mut seen_motion = false;
        let mut last_query_at: Option<Instant> = None;

        loop {
            let snap = self.monitor.snapshot();
            match snap.state {
                MotionState::Moving | MotionState::Homing => {
                    seen_motion = true;
                }
                MotionState::Alarm => return Err(ScannerError::Alarm { code: None }),
                MotionState::Error => {
                    return Err(ScannerError::Protocol {
                        code: None,
                        message: "controller entered error state during motion".into(),
                    })
                }
                MotionState::EmergencyStop => return Err(ScannerError::EmergencyStopped),
                MotionState::Disconnected => {
                    return Err(ScannerError::Link("link lost during motion".into()))
                }
                MotionState::Hold => {
                    // Feed hold: motion is suspended, keep waiting
                    debug!("hold state during {}", operation);
                }
                MotionState::Idle => {
                    if seen_motion {
                        debug!(elapsed_ms = issued_at.elapsed().as_millis() as u64,
                               "{} complete (run->idle)", operation);
                        return Ok(());
                    }
                    if issued_at.elapsed() > ENGAGEMENT_WINDOW {
                        if snap.status_seq > seq_at_issue {
                            // Fresh post-command report still says Idle: the
                            // command completed inside the engagement window
                            debug!("{} complete (quick completion)", operation);
                            return Ok(());
                        }
                        // Stale snapshot: ask the firmware directly, but not
                        // more than once per stale interval
                        let due = last_query_at
                            .map(|t| t.elapsed() > SNAPSHOT_STALE_AFTER)
                            .unwrap_or(issued_at.elapsed() > SNAPSHOT_STALE_AFTER);
                        if due {
                            last_query_at = Some(Instant::now());
                            if let Err(e) = self.command_unacked("?").await {
                                warn!(error = %e, "status request during wait failed");
                            }
                        }
                    }
                }
            }

            if issued_at.elapsed() >= timeout {
                return Err(ScannerError::Timeout {
                    operation: operation.to_string(),
                    elapsed_ms: issued_at.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    /// Wait for a homing cycle to finish.
    ///
    /// The firmware's status stream can lag mechanical completion by
    /// seconds, so the message stream is the preferred signal:
    /// 1. the final `homing done` message;
    /// 2. a `Home` -> `Idle` state transition;
    /// 3. `Idle` (or post-home `Alarm`) with the machine at the expected
    ///    home position within tolerance.
    async fn wait_for_homing_complete(
        &self,
        mut events: broadcast::Receiver<MotionEvent>,
    ) -> ScanResult<()> {
        let start = Instant::now();
        let mut homing_seen = false;

        loop {
            if start.elapsed() >= HOMING_TIMEOUT {
                return Err(ScannerError::Timeout {
                    operation: "homing".into(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                });
            }

            let event = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
            match event {
                Ok(Ok(MotionEvent::HomingDone)) => {
                    info!("homing complete (homing done message)");
                    return Ok(());
                }
                Ok(Ok(MotionEvent::HomedAxis(axis))) => {
                    info!(axis = %axis, "axis homed");
                    homing_seen = true;
                    continue;
                }
                Ok(Ok(MotionEvent::HomingMessage(text))) => {
                    debug!(msg = %text, "homing progress");
                    homing_seen = true;
                    continue;
                }
                Ok(Ok(MotionEvent::LinkDead)) => {
                    return Err(ScannerError::Link("link lost during homing".into()));
                }
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(ScannerError::Link("monitor stopped during homing".into()));
                }
                Err(_) => {
                    // No message for 200 ms; fall back to snapshot patterns
                }
            }

            let snap = self.monitor.snapshot();
            match snap.state {
                MotionState::Homing => {
                    homing_seen = true;
                }
                MotionState::Idle if homing_seen => {
                    info!("homing complete (home->idle transition)");
                    return Ok(());
                }
                MotionState::Idle | MotionState::Alarm => {
                    // Status lag pattern: machine parked at the expected home
                    if self.at_expected_home(&snap.machine_pos) && start.elapsed() > Duration::from_secs(2)
                    {
                        info!(pos = %snap.machine_pos, state = %snap.state,
                              "homing complete (expected home position reached)");
                        if snap.state == MotionState::Alarm {
                            // Post-home alarm is common; try one unlock
                            if let Err(e) = self.unlock_inner().await {
                                warn!(error = %e, "post-homing unlock failed");
                            }
                        }
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    /// True when X and Y are within tolerance of the configured home.
    ///
    /// Only the linear axes actually home; Z is continuous and C is a servo.
    fn at_expected_home(&self, pos: &Position4D) -> bool {
        let expected = &self.config.expected_home;
        (pos.x - expected.position.x).abs() <= expected.tolerance_mm
            && (pos.y - expected.position.y).abs() <= expected.tolerance_mm
    }

    /// Clear work coordinate offsets, escalating as needed.
    ///
    /// `$RST=#` followed by `G92.1` is usually enough; some firmware builds
    /// keep WCO in non-volatile storage and only forget it across a `$Bye`
    /// restart, so persistence is verified and escalated once.
    async fn reset_work_offsets(&self) -> ScanResult<()> {
        info!("clearing work coordinate offsets");
        if let Err(e) = self.command("$RST=#", self.default_timeout()).await {
            warn!(error = %e, "$RST=# failed");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Err(e) = self.command("G92.1", self.default_timeout()).await {
            warn!(error = %e, "G92.1 failed");
        }
        let _ = self.command("G54", self.default_timeout()).await;

        let snap = self.request_status().await?;
        let cleared = snap
            .wco
            .map(|w| w.approx_eq(&Position4D::default(), 1e-3))
            .unwrap_or(true);
        if cleared {
            info!("work coordinate offsets cleared");
            return Ok(());
        }

        warn!("work offsets persist; escalating to $Bye restart");
        // The restart drops the link; the reader task reconnects and resends
        // the init sequence.
        self.command_unacked("$Bye").await?;
        let mut events = self.monitor.subscribe_events();
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ScannerError::Timeout {
                    operation: "controller restart for WCO clear".into(),
                    elapsed_ms: 15_000,
                });
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(MotionEvent::LinkRecovered)) => break,
                Ok(Ok(MotionEvent::LinkDead)) => {
                    return Err(ScannerError::Link(
                        "link did not recover after $Bye restart".into(),
                    ))
                }
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => continue,
                Err(_) => continue,
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let snap = self.request_status().await?;
        let cleared = snap
            .wco
            .map(|w| w.approx_eq(&Position4D::default(), 1e-3))
            .unwrap_or(true);
        if cleared {
            info!("work coordinate offsets cleared after restart");
            Ok(())
        } else {
            Err(ScannerError::Protocol {
                code: None,
                message: "work coordinate offsets persist after controller restart".into(),
            })
        }
    }

    async fn unlock_inner(&self) -> ScanResult<()> {
        self.command("$X", UNLOCK_TIMEOUT).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snap = self.request_status().await?;
        if snap.state == MotionState::Alarm {
            return Err(ScannerError::Alarm { code: None });
        }
        Ok(())
    }

    /// Validate, clamp and format one absolute move, returning the command
    /// line. Split out for testability.
    fn build_move(&self, target: &Position4D, feedrate: Option<f64>, from: &Position4D)
        -> ScanResult<String>
    {
        self.config.limits.validate(target)?;
        let delta = *target - *from;
        let feed = self
            .config
            .limits
            .clamp_feedrate(feedrate.unwrap_or(DEFAULT_FEEDRATE), &delta);
        Ok(format!("G1 {} F{:.0}", target.gcode_words(), feed))
    }

    /// Resume a feed hold (`~`).
    pub async fn resume_motion(&self) -> ScanResult<()> {
        self.link
            .send_realtime(b"~")
            .await
            .map_err(ScannerError::Link)
    }

    /// Assert a feed hold (`!`) without resetting.
    pub async fn pause_motion(&self) -> ScanResult<()> {
        self.link
            .send_realtime(b"!")
            .await
            .map_err(ScannerError::Link)
    }

    /// Rapid (G0) move to an absolute position, validated like `move_to`.
    #[instrument(skip(self), fields(target = %target), err)]
    pub async fn rapid_move(&self, target: Position4D) -> ScanResult<Position4D> {
        self.config.limits.validate(&target)?;
        self.command(&format!("G0 {}", target.gcode_words()), self.default_timeout())
            .await?;
        self.wait_for_idle(MOVE_TIMEOUT, "rapid move").await?;
        Ok(self.request_status().await?.work_pos)
    }

    /// Soft-reset the controller (0x18) and re-run the init sequence.
    ///
    /// Clears the planner queue and any homed state; motion after a reset
    /// requires a fresh homing cycle.
    pub async fn reset_controller(&self, auto_unlock: bool) -> ScanResult<()> {
        self.link
            .send_realtime(&[0x18])
            .await
            .map_err(ScannerError::Link)?;
        self.monitor.fail_pending("controller reset");
        self.monitor.set_homed(false);
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.initialize(auto_unlock).await
    }
}

#[async_trait]
impl MotionControllable for FluidNcController {
    #[instrument(skip(self), err)]
    async fn initialize(&self, auto_unlock: bool) -> ScanResult<()> {
        // Clears any latched emergency-stop state from a previous session
        self.monitor.force_state(MotionState::Disconnected);
        self.link
            .set_init_lines(vec![
                "G21".into(),
                "G90".into(),
                "G94".into(),
                format!("$Report/Interval={}", self.config.status_report_interval_ms),
            ])
            .await;
        if !self.link.is_healthy() {
            self.link
                .connect()
                .await
                .map_err(|e| ScannerError::Link(e.to_string()))?;
            // Let the firmware finish its boot chatter before talking to it
            tokio::time::sleep(Duration::from_millis(self.config.startup_settle_ms)).await;
        }

        let snap = self.request_status().await?;
        if snap.state == MotionState::Alarm {
            if auto_unlock {
                info!("controller in alarm state, auto-unlocking");
                if let Err(e) = self.unlock_inner().await {
                    warn!(error = %e, "auto-unlock failed; homing will clear the alarm");
                }
            } else {
                warn!("controller in alarm state; unlock() or a homing cycle will clear it");
            }
        }

        // Basic G-code modes; tolerated to fail while alarmed
        for cmd in ["G21", "G90", "G94"] {
            if let Err(e) = self.command(cmd, self.default_timeout()).await {
                warn!(command = cmd, error = %e, "init command rejected");
            }
        }
        self.command(
            &format!("$Report/Interval={}", self.config.status_report_interval_ms),
            self.default_timeout(),
        )
        .await?;

        self.initialized.store(true, Ordering::Release);
        info!(port = %self.config.port, "motion controller initialized");
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn home(&self) -> ScanResult<Position4D> {
        self.monitor.set_homed(false);

        // Make sure the steppers are energized; some builds reject M17, which
        // is harmless
        if let Err(e) = self.command("M17", self.default_timeout()).await {
            debug!(error = %e, "M17 rejected (continuing)");
        }

        let snap = self.request_status().await?;
        if snap.state == MotionState::Alarm {
            info!("alarm state before homing; the homing cycle clears it");
        }

        // $H acks only after the cycle finishes, so completion is driven by
        // messages and status rather than the ack queue. Subscribe before
        // sending so no homing message can be missed.
        let events = self.monitor.subscribe_events();
        self.command_unacked("$H").await?;
        self.wait_for_homing_complete(events).await?;

        self.reset_work_offsets().await?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snap = self.request_status().await?;
        if !self.at_expected_home(&snap.machine_pos) {
            warn!(
                pos = %snap.machine_pos,
                expected = %self.config.expected_home.position,
                "post-homing position outside expected tolerance"
            );
        }
        self.monitor.set_homed(true);
        info!(pos = %snap.work_pos, "homing sequence complete");
        Ok(snap.work_pos)
    }

    #[instrument(skip(self), fields(target = %target), err)]
    async fn move_to(&self, target: Position4D, feedrate: Option<f64>) -> ScanResult<Position4D> {
        if !self.is_connected() {
            return Err(ScannerError::Link("not connected".into()));
        }
        let from = self.monitor.snapshot().work_pos;
        let command = self.build_move(&target, feedrate, &from)?;

        self.command(&command, self.default_timeout()).await?;
        self.wait_for_idle(MOVE_TIMEOUT, "move").await?;

        let snap = self.request_status().await?;
        Ok(snap.work_pos)
    }

    #[instrument(skip(self), fields(delta = %delta), err)]
    async fn move_relative(
        &self,
        delta: Position4D,
        feedrate: Option<f64>,
    ) -> ScanResult<Position4D> {
        let from = self.monitor.snapshot().work_pos;
        let target = from + delta;
        self.config.limits.validate(&target)?;
        let feed = self
            .config
            .limits
            .clamp_feedrate(feedrate.unwrap_or(DEFAULT_FEEDRATE), &delta);

        self.command("G91", self.default_timeout()).await?;
        let result = self
            .command(
                &format!("G0 {} F{:.0}", delta.gcode_words(), feed),
                self.default_timeout(),
            )
            .await;
        // Always restore absolute mode, even when the move was rejected
        let restore = self.command("G90", self.default_timeout()).await;
        result?;
        restore?;

        self.wait_for_idle(MOVE_TIMEOUT, "relative move").await?;
        let snap = self.request_status().await?;
        Ok(snap.work_pos)
    }

    #[instrument(skip(self), err)]
    async fn emergency_stop(&self) -> ScanResult<()> {
        warn!("emergency stop");
        // Feed hold first, then soft reset; both are real-time bytes that
        // bypass the planner queue
        self.link
            .send_realtime(b"!")
            .await
            .map_err(ScannerError::Link)?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.link
            .send_realtime(&[0x18])
            .await
            .map_err(ScannerError::Link)?;

        self.monitor.fail_pending("emergency stop engaged");
        self.monitor.force_state(MotionState::EmergencyStop);
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn unlock(&self) -> ScanResult<()> {
        self.unlock_inner().await
    }

    async fn position(&self) -> ScanResult<Position4D> {
        Ok(self.request_status().await?.work_pos)
    }

    async fn status(&self) -> MotionState {
        self.monitor.snapshot().state
    }

    fn is_connected(&self) -> bool {
        self.link.is_healthy() && self.initialized.load(Ordering::Acquire)
    }

    fn is_homed(&self) -> bool {
        self.monitor.snapshot().homed
    }

    async fn shutdown(&self) -> ScanResult<()> {
        self.initialized.store(false, Ordering::Release);
        self.monitor.force_state(MotionState::Disconnected);
        self.link.close().await;
        Ok(())
    }
}
