//! Background status processor.
//!
//! One task consumes every line the link broadcasts, classifies it with
//! [`crate::protocol`], and maintains the authoritative
//! [`ControllerSnapshot`] behind a `watch` channel. It is the only writer of
//! the snapshot; everything else holds a receiver and clones the value.
//!
//! The monitor also owns acknowledgment bookkeeping: commands that expect a
//! response register a oneshot before their bytes are written, and `ok` /
//! `error:<n>` frames complete or fail the oldest registered waiter. Frames
//! arriving with no waiter registered (init resends, `$H`, `?`) are logged
//! and dropped, which is the tolerant behavior the firmware's unsolicited
//! chatter requires.

use crate::link::LinkEvent;
use crate::protocol::{self, Frame, ReportedState};
use scan_core::error::ScannerError;
use scan_core::motion::{ControllerSnapshot, MotionState};
use std::collections::VecDeque;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

/// Result delivered to a registered command waiter.
pub type AckResult = Result<(), ScannerError>;

/// Events of interest to higher layers, extracted from the frame stream.
#[derive(Debug, Clone)]
pub enum MotionEvent {
    /// A `[MSG:...]` frame mentioning homing.
    HomingMessage(String),
    /// `Homed:<axis>` seen for the given axis letter.
    HomedAxis(char),
    /// The final homing-done message.
    HomingDone,
    /// `ALARM:<n>` was raised.
    AlarmRaised(Option<u8>),
    /// The link dropped; reconnect in progress.
    LinkDropped,
    /// The link reconnected.
    LinkRecovered,
    /// Reconnect attempts exhausted.
    LinkDead,
}

/// Control messages into the monitor task.
pub enum MonitorCommand {
    /// Register an ack waiter for the next `ok`/`error` frame.
    RegisterAck(oneshot::Sender<AckResult>),
    /// Force the snapshot into a state (emergency stop, shutdown).
    ForceState(MotionState),
    /// Fail every pending ack waiter with the given error kind.
    FailPending(&'static str),
    /// Set the homed flag (after a verified homing cycle).
    SetHomed(bool),
}

/// Handle to the monitor task.
#[derive(Clone)]
pub struct StatusMonitor {
    snapshot_rx: watch::Receiver<ControllerSnapshot>,
    events_tx: broadcast::Sender<MotionEvent>,
    ctrl_tx: mpsc::UnboundedSender<MonitorCommand>,
}

impl StatusMonitor {
    /// Spawn the monitor over a link event subscription.
    pub fn spawn(link_events: broadcast::Receiver<LinkEvent>) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(ControllerSnapshot::default());
        let (events_tx, _) = broadcast::channel(64);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let task = MonitorTask {
            snapshot_tx,
            events_tx: events_tx.clone(),
            pending: VecDeque::new(),
            estop_latched: false,
        };
        tokio::spawn(task.run(link_events, ctrl_rx));

        Self {
            snapshot_rx,
            events_tx,
            ctrl_tx,
        }
    }

    /// Current snapshot (cloned; the watch retains the latest value).
    pub fn snapshot(&self) -> ControllerSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// A receiver that can `changed().await` on snapshot updates.
    pub fn watch(&self) -> watch::Receiver<ControllerSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Subscribe to extracted motion events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MotionEvent> {
        self.events_tx.subscribe()
    }

    /// Register an ack waiter. Must be called before the command bytes are
    /// written so a fast reply cannot race the registration.
    pub fn register_ack(&self) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        let _ = self.ctrl_tx.send(MonitorCommand::RegisterAck(tx));
        rx
    }

    pub fn force_state(&self, state: MotionState) {
        let _ = self.ctrl_tx.send(MonitorCommand::ForceState(state));
    }

    pub fn fail_pending(&self, reason: &'static str) {
        let _ = self.ctrl_tx.send(MonitorCommand::FailPending(reason));
    }

    pub fn set_homed(&self, homed: bool) {
        let _ = self.ctrl_tx.send(MonitorCommand::SetHomed(homed));
    }
}

struct MonitorTask {
    snapshot_tx: watch::Sender<ControllerSnapshot>,
    events_tx: broadcast::Sender<MotionEvent>,
    pending: VecDeque<oneshot::Sender<AckResult>>,
    /// While latched, status frames may not change the state: an emergency
    /// stop stays in force until an explicit re-initialization clears it.
    estop_latched: bool,
}

impl MonitorTask {
    async fn run(
        mut self,
        mut link_events: broadcast::Receiver<LinkEvent>,
        mut ctrl_rx: mpsc::UnboundedReceiver<MonitorCommand>,
    ) {
        loop {
            tokio::select! {
                event = link_events.recv() => match event {
                    Ok(LinkEvent::Line { text, .. }) => self.handle_line(&text),
                    Ok(LinkEvent::Dropped { reason }) => {
                        warn!(reason = %reason, "link dropped; failing in-flight commands");
                        self.fail_all(&reason);
                        self.update(|snap| snap.state = MotionState::Disconnected);
                        let _ = self.events_tx.send(MotionEvent::LinkDropped);
                    }
                    Ok(LinkEvent::Reconnected { .. }) => {
                        self.update(|snap| {
                            if snap.state == MotionState::Disconnected {
                                snap.state = MotionState::Idle;
                            }
                        });
                        let _ = self.events_tx.send(MotionEvent::LinkRecovered);
                    }
                    Ok(LinkEvent::Dead) => {
                        self.fail_all("reconnect attempts exhausted");
                        self.update(|snap| snap.state = MotionState::Disconnected);
                        let _ = self.events_tx.send(MotionEvent::LinkDead);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status monitor lagged behind line stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                cmd = ctrl_rx.recv() => match cmd {
                    Some(MonitorCommand::RegisterAck(tx)) => self.pending.push_back(tx),
                    Some(MonitorCommand::ForceState(state)) => {
                        self.estop_latched = state == MotionState::EmergencyStop;
                        self.update(|snap| {
                            snap.state = state;
                            if state == MotionState::Alarm || state == MotionState::EmergencyStop {
                                snap.homed = false;
                            }
                        });
                    }
                    Some(MonitorCommand::FailPending(reason)) => {
                        self.fail_all(reason);
                    }
                    Some(MonitorCommand::SetHomed(homed)) => {
                        self.update(|snap| snap.homed = homed);
                    }
                    None => break,
                },
            }
        }
        debug!("status monitor stopped");
    }

    fn handle_line(&mut self, line: &str) {
        match protocol::parse_frame(line) {
            Frame::Ok => {
                if let Some(waiter) = self.pending.pop_front() {
                    let _ = waiter.send(Ok(()));
                } else {
                    trace!("unmatched ok (init resend or status query)");
                }
            }
            Frame::Error { code } => {
                let err = ScannerError::Protocol {
                    code,
                    message: line.to_string(),
                };
                if let Some(waiter) = self.pending.pop_front() {
                    let _ = waiter.send(Err(err));
                } else {
                    warn!(frame = line, "firmware error with no command in flight");
                }
            }
            Frame::Alarm { code } => {
                warn!(?code, "firmware alarm");
                self.update(|snap| {
                    snap.state = MotionState::Alarm;
                    snap.homed = false;
                });
                // An alarm also terminates whatever command was in flight
                if let Some(waiter) = self.pending.pop_front() {
                    let _ = waiter.send(Err(ScannerError::Alarm { code }));
                }
                let _ = self.events_tx.send(MotionEvent::AlarmRaised(code));
            }
            Frame::Msg(msg) => {
                debug!(msg = %msg.text, "firmware message");
                if msg.is_homing_done() {
                    let _ = self.events_tx.send(MotionEvent::HomingDone);
                } else if let Some(axis) = msg.homed_axis() {
                    let _ = self.events_tx.send(MotionEvent::HomedAxis(axis));
                } else if msg.mentions_homing() {
                    let _ = self.events_tx.send(MotionEvent::HomingMessage(msg.text));
                }
            }
            Frame::Status(report) => {
                let latched = self.estop_latched;
                self.update(|snap| {
                    if latched {
                        // Positions and sequence still update; the state does
                        // not leave EmergencyStop until re-initialization
                        if let Some(mpos) = report.mpos {
                            snap.machine_pos = mpos;
                        }
                        if let Some((pos, source)) = report.effective_position() {
                            snap.work_pos = pos;
                            snap.position_source = Some(source);
                        }
                        snap.last_raw_status = report.raw.clone();
                        snap.status_seq += 1;
                        return;
                    }
                    match report.state {
                        ReportedState::Idle => snap.state = MotionState::Idle,
                        ReportedState::Run | ReportedState::Jog => {
                            snap.state = MotionState::Moving
                        }
                        ReportedState::Home => snap.state = MotionState::Homing,
                        ReportedState::Hold | ReportedState::Door => {
                            snap.state = MotionState::Hold
                        }
                        ReportedState::Alarm => {
                            snap.state = MotionState::Alarm;
                            snap.homed = false;
                        }
                        // Check/Sleep/unknown states leave the last state in place
                        ReportedState::Check
                        | ReportedState::Sleep
                        | ReportedState::Unknown => {}
                    }
                    if let Some(mpos) = report.mpos {
                        snap.machine_pos = mpos;
                    }
                    if let Some((pos, source)) = report.effective_position() {
                        snap.work_pos = pos;
                        snap.position_source = Some(source);
                    }
                    if report.wco.is_some() {
                        snap.wco = report.wco;
                    }
                    snap.last_raw_status = report.raw.clone();
                    snap.status_seq += 1;
                });
            }
            Frame::Ancillary(text) => trace!(frame = %text, "ancillary frame"),
            Frame::Other(text) => debug!(frame = %text, "unclassified frame"),
        }
    }

    fn update(&self, f: impl FnOnce(&mut ControllerSnapshot)) {
        self.snapshot_tx.send_modify(f);
    }

    fn fail_all(&mut self, reason: &str) {
        for waiter in self.pending.drain(..) {
            let _ = waiter.send(Err(ScannerError::Link(reason.to_string())));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration, Instant};

    fn line(text: &str) -> LinkEvent {
        LinkEvent::Line {
            text: text.to_string(),
            received_at: Instant::now(),
        }
    }

    struct Fixture {
        monitor: StatusMonitor,
        feed: broadcast::Sender<LinkEvent>,
    }

    fn fixture() -> Fixture {
        let (feed, rx) = broadcast::channel(64);
        let monitor = StatusMonitor::spawn(rx);
        Fixture { monitor, feed }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn status_frames_update_snapshot() {
        let fx = fixture();
        fx.feed
            .send(line("<Run|MPos:1.0,2.0,3.0,4.0|WPos:0.5,1.5,2.5,3.5>"))
            .unwrap();
        settle().await;

        let snap = fx.monitor.snapshot();
        assert_eq!(snap.state, MotionState::Moving);
        assert_eq!(snap.machine_pos.x, 1.0);
        // Hybrid: WPos for X/Y/C, MPos for Z
        assert_eq!(snap.work_pos.z, 3.0);
        assert_eq!(snap.work_pos.c, 3.5);
        assert_eq!(snap.status_seq, 1);
    }

    #[tokio::test]
    async fn ok_completes_oldest_ack() {
        let fx = fixture();
        let first = fx.monitor.register_ack();
        let second = fx.monitor.register_ack();
        settle().await;

        fx.feed.send(line("ok")).unwrap();
        fx.feed.send(line("error:9")).unwrap();

        assert!(timeout(Duration::from_secs(1), first).await.unwrap().unwrap().is_ok());
        let err = timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ScannerError::Protocol { code: Some(9), .. }));
    }

    #[tokio::test]
    async fn alarm_sets_state_clears_homed_and_fails_command() {
        let fx = fixture();
        fx.monitor.set_homed(true);
        let pending = fx.monitor.register_ack();
        settle().await;
        assert!(fx.monitor.snapshot().homed);

        let mut events = fx.monitor.subscribe_events();
        fx.feed.send(line("ALARM:2")).unwrap();
        settle().await;

        let snap = fx.monitor.snapshot();
        assert_eq!(snap.state, MotionState::Alarm);
        assert!(!snap.homed);
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ScannerError::Alarm { code: Some(2) }));
        assert!(matches!(
            events.recv().await.unwrap(),
            MotionEvent::AlarmRaised(Some(2))
        ));
    }

    #[tokio::test]
    async fn homing_messages_become_events() {
        let fx = fixture();
        let mut events = fx.monitor.subscribe_events();
        fx.feed.send(line("[MSG:DBG: Homing Cycle Y]")).unwrap();
        fx.feed.send(line("[MSG:Homed:Y]")).unwrap();
        fx.feed.send(line("[MSG:DBG: Homing done]")).unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            MotionEvent::HomingMessage(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            MotionEvent::HomedAxis('Y')
        ));
        assert!(matches!(events.recv().await.unwrap(), MotionEvent::HomingDone));
    }

    #[tokio::test]
    async fn unmatched_ok_is_tolerated() {
        let fx = fixture();
        fx.feed.send(line("ok")).unwrap();
        fx.feed.send(line("[GC:G0 G54 G17 G21]")).unwrap();
        settle().await;
        // Nothing to assert beyond "did not panic"; the snapshot is untouched
        assert_eq!(fx.monitor.snapshot().status_seq, 0);
    }
}
