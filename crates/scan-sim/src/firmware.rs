//! Simulated FluidNC firmware.
//!
//! Each call to [`SimFluidNc::spawn_session`] opens a fresh duplex "serial
//! port" and runs a firmware session over it: line-framed G-code in,
//! `ok`/`error`/`ALARM`/status frames out, with periodic auto-reports.
//! Machine state survives sessions, which is what makes `$Bye` restart and
//! reconnect testing possible.

use scan_core::position::Position4D;
use scan_core::serial::DynSerial;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

/// Timing and fault-injection knobs.
#[derive(Debug, Clone)]
pub struct SimFirmwareConfig {
    /// Auto-report period.
    pub report_interval: Duration,
    /// How long a move shows `Run` before settling.
    pub move_duration: Duration,
    /// How long a homing cycle takes.
    pub homing_duration: Duration,
    /// Machine position after homing.
    pub home_position: Position4D,
    /// Start in an alarm state (firmware booted without homing).
    pub initial_alarm: bool,
    /// Raise `ALARM:2` instead of executing the Nth move (0-based).
    pub alarm_on_move: Option<usize>,
    /// Work coordinate offset present at boot; cleared by `$RST=#`.
    pub initial_wco: Position4D,
}

impl Default for SimFirmwareConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_millis(50),
            move_duration: Duration::from_millis(150),
            homing_duration: Duration::from_millis(120),
            home_position: Position4D::new(0.0, 200.0, 0.0, 0.0),
            initial_alarm: false,
            alarm_on_move: None,
            initial_wco: Position4D::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FwState {
    Idle,
    Run,
    Home,
    Hold,
    Alarm,
}

impl FwState {
    fn token(&self) -> &'static str {
        match self {
            FwState::Idle => "Idle",
            FwState::Run => "Run",
            FwState::Home => "Home",
            FwState::Hold => "Hold",
            FwState::Alarm => "Alarm",
        }
    }
}

struct FwInner {
    state: FwState,
    mpos: Position4D,
    wco: Position4D,
    relative_mode: bool,
    moves_seen: usize,
    realtime_log: Vec<u8>,
    /// Pending move target and completion time.
    pending_move: Option<(Position4D, tokio::time::Instant)>,
}

/// The simulated controller. Clone the `Arc` and call
/// [`SimFluidNc::spawn_session`] from a port factory.
pub struct SimFluidNc {
    config: SimFirmwareConfig,
    inner: Arc<Mutex<FwInner>>,
    /// Write halves of live sessions, for forced disconnects.
    session_writers: Arc<Mutex<Vec<Arc<Mutex<Option<WriteHalf<DynSerial>>>>>>>,
    /// Reader tasks of live sessions; aborting one drops its read half so
    /// the peer observes EOF.
    session_tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl SimFluidNc {
    pub fn new(config: SimFirmwareConfig) -> Arc<Self> {
        let state = if config.initial_alarm {
            FwState::Alarm
        } else {
            FwState::Idle
        };
        let inner = Arc::new(Mutex::new(FwInner {
            state,
            mpos: Position4D::default(),
            wco: config.initial_wco,
            relative_mode: false,
            moves_seen: 0,
            realtime_log: Vec::new(),
            pending_move: None,
        }));
        Arc::new(Self {
            config,
            inner,
            session_writers: Arc::new(Mutex::new(Vec::new())),
            session_tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Raw real-time bytes received so far (`!`, `~`, 0x18).
    pub async fn realtime_log(&self) -> Vec<u8> {
        self.inner.lock().await.realtime_log.clone()
    }

    /// Current machine position.
    pub async fn machine_position(&self) -> Position4D {
        self.inner.lock().await.mpos
    }

    /// Kill every live session (simulates a cable pull); the next
    /// `spawn_session` provides a fresh port for reconnect.
    pub async fn kill_sessions(&self) {
        let mut writers = self.session_writers.lock().await;
        for writer in writers.drain(..) {
            *writer.lock().await = None;
        }
        drop(writers);
        let mut tasks = self.session_tasks.lock().await;
        for task in tasks.drain(..) {
            // Dropping the reader half closes the last reference to the
            // stream, so the controller side reads EOF
            task.abort();
        }
    }

    /// Open one firmware session and return the device side of the port.
    pub async fn spawn_session(self: &Arc<Self>) -> DynSerial {
        let (host, device) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(Box::new(host) as DynSerial);
        let writer = Arc::new(Mutex::new(Some(write_half)));
        self.session_writers.lock().await.push(Arc::clone(&writer));

        let sim = Arc::clone(self);
        let task = tokio::spawn(session_loop(sim, read_half, writer));
        self.session_tasks.lock().await.push(task);
        Box::new(device)
    }

    async fn status_line(&self) -> String {
        let inner = self.inner.lock().await;
        let m = inner.mpos;
        let w = m - inner.wco;
        let o = inner.wco;
        format!(
            "<{}|MPos:{:.3},{:.3},{:.3},{:.3}|WPos:{:.3},{:.3},{:.3},{:.3}|FS:0,0|WCO:{:.3},{:.3},{:.3},{:.3}>",
            inner.state.token(),
            m.x, m.y, m.z, m.c,
            w.x, w.y, w.z, w.c,
            o.x, o.y, o.z, o.c,
        )
    }
}

type SharedWriter = Arc<Mutex<Option<WriteHalf<DynSerial>>>>;

async fn write_line(writer: &SharedWriter, line: &str) -> bool {
    let mut guard = writer.lock().await;
    let Some(w) = guard.as_mut() else {
        return false;
    };
    let mut bytes = line.as_bytes().to_vec();
    bytes.extend_from_slice(b"\r\n");
    w.write_all(&bytes).await.is_ok() && w.flush().await.is_ok()
}

async fn session_loop(
    sim: Arc<SimFluidNc>,
    mut read_half: tokio::io::ReadHalf<DynSerial>,
    writer: SharedWriter,
) {
    // Auto-report ticker, independent of command handling
    let report_sim = Arc::clone(&sim);
    let report_writer = Arc::clone(&writer);
    let reporter = tokio::spawn(async move {
        let mut tick = tokio::time::interval(report_sim.config.report_interval);
        loop {
            tick.tick().await;
            // Settle any due move before reporting
            finish_due_move(&report_sim).await;
            let line = report_sim.status_line().await;
            if !write_line(&report_writer, &line).await {
                break;
            }
        }
    });

    let mut buf = [0u8; 256];
    let mut line = Vec::new();
    'session: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            match byte {
                b'!' | b'~' | 0x18 => {
                    handle_realtime(&sim, byte).await;
                    if byte == 0x18 {
                        let _ = write_line(&writer, "[MSG:INFO: Reset]").await;
                    }
                }
                b'\n' => {
                    let text = String::from_utf8_lossy(&line).trim().to_string();
                    line.clear();
                    if text.is_empty() {
                        continue;
                    }
                    debug!(command = %text, "sim firmware received");
                    if !handle_command(&sim, &writer, &text).await {
                        break 'session; // $Bye
                    }
                }
                b'\r' => {}
                other => line.push(other),
            }
        }
    }

    reporter.abort();
    *writer.lock().await = None;
}

/// Apply a completed move if its timer expired.
async fn finish_due_move(sim: &Arc<SimFluidNc>) {
    let mut inner = sim.inner.lock().await;
    if let Some((target, due)) = inner.pending_move {
        if tokio::time::Instant::now() >= due && inner.state == FwState::Run {
            inner.mpos = target;
            inner.state = FwState::Idle;
            inner.pending_move = None;
        }
    }
}

async fn handle_realtime(sim: &Arc<SimFluidNc>, byte: u8) {
    let mut inner = sim.inner.lock().await;
    inner.realtime_log.push(byte);
    match byte {
        b'!' => {
            if inner.state == FwState::Run {
                inner.state = FwState::Hold;
            }
        }
        b'~' => {
            if inner.state == FwState::Hold {
                inner.state = FwState::Run;
            }
        }
        0x18 => {
            inner.state = FwState::Idle;
            inner.pending_move = None;
        }
        _ => {}
    }
}

/// Returns false when the session should end (`$Bye`).
async fn handle_command(sim: &Arc<SimFluidNc>, writer: &SharedWriter, command: &str) -> bool {
    match command {
        "?" => {
            finish_due_move(sim).await;
            let status = sim.status_line().await;
            let _ = write_line(writer, &status).await;
            let _ = write_line(writer, "ok").await;
        }
        "$Bye" => {
            let _ = write_line(writer, "ok").await;
            return false;
        }
        "$X" => {
            let mut inner = sim.inner.lock().await;
            if inner.state == FwState::Alarm {
                inner.state = FwState::Idle;
            }
            drop(inner);
            let _ = write_line(writer, "ok").await;
        }
        "$H" => {
            run_homing(sim, writer).await;
        }
        "$RST=#" | "G92.1" => {
            sim.inner.lock().await.wco = Position4D::default();
            let _ = write_line(writer, "ok").await;
        }
        "G91" => {
            sim.inner.lock().await.relative_mode = true;
            let _ = write_line(writer, "ok").await;
        }
        "G90" => {
            sim.inner.lock().await.relative_mode = false;
            let _ = write_line(writer, "ok").await;
        }
        cmd if cmd.starts_with("G0") || cmd.starts_with("G1") => {
            handle_move(sim, writer, cmd).await;
        }
        cmd if cmd.starts_with('$') || cmd.starts_with('G') || cmd.starts_with('M') => {
            // Modal commands, report interval, M17 and friends
            let _ = write_line(writer, "ok").await;
        }
        _ => {
            let _ = write_line(writer, "error:20").await;
        }
    }
    true
}

async fn run_homing(sim: &Arc<SimFluidNc>, writer: &SharedWriter) {
    {
        let mut inner = sim.inner.lock().await;
        inner.state = FwState::Home;
    }
    let _ = write_line(writer, "[MSG:DBG: Homing Cycle Y]").await;
    tokio::time::sleep(sim.config.homing_duration / 2).await;
    let _ = write_line(writer, "[MSG:Homed:Y]").await;
    let _ = write_line(writer, "[MSG:DBG: Homing Cycle X]").await;
    tokio::time::sleep(sim.config.homing_duration / 2).await;
    let _ = write_line(writer, "[MSG:Homed:X]").await;
    {
        let mut inner = sim.inner.lock().await;
        inner.mpos = sim.config.home_position;
        inner.state = FwState::Idle;
    }
    let _ = write_line(writer, "[MSG:DBG: Homing done]").await;
    let _ = write_line(writer, "ok").await;
}

async fn handle_move(sim: &Arc<SimFluidNc>, writer: &SharedWriter, command: &str) {
    let mut inner = sim.inner.lock().await;
    if inner.state == FwState::Alarm {
        drop(inner);
        let _ = write_line(writer, "error:9").await;
        return;
    }

    let move_index = inner.moves_seen;
    inner.moves_seen += 1;

    if sim.config.alarm_on_move == Some(move_index) {
        inner.state = FwState::Alarm;
        inner.pending_move = None;
        drop(inner);
        let _ = write_line(writer, "ok").await;
        let _ = write_line(writer, "ALARM:2").await;
        return;
    }

    // Parse axis words; targets are in the work frame
    let mut target_work = inner.mpos - inner.wco;
    let base = if inner.relative_mode {
        Position4D::default()
    } else {
        target_work
    };
    let mut delta = base;
    for word in command.split_whitespace().skip(1) {
        let (axis, value) = word.split_at(1);
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        match axis {
            "X" => delta.x = value,
            "Y" => delta.y = value,
            "Z" => delta.z = value,
            "C" => delta.c = value,
            _ => {}
        }
    }
    target_work = if inner.relative_mode {
        target_work + delta
    } else {
        delta
    };

    let target_machine = target_work + inner.wco;
    inner.state = FwState::Run;
    inner.pending_move = Some((
        target_machine,
        tokio::time::Instant::now() + sim.config.move_duration,
    ));
    drop(inner);
    let _ = write_line(writer, "ok").await;
}
