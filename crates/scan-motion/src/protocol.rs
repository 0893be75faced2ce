//! FluidNC/GRBL line protocol parsing.
//!
//! Pure functions and data types only: every line received from the firmware
//! is classified into a [`Frame`], and `<...>` real-time reports are parsed
//! into [`StatusReport`]. No I/O happens here, which is what makes the
//! protocol layer testable against captured wire traffic.

use scan_core::motion::PositionSource;
use scan_core::position::Position4D;

/// Controller state token from a `<State|...>` report.
///
/// FluidNC appends sub-codes to some states (`Hold:0`, `Door:1`); the
/// sub-code is dropped during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedState {
    Idle,
    Run,
    Jog,
    Home,
    Hold,
    Alarm,
    Door,
    Check,
    Sleep,
    Unknown,
}

impl ReportedState {
    fn parse(token: &str) -> Self {
        let base = token.split(':').next().unwrap_or(token);
        match base {
            "Idle" => ReportedState::Idle,
            "Run" => ReportedState::Run,
            "Jog" => ReportedState::Jog,
            "Home" | "Homing" => ReportedState::Home,
            "Hold" => ReportedState::Hold,
            "Alarm" => ReportedState::Alarm,
            "Door" => ReportedState::Door,
            "Check" => ReportedState::Check,
            "Sleep" => ReportedState::Sleep,
            _ => ReportedState::Unknown,
        }
    }

    /// True while the machine is executing motion.
    pub fn is_motion(&self) -> bool {
        matches!(self, ReportedState::Run | ReportedState::Jog)
    }
}

/// A parsed `<...>` real-time status report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub state: ReportedState,
    pub mpos: Option<Position4D>,
    pub wpos: Option<Position4D>,
    pub wco: Option<Position4D>,
    /// Current feed rate from the `FS:` field, when present.
    pub feed: Option<f64>,
    pub raw: String,
}

impl StatusReport {
    /// Effective work-frame position and the source it was derived from.
    ///
    /// When both vectors are present, work coordinates are used for X, Y and
    /// C but the machine coordinate for Z: the turntable is continuous and a
    /// work offset on it would accumulate across scans.
    pub fn effective_position(&self) -> Option<(Position4D, PositionSource)> {
        match (self.wpos, self.mpos) {
            (Some(w), Some(m)) => Some((
                Position4D::new(w.x, w.y, m.z, w.c),
                PositionSource::Hybrid,
            )),
            (Some(w), None) => Some((w, PositionSource::WorkOnly)),
            (None, Some(m)) => Some((m, PositionSource::MachineOnly)),
            (None, None) => None,
        }
    }

    /// True when the reported work coordinate offset is absent or zero.
    pub fn wco_cleared(&self) -> bool {
        match self.wco {
            None => true,
            Some(wco) => wco.approx_eq(&Position4D::default(), 1e-3),
        }
    }
}

/// An informational `[MSG:...]` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub text: String,
}

impl Message {
    /// Axis letter from a `Homed:<axis>` token, if present.
    pub fn homed_axis(&self) -> Option<char> {
        let idx = self.text.find("Homed:")?;
        self.text[idx + "Homed:".len()..]
            .trim_start()
            .chars()
            .next()
            .filter(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_uppercase())
    }

    /// True for the final homing-complete message.
    pub fn is_homing_done(&self) -> bool {
        self.text.to_ascii_lowercase().contains("homing done")
    }

    /// True for any homing-related message (cycle progress, axis done).
    pub fn mentions_homing(&self) -> bool {
        let lower = self.text.to_ascii_lowercase();
        lower.contains("homing") || lower.contains("homed")
    }
}

/// One classified line from the firmware.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `ok`: completes the oldest unacknowledged command.
    Ok,
    /// `error:<n>` or bare `error`: fails the oldest command.
    Error { code: Option<u8> },
    /// `ALARM:<n>`: firmware entered an alarm state.
    Alarm { code: Option<u8> },
    /// `[MSG:...]` informational frame.
    Msg(Message),
    /// `<...>` real-time status report.
    Status(StatusReport),
    /// `[GC:...]`, `[G54:...]`, `[PRB:...]`, `$n=v`: stored, never a
    /// completion signal.
    Ancillary(String),
    /// Anything else (boot banners, firmware chatter).
    Other(String),
}

/// Classify one line. The input must already be `\r`/`\n`-stripped.
pub fn parse_frame(line: &str) -> Frame {
    let line = line.trim();
    if line == "ok" {
        return Frame::Ok;
    }
    if line == "error" {
        return Frame::Error { code: None };
    }
    if let Some(rest) = line.strip_prefix("error:") {
        return Frame::Error {
            code: rest.trim().parse().ok(),
        };
    }
    if let Some(rest) = line.strip_prefix("ALARM:") {
        return Frame::Alarm {
            code: rest.trim().parse().ok(),
        };
    }
    if let Some(inner) = line
        .strip_prefix("[MSG:")
        .and_then(|r| r.strip_suffix(']'))
    {
        return Frame::Msg(Message {
            text: inner.to_string(),
        });
    }
    if line.starts_with('<') && line.ends_with('>') {
        if let Some(report) = parse_status(line) {
            return Frame::Status(report);
        }
        return Frame::Other(line.to_string());
    }
    if line.starts_with('[') || line.starts_with('$') {
        return Frame::Ancillary(line.to_string());
    }
    Frame::Other(line.to_string())
}

/// Parse a `<State|MPos:...|WPos:...|FS:...|WCO:...>` report.
///
/// Position vectors with 3 axes are accepted (`c = 0`); vectors with more
/// than 4 axes are accepted with the extras ignored.
pub fn parse_status(line: &str) -> Option<StatusReport> {
    let inner = line.strip_prefix('<')?.strip_suffix('>')?;
    let mut fields = inner.split('|');
    let state = ReportedState::parse(fields.next()?);

    let mut report = StatusReport {
        state,
        mpos: None,
        wpos: None,
        wco: None,
        feed: None,
        raw: line.to_string(),
    };

    for field in fields {
        if let Some(coords) = field.strip_prefix("MPos:") {
            report.mpos = parse_axes(coords);
        } else if let Some(coords) = field.strip_prefix("WPos:") {
            report.wpos = parse_axes(coords);
        } else if let Some(coords) = field.strip_prefix("WCO:") {
            report.wco = parse_axes(coords);
        } else if let Some(fs) = field.strip_prefix("FS:") {
            report.feed = fs.split(',').next().and_then(|f| f.parse().ok());
        }
        // Bf:, Ov:, Pn: and friends are ignored
    }

    Some(report)
}

/// Parse a comma-separated axis vector into the first four coordinates.
///
/// Three coordinates yield `c = 0`; fewer than three is a parse failure.
fn parse_axes(coords: &str) -> Option<Position4D> {
    let mut values = [0.0f64; 4];
    let mut count = 0usize;
    for part in coords.split(',') {
        if count == 4 {
            break; // 5th/6th coordinates tolerated and ignored
        }
        values[count] = part.trim().parse().ok()?;
        count += 1;
    }
    if count < 3 {
        return None;
    }
    Some(Position4D::new(values[0], values[1], values[2], values[3]))
}
