//! Framed duplex serial link to the motion firmware.
//!
//! Writes are whole `\n`-terminated lines, serialized through a single
//! writer. A dedicated reader task frames incoming bytes on `\n`, strips
//! `\r`, and publishes each line on a broadcast channel together with a
//! receive timestamp. Unsolicited frames (auto-reports, `[MSG:...]`) arrive
//! interleaved with command responses; classification happens downstream in
//! the monitor.
//!
//! On I/O failure the link marks itself unhealthy, drops the writer, and
//! attempts a bounded reconnect with exponential backoff. After a successful
//! reconnect the configured firmware-init lines are resent and a
//! [`LinkEvent::Reconnected`] is broadcast.

use futures::future::BoxFuture;
use scan_core::serial::DynSerial;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Factory producing a fresh port for connect and reconnect.
pub type PortFactory =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<DynSerial>> + Send + Sync>;

/// Maximum reconnect attempts before the link gives up.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Initial reconnect backoff; doubles per attempt, capped at 2 s.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Events published by the link reader.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// One framed line, `\r\n` stripped, with its receive time.
    Line { text: String, received_at: Instant },
    /// The link went unhealthy; reconnect is being attempted.
    Dropped { reason: String },
    /// Reconnect succeeded on the given attempt; init lines were resent.
    Reconnected { attempt: u32 },
    /// Reconnect attempts exhausted; the link is dead.
    Dead,
}

/// The serial link. Cheap to clone via `Arc`.
pub struct SerialLink {
    writer: Mutex<Option<WriteHalf<DynSerial>>>,
    /// Read half handed from `install_port` to the reader loop, so
    /// reconnects can swap the underlying port without restarting the task.
    pending_reader: Mutex<Option<ReadHalf<DynSerial>>>,
    events: broadcast::Sender<LinkEvent>,
    factory: PortFactory,
    /// Lines resent after every (re)connect, in order.
    init_lines: Mutex<Vec<String>>,
    healthy: AtomicBool,
}

impl SerialLink {
    /// Create an unconnected link around a port factory.
    pub fn new(factory: PortFactory) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            writer: Mutex::new(None),
            pending_reader: Mutex::new(None),
            events,
            factory,
            init_lines: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(false),
        })
    }

    /// Subscribe to the line/event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Replace the firmware-init sequence resent after reconnects.
    pub async fn set_init_lines(&self, lines: Vec<String>) {
        *self.init_lines.lock().await = lines;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Open the port and start the reader task. Idempotent only in the sense
    /// that calling it on a healthy link is an error.
    pub async fn connect(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.is_healthy() {
            anyhow::bail!("link already connected");
        }
        let port = (self.factory)().await?;
        self.install_port(port).await;
        let link = Arc::clone(self);
        tokio::spawn(async move {
            link.read_loop().await;
        });
        Ok(())
    }

    async fn install_port(&self, port: DynSerial) {
        let (read_half, write_half) = tokio::io::split(port);
        *self.writer.lock().await = Some(write_half);
        self.healthy.store(true, Ordering::Release);
        // Reader loop picks the read half up through the handoff slot
        *self.pending_reader.lock().await = Some(read_half);
    }

    /// Send one command line; `\n` is appended.
    pub async fn send_line(&self, line: &str) -> Result<(), String> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| "link not connected".to_string())?;
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| format!("write failed: {}", e))?;
        writer
            .flush()
            .await
            .map_err(|e| format!("flush failed: {}", e))?;
        debug!(command = line, "sent line");
        Ok(())
    }

    /// Send raw control bytes (`!`, `~`, 0x18) without line framing.
    ///
    /// Real-time commands are not queued by the firmware; they act
    /// immediately and receive no `ok`.
    pub async fn send_realtime(&self, bytes: &[u8]) -> Result<(), String> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| "link not connected".to_string())?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| format!("write failed: {}", e))?;
        writer
            .flush()
            .await
            .map_err(|e| format!("flush failed: {}", e))?;
        Ok(())
    }

    /// Drop the port without reconnecting. Used at shutdown.
    pub async fn close(&self) {
        self.healthy.store(false, Ordering::Release);
        *self.writer.lock().await = None;
        *self.pending_reader.lock().await = None;
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            let read_half = match self.pending_reader.lock().await.take() {
                Some(half) => half,
                None => return, // closed
            };
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();

            let err = loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break "unexpected EOF from serial port".to_string(),
                    Ok(_) => {
                        let text = line.trim_end_matches(['\r', '\n']).to_string();
                        if text.is_empty() {
                            continue;
                        }
                        let _ = self.events.send(LinkEvent::Line {
                            text,
                            received_at: Instant::now(),
                        });
                    }
                    Err(e) => break format!("read failed: {}", e),
                }
            };

            if !self.healthy.swap(false, Ordering::AcqRel) {
                // close() was called; EOF is the expected consequence
                return;
            }
            warn!(reason = %err, "serial link dropped");
            *self.writer.lock().await = None;
            let _ = self.events.send(LinkEvent::Dropped { reason: err });

            if !self.reconnect().await {
                let _ = self.events.send(LinkEvent::Dead);
                return;
            }
        }
    }

    /// Bounded reconnect with exponential backoff. Returns true on success.
    async fn reconnect(&self) -> bool {
        let mut backoff = RECONNECT_BACKOFF;
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
            match (self.factory)().await {
                Ok(port) => {
                    self.install_port(port).await;
                    info!(attempt, "serial link reconnected");
                    let init = self.init_lines.lock().await.clone();
                    for line in init {
                        if let Err(e) = self.send_line(&line).await {
                            warn!(line = %line, error = %e, "init resend failed after reconnect");
                        }
                    }
                    let _ = self.events.send(LinkEvent::Reconnected { attempt });
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
        false
    }
}
