//! Simulated LED backend that records the full duty-cycle timeline.

use async_trait::async_trait;
use scan_lighting::LedBackend;
use std::sync::Mutex;
use tokio::time::Instant;

/// One recorded write.
#[derive(Debug, Clone, Copy)]
pub struct LedEvent {
    pub at: Instant,
    pub channel: u8,
    pub duty: f64,
}

/// Records every `set_duty` call with a timestamp so tests can assert the
/// flash-assert / shutter / flash-release ordering.
#[derive(Default)]
pub struct SimLeds {
    events: Mutex<Vec<LedEvent>>,
}

impl SimLeds {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Time of the first write with a non-zero duty, if any.
    pub fn first_assert(&self) -> Option<Instant> {
        self.events()
            .iter()
            .find(|e| e.duty > 0.0)
            .map(|e| e.at)
    }

    /// Time of the last write that turned a channel off, if any.
    pub fn last_release(&self) -> Option<Instant> {
        self.events()
            .iter()
            .rev()
            .find(|e| e.duty == 0.0)
            .map(|e| e.at)
    }
}

#[async_trait]
impl LedBackend for SimLeds {
    async fn set_duty(&self, channel: u8, duty: f64) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .push(LedEvent {
                at: Instant::now(),
                channel,
                duty,
            });
        Ok(())
    }
}
