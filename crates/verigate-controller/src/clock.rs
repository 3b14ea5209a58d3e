use tokio::time::Instant;
use verigate_core::clock::{Clock, SystemClock};

/// Wall-clock milliseconds driven by tokio's clock.
///
/// Anchored to the system time at construction, then advanced by
/// `tokio::time::Instant`. Under a paused test runtime deadlines and the
/// controller's timers move together.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_ms: u64,
    anchor: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::anchored_at(SystemClock.now_ms())
    }

    pub fn anchored_at(anchor_ms: u64) -> Self {
        Self {
            anchor_ms,
            anchor: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as u64
    }
}
