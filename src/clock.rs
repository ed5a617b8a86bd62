// Injected time source: monotonic milliseconds for the transport,
// wall-clock seconds for handshake timestamps.
// Numan Thabit 2025

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// The session's single clock. Components never read time themselves; the
/// session samples this and passes `now` values down.
///
/// `manual` pins both readings for deterministic tests and harnesses.
#[derive(Debug, Clone)]
pub struct Clock {
    start: Instant,
    manual: Option<(u64, u64)>, // (now_ms, now_secs)
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            manual: None,
        }
    }

    /// A pinned clock reporting exactly the given readings.
    pub fn manual(now_ms: u64, now_secs: u64) -> Self {
        Self {
            start: Instant::now(),
            manual: Some((now_ms, now_secs)),
        }
    }

    /// Re-pins a manual clock. No effect ordering surprises: a clock created
    /// with `new` stays monotonic until pinned.
    pub fn set_manual(&mut self, now_ms: u64, now_secs: u64) {
        self.manual = Some((now_ms, now_secs));
    }

    /// Monotonic milliseconds since session start.
    pub fn now_ms(&self) -> u64 {
        match self.manual {
            Some((ms, _)) => ms,
            None => self.start.elapsed().as_millis() as u64,
        }
    }

    /// Wall-clock seconds since the UNIX epoch.
    pub fn now_secs(&self) -> u64 {
        match self.manual {
            Some((_, secs)) => secs,
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
