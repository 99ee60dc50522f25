use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Injected time source. The kernel itself never reads a clock; every entry
/// point takes explicit timestamps so callers control the time base and tests
/// can replay exact sequences.
pub trait Clocks {
    /// Monotonic milliseconds since boot, including time spent asleep.
    fn elapsed_realtime_ms(&self) -> i64;
    /// Monotonic milliseconds since boot, excluding time spent asleep.
    fn uptime_ms(&self) -> i64;
    /// Wall-clock milliseconds since the Unix epoch (for cross-process logs only).
    fn current_time_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy)]
pub struct RealClocks {
    start: Instant,
}

impl RealClocks {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for RealClocks {
    fn default() -> Self {
        Self::new()
    }
}

impl Clocks for RealClocks {
    fn elapsed_realtime_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    // No suspend on the host process, so uptime and realtime share a source.
    fn uptime_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    fn current_time_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Settable clocks for tests and replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualClocks {
    pub realtime_ms: i64,
    pub uptime_ms: i64,
    pub current_time_ms: i64,
}

impl ManualClocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance both monotonic clocks together.
    pub fn advance(&mut self, ms: i64) {
        self.realtime_ms += ms;
        self.uptime_ms += ms;
        self.current_time_ms += ms;
    }
}

impl Clocks for ManualClocks {
    fn elapsed_realtime_ms(&self) -> i64 {
        self.realtime_ms
    }

    fn uptime_ms(&self) -> i64 {
        self.uptime_ms
    }

    fn current_time_ms(&self) -> i64 {
        self.current_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clocks_advance_together() {
        let mut clocks = ManualClocks::new();
        clocks.advance(250);
        assert_eq!(clocks.elapsed_realtime_ms(), 250);
        assert_eq!(clocks.uptime_ms(), 250);
        clocks.advance(50);
        assert_eq!(clocks.elapsed_realtime_ms(), 300);
    }

    #[test]
    fn real_clocks_are_monotonic() {
        let clocks = RealClocks::new();
        let a = clocks.elapsed_realtime_ms();
        let b = clocks.elapsed_realtime_ms();
        assert!(b >= a);
    }
}
