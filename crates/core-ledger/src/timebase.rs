use crate::ids::ObsHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Boolean-gated clock pair. While `running`, the base accumulates uptime and
/// realtime in parallel; while stopped, both read back as frozen totals.
/// Consumers (timers, counters) accrue only against a running base.
///
/// Observers are handles into the owning ledger, not references: the ledger
/// performs the flip fan-out and disposal of an observer removes it here, so
/// there is no separately managed detach step to forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBase {
    running: bool,
    past_uptime_us: i64,
    past_realtime_us: i64,
    uptime_start_us: i64,
    realtime_start_us: i64,
    unplugged_uptime_us: i64,
    unplugged_realtime_us: i64,
    observers: BTreeSet<ObsHandle>,
}

/// State change computed by [`TimeBase::set_running`]; the ledger uses it to
/// drive the observer fan-out with consistent basis values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flip {
    Started {
        base_uptime_us: i64,
        base_realtime_us: i64,
    },
    Stopped {
        base_uptime_us: i64,
        base_realtime_us: i64,
    },
}

impl TimeBase {
    pub fn new() -> Self {
        Self {
            running: false,
            past_uptime_us: 0,
            past_realtime_us: 0,
            uptime_start_us: 0,
            realtime_start_us: 0,
            unplugged_uptime_us: 0,
            unplugged_realtime_us: 0,
            observers: BTreeSet::new(),
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    /// Accumulated uptime as of `now_us`. Pure read; safe to call from any
    /// number of readers between flips.
    pub fn uptime(&self, now_us: i64) -> i64 {
        let mut time = self.past_uptime_us;
        if self.running {
            time += now_us - self.uptime_start_us;
        }
        time
    }

    /// Accumulated realtime as of `now_us`. Pure read.
    pub fn realtime(&self, now_us: i64) -> i64 {
        let mut time = self.past_realtime_us;
        if self.running {
            time += now_us - self.realtime_start_us;
        }
        time
    }

    /// Accumulated uptime at the most recent start transition.
    pub fn uptime_at_start(&self) -> i64 {
        self.unplugged_uptime_us
    }

    /// Accumulated realtime at the most recent start transition.
    pub fn realtime_at_start(&self) -> i64 {
        self.unplugged_realtime_us
    }

    /// Apply a running-state change. Returns `None` when the state did not
    /// actually change; otherwise the basis totals observers must be told.
    pub(crate) fn set_running(
        &mut self,
        running: bool,
        uptime_us: i64,
        realtime_us: i64,
    ) -> Option<Flip> {
        if self.running == running {
            return None;
        }
        self.running = running;
        if running {
            self.uptime_start_us = uptime_us;
            self.realtime_start_us = realtime_us;
            self.unplugged_uptime_us = self.uptime(uptime_us);
            self.unplugged_realtime_us = self.realtime(realtime_us);
            Some(Flip::Started {
                base_uptime_us: self.unplugged_uptime_us,
                base_realtime_us: self.unplugged_realtime_us,
            })
        } else {
            self.past_uptime_us += uptime_us - self.uptime_start_us;
            self.past_realtime_us += realtime_us - self.realtime_start_us;
            Some(Flip::Stopped {
                base_uptime_us: self.uptime(uptime_us),
                base_realtime_us: self.realtime(realtime_us),
            })
        }
    }

    /// Zero the historical totals, preserving `running` and restarting the
    /// current interval (if any) at the given timestamps.
    pub fn reset(&mut self, uptime_us: i64, realtime_us: i64) {
        self.past_uptime_us = 0;
        self.past_realtime_us = 0;
        self.uptime_start_us = uptime_us;
        self.realtime_start_us = realtime_us;
        self.unplugged_uptime_us = 0;
        self.unplugged_realtime_us = 0;
    }

    pub(crate) fn add_observer(&mut self, obs: ObsHandle) {
        self.observers.insert(obs);
    }

    pub(crate) fn remove_observer(&mut self, obs: ObsHandle) {
        self.observers.remove(&obs);
    }

    pub(crate) fn has_observer(&self, obs: ObsHandle) -> bool {
        self.observers.contains(&obs)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn observers(&self) -> impl Iterator<Item = ObsHandle> + '_ {
        self.observers.iter().copied()
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}
