use crate::ids::{PoolId, TimeBaseId, TimerId};
use serde::{Deserialize, Serialize};

/// One timer core with interchangeable accrual policies. All variants share
/// the folded running total, the acquisition count and the mark snapshot;
/// the policy decides how elapsed time turns into credit.
///
/// Pool membership and time-base lookups go through the owning ledger; the
/// state here is plain data so full checkpoints can serialize it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    pub(crate) timebase: TimeBaseId,
    pub(crate) count: i32,
    pub(crate) total_time_us: i64,
    pub(crate) time_before_mark_us: i64,
    /// Secondary timer mirrored on every lifecycle call (dual timers bind a
    /// duration timer on a second, usually narrower base).
    pub(crate) sub_timer: Option<TimerId>,
    pub(crate) accrual: Accrual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Accrual {
    Stopwatch(StopwatchState),
    Duration {
        sw: StopwatchState,
        dur: DurationState,
    },
    Batch(BatchState),
    Sampling(SamplingState),
}

/// Continuous hold/release accrual. `update_time_us` is in time-base realtime
/// coordinates, so a stopped base freezes accrual without any bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StopwatchState {
    pub nesting: u32,
    pub update_time_us: i64,
    /// Total at the moment of acquisition; -1 when the acquisition happened
    /// with the base stopped. A release that added no time since this mark is
    /// discarded as uninteresting (its count bump is taken back).
    pub acquire_time_us: i64,
    pub pool: Option<PoolId>,
    /// Hard cap on attributable time per hold; 0 = unlimited.
    pub timeout_us: i64,
}

impl StopwatchState {
    pub(crate) fn new(pool: Option<PoolId>, timeout_us: i64) -> Self {
        Self {
            nesting: 0,
            update_time_us: 0,
            acquire_time_us: -1,
            pool,
            timeout_us,
        }
    }

    /// Running total as of `cur_base_realtime_us`. `pool_len` is the current
    /// pool size (0 when unpooled).
    pub(crate) fn compute_run_time(
        &self,
        total_time_us: i64,
        mut cur_base_realtime_us: i64,
        pool_len: usize,
    ) -> i64 {
        if self.timeout_us > 0 && cur_base_realtime_us > self.update_time_us + self.timeout_us {
            cur_base_realtime_us = self.update_time_us + self.timeout_us;
        }
        if self.nesting == 0 {
            return total_time_us;
        }
        let divisor = pool_len.max(1) as i64;
        total_time_us + (cur_base_realtime_us - self.update_time_us) / divisor
    }

    /// Credit for the span since the last update, honoring the timeout cap,
    /// and advance the update mark. The caller decides whether a hold is in
    /// progress; pooled timers settle through the pool instead.
    pub(crate) fn settle_span(&mut self, base_realtime_us: i64) -> i64 {
        let mut cur = base_realtime_us;
        if self.timeout_us > 0 && cur > self.update_time_us + self.timeout_us {
            cur = self.update_time_us + self.timeout_us;
        }
        let held = cur - self.update_time_us;
        self.update_time_us = base_realtime_us;
        held.max(0)
    }
}

/// Un-pooled wall-clock overlay for duration timers: the actual time this
/// specific timer was held, regardless of pool sharing. Times in ms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DurationState {
    pub total_ms: i64,
    pub max_ms: i64,
    pub current_ms: i64,
    /// Base-realtime ms at which the current accrual leg began; -1 while not
    /// accruing (not held, or base stopped).
    pub start_time_ms: i64,
}

impl DurationState {
    pub(crate) fn new() -> Self {
        Self {
            total_ms: 0,
            max_ms: 0,
            current_ms: 0,
            start_time_ms: -1,
        }
    }

    pub(crate) fn current_duration_ms(&self, cur_base_realtime_ms: i64) -> i64 {
        let mut duration = self.current_ms;
        if self.start_time_ms >= 0 {
            duration += cur_base_realtime_ms - self.start_time_ms;
        }
        duration
    }

    /// Fold the in-flight leg so a serialization mid-hold stays accurate.
    pub(crate) fn fold_leg(&mut self, cur_base_realtime_ms: i64) {
        if self.start_time_ms >= 0 {
            self.current_ms += cur_base_realtime_ms - self.start_time_ms;
            self.start_time_ms = -1;
        }
    }
}

/// Discrete externally-metered grants. A grant credits its full duration up
/// front and is consumed linearly over wall time; the unconsumed remainder of
/// a superseded or aborted grant is rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BatchState {
    /// Wall (elapsed realtime) us of the outstanding grant, if any.
    pub last_added_time_us: Option<i64>,
    pub last_added_duration_us: i64,
    /// Whether the gating base was running when the grant landed; only then
    /// was the grant credited, so only then is there anything to roll back.
    pub base_running: bool,
}

impl BatchState {
    pub(crate) fn new(base_running: bool) -> Self {
        Self {
            last_added_time_us: None,
            last_added_duration_us: 0,
            base_running,
        }
    }

    /// Settle the outstanding grant at `now_us`: a fully elapsed grant keeps
    /// its credit, an unconsumed remainder is rolled back. Returns the
    /// adjustment to apply to the timer's total.
    pub(crate) fn settle(&mut self, now_us: i64) -> i64 {
        let Some(added_us) = self.last_added_time_us.take() else {
            return 0;
        };
        let elapsed = now_us - added_us;
        let mut adjust = 0;
        if elapsed < self.last_added_duration_us {
            let remaining = self.last_added_duration_us - elapsed;
            if self.base_running {
                adjust = -remaining;
            }
        }
        self.last_added_duration_us = 0;
        adjust
    }

    /// Record a new grant. Returns the credit to add to the timer's total
    /// (zero when the base is stopped) and whether the count should bump.
    pub(crate) fn grant(&mut self, duration_us: i64, now_us: i64, base_running: bool) -> (i64, bool) {
        self.base_running = base_running;
        self.last_added_time_us = Some(now_us);
        self.last_added_duration_us = duration_us;
        if base_running {
            (duration_us, true)
        } else {
            (0, false)
        }
    }
}

/// Externally reported monotonically increasing (total, count) pairs, e.g.
/// kernel-reported cumulative stats. Deltas accrue only while the gating base
/// runs; a reported decrease means the external subsystem reset and closes
/// out the current sample first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SamplingState {
    pub tracking: bool,
    pub base_running: bool,
    pub cur_total_us: i64,
    pub cur_count: i64,
    pub base_total_us: i64,
    pub base_count: i64,
}

impl SamplingState {
    pub(crate) fn new(base_running: bool) -> Self {
        Self {
            tracking: false,
            base_running,
            cur_total_us: 0,
            cur_count: 0,
            base_total_us: 0,
            base_count: 0,
        }
    }

    pub(crate) fn pending_time_us(&self) -> i64 {
        if self.base_running && self.tracking {
            self.cur_total_us - self.base_total_us
        } else {
            0
        }
    }

    pub(crate) fn pending_count(&self) -> i64 {
        if self.base_running && self.tracking {
            self.cur_count - self.base_count
        } else {
            0
        }
    }

    /// Fold the pending delta and restart tracking from zero, as when the
    /// external counter reset underneath us. Returns (time, count) to fold.
    pub(crate) fn end_sample(&mut self) -> (i64, i64) {
        let folded = (self.pending_time_us(), self.pending_count());
        self.cur_total_us = 0;
        self.cur_count = 0;
        self.base_total_us = 0;
        self.base_count = 0;
        folded
    }

    /// Record newly reported cumulative values. Returns (time, count) to fold
    /// into the timer's totals (non-zero only when a reset closed a sample).
    pub(crate) fn update(&mut self, total_us: i64, count: i64) -> (i64, i64) {
        let mut folded = (0, 0);
        if self.tracking && (total_us < self.cur_total_us || count < self.cur_count) {
            folded = self.end_sample();
        }
        self.tracking = true;
        self.cur_total_us = total_us;
        self.cur_count = count;
        folded
    }

    /// Freeze pending credit at a base stop: fold it and re-seed the baseline
    /// so growth while stopped is never credited.
    pub(crate) fn on_base_stopped(&mut self) -> (i64, i64) {
        let folded = (self.pending_time_us(), self.pending_count());
        self.base_total_us = self.cur_total_us;
        self.base_count = self.cur_count;
        self.base_running = false;
        folded
    }

    pub(crate) fn on_base_started(&mut self) {
        self.base_running = true;
        if self.tracking {
            self.base_total_us = self.cur_total_us;
            self.base_count = self.cur_count;
        }
    }
}

impl Timer {
    pub(crate) fn stopwatch(timebase: TimeBaseId, pool: Option<PoolId>, timeout_us: i64) -> Self {
        Self {
            timebase,
            count: 0,
            total_time_us: 0,
            time_before_mark_us: 0,
            sub_timer: None,
            accrual: Accrual::Stopwatch(StopwatchState::new(pool, timeout_us)),
        }
    }

    pub(crate) fn duration(timebase: TimeBaseId, pool: Option<PoolId>) -> Self {
        Self {
            timebase,
            count: 0,
            total_time_us: 0,
            time_before_mark_us: 0,
            sub_timer: None,
            accrual: Accrual::Duration {
                sw: StopwatchState::new(pool, 0),
                dur: DurationState::new(),
            },
        }
    }

    pub(crate) fn batch(timebase: TimeBaseId, base_running: bool) -> Self {
        Self {
            timebase,
            count: 0,
            total_time_us: 0,
            time_before_mark_us: 0,
            sub_timer: None,
            accrual: Accrual::Batch(BatchState::new(base_running)),
        }
    }

    pub(crate) fn sampling(timebase: TimeBaseId, base_running: bool) -> Self {
        Self {
            timebase,
            count: 0,
            total_time_us: 0,
            time_before_mark_us: 0,
            sub_timer: None,
            accrual: Accrual::Sampling(SamplingState::new(base_running)),
        }
    }

    pub(crate) fn stopwatch_state(&self) -> Option<&StopwatchState> {
        match &self.accrual {
            Accrual::Stopwatch(sw) | Accrual::Duration { sw, .. } => Some(sw),
            _ => None,
        }
    }

    pub(crate) fn stopwatch_state_mut(&mut self) -> Option<&mut StopwatchState> {
        match &mut self.accrual {
            Accrual::Stopwatch(sw) | Accrual::Duration { sw, .. } => Some(sw),
            _ => None,
        }
    }

    pub(crate) fn nesting(&self) -> u32 {
        self.stopwatch_state().map_or(0, |sw| sw.nesting)
    }
}
