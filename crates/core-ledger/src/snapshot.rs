use crate::counter::Counter;
use crate::ids::{CounterId, TimeBaseId, TimerId};
use crate::ledger::{Ledger, TimerPool};
use crate::slab::Slab;
use crate::timebase::TimeBase;
use crate::timer::{Accrual, Timer};
use serde::{Deserialize, Serialize};

/// Full serialization of the kernel: every field of every object, verbatim,
/// so a checkpoint restore resumes exactly where the process left off —
/// including in-flight nesting. The runtime wraps this in a version-led
/// envelope; a mismatch there discards the whole payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub(crate) timebases: Vec<(u32, TimeBase)>,
    pub(crate) counters: Vec<(u32, Counter)>,
    pub(crate) timers: Vec<(u32, Timer)>,
    pub(crate) pools: Vec<(u32, TimerPool)>,
}

/// Summary of one timer: cumulative totals only. In-flight state is
/// intentionally dropped — loading a summary yields a stopped timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSummary {
    pub total_time_us: i64,
    pub count: i32,
    pub total_duration_ms: i64,
    pub max_duration_ms: i64,
}

/// Summary of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSummary {
    pub buckets: Vec<i64>,
}

/// Summary of one time base: accumulated totals as of the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBaseSummary {
    pub uptime_us: i64,
    pub realtime_us: i64,
}

impl Ledger {
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            timebases: self.timebases.iter().map(|(i, v)| (i, v.clone())).collect(),
            counters: self.counters.iter().map(|(i, v)| (i, v.clone())).collect(),
            timers: self.timers.iter().map(|(i, v)| (i, v.clone())).collect(),
            pools: self.pools.iter().map(|(i, v)| (i, v.clone())).collect(),
        }
    }

    pub fn restore(snapshot: LedgerSnapshot) -> Ledger {
        Ledger {
            timebases: Slab::from_entries(snapshot.timebases),
            counters: Slab::from_entries(snapshot.counters),
            timers: Slab::from_entries(snapshot.timers),
            pools: Slab::from_entries(snapshot.pools),
        }
    }

    /// Summary of a timer at the moment of the write. The value reported for
    /// an actively held timer is its running total as of `now_us`; reading it
    /// back must not show any further increase.
    pub fn timer_summary(&self, id: TimerId, now_us: i64) -> TimerSummary {
        TimerSummary {
            total_time_us: self.timer_total_time_us(id, now_us),
            count: self.timer_count(id),
            total_duration_ms: self.timer_total_duration_ms(id, now_us),
            max_duration_ms: self.timer_max_duration_ms(id, now_us),
        }
    }

    /// Load a summary onto a timer, implicitly stopping it: totals are
    /// replaced, nesting and all in-flight accrual state are cleared.
    pub fn load_timer_summary(&mut self, id: TimerId, summary: &TimerSummary) {
        let in_pool = {
            let Some(t) = self.timers.get(id.0) else {
                return;
            };
            t.stopwatch_state().and_then(|sw| sw.pool).filter(|p| {
                self.pools
                    .get(p.0)
                    .is_some_and(|pl| pl.members.contains(&id))
            })
        };
        if let Some(p) = in_pool {
            if let Some(pl) = self.pools.get_mut(p.0) {
                pl.members.retain(|m| *m != id);
            }
        }
        let Some(t) = self.timers.get_mut(id.0) else {
            return;
        };
        t.total_time_us = summary.total_time_us;
        t.count = summary.count;
        t.time_before_mark_us = 0;
        match &mut t.accrual {
            Accrual::Stopwatch(sw) => {
                sw.nesting = 0;
                sw.acquire_time_us = -1;
            }
            Accrual::Duration { sw, dur } => {
                sw.nesting = 0;
                sw.acquire_time_us = -1;
                dur.total_ms = summary.total_duration_ms;
                dur.max_ms = summary.max_duration_ms;
                dur.current_ms = 0;
                dur.start_time_ms = -1;
            }
            Accrual::Batch(b) => {
                b.last_added_time_us = None;
                b.last_added_duration_us = 0;
            }
            Accrual::Sampling(s) => {
                let base_running = s.base_running;
                *s = crate::timer::SamplingState::new(base_running);
            }
        }
    }

    pub fn counter_summary(&self, id: CounterId) -> CounterSummary {
        CounterSummary {
            buckets: self.counter_buckets(id),
        }
    }

    pub fn load_counter_summary(&mut self, id: CounterId, summary: &CounterSummary) {
        let Some(c) = self.counters.get_mut(id.0) else {
            return;
        };
        c.load_buckets(&summary.buckets);
    }

    pub fn timebase_summary(&self, tb: TimeBaseId, now_us: i64) -> TimeBaseSummary {
        TimeBaseSummary {
            uptime_us: self.timebase_uptime_us(tb, now_us),
            realtime_us: self.timebase_realtime_us(tb, now_us),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = 1_000_000;

    #[test]
    fn full_snapshot_preserves_in_flight_state() {
        let mut ledger = Ledger::new();
        let tb = ledger.new_timebase();
        ledger.set_running(tb, true, 0, 0);
        let pool = ledger.new_pool(tb);
        let t = ledger.new_stopwatch_timer(tb, Some(pool));
        ledger.start_timer(t, 0);
        ledger.start_timer(t, SEC);

        let snap = ledger.snapshot();
        let restored = Ledger::restore(snap);
        assert_eq!(restored.timer_nesting(t), 2, "exact resume keeps nesting");
        assert_eq!(restored.pool_size(pool), 1);
        assert!(restored.timebase_running(tb));
        // The restored kernel keeps accruing where the old one stopped.
        assert_eq!(restored.timer_total_time_us(t, 7 * SEC), 7 * SEC);
    }

    #[test]
    fn full_snapshot_serializes_as_json() {
        let mut ledger = Ledger::new();
        let tb = ledger.new_timebase();
        ledger.set_running(tb, true, 0, 0);
        let c = ledger.new_multi_state_counter(tb, 3);
        ledger.counter_add(c, 4);
        let text = serde_json::to_string(&ledger.snapshot()).expect("snapshot serializes");
        let parsed: LedgerSnapshot = serde_json::from_str(&text).expect("snapshot parses");
        let restored = Ledger::restore(parsed);
        assert_eq!(restored.counter_value(c), 4);
    }

    #[test]
    fn summary_of_held_timer_stops_it_on_read() {
        let mut ledger = Ledger::new();
        let tb = ledger.new_timebase();
        ledger.set_running(tb, true, 0, 0);
        let t = ledger.new_stopwatch_timer(tb, None);
        ledger.start_timer(t, 0);

        let summary = ledger.timer_summary(t, 5 * SEC);
        assert_eq!(summary.total_time_us, 5 * SEC);
        assert_eq!(summary.count, 1);

        ledger.load_timer_summary(t, &summary);
        assert_eq!(ledger.timer_nesting(t), 0);
        // No silent increase after the read, even though time moves on.
        assert_eq!(ledger.timer_total_time_us(t, 9 * SEC), 5 * SEC);
    }

    #[test]
    fn summary_of_pooled_timer_leaves_the_pool() {
        let mut ledger = Ledger::new();
        let tb = ledger.new_timebase();
        ledger.set_running(tb, true, 0, 0);
        let pool = ledger.new_pool(tb);
        let a = ledger.new_stopwatch_timer(tb, Some(pool));
        ledger.start_timer(a, 0);
        let summary = ledger.timer_summary(a, 2 * SEC);
        ledger.load_timer_summary(a, &summary);
        assert_eq!(ledger.pool_size(pool), 0);
    }

    #[test]
    fn counter_summary_round_trips() {
        let mut ledger = Ledger::new();
        let tb = ledger.new_timebase();
        ledger.set_running(tb, true, 0, 0);
        let c = ledger.new_multi_state_counter(tb, 2);
        ledger.counter_add(c, 3);
        ledger.counter_set_state(c, 1, SEC);
        ledger.counter_add(c, 9);
        let summary = ledger.counter_summary(c);
        assert_eq!(summary.buckets, vec![3, 9]);

        let mut fresh = Ledger::new();
        let tb2 = fresh.new_timebase();
        let c2 = fresh.new_multi_state_counter(tb2, 2);
        fresh.load_counter_summary(c2, &summary);
        assert_eq!(fresh.counter_buckets(c2), vec![3, 9]);
    }
}
