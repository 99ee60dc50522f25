use crate::counter::Counter;
use crate::ids::{CounterId, ObsHandle, PoolId, TimeBaseId, TimerId};
use crate::slab::Slab;
use crate::timebase::{Flip, TimeBase};
use crate::timer::{Accrual, Timer};
use serde::{Deserialize, Serialize};

/// Shared-credit pool. All members must be gated by the pool's time base so
/// the fairness split is computed in one coordinate system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TimerPool {
    pub timebase: TimeBaseId,
    pub members: Vec<TimerId>,
}

/// The single coarse mutation context. Owns every time base, counter, timer
/// and pool; all mutation entry points take `&mut self` plus explicit
/// timestamps, so callers hold exactly one lock around the whole kernel and
/// readers under that lock always observe a consistent snapshot.
///
/// Disposal (`drop_timer`/`drop_counter`) is the single unregistration point:
/// it removes the handle from its arena, the time base's observer set and any
/// pool, so there is no detach call to forget.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    pub(crate) timebases: Slab<TimeBase>,
    pub(crate) counters: Slab<Counter>,
    pub(crate) timers: Slab<Timer>,
    pub(crate) pools: Slab<TimerPool>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Time bases
    // ------------------------------------------------------------------

    pub fn new_timebase(&mut self) -> TimeBaseId {
        TimeBaseId(self.timebases.insert(TimeBase::new()))
    }

    pub fn timebase_running(&self, tb: TimeBaseId) -> bool {
        self.timebases.get(tb.0).is_some_and(TimeBase::running)
    }

    pub fn timebase_uptime_us(&self, tb: TimeBaseId, now_us: i64) -> i64 {
        self.timebases.get(tb.0).map_or(0, |b| b.uptime(now_us))
    }

    pub fn timebase_realtime_us(&self, tb: TimeBaseId, now_us: i64) -> i64 {
        self.timebases.get(tb.0).map_or(0, |b| b.realtime(now_us))
    }

    pub fn timebase_observer_count(&self, tb: TimeBaseId) -> usize {
        self.timebases.get(tb.0).map_or(0, TimeBase::observer_count)
    }

    /// Flip a time base and fan the transition out to every observer, so each
    /// can settle its running total before the clock basis changes. Returns
    /// whether the state actually changed.
    pub fn set_running(
        &mut self,
        tb: TimeBaseId,
        running: bool,
        uptime_us: i64,
        realtime_us: i64,
    ) -> bool {
        let Some(base) = self.timebases.get_mut(tb.0) else {
            log::warn!("set_running on a dead time base handle ignored");
            return false;
        };
        let Some(flip) = base.set_running(running, uptime_us, realtime_us) else {
            return false;
        };
        let observers: Vec<ObsHandle> = base.observers().collect();
        match flip {
            Flip::Started {
                base_uptime_us,
                base_realtime_us,
            } => {
                for obs in observers {
                    if let ObsHandle::Timer(id) = obs {
                        self.timer_on_time_started(id, realtime_us, base_uptime_us, base_realtime_us);
                    }
                }
            }
            Flip::Stopped {
                base_uptime_us,
                base_realtime_us,
            } => {
                for obs in observers {
                    if let ObsHandle::Timer(id) = obs {
                        self.timer_on_time_stopped(id, realtime_us, base_uptime_us, base_realtime_us);
                    }
                }
            }
        }
        true
    }

    pub fn reset_timebase(&mut self, tb: TimeBaseId, uptime_us: i64, realtime_us: i64) {
        if let Some(base) = self.timebases.get_mut(tb.0) {
            base.reset(uptime_us, realtime_us);
        }
    }

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    /// Create a shared-credit pool gated by `tb`. Every timer joining the
    /// pool must use the same base.
    pub fn new_pool(&mut self, tb: TimeBaseId) -> PoolId {
        PoolId(self.pools.insert(TimerPool {
            timebase: tb,
            members: Vec::new(),
        }))
    }

    pub fn pool_size(&self, pool: PoolId) -> usize {
        self.pools.get(pool.0).map_or(0, |p| p.members.len())
    }

    /// Credit every pool member its fair share of the time since its last
    /// update and advance all members to `now`. Called on every membership
    /// change and base stop, so N concurrent holders each accrue elapsed/N.
    fn refresh_pool(&mut self, pool: PoolId, now_base_realtime_us: i64) {
        let members = match self.pools.get(pool.0) {
            Some(p) => p.members.clone(),
            None => return,
        };
        let n = members.len() as i64;
        if n == 0 {
            return;
        }
        for member in members {
            let Some(t) = self.timers.get_mut(member.0) else {
                continue;
            };
            if let Accrual::Stopwatch(sw) | Accrual::Duration { sw, .. } = &mut t.accrual {
                let held = now_base_realtime_us - sw.update_time_us;
                if held > 0 {
                    t.total_time_us += held / n;
                }
                sw.update_time_us = now_base_realtime_us;
            }
        }
    }

    // ------------------------------------------------------------------
    // Timer construction
    // ------------------------------------------------------------------

    fn insert_timer(&mut self, timer: Timer) -> TimerId {
        let tb = timer.timebase;
        let id = TimerId(self.timers.insert(timer));
        if let Some(base) = self.timebases.get_mut(tb.0) {
            base.add_observer(ObsHandle::Timer(id));
        }
        id
    }

    fn checked_pool(&self, tb: TimeBaseId, pool: Option<PoolId>) -> Option<PoolId> {
        let pool = pool?;
        match self.pools.get(pool.0) {
            Some(p) if p.timebase == tb => Some(pool),
            Some(_) => {
                log::warn!("pool is gated by a different time base; timer joins unpooled");
                None
            }
            None => {
                log::warn!("dead pool handle; timer joins unpooled");
                None
            }
        }
    }

    pub fn new_stopwatch_timer(&mut self, tb: TimeBaseId, pool: Option<PoolId>) -> TimerId {
        self.new_stopwatch_timer_with_timeout(tb, pool, 0)
    }

    /// `timeout_us` caps the attributable time per hold; 0 means unlimited.
    pub fn new_stopwatch_timer_with_timeout(
        &mut self,
        tb: TimeBaseId,
        pool: Option<PoolId>,
        timeout_us: i64,
    ) -> TimerId {
        let pool = self.checked_pool(tb, pool);
        self.insert_timer(Timer::stopwatch(tb, pool, timeout_us))
    }

    pub fn new_duration_timer(&mut self, tb: TimeBaseId) -> TimerId {
        self.insert_timer(Timer::duration(tb, None))
    }

    /// Primary stopwatch timer on `tb` plus a mirrored duration timer on
    /// `sub_tb` (typically a narrower base); only the primary may be pooled.
    pub fn new_dual_timer(
        &mut self,
        tb: TimeBaseId,
        sub_tb: TimeBaseId,
        pool: Option<PoolId>,
    ) -> TimerId {
        let sub = self.insert_timer(Timer::duration(sub_tb, None));
        let pool = self.checked_pool(tb, pool);
        let mut primary = Timer::stopwatch(tb, pool, 0);
        primary.sub_timer = Some(sub);
        self.insert_timer(primary)
    }

    pub fn new_batch_timer(&mut self, tb: TimeBaseId) -> TimerId {
        let running = self.timebase_running(tb);
        self.insert_timer(Timer::batch(tb, running))
    }

    pub fn new_sampling_timer(&mut self, tb: TimeBaseId) -> TimerId {
        let running = self.timebase_running(tb);
        self.insert_timer(Timer::sampling(tb, running))
    }

    // ------------------------------------------------------------------
    // Timer lifecycle
    // ------------------------------------------------------------------

    pub fn start_timer(&mut self, id: TimerId, now_us: i64) {
        if let Some(sub) = self.timers.get(id.0).and_then(|t| t.sub_timer) {
            self.start_timer_one(sub, now_us);
        }
        self.start_timer_one(id, now_us);
    }

    fn start_timer_one(&mut self, id: TimerId, now_us: i64) {
        let (tb, pool) = match self.timers.get(id.0) {
            Some(t) => match t.stopwatch_state() {
                Some(sw) => (t.timebase, sw.pool),
                None => {
                    log::warn!("start on a non-stopwatch timer ignored");
                    return;
                }
            },
            None => {
                log::warn!("start on a dead timer handle ignored");
                return;
            }
        };
        let (running, base_rt) = match self.timebases.get(tb.0) {
            Some(b) => (b.running(), b.realtime(now_us)),
            None => {
                log::warn!("timer gated by a dead time base; start ignored");
                return;
            }
        };
        let first = {
            let Some(t) = self.timers.get_mut(id.0) else {
                return;
            };
            let Some(sw) = t.stopwatch_state_mut() else {
                return;
            };
            sw.nesting += 1;
            sw.nesting == 1
        };
        if !first {
            return;
        }
        // Settle the pool before self joins: the divisor changes on insert.
        if let Some(p) = pool {
            self.refresh_pool(p, base_rt);
            if let Some(pl) = self.pools.get_mut(p.0) {
                pl.members.push(id);
            }
        }
        let Some(t) = self.timers.get_mut(id.0) else {
            return;
        };
        match &mut t.accrual {
            Accrual::Stopwatch(sw) => {
                sw.update_time_us = base_rt;
                sw.acquire_time_us = if running { t.total_time_us } else { -1 };
            }
            Accrual::Duration { sw, dur } => {
                sw.update_time_us = base_rt;
                sw.acquire_time_us = if running { t.total_time_us } else { -1 };
                dur.start_time_ms = if running { base_rt / 1000 } else { -1 };
            }
            _ => {}
        }
        if running {
            t.count += 1;
        }
    }

    pub fn stop_timer(&mut self, id: TimerId, now_us: i64) {
        if let Some(sub) = self.timers.get(id.0).and_then(|t| t.sub_timer) {
            self.stop_timer_one(sub, now_us);
        }
        self.stop_timer_one(id, now_us);
    }

    fn stop_timer_one(&mut self, id: TimerId, now_us: i64) {
        let (tb, pool, nesting) = match self.timers.get(id.0) {
            Some(t) => match t.stopwatch_state() {
                Some(sw) => (t.timebase, sw.pool, sw.nesting),
                None => {
                    log::warn!("stop on a non-stopwatch timer ignored");
                    return;
                }
            },
            None => {
                log::warn!("stop on a dead timer handle ignored");
                return;
            }
        };
        if nesting == 0 {
            log::warn!("stop on a timer that is not running ignored");
            return;
        }
        let last = {
            let Some(t) = self.timers.get_mut(id.0) else {
                return;
            };
            let Some(sw) = t.stopwatch_state_mut() else {
                return;
            };
            sw.nesting -= 1;
            sw.nesting == 0
        };
        if !last {
            return;
        }
        let base_rt = self
            .timebases
            .get(tb.0)
            .map_or(0, |b| b.realtime(now_us));
        if let Some(p) = pool {
            // Settle credit before self leaves: removal changes the divisor
            // for everyone else.
            self.refresh_pool(p, base_rt);
            if let Some(pl) = self.pools.get_mut(p.0) {
                pl.members.retain(|m| *m != id);
            }
        } else if let Some(t) = self.timers.get_mut(id.0) {
            if let Accrual::Stopwatch(sw) | Accrual::Duration { sw, .. } = &mut t.accrual {
                t.total_time_us += sw.settle_span(base_rt);
            }
        }
        let Some(t) = self.timers.get_mut(id.0) else {
            return;
        };
        if let Accrual::Duration { dur, .. } = &mut t.accrual {
            let duration = dur.current_duration_ms(base_rt / 1000);
            dur.total_ms += duration;
            if duration > dur.max_ms {
                dur.max_ms = duration;
            }
            dur.start_time_ms = -1;
            dur.current_ms = 0;
        }
        // An acquisition that added no time is uninteresting; take the count
        // bump back.
        let (acquire, total) = match t.stopwatch_state() {
            Some(sw) => (sw.acquire_time_us, t.total_time_us),
            None => (-1, 0),
        };
        if acquire >= 0 && total == acquire {
            t.count -= 1;
        }
    }

    /// Unwind all nested acquisitions and stop, e.g. when the holder goes
    /// away without releasing.
    pub fn stop_all_timer(&mut self, id: TimerId, now_us: i64) {
        if let Some(sub) = self.timers.get(id.0).and_then(|t| t.sub_timer) {
            self.stop_all_one(sub, now_us);
        }
        self.stop_all_one(id, now_us);
    }

    fn stop_all_one(&mut self, id: TimerId, now_us: i64) {
        let held = {
            let Some(t) = self.timers.get_mut(id.0) else {
                return;
            };
            match t.stopwatch_state_mut() {
                Some(sw) if sw.nesting > 0 => {
                    sw.nesting = 1;
                    true
                }
                _ => false,
            }
        };
        if held {
            self.stop_timer_one(id, now_us);
        }
    }

    // ------------------------------------------------------------------
    // Time-base flip callbacks
    // ------------------------------------------------------------------

    fn timer_on_time_started(
        &mut self,
        id: TimerId,
        elapsed_realtime_us: i64,
        _base_uptime_us: i64,
        base_realtime_us: i64,
    ) {
        let Some(t) = self.timers.get_mut(id.0) else {
            return;
        };
        match &mut t.accrual {
            Accrual::Stopwatch(_) => {}
            Accrual::Duration { sw, dur } => {
                if sw.nesting > 0 {
                    dur.start_time_ms = base_realtime_us / 1000;
                }
            }
            Accrual::Batch(b) => {
                // A grant recorded while stopped was never credited; clear it
                // so it cannot be rolled back against the new interval.
                t.total_time_us += b.settle(elapsed_realtime_us);
            }
            Accrual::Sampling(s) => s.on_base_started(),
        }
    }

    fn timer_on_time_stopped(
        &mut self,
        id: TimerId,
        elapsed_realtime_us: i64,
        _base_uptime_us: i64,
        base_realtime_us: i64,
    ) {
        let pool = {
            let Some(t) = self.timers.get(id.0) else {
                return;
            };
            match t.stopwatch_state() {
                Some(sw) if sw.nesting > 0 => sw.pool,
                Some(_) => None,
                None => None,
            }
        };
        // Pooled holders settle the whole pool at the flip instant.
        if let Some(p) = pool {
            self.refresh_pool(p, base_realtime_us);
        }
        let Some(t) = self.timers.get_mut(id.0) else {
            return;
        };
        match &mut t.accrual {
            Accrual::Stopwatch(sw) => {
                if sw.nesting > 0 && sw.pool.is_none() {
                    t.total_time_us += sw.settle_span(base_realtime_us);
                }
            }
            Accrual::Duration { sw, dur } => {
                if sw.nesting > 0 {
                    if sw.pool.is_none() {
                        t.total_time_us += sw.settle_span(base_realtime_us);
                    }
                    dur.fold_leg(base_realtime_us / 1000);
                }
            }
            Accrual::Batch(b) => {
                t.total_time_us += b.settle(elapsed_realtime_us);
            }
            Accrual::Sampling(s) => {
                let (ft, fc) = s.on_base_stopped();
                t.total_time_us += ft;
                t.count += fc as i32;
            }
        }
    }

    // ------------------------------------------------------------------
    // Timer reads
    // ------------------------------------------------------------------

    pub fn timer_total_time_us(&self, id: TimerId, now_us: i64) -> i64 {
        let Some(t) = self.timers.get(id.0) else {
            return 0;
        };
        match &t.accrual {
            Accrual::Stopwatch(sw) | Accrual::Duration { sw, .. } => {
                let base_rt = self
                    .timebases
                    .get(t.timebase.0)
                    .map_or(0, |b| b.realtime(now_us));
                let pool_len = sw.pool.map_or(0, |p| self.pool_size(p));
                sw.compute_run_time(t.total_time_us, base_rt, pool_len)
            }
            Accrual::Batch(_) => t.total_time_us,
            Accrual::Sampling(s) => t.total_time_us + s.pending_time_us(),
        }
    }

    pub fn timer_count(&self, id: TimerId) -> i32 {
        let Some(t) = self.timers.get(id.0) else {
            return 0;
        };
        match &t.accrual {
            Accrual::Sampling(s) => t.count + s.pending_count() as i32,
            _ => t.count,
        }
    }

    pub fn timer_nesting(&self, id: TimerId) -> u32 {
        self.timers.get(id.0).map_or(0, Timer::nesting)
    }

    pub fn timer_sub(&self, id: TimerId) -> Option<TimerId> {
        self.timers.get(id.0).and_then(|t| t.sub_timer)
    }

    pub fn active_timer_count(&self) -> usize {
        self.timers.iter().filter(|(_, t)| t.nesting() > 0).count()
    }

    fn duration_base_realtime_ms(&self, t: &Timer, now_us: i64) -> i64 {
        self.timebases
            .get(t.timebase.0)
            .map_or(0, |b| b.realtime(now_us))
            / 1000
    }

    /// Actual (un-pooled) duration of the current hold, ms.
    pub fn timer_current_duration_ms(&self, id: TimerId, now_us: i64) -> i64 {
        let Some(t) = self.timers.get(id.0) else {
            return 0;
        };
        match &t.accrual {
            Accrual::Duration { dur, .. } => {
                dur.current_duration_ms(self.duration_base_realtime_ms(t, now_us))
            }
            _ => 0,
        }
    }

    pub fn timer_max_duration_ms(&self, id: TimerId, now_us: i64) -> i64 {
        let Some(t) = self.timers.get(id.0) else {
            return 0;
        };
        match &t.accrual {
            Accrual::Duration { dur, .. } => dur
                .max_ms
                .max(dur.current_duration_ms(self.duration_base_realtime_ms(t, now_us))),
            _ => 0,
        }
    }

    pub fn timer_total_duration_ms(&self, id: TimerId, now_us: i64) -> i64 {
        let Some(t) = self.timers.get(id.0) else {
            return 0;
        };
        match &t.accrual {
            Accrual::Duration { dur, .. } => {
                dur.total_ms + dur.current_duration_ms(self.duration_base_realtime_ms(t, now_us))
            }
            _ => 0,
        }
    }

    // ------------------------------------------------------------------
    // Batch and sampling entry points
    // ------------------------------------------------------------------

    /// Grant a discrete duration. The unconsumed remainder of the previous
    /// grant is rolled back first; the new grant only lands while the gating
    /// base runs.
    pub fn add_duration(&mut self, id: TimerId, duration_ms: i64, now_us: i64) {
        let running = match self.timers.get(id.0) {
            Some(t) => self.timebase_running(t.timebase),
            None => {
                log::warn!("add_duration on a dead timer handle ignored");
                return;
            }
        };
        let Some(t) = self.timers.get_mut(id.0) else {
            return;
        };
        if let Accrual::Batch(b) = &mut t.accrual {
            t.total_time_us += b.settle(now_us);
            let (credit, counted) = b.grant(duration_ms * 1000, now_us, running);
            t.total_time_us += credit;
            if counted {
                t.count += 1;
            }
        } else {
            log::warn!("add_duration on a non-batch timer ignored");
        }
    }

    /// Roll back whatever part of the last grant has not yet elapsed.
    pub fn abort_last_duration(&mut self, id: TimerId, now_us: i64) {
        let Some(t) = self.timers.get_mut(id.0) else {
            return;
        };
        if let Accrual::Batch(b) = &mut t.accrual {
            t.total_time_us += b.settle(now_us);
        } else {
            log::warn!("abort_last_duration on a non-batch timer ignored");
        }
    }

    /// Feed externally reported cumulative (total, count) values. A decrease
    /// in either closes out the current sample first.
    pub fn update_sampling_timer(&mut self, id: TimerId, total_us: i64, count: i64, _now_us: i64) {
        let Some(t) = self.timers.get_mut(id.0) else {
            return;
        };
        if let Accrual::Sampling(s) = &mut t.accrual {
            let (ft, fc) = s.update(total_us, count);
            t.total_time_us += ft;
            t.count += fc as i32;
        } else {
            log::warn!("sampling update on a non-sampling timer ignored");
        }
    }

    /// Sugar over [`Self::update_sampling_timer`] for callers that report
    /// deltas rather than cumulative values.
    pub fn add_sampled(&mut self, id: TimerId, delta_time_us: i64, delta_count: i64, now_us: i64) {
        let (cur_total, cur_count) = match self.timers.get(id.0) {
            Some(t) => match &t.accrual {
                Accrual::Sampling(s) => (s.cur_total_us, s.cur_count),
                _ => {
                    log::warn!("sampled add on a non-sampling timer ignored");
                    return;
                }
            },
            None => return,
        };
        self.update_sampling_timer(id, cur_total + delta_time_us, cur_count + delta_count, now_us);
    }

    // ------------------------------------------------------------------
    // Mark
    // ------------------------------------------------------------------

    pub fn mark_timer(&mut self, id: TimerId, now_us: i64) {
        let total = self.timer_total_time_us(id, now_us);
        if let Some(t) = self.timers.get_mut(id.0) {
            t.time_before_mark_us = total;
        }
    }

    pub fn timer_time_since_mark_us(&self, id: TimerId, now_us: i64) -> i64 {
        let Some(t) = self.timers.get(id.0) else {
            return 0;
        };
        self.timer_total_time_us(id, now_us) - t.time_before_mark_us
    }

    // ------------------------------------------------------------------
    // Reset and disposal
    // ------------------------------------------------------------------

    /// Zero the timer's accumulations. Returns whether the timer is now fully
    /// inert (a still-held stopwatch is not). With `detach_if_reset`, an
    /// inert timer also stops observing its time base; it still must be
    /// disposed via [`Self::drop_timer`].
    pub fn reset_timer(&mut self, id: TimerId, detach_if_reset: bool, now_us: i64) -> bool {
        if let Some(sub) = self.timers.get(id.0).and_then(|t| t.sub_timer) {
            self.reset_timer_one(sub, detach_if_reset, now_us);
        }
        self.reset_timer_one(id, detach_if_reset, now_us)
    }

    fn reset_timer_one(&mut self, id: TimerId, detach_if_reset: bool, now_us: i64) -> bool {
        let (tb, running, base_rt) = match self.timers.get(id.0) {
            Some(t) => match self.timebases.get(t.timebase.0) {
                Some(b) => (t.timebase, b.running(), b.realtime(now_us)),
                None => (t.timebase, false, 0),
            },
            None => return true,
        };
        let Some(t) = self.timers.get_mut(id.0) else {
            return true;
        };
        t.count = 0;
        t.total_time_us = 0;
        t.time_before_mark_us = 0;
        let inert = match &mut t.accrual {
            Accrual::Stopwatch(sw) => {
                let inert = sw.nesting == 0;
                if !inert {
                    sw.update_time_us = base_rt;
                }
                sw.acquire_time_us = -1;
                inert
            }
            Accrual::Duration { sw, dur } => {
                let inert = sw.nesting == 0;
                if !inert {
                    sw.update_time_us = base_rt;
                }
                sw.acquire_time_us = -1;
                dur.total_ms = 0;
                dur.max_ms = 0;
                dur.current_ms = 0;
                dur.start_time_ms = if sw.nesting > 0 && running {
                    base_rt / 1000
                } else {
                    -1
                };
                inert
            }
            Accrual::Batch(b) => {
                b.last_added_time_us = None;
                b.last_added_duration_us = 0;
                true
            }
            Accrual::Sampling(s) => {
                let base_running = s.base_running;
                *s = crate::timer::SamplingState::new(base_running);
                true
            }
        };
        if detach_if_reset && inert {
            if let Some(base) = self.timebases.get_mut(tb.0) {
                base.remove_observer(ObsHandle::Timer(id));
            }
        }
        inert
    }

    /// Dispose of a timer: settle and leave its pool, unregister from its
    /// time base, free the arena slot. A dual timer's secondary goes with it.
    /// Double disposal is a defensive no-op.
    pub fn drop_timer(&mut self, id: TimerId, now_us: i64) {
        if let Some(sub) = self.timers.get(id.0).and_then(|t| t.sub_timer) {
            self.drop_timer_one(sub, now_us);
        }
        self.drop_timer_one(id, now_us);
    }

    fn drop_timer_one(&mut self, id: TimerId, now_us: i64) {
        let Some(t) = self.timers.get(id.0) else {
            return;
        };
        let tb = t.timebase;
        let pool = t.stopwatch_state().and_then(|sw| sw.pool);
        if let Some(p) = pool {
            let in_pool = self
                .pools
                .get(p.0)
                .is_some_and(|pl| pl.members.contains(&id));
            if in_pool {
                let base_rt = self.timebases.get(tb.0).map_or(0, |b| b.realtime(now_us));
                self.refresh_pool(p, base_rt);
                if let Some(pl) = self.pools.get_mut(p.0) {
                    pl.members.retain(|m| *m != id);
                }
            }
        }
        if let Some(base) = self.timebases.get_mut(tb.0) {
            base.remove_observer(ObsHandle::Timer(id));
        }
        self.timers.remove(id.0);
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    fn insert_counter(&mut self, counter: Counter) -> CounterId {
        let tb = counter.timebase;
        let id = CounterId(self.counters.insert(counter));
        if let Some(base) = self.timebases.get_mut(tb.0) {
            base.add_observer(ObsHandle::Counter(id));
        }
        id
    }

    pub fn new_counter(&mut self, tb: TimeBaseId) -> CounterId {
        self.insert_counter(Counter::scalar(tb))
    }

    pub fn new_counter_array(&mut self, tb: TimeBaseId, len: usize) -> CounterId {
        self.insert_counter(Counter::array(tb, len))
    }

    pub fn new_multi_state_counter(&mut self, tb: TimeBaseId, states: usize) -> CounterId {
        self.insert_counter(Counter::multi_state(tb, states))
    }

    pub fn counter_step(&mut self, id: CounterId) {
        self.counter_add(id, 1);
    }

    pub fn counter_add(&mut self, id: CounterId, delta: i64) {
        let running = match self.counters.get(id.0) {
            Some(c) => self.timebase_running(c.timebase),
            None => {
                log::warn!("add on a dead counter handle ignored");
                return;
            }
        };
        if let Some(c) = self.counters.get_mut(id.0) {
            c.add(delta, running);
        }
    }

    pub fn counter_add_all(&mut self, id: CounterId, deltas: &[i64]) {
        let running = match self.counters.get(id.0) {
            Some(c) => self.timebase_running(c.timebase),
            None => return,
        };
        if let Some(c) = self.counters.get_mut(id.0) {
            c.add_all(deltas, running);
        }
    }

    pub fn counter_set_state(&mut self, id: CounterId, state: usize, now_us: i64) {
        if let Some(c) = self.counters.get_mut(id.0) {
            c.set_state(state, now_us);
        }
    }

    pub fn counter_value(&self, id: CounterId) -> i64 {
        self.counters.get(id.0).map_or(0, Counter::value)
    }

    pub fn counter_bucket(&self, id: CounterId, index: usize) -> i64 {
        self.counters.get(id.0).map_or(0, |c| c.bucket(index))
    }

    pub fn counter_buckets(&self, id: CounterId) -> Vec<i64> {
        self.counters.get(id.0).map_or_else(Vec::new, Counter::buckets)
    }

    /// Zero a counter. Counters are always inert afterwards; with
    /// `detach_if_reset` it also stops observing its time base.
    pub fn reset_counter(&mut self, id: CounterId, detach_if_reset: bool) -> bool {
        let tb = match self.counters.get(id.0) {
            Some(c) => c.timebase,
            None => return true,
        };
        let Some(c) = self.counters.get_mut(id.0) else {
            return true;
        };
        let inert = c.reset();
        if detach_if_reset && inert {
            if let Some(base) = self.timebases.get_mut(tb.0) {
                base.remove_observer(ObsHandle::Counter(id));
            }
        }
        inert
    }

    pub fn drop_counter(&mut self, id: CounterId) {
        let Some(c) = self.counters.remove(id.0) else {
            return;
        };
        if let Some(base) = self.timebases.get_mut(c.timebase.0) {
            base.remove_observer(ObsHandle::Counter(id));
        }
    }
}
