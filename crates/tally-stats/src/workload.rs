//! Deterministic synthetic workload for the demo binary: a handful of
//! simulated subjects acquire pooled wakelocks, run jobs, flip the screen and
//! the charger, and feed sampled cpu stats into the kernel, exercising every
//! accounting primitive against the history log.

use core_ledger::{CounterId, Ledger, PoolId, TimeBaseId, TimerId};
use tally_history::item::*;
use tally_history::{HistoryLog, HistoryTag, RotatedBuffer};

struct Subject {
    uid: i32,
    wakelock: TimerId,
    job: TimerId,
    jobs_started: CounterId,
    holding: bool,
    job_running: bool,
}

pub struct Workload {
    rng: u64,
    on_battery: TimeBaseId,
    screen_off: TimeBaseId,
    _pool: PoolId,
    subjects: Vec<Subject>,
    cpu_stats: TimerId,
    cpu_reported_us: i64,
    cpu_reported_count: i64,
    battery_level: u8,
    charge_uah: u32,
    drain_accum: u32,
    screen_on: bool,
    plugged: bool,
}

impl Workload {
    pub fn new(ledger: &mut Ledger, history: &mut HistoryLog, subject_count: usize, seed: u64) -> Self {
        let subject_count = subject_count.max(1);
        let on_battery = ledger.new_timebase();
        let screen_off = ledger.new_timebase();
        // Unplugged from the start; the screen starts on, so the narrower
        // screen-off base is idle.
        ledger.set_running(on_battery, true, 0, 0);

        let pool = ledger.new_pool(on_battery);
        let subjects = (0..subject_count)
            .map(|i| {
                let uid = 10_000 + i as i32;
                Subject {
                    uid,
                    wakelock: ledger.new_stopwatch_timer(on_battery, Some(pool)),
                    job: ledger.new_dual_timer(on_battery, screen_off, None),
                    jobs_started: ledger.new_counter(on_battery),
                    holding: false,
                    job_running: false,
                }
            })
            .collect();
        let cpu_stats = ledger.new_sampling_timer(on_battery);

        history.set_battery(
            100,
            BATTERY_STATUS_DISCHARGING,
            BATTERY_HEALTH_GOOD,
            BATTERY_PLUGGED_NONE,
            250,
            4350,
        );
        history.set_charge_uah(3_000_000);
        history.set_state(STATE_CPU_RUNNING, true);
        history.set_state(STATE_SCREEN_ON, true);

        Self {
            rng: seed | 1,
            on_battery,
            screen_off,
            _pool: pool,
            subjects,
            cpu_stats,
            cpu_reported_us: 0,
            cpu_reported_count: 0,
            battery_level: 100,
            charge_uah: 3_000_000,
            drain_accum: 0,
            screen_on: true,
            plugged: false,
        }
    }

    pub fn on_battery(&self) -> TimeBaseId {
        self.on_battery
    }

    pub fn named_timers(&self) -> Vec<(String, TimerId)> {
        let mut named: Vec<(String, TimerId)> = self
            .subjects
            .iter()
            .flat_map(|s| {
                [
                    (format!("wakelock:{}", s.uid), s.wakelock),
                    (format!("job:{}", s.uid), s.job),
                ]
            })
            .collect();
        named.push(("cpu".to_string(), self.cpu_stats));
        named
    }

    pub fn named_counters(&self) -> Vec<(String, CounterId)> {
        self.subjects
            .iter()
            .map(|s| (format!("jobs_started:{}", s.uid), s.jobs_started))
            .collect()
    }

    fn next_rand(&mut self, bound: u64) -> u64 {
        self.rng = self
            .rng
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.rng >> 33) % bound
    }

    /// Advance the simulation one tick. Any history writes that pushed the
    /// buffer past its ceiling hand back rotated generations.
    pub fn tick(
        &mut self,
        ledger: &mut Ledger,
        history: &mut HistoryLog,
        now_ms: i64,
    ) -> Vec<RotatedBuffer> {
        let now_us = now_ms * 1000;
        let mut rotated = Vec::new();
        let roll = self.next_rand(100);

        if roll < 30 {
            let idx = self.next_rand(self.subjects.len() as u64) as usize;
            let subject = &mut self.subjects[idx];
            if subject.holding {
                ledger.stop_timer(subject.wakelock, now_us);
                subject.holding = false;
            } else {
                ledger.start_timer(subject.wakelock, now_us);
                subject.holding = true;
                history.note_wakelock(HistoryTag::new("*walarm*", subject.uid));
            }
            let any_held = self.subjects.iter().any(|s| s.holding);
            history.set_state(STATE_WAKE_LOCK, any_held);
            rotated.extend(history.record_update(now_ms));
        } else if roll < 50 {
            let idx = self.next_rand(self.subjects.len() as u64) as usize;
            let subject = &mut self.subjects[idx];
            if subject.job_running {
                ledger.stop_timer(subject.job, now_us);
                subject.job_running = false;
                history.note_event(
                    EVENT_JOB | EVENT_FLAG_FINISH,
                    Some(HistoryTag::new("sim.job", subject.uid)),
                );
            } else {
                ledger.start_timer(subject.job, now_us);
                ledger.counter_step(subject.jobs_started);
                subject.job_running = true;
                history.note_event(
                    EVENT_JOB | EVENT_FLAG_START,
                    Some(HistoryTag::new("sim.job", subject.uid)),
                );
            }
            let any_job = self.subjects.iter().any(|s| s.job_running);
            history.set_state(STATE_JOB_RUNNING, any_job);
            rotated.extend(history.record_update(now_ms));
        } else if roll < 56 {
            self.screen_on = !self.screen_on;
            ledger.set_running(self.screen_off, !self.screen_on, now_us, now_us);
            history.set_state(STATE_SCREEN_ON, self.screen_on);
            rotated.extend(history.record_update(now_ms));
        } else if roll < 60 {
            self.plugged = !self.plugged;
            ledger.set_running(self.on_battery, !self.plugged, now_us, now_us);
            history.set_state(STATE_BATTERY_PLUGGED, self.plugged);
            history.set_battery(
                self.battery_level,
                if self.plugged {
                    BATTERY_STATUS_CHARGING
                } else {
                    BATTERY_STATUS_DISCHARGING
                },
                BATTERY_HEALTH_GOOD,
                if self.plugged {
                    BATTERY_PLUGGED_AC
                } else {
                    BATTERY_PLUGGED_NONE
                },
                250,
                4350,
            );
            rotated.extend(history.record_update(now_ms));
        } else if roll < 75 {
            // Cumulative cpu stats from outside; occasionally the external
            // counter resets and reports from zero again.
            if self.next_rand(40) == 0 {
                self.cpu_reported_us = self.next_rand(5_000) as i64;
                self.cpu_reported_count = 1;
            } else {
                self.cpu_reported_us += self.next_rand(20_000) as i64;
                self.cpu_reported_count += 1;
            }
            ledger.update_sampling_timer(
                self.cpu_stats,
                self.cpu_reported_us,
                self.cpu_reported_count,
                now_us,
            );
        } else if !self.plugged {
            self.drain_accum += 1;
            if self.drain_accum >= 40 && self.battery_level > 1 {
                self.drain_accum = 0;
                self.battery_level -= 1;
                self.charge_uah = self.charge_uah.saturating_sub(30_000);
                history.set_battery_level(self.battery_level);
                history.set_charge_uah(self.charge_uah);
                rotated.extend(history.record_update(now_ms));
            }
        }
        rotated
    }

    /// Release everything the simulation still holds, as on shutdown.
    pub fn quiesce(&mut self, ledger: &mut Ledger, history: &mut HistoryLog, now_ms: i64) {
        let now_us = now_ms * 1000;
        for subject in &mut self.subjects {
            if subject.holding {
                ledger.stop_timer(subject.wakelock, now_us);
                subject.holding = false;
            }
            if subject.job_running {
                ledger.stop_timer(subject.job, now_us);
                subject.job_running = false;
            }
        }
        history.set_state(STATE_WAKE_LOCK, false);
        history.set_state(STATE_JOB_RUNNING, false);
    }
}
