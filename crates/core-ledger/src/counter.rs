use crate::ids::TimeBaseId;
use serde::{Deserialize, Serialize};

/// Accumulator gated by a time base: mutations only land while the base is
/// running, reads are unconditional. The ledger resolves the gate and passes
/// it in, so the counter itself stays a plain value type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counter {
    pub(crate) timebase: TimeBaseId,
    pub(crate) kind: CounterKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum CounterKind {
    Scalar {
        count: i64,
    },
    Array {
        counts: Vec<i64>,
    },
    /// Buckets indexed by an externally supplied process-state index.
    /// Switching state redirects subsequent increments; prior buckets are
    /// never rewritten.
    MultiState {
        counts: Vec<i64>,
        state: usize,
        last_state_change_us: i64,
    },
}

impl Counter {
    pub(crate) fn scalar(timebase: TimeBaseId) -> Self {
        Self {
            timebase,
            kind: CounterKind::Scalar { count: 0 },
        }
    }

    pub(crate) fn array(timebase: TimeBaseId, len: usize) -> Self {
        Self {
            timebase,
            kind: CounterKind::Array {
                counts: vec![0; len],
            },
        }
    }

    pub(crate) fn multi_state(timebase: TimeBaseId, states: usize) -> Self {
        Self {
            timebase,
            kind: CounterKind::MultiState {
                counts: vec![0; states],
                state: 0,
                last_state_change_us: 0,
            },
        }
    }

    pub(crate) fn add(&mut self, delta: i64, base_running: bool) {
        if !base_running {
            return;
        }
        match &mut self.kind {
            CounterKind::Scalar { count } => *count += delta,
            CounterKind::MultiState { counts, state, .. } => counts[*state] += delta,
            CounterKind::Array { .. } => {
                log::warn!("scalar add on an array counter ignored");
            }
        }
    }

    pub(crate) fn add_all(&mut self, deltas: &[i64], base_running: bool) {
        if !base_running {
            return;
        }
        match &mut self.kind {
            CounterKind::Array { counts } => {
                if deltas.len() != counts.len() {
                    log::warn!(
                        "array counter add with {} deltas into {} buckets ignored",
                        deltas.len(),
                        counts.len()
                    );
                    return;
                }
                for (slot, delta) in counts.iter_mut().zip(deltas) {
                    *slot += delta;
                }
            }
            _ => log::warn!("array add on a non-array counter ignored"),
        }
    }

    /// Redirect subsequent increments to `new_state`. Out-of-range indices
    /// are logged no-ops; the kernel never aborts over bookkeeping.
    pub(crate) fn set_state(&mut self, new_state: usize, now_us: i64) {
        match &mut self.kind {
            CounterKind::MultiState {
                counts,
                state,
                last_state_change_us,
            } => {
                if new_state >= counts.len() {
                    log::warn!(
                        "state index {new_state} out of range ({} buckets), keeping {}",
                        counts.len(),
                        *state
                    );
                    return;
                }
                *state = new_state;
                *last_state_change_us = now_us;
            }
            _ => log::warn!("set_state on a non-multi-state counter ignored"),
        }
    }

    pub(crate) fn value(&self) -> i64 {
        match &self.kind {
            CounterKind::Scalar { count } => *count,
            CounterKind::Array { counts } => counts.iter().sum(),
            CounterKind::MultiState { counts, .. } => counts.iter().sum(),
        }
    }

    pub(crate) fn bucket(&self, index: usize) -> i64 {
        match &self.kind {
            CounterKind::Scalar { count } => {
                if index == 0 {
                    *count
                } else {
                    0
                }
            }
            CounterKind::Array { counts } | CounterKind::MultiState { counts, .. } => {
                counts.get(index).copied().unwrap_or(0)
            }
        }
    }

    pub(crate) fn buckets(&self) -> Vec<i64> {
        match &self.kind {
            CounterKind::Scalar { count } => vec![*count],
            CounterKind::Array { counts } | CounterKind::MultiState { counts, .. } => {
                counts.clone()
            }
        }
    }

    /// Replace bucket values from a summary, bucket-count permitting; a
    /// mismatched summary is dropped rather than partially applied.
    pub(crate) fn load_buckets(&mut self, buckets: &[i64]) {
        match &mut self.kind {
            CounterKind::Scalar { count } => {
                if let [value] = buckets {
                    *count = *value;
                } else {
                    log::warn!("scalar counter summary with {} buckets dropped", buckets.len());
                }
            }
            CounterKind::Array { counts } | CounterKind::MultiState { counts, .. } => {
                if counts.len() == buckets.len() {
                    counts.copy_from_slice(buckets);
                } else {
                    log::warn!(
                        "counter summary with {} buckets into {} dropped",
                        buckets.len(),
                        counts.len()
                    );
                }
            }
        }
    }

    /// Zero the value. Counters carry no in-flight state, so they are always
    /// inert after a reset.
    pub(crate) fn reset(&mut self) -> bool {
        match &mut self.kind {
            CounterKind::Scalar { count } => *count = 0,
            CounterKind::Array { counts } => counts.iter_mut().for_each(|c| *c = 0),
            CounterKind::MultiState { counts, .. } => counts.iter_mut().for_each(|c| *c = 0),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tb() -> TimeBaseId {
        TimeBaseId(0)
    }

    #[test]
    fn scalar_gates_on_running() {
        let mut c = Counter::scalar(tb());
        c.add(3, false);
        assert_eq!(c.value(), 0);
        c.add(3, true);
        c.add(1, true);
        assert_eq!(c.value(), 4);
    }

    #[test]
    fn multi_state_redirects_without_rewriting() {
        let mut c = Counter::multi_state(tb(), 3);
        c.add(5, true);
        c.set_state(2, 1_000);
        c.add(7, true);
        assert_eq!(c.bucket(0), 5);
        assert_eq!(c.bucket(2), 7);
        assert_eq!(c.value(), 12);
    }

    #[test]
    fn out_of_range_state_is_a_no_op() {
        let mut c = Counter::multi_state(tb(), 2);
        c.set_state(9, 0);
        c.add(1, true);
        assert_eq!(c.bucket(0), 1, "increments keep flowing to the old state");
    }

    #[test]
    fn array_add_checks_length() {
        let mut c = Counter::array(tb(), 4);
        c.add_all(&[1, 2, 3, 4], true);
        c.add_all(&[1, 2], true);
        assert_eq!(c.buckets(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn reset_reports_inert() {
        let mut c = Counter::scalar(tb());
        c.add(9, true);
        assert!(c.reset());
        assert_eq!(c.value(), 0);
    }
}
