use serde::{Deserialize, Serialize};

/// Handle to a [`crate::TimeBase`] in the owning ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeBaseId(pub(crate) u32);

/// Handle to a counter in the owning ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CounterId(pub(crate) u32);

/// Handle to a timer in the owning ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerId(pub(crate) u32);

/// Handle to a timer pool in the owning ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub(crate) u32);

/// What a time base notifies on a running-state flip. Counters gate at
/// mutation time and ignore the callbacks; timers freeze or resume accrual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObsHandle {
    Counter(CounterId),
    Timer(TimerId),
}
