pub mod clock;
pub mod counter;
pub mod ids;
pub mod ledger;
pub mod slab;
pub mod snapshot;
pub mod timebase;
pub mod timer;

pub use clock::{Clocks, ManualClocks, RealClocks};
pub use ids::{CounterId, ObsHandle, PoolId, TimeBaseId, TimerId};
pub use ledger::Ledger;
pub use snapshot::{CounterSummary, LedgerSnapshot, TimeBaseSummary, TimerSummary};
pub use timebase::TimeBase;
