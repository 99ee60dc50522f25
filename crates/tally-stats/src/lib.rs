pub mod metrics;
pub mod persist;
pub mod runtime;
pub mod store;
pub mod workload;

pub use persist::{read_checkpoint, read_summary, write_checkpoint, write_summary};
pub use runtime::RuntimeConfig;
pub use store::HistoryStore;
pub use workload::Workload;
