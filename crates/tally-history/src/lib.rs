pub mod delta;
pub mod item;
pub mod log;
pub mod render;
pub mod tags;

pub use delta::DecodeError;
pub use item::{HistoryCmd, HistoryItem, HistoryTag};
pub use log::{HistoryConfig, HistoryIter, HistoryLog, HistorySnapshot, HistoryStats, RotatedBuffer};
pub use render::{render_item, render_log};
pub use tags::TagPool;
