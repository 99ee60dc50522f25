pub mod app;
pub mod config;
pub mod logging;

pub use app::{dump, run, run_from_args};
pub use config::RuntimeConfig;
