use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter; JSON output is for log aggregation pipelines.
pub fn init_tracing(json_output: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally_stats=debug,tally_history=debug"));
    let builder = fmt().with_env_filter(filter);
    if json_output {
        builder.json().init();
    } else {
        builder.init();
    }
}
