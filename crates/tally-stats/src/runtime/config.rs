use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub metrics_addr: Option<String>,
    pub history_dir: Option<PathBuf>,
    pub checkpoint_path: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
    pub checkpoint_interval_secs: u64,
    pub subjects: usize,
    pub tick_ms: u64,
    pub merge_window_ms: i64,
    pub max_buffer_bytes: usize,
    pub tag_pool_limit: u16,
    /// Render a stored history file (or directory) and exit.
    pub dump_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            run_seconds: None,
            json_logs: false,
            metrics_addr: None,
            history_dir: None,
            checkpoint_path: None,
            summary_path: None,
            checkpoint_interval_secs: 30,
            subjects: 8,
            tick_ms: 50,
            merge_window_ms: 1_000,
            max_buffer_bytes: 128 * 1024,
            tag_pool_limit: tally_history::tags::TAG_POOL_HARD_LIMIT,
            dump_path: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Self {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--run-seconds" => {
                    if i + 1 < args.len() {
                        cfg.run_seconds = args[i + 1].parse::<u64>().ok();
                        i += 1;
                    }
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--metrics-addr" => {
                    if i + 1 < args.len() {
                        cfg.metrics_addr = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--history-dir" => {
                    if i + 1 < args.len() {
                        cfg.history_dir = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--checkpoint" => {
                    if i + 1 < args.len() {
                        cfg.checkpoint_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--summary" => {
                    if i + 1 < args.len() {
                        cfg.summary_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--checkpoint-interval" => {
                    if i + 1 < args.len() {
                        cfg.checkpoint_interval_secs = args[i + 1].parse().unwrap_or(30);
                        i += 1;
                    }
                }
                "--subjects" => {
                    if i + 1 < args.len() {
                        cfg.subjects = args[i + 1].parse().unwrap_or(8);
                        i += 1;
                    }
                }
                "--tick-ms" => {
                    if i + 1 < args.len() {
                        cfg.tick_ms = args[i + 1].parse().unwrap_or(50);
                        i += 1;
                    }
                }
                "--merge-window-ms" => {
                    if i + 1 < args.len() {
                        cfg.merge_window_ms = args[i + 1].parse().unwrap_or(1_000);
                        i += 1;
                    }
                }
                "--max-buffer-bytes" => {
                    if i + 1 < args.len() {
                        cfg.max_buffer_bytes = args[i + 1].parse().unwrap_or(128 * 1024);
                        i += 1;
                    }
                }
                "--tag-pool-limit" => {
                    if i + 1 < args.len() {
                        cfg.tag_pool_limit = args[i + 1]
                            .parse()
                            .unwrap_or(tally_history::tags::TAG_POOL_HARD_LIMIT);
                        i += 1;
                    }
                }
                "--dump" => {
                    if i + 1 < args.len() {
                        cfg.dump_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        cfg
    }

    pub fn print_help() {
        println!(
            r#"tally-stats - usage accounting kernel with a compact history log

USAGE:
    tally-stats [OPTIONS]

OPTIONS:
    --run-seconds <SECS>      Run the synthetic workload for a fixed duration then exit
    --json-logs               Output logs in JSON format (for log aggregation)
    --metrics-addr <ADDR>     Enable Prometheus metrics server on address (e.g. 0.0.0.0:9090)
    --history-dir <PATH>      Directory for rotated history buffers
    --checkpoint <PATH>       Checkpoint file for exact restart resume
    --summary <PATH>          Summary report file (cumulative totals only)
    --checkpoint-interval <S> Seconds between periodic checkpoints [default: 30]
    --subjects <N>            Simulated accounting subjects [default: 8]
    --tick-ms <MS>            Workload tick interval [default: 50]
    --merge-window-ms <MS>    History merge-compaction window [default: 1000]
    --max-buffer-bytes <N>    History buffer rotation ceiling [default: 131072]
    --tag-pool-limit <N>      History tag pool ceiling
    --dump <PATH>             Render a stored history file (or directory) and exit
    -h, --help                Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                  Set log filter (e.g. RUST_LOG=debug,tally_stats=trace)

EXAMPLES:
    # Bounded demo run with everything on
    tally-stats --run-seconds 10 --history-dir ./history --checkpoint ./tally.ckpt

    # Inspect what was recorded
    tally-stats --dump ./history
"#
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("tally-stats")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_flags() {
        let cfg = RuntimeConfig::from_args(&args(&[]));
        assert!(!cfg.show_help);
        assert_eq!(cfg.subjects, 8);
        assert_eq!(cfg.merge_window_ms, 1_000);
        assert!(cfg.dump_path.is_none());
    }

    #[test]
    fn parses_paths_and_numbers() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--run-seconds",
            "5",
            "--checkpoint",
            "/tmp/tally.ckpt",
            "--merge-window-ms",
            "250",
            "--json-logs",
        ]));
        assert_eq!(cfg.run_seconds, Some(5));
        assert_eq!(cfg.checkpoint_path, Some(PathBuf::from("/tmp/tally.ckpt")));
        assert_eq!(cfg.merge_window_ms, 250);
        assert!(cfg.json_logs);
    }

    #[test]
    fn help_stops_parsing() {
        let cfg = RuntimeConfig::from_args(&args(&["--help", "--subjects", "99"]));
        assert!(cfg.show_help);
        assert_eq!(cfg.subjects, 8);
    }
}
