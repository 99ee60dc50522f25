use crate::metrics;
use crate::persist::{self, SummaryEntry, SummaryValue};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::store::HistoryStore;
use crate::workload::Workload;
use core_ledger::{Clocks, Ledger, RealClocks};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tally_history::{render_log, HistoryConfig, HistoryIter, HistoryItem, HistoryLog};
use tracing::{info, warn};

/// Everything behind the one coarse lock: the accounting kernel, the history
/// log, and the workload driving them. All mutation goes through this guard.
struct Kernel {
    ledger: Ledger,
    history: HistoryLog,
    workload: Workload,
}

pub fn run_from_args() {
    let config = RuntimeConfig::from_env();
    if config.show_help {
        RuntimeConfig::print_help();
        return;
    }
    if let Some(path) = config.dump_path.clone() {
        dump(&path);
        return;
    }
    run(config);
}

pub fn run(config: RuntimeConfig) {
    init_tracing(config.json_logs);
    metrics::init_metrics();
    let _metrics_handle = config.metrics_addr.clone().map(metrics::serve_metrics);

    let history_cfg = HistoryConfig {
        merge_window_ms: config.merge_window_ms,
        max_buffer_bytes: config.max_buffer_bytes,
        tag_pool_limit: config.tag_pool_limit,
    };

    // Restore the previous incarnation exactly if a checkpoint exists;
    // anything unreadable is discarded and we start empty.
    let (mut ledger, mut history) = match config
        .checkpoint_path
        .as_deref()
        .and_then(persist::read_checkpoint)
    {
        Some((ledger, history, _wall)) => {
            info!(
                records = history.stats().records,
                active_timers = ledger.active_timer_count(),
                "resuming from checkpoint"
            );
            (ledger, history)
        }
        None => (Ledger::new(), HistoryLog::new(history_cfg)),
    };

    let store = config.history_dir.as_ref().and_then(|dir| {
        match HistoryStore::new(dir) {
            Ok(store) => Some(store),
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "history store disabled");
                None
            }
        }
    });

    let clocks = RealClocks::new();
    // The synthetic workload builds fresh subjects each run; objects restored
    // from a checkpoint keep their totals and stay reportable, they are just
    // no longer driven.
    let workload = Workload::new(&mut ledger, &mut history, config.subjects, 0x5EED);
    history.set_wall_clock_ms(clocks.current_time_ms());
    if let Some(rotated) = history.record_current_time(
        clocks.elapsed_realtime_ms(),
        clocks.current_time_ms(),
    ) {
        if let Some(store) = &store {
            store.flush_async(rotated);
        }
    }

    info!(
        subjects = config.subjects,
        tick_ms = config.tick_ms,
        merge_window_ms = config.merge_window_ms,
        "tally-stats running"
    );

    let state = Arc::new(Mutex::new(Kernel {
        ledger,
        history,
        workload,
    }));

    let deadline_ms = config
        .run_seconds
        .map(|secs| clocks.elapsed_realtime_ms() + (secs * 1000) as i64);
    let checkpoint_interval_ms = (config.checkpoint_interval_secs * 1000) as i64;
    let mut last_checkpoint_ms = clocks.elapsed_realtime_ms();
    let mut last_metrics_ms = 0i64;

    loop {
        let now_ms = clocks.elapsed_realtime_ms();
        if deadline_ms.is_some_and(|deadline| now_ms >= deadline) {
            break;
        }
        {
            let mut guard = state.lock().unwrap();
            let kernel = &mut *guard;
            let rotated = kernel
                .workload
                .tick(&mut kernel.ledger, &mut kernel.history, now_ms);
            for generation in rotated {
                if let Some(store) = &store {
                    store.flush_async(generation);
                }
            }
            metrics::EVENTS_NOTED.inc();
            if now_ms - last_metrics_ms >= 1_000 {
                last_metrics_ms = now_ms;
                metrics::update_from(&kernel.history.stats(), kernel.ledger.active_timer_count());
            }
            if let Some(path) = &config.checkpoint_path {
                if now_ms - last_checkpoint_ms >= checkpoint_interval_ms {
                    last_checkpoint_ms = now_ms;
                    checkpoint_async(path.clone(), kernel, clocks.current_time_ms());
                }
            }
        }
        thread::sleep(Duration::from_millis(config.tick_ms));
    }

    // Shutdown: release held timers, stamp the log, persist everything.
    let now_ms = clocks.elapsed_realtime_ms();
    let mut guard = state.lock().unwrap();
    let kernel = &mut *guard;
    kernel
        .workload
        .quiesce(&mut kernel.ledger, &mut kernel.history, now_ms);
    kernel.history.record_update(now_ms);
    kernel.history.record_shutdown(now_ms);
    metrics::update_from(&kernel.history.stats(), kernel.ledger.active_timer_count());

    if let Some(path) = &config.checkpoint_path {
        match persist::write_checkpoint(path, &kernel.ledger, &kernel.history, clocks.current_time_ms())
        {
            Ok(()) => metrics::CHECKPOINT_WRITES.inc(),
            Err(err) => {
                metrics::CHECKPOINT_FAILURES.inc();
                warn!(error = %err, "final checkpoint failed");
            }
        }
    }
    if let Some(path) = &config.summary_path {
        let entries = summary_entries(kernel, now_ms * 1000);
        match persist::write_summary(path, entries, clocks.current_time_ms()) {
            Ok(()) => info!(path = %path.display(), "summary written"),
            Err(err) => warn!(error = %err, "summary write failed"),
        }
    }

    let stats = kernel.history.stats();
    info!(
        records = stats.records,
        merges = stats.merges,
        rotations = stats.rotations,
        tag_pool_entries = stats.tag_pool_entries,
        "run complete"
    );
}

fn checkpoint_async(path: PathBuf, kernel: &Kernel, wall_ms: i64) {
    // Snapshots are taken under the lock; the write happens off it.
    let ledger = kernel.ledger.snapshot();
    let history = kernel.history.snapshot();
    thread::spawn(move || {
        match persist::write_checkpoint_snapshot(&path, ledger, history, wall_ms) {
            Ok(()) => {
                metrics::CHECKPOINT_WRITES.inc();
                tracing::debug!(path = %path.display(), "checkpoint written");
            }
            Err(err) => {
                metrics::CHECKPOINT_FAILURES.inc();
                warn!(error = %err, "checkpoint failed");
            }
        }
    });
}

fn summary_entries(kernel: &Kernel, now_us: i64) -> Vec<SummaryEntry> {
    let mut entries = vec![SummaryEntry {
        name: "on_battery".into(),
        value: SummaryValue::TimeBase(
            kernel
                .ledger
                .timebase_summary(kernel.workload.on_battery(), now_us),
        ),
    }];
    for (name, id) in kernel.workload.named_timers() {
        entries.push(SummaryEntry {
            name,
            value: SummaryValue::Timer(kernel.ledger.timer_summary(id, now_us)),
        });
    }
    for (name, id) in kernel.workload.named_counters() {
        entries.push(SummaryEntry {
            name,
            value: SummaryValue::Counter(kernel.ledger.counter_summary(id)),
        });
    }
    entries
}

/// Render stored history generations (a single file or a directory of
/// rotated buffers) as text on stdout.
pub fn dump(path: &Path) {
    let files: Vec<PathBuf> = if path.is_dir() {
        match HistoryStore::new(path).and_then(|store| store.list()) {
            Ok(files) => files,
            Err(err) => {
                eprintln!("cannot list {}: {err}", path.display());
                return;
            }
        }
    } else {
        vec![path.to_path_buf()]
    };
    if files.is_empty() {
        eprintln!("no history buffers under {}", path.display());
        return;
    }
    for file in files {
        let data = match HistoryStore::load(&file) {
            Ok(data) => data,
            Err(err) => {
                eprintln!("cannot read {}: {err}", file.display());
                continue;
            }
        };
        let mut items: Vec<HistoryItem> = Vec::new();
        for record in HistoryIter::new(&data) {
            match record {
                Ok(item) => items.push(item),
                Err(err) => {
                    // Decode stops at the first corrupt record; everything
                    // before it is still worth showing.
                    eprintln!("{}: truncated replay: {err}", file.display());
                    break;
                }
            }
        }
        println!("== {} ({} records)", file.display(), items.len());
        print!("{}", render_log(&items));
    }
}
