use core_ledger::Ledger;
use tally_history::{HistoryCmd, HistoryConfig, HistoryIter, HistoryLog};
use tally_stats::persist;
use tally_stats::store::HistoryStore;
use tally_stats::workload::Workload;
use tempfile::tempdir;

#[test]
fn workload_checkpoint_restart_resume() {
    let dir = tempdir().unwrap();
    let ckpt = dir.path().join("tally.ckpt");
    let store = HistoryStore::new(dir.path().join("history")).unwrap();

    let mut ledger = Ledger::new();
    let mut history = HistoryLog::new(HistoryConfig {
        max_buffer_bytes: 2_048,
        ..HistoryConfig::default()
    });
    let mut workload = Workload::new(&mut ledger, &mut history, 3, 99);
    for tick in 0..2_000i64 {
        for rotated in workload.tick(&mut ledger, &mut history, tick * 50) {
            store.write(&rotated).unwrap();
        }
    }
    let end_us = 2_000 * 50 * 1_000;
    let records_before = history.stats().records;
    persist::write_checkpoint(&ckpt, &ledger, &history, 111).unwrap();

    // Process restart: the restored kernel is indistinguishable from the one
    // that wrote the checkpoint.
    let (ledger2, mut history2, wall) = persist::read_checkpoint(&ckpt).expect("restores");
    assert_eq!(wall, 111);
    assert_eq!(history2.stats().records, records_before);
    assert_eq!(history2.buffer(), history.buffer());
    assert_eq!(ledger2.active_timer_count(), ledger.active_timer_count());
    for (name, id) in workload.named_timers() {
        assert_eq!(
            ledger2.timer_total_time_us(id, end_us),
            ledger.timer_total_time_us(id, end_us),
            "timer {name} must resume exactly"
        );
        assert_eq!(ledger2.timer_count(id), ledger.timer_count(id), "{name}");
    }
    for (name, id) in workload.named_counters() {
        assert_eq!(
            ledger2.counter_value(id),
            ledger.counter_value(id),
            "counter {name} must resume exactly"
        );
    }

    // The restored log keeps recording into the same generation.
    history2.record_shutdown(2_000 * 50);
    let items: Vec<_> = history2
        .iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("tail replays after resume");
    assert_eq!(items.last().map(|i| i.cmd), Some(HistoryCmd::Shutdown));
}

#[test]
fn stored_generations_replay_standalone_after_restart() {
    let dir = tempdir().unwrap();
    let store = HistoryStore::new(dir.path()).unwrap();

    let mut ledger = Ledger::new();
    let mut history = HistoryLog::new(HistoryConfig {
        max_buffer_bytes: 1_024,
        ..HistoryConfig::default()
    });
    let mut workload = Workload::new(&mut ledger, &mut history, 2, 7);
    for tick in 0..3_000i64 {
        for rotated in workload.tick(&mut ledger, &mut history, tick * 50) {
            store.write(&rotated).unwrap();
        }
    }

    let paths = store.list().unwrap();
    assert!(paths.len() >= 2, "small ceiling produced several generations");
    for path in paths {
        let data = HistoryStore::load(&path).unwrap();
        let items: Vec<_> = HistoryIter::new(&data)
            .collect::<Result<Vec<_>, _>>()
            .unwrap_or_else(|err| panic!("{} must replay standalone: {err}", path.display()));
        assert_eq!(items.first().map(|i| i.cmd), Some(HistoryCmd::Reset));
        // Tags referenced in this generation resolved from this generation.
        assert!(items
            .iter()
            .all(|i| i.wakelock_tag.as_ref().is_none_or(|t| !t.string.is_empty())));
    }
}

#[test]
fn summary_report_covers_the_workload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("summary.json");

    let mut ledger = Ledger::new();
    let mut history = HistoryLog::default();
    let mut workload = Workload::new(&mut ledger, &mut history, 2, 3);
    for tick in 0..1_000i64 {
        workload.tick(&mut ledger, &mut history, tick * 50);
    }
    let end_us = 1_000 * 50 * 1_000;
    let mut entries = Vec::new();
    for (name, id) in workload.named_timers() {
        entries.push(persist::SummaryEntry {
            name,
            value: persist::SummaryValue::Timer(ledger.timer_summary(id, end_us)),
        });
    }
    persist::write_summary(&path, entries, 5).unwrap();

    let file = persist::read_summary(&path).expect("reads back");
    assert_eq!(file.entries.len(), workload.named_timers().len());
    let total: i64 = file
        .entries
        .iter()
        .map(|e| match &e.value {
            persist::SummaryValue::Timer(t) => t.total_time_us,
            _ => 0,
        })
        .sum();
    assert!(total > 0, "the workload accrued time somewhere");
}
