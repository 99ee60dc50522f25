//! Versioned persistence for the kernel and history log.
//!
//! Two formats, per the durable-storage contract: the **checkpoint** carries
//! every field for exact restart resume; the **summary** carries cumulative
//! totals only and implicitly stops in-flight timers on read. Both lead with
//! a format-version integer, and any mismatch or parse failure discards the
//! whole payload — the caller reinitializes empty rather than partially
//! applying a corrupt store.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use core_ledger::{CounterSummary, Ledger, LedgerSnapshot, TimeBaseSummary, TimerSummary};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tally_history::{HistoryLog, HistorySnapshot};
use thiserror::Error;

pub const CHECKPOINT_VERSION: u32 = 1;
pub const SUMMARY_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

mod b64 {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    version: u32,
    wall_ms: i64,
    ledger: LedgerSnapshot,
    /// History state minus the raw buffer, which rides separately as base64.
    history: HistorySnapshot,
    #[serde(with = "b64")]
    history_buffer: Vec<u8>,
}

/// Write a full checkpoint atomically (temp file + rename).
pub fn write_checkpoint(
    path: &Path,
    ledger: &Ledger,
    history: &HistoryLog,
    wall_ms: i64,
) -> Result<(), PersistError> {
    write_checkpoint_snapshot(path, ledger.snapshot(), history.snapshot(), wall_ms)
}

/// Snapshot-based variant for deferred writes: the caller takes the
/// snapshots under its lock and hands them to a background thread.
pub fn write_checkpoint_snapshot(
    path: &Path,
    ledger: LedgerSnapshot,
    mut history: HistorySnapshot,
    wall_ms: i64,
) -> Result<(), PersistError> {
    let history_buffer = std::mem::take(&mut history.buffer);
    let file = CheckpointFile {
        version: CHECKPOINT_VERSION,
        wall_ms,
        ledger,
        history,
        history_buffer,
    };
    write_atomic(path, &serde_json::to_vec(&file)?)?;
    Ok(())
}

/// Load a checkpoint. Returns `None` — caller starts empty — when the file is
/// missing, the version does not match, or any part fails to parse.
pub fn read_checkpoint(path: &Path) -> Option<(Ledger, HistoryLog, i64)> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "no checkpoint to restore");
            return None;
        }
    };
    let value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "discarding unparseable checkpoint");
            return None;
        }
    };
    match value.get("version").and_then(serde_json::Value::as_u64) {
        Some(version) if version == CHECKPOINT_VERSION as u64 => {}
        version => {
            tracing::warn!(
                path = %path.display(),
                ?version,
                expected = CHECKPOINT_VERSION,
                "discarding checkpoint with mismatched version"
            );
            return None;
        }
    }
    let mut file: CheckpointFile = match serde_json::from_value(value) {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "discarding malformed checkpoint");
            return None;
        }
    };
    file.history.buffer = std::mem::take(&mut file.history_buffer);
    let ledger = Ledger::restore(file.ledger);
    let history = HistoryLog::restore(file.history);
    tracing::info!(path = %path.display(), wall_ms = file.wall_ms, "checkpoint restored");
    Some((ledger, history, file.wall_ms))
}

/// One named total in a summary report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SummaryValue {
    Timer(TimerSummary),
    Counter(CounterSummary),
    TimeBase(TimeBaseSummary),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub name: String,
    #[serde(flatten)]
    pub value: SummaryValue,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SummaryFile {
    pub version: u32,
    pub wall_ms: i64,
    pub entries: Vec<SummaryEntry>,
}

pub fn write_summary(
    path: &Path,
    entries: Vec<SummaryEntry>,
    wall_ms: i64,
) -> Result<(), PersistError> {
    let file = SummaryFile {
        version: SUMMARY_VERSION,
        wall_ms,
        entries,
    };
    write_atomic(path, &serde_json::to_vec_pretty(&file)?)?;
    Ok(())
}

/// Load a summary report; same discard rules as the checkpoint.
pub fn read_summary(path: &Path) -> Option<SummaryFile> {
    let text = fs::read_to_string(path).ok()?;
    let value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "discarding unparseable summary");
            return None;
        }
    };
    match value.get("version").and_then(serde_json::Value::as_u64) {
        Some(version) if version == SUMMARY_VERSION as u64 => {}
        version => {
            tracing::warn!(
                path = %path.display(),
                ?version,
                expected = SUMMARY_VERSION,
                "discarding summary with mismatched version"
            );
            return None;
        }
    }
    match serde_json::from_value(value) {
        Ok(file) => Some(file),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "discarding malformed summary");
            None
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_history::{HistoryConfig, HistoryTag};
    use tempfile::tempdir;

    const SEC: i64 = 1_000_000;

    fn populated() -> (Ledger, HistoryLog) {
        let mut ledger = Ledger::new();
        let tb = ledger.new_timebase();
        ledger.set_running(tb, true, 0, 0);
        let t = ledger.new_stopwatch_timer(tb, None);
        ledger.start_timer(t, 0);
        let mut history = HistoryLog::new(HistoryConfig::default());
        history.note_wakelock(HistoryTag::new("wl:ckpt", 1001));
        history.record_update(100);
        (ledger, history)
    }

    #[test]
    fn checkpoint_round_trips_exactly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tally.ckpt");
        let (ledger, history) = populated();
        write_checkpoint(&path, &ledger, &history, 1_700_000_000_000).unwrap();

        let (ledger2, history2, wall) = read_checkpoint(&path).expect("restores");
        assert_eq!(wall, 1_700_000_000_000);
        assert_eq!(ledger2.active_timer_count(), 1, "in-flight state survives");
        assert_eq!(history2.buffer(), history.buffer());
        assert_eq!(history2.stats().records, history.stats().records);
    }

    #[test]
    fn version_mismatch_discards_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tally.ckpt");
        let (ledger, history) = populated();
        write_checkpoint(&path, &ledger, &history, 0).unwrap();

        let mut value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["version"] = serde_json::json!(CHECKPOINT_VERSION + 1);
        fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        assert!(read_checkpoint(&path).is_none());
    }

    #[test]
    fn corrupt_payload_discards_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tally.ckpt");
        fs::write(&path, b"{\"version\":1,\"ledger\":").unwrap();
        assert!(read_checkpoint(&path).is_none());
        fs::write(&path, b"{\"version\":1,\"ledger\":{}}").unwrap();
        assert!(read_checkpoint(&path).is_none(), "never partially applied");
    }

    #[test]
    fn summary_round_trips_and_checks_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let mut ledger = Ledger::new();
        let tb = ledger.new_timebase();
        ledger.set_running(tb, true, 0, 0);
        let t = ledger.new_stopwatch_timer(tb, None);
        ledger.start_timer(t, 0);
        let entries = vec![SummaryEntry {
            name: "wakelock:1001".into(),
            value: SummaryValue::Timer(ledger.timer_summary(t, 5 * SEC)),
        }];
        write_summary(&path, entries, 42).unwrap();

        let file = read_summary(&path).expect("reads back");
        assert_eq!(file.wall_ms, 42);
        match &file.entries[0].value {
            SummaryValue::Timer(summary) => {
                assert_eq!(summary.total_time_us, 5 * SEC);
                assert_eq!(summary.count, 1);
            }
            other => panic!("expected timer summary, got {other:?}"),
        }

        let mut value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["version"] = serde_json::json!(99);
        fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();
        assert!(read_summary(&path).is_none());
    }
}
