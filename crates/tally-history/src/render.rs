//! Human-readable rendering of history records for the dump tool.

use crate::item::*;
use std::fmt::Write;

const STATE_NAMES: &[(u32, &str)] = &[
    (STATE_CPU_RUNNING, "cpu"),
    (STATE_WAKE_LOCK, "wake_lock"),
    (STATE_SENSOR_ON, "sensor"),
    (STATE_GPS_ON, "gps"),
    (STATE_WIFI_FULL_LOCK, "wifi_full_lock"),
    (STATE_WIFI_SCAN, "wifi_scan"),
    (STATE_MOBILE_RADIO_ACTIVE, "mobile_radio"),
    (STATE_SCREEN_ON, "screen"),
    (STATE_BATTERY_PLUGGED, "plugged"),
    (STATE_PHONE_IN_CALL, "phone_in_call"),
    (STATE_WIFI_ON, "wifi"),
    (STATE_AUDIO_ON, "audio"),
    (STATE_VIDEO_ON, "video"),
    (STATE_FOREGROUND_ACTIVITIES, "fg_activities"),
    (STATE_JOB_RUNNING, "job"),
];

const STATE2_NAMES: &[(u32, &str)] = &[
    (STATE2_POWER_SAVE, "power_save"),
    (STATE2_DEVICE_IDLE, "device_idle"),
    (STATE2_CHARGING, "charging"),
    (STATE2_BLUETOOTH_ON, "bluetooth"),
    (STATE2_CAMERA_ON, "camera"),
    (STATE2_FLASHLIGHT_ON, "flashlight"),
    (STATE2_WIFI_RUNNING, "wifi_running"),
    (STATE2_CELL_HIGH_TX_POWER, "cell_high_tx"),
];

fn status_char(status: u8) -> char {
    match status {
        BATTERY_STATUS_CHARGING => 'c',
        BATTERY_STATUS_DISCHARGING => 'd',
        BATTERY_STATUS_NOT_CHARGING => 'n',
        BATTERY_STATUS_FULL => 'f',
        _ => '?',
    }
}

fn event_name(code: u16) -> &'static str {
    match code & EVENT_TYPE_MASK {
        EVENT_PROC => "proc",
        EVENT_FOREGROUND => "fg",
        EVENT_TOP => "top",
        EVENT_JOB => "job",
        EVENT_SYNC => "sync",
        EVENT_ALARM => "alarm",
        _ => "event",
    }
}

fn push_toggles(out: &mut String, prev: u32, cur: u32, names: &[(u32, &str)]) {
    for (mask, name) in names {
        let was = prev & mask != 0;
        let is = cur & mask != 0;
        if is != was {
            let sign = if is { '+' } else { '-' };
            let _ = write!(out, " {sign}{name}");
        }
    }
}

/// Render one record on one line, diffed against the record before it so the
/// output reads like the log itself: flags as +name/-name toggles, battery
/// fields only when they moved.
pub fn render_item(item: &HistoryItem, prev: Option<&HistoryItem>) -> String {
    let mut out = String::new();
    match item.cmd {
        HistoryCmd::Reset => {
            let _ = write!(out, "{:>10} RESET", format_ms(item.time_ms));
        }
        HistoryCmd::CurrentTime => {
            let _ = write!(
                out,
                "{:>10} TIME wall={}",
                format_ms(item.time_ms),
                item.current_time_ms
            );
        }
        HistoryCmd::Shutdown => {
            let _ = write!(out, "{:>10} SHUTDOWN", format_ms(item.time_ms));
        }
        HistoryCmd::Update => {
            let _ = write!(out, "{:>10}", format_ms(item.time_ms));
        }
    }
    let _ = write!(
        out,
        " {:03} {}",
        item.battery_level,
        status_char(item.battery_status)
    );
    let base = prev.filter(|_| item.cmd == HistoryCmd::Update);
    match base {
        Some(prev) => {
            push_toggles(&mut out, prev.states, item.states, STATE_NAMES);
            push_toggles(&mut out, prev.states2, item.states2, STATE2_NAMES);
            if item.battery_temperature != prev.battery_temperature {
                let _ = write!(out, " temp={}", item.battery_temperature);
            }
            if item.battery_voltage_mv != prev.battery_voltage_mv {
                let _ = write!(out, " volt={}", item.battery_voltage_mv);
            }
            if item.battery_charge_uah != prev.battery_charge_uah {
                let _ = write!(out, " charge={}", item.battery_charge_uah);
            }
        }
        None => {
            push_toggles(&mut out, 0, item.states, STATE_NAMES);
            push_toggles(&mut out, 0, item.states2, STATE2_NAMES);
            let _ = write!(
                out,
                " temp={} volt={} charge={}",
                item.battery_temperature, item.battery_voltage_mv, item.battery_charge_uah
            );
        }
    }
    if let Some(tag) = &item.wakelock_tag {
        let _ = write!(out, " wake_lock={}:\"{}\"", tag.uid, tag.string);
    }
    if let Some(tag) = &item.wake_reason_tag {
        let _ = write!(out, " wake_reason={}:\"{}\"", tag.uid, tag.string);
    }
    if item.has_event() {
        let code = item.event_code;
        let phase = if code & EVENT_FLAG_START != 0 {
            "+"
        } else if code & EVENT_FLAG_FINISH != 0 {
            "-"
        } else {
            ""
        };
        let _ = write!(out, " {}{}", phase, event_name(code));
        if let Some(tag) = &item.event_tag {
            let _ = write!(out, "={}:\"{}\"", tag.uid, tag.string);
        }
    }
    out
}

fn format_ms(ms: i64) -> String {
    if ms >= 60_000 {
        format!("+{}m{:02}s{:03}", ms / 60_000, (ms / 1000) % 60, ms % 1000)
    } else if ms >= 1000 {
        format!("+{}s{:03}", ms / 1000, ms % 1000)
    } else {
        format!("+{ms}ms")
    }
}

/// Render a whole decoded generation.
pub fn render_log<'a>(items: impl IntoIterator<Item = &'a HistoryItem>) -> String {
    let mut out = String::new();
    let mut prev: Option<&HistoryItem> = None;
    for item in items {
        out.push_str(&render_item(item, prev));
        out.push('\n');
        prev = Some(item);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::HistoryTag;

    #[test]
    fn update_renders_toggles_only() {
        let mut prev = HistoryItem::new();
        prev.battery_level = 80;
        let mut item = prev.clone();
        item.time_ms = 4_250;
        item.states = STATE_SCREEN_ON;
        let line = render_item(&item, Some(&prev));
        assert!(line.contains("+4s250"));
        assert!(line.contains("+screen"));
        assert!(!line.contains("temp="), "unchanged fields stay silent");
    }

    #[test]
    fn events_and_tags_render_with_subject() {
        let mut item = HistoryItem::new();
        item.time_ms = 10;
        item.event_code = EVENT_JOB | EVENT_FLAG_START;
        item.event_tag = Some(HistoryTag::new("backup", 10023));
        item.wakelock_tag = Some(HistoryTag::new("*sync*", 1001));
        let line = render_item(&item, Some(&HistoryItem::new()));
        assert!(line.contains("+job=10023:\"backup\""));
        assert!(line.contains("wake_lock=1001:\"*sync*\""));
    }

    #[test]
    fn reset_renders_full_state() {
        let mut item = HistoryItem::new();
        item.cmd = HistoryCmd::Reset;
        item.battery_level = 97;
        item.states = STATE_CPU_RUNNING;
        let line = render_item(&item, None);
        assert!(line.contains("RESET"));
        assert!(line.contains("097"));
        assert!(line.contains("+cpu"));
    }
}
