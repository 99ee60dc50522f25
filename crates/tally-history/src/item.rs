use serde::{Deserialize, Serialize};

// Primary state flags. The top seven bits are the frequently-flipping ones:
// every delta header carries them inline, so a lone toggle of any of these
// costs no extra payload word. Bit 24 is never assigned — the delta encoding
// cannot carry it (it is the charge-counter section flag's shadow).
pub const STATE_CPU_RUNNING: u32 = 1 << 31;
pub const STATE_WAKE_LOCK: u32 = 1 << 30;
pub const STATE_SENSOR_ON: u32 = 1 << 29;
pub const STATE_GPS_ON: u32 = 1 << 28;
pub const STATE_WIFI_FULL_LOCK: u32 = 1 << 27;
pub const STATE_WIFI_SCAN: u32 = 1 << 26;
pub const STATE_MOBILE_RADIO_ACTIVE: u32 = 1 << 25;

pub const STATE_SCREEN_ON: u32 = 1 << 23;
pub const STATE_BATTERY_PLUGGED: u32 = 1 << 22;
pub const STATE_PHONE_IN_CALL: u32 = 1 << 21;
pub const STATE_WIFI_ON: u32 = 1 << 20;
pub const STATE_AUDIO_ON: u32 = 1 << 19;
pub const STATE_VIDEO_ON: u32 = 1 << 18;
pub const STATE_FOREGROUND_ACTIVITIES: u32 = 1 << 17;
pub const STATE_JOB_RUNNING: u32 = 1 << 16;

// Secondary state flags; a change here always costs a payload word.
pub const STATE2_POWER_SAVE: u32 = 1 << 31;
pub const STATE2_DEVICE_IDLE: u32 = 1 << 30;
pub const STATE2_CHARGING: u32 = 1 << 29;
pub const STATE2_BLUETOOTH_ON: u32 = 1 << 28;
pub const STATE2_CAMERA_ON: u32 = 1 << 27;
pub const STATE2_FLASHLIGHT_ON: u32 = 1 << 26;
pub const STATE2_WIFI_RUNNING: u32 = 1 << 25;
pub const STATE2_CELL_HIGH_TX_POWER: u32 = 1 << 24;

pub const BATTERY_STATUS_UNKNOWN: u8 = 1;
pub const BATTERY_STATUS_CHARGING: u8 = 2;
pub const BATTERY_STATUS_DISCHARGING: u8 = 3;
pub const BATTERY_STATUS_NOT_CHARGING: u8 = 4;
pub const BATTERY_STATUS_FULL: u8 = 5;

pub const BATTERY_HEALTH_UNKNOWN: u8 = 1;
pub const BATTERY_HEALTH_GOOD: u8 = 2;
pub const BATTERY_HEALTH_OVERHEAT: u8 = 3;
pub const BATTERY_HEALTH_DEAD: u8 = 4;
pub const BATTERY_HEALTH_OVER_VOLTAGE: u8 = 5;

pub const BATTERY_PLUGGED_NONE: u8 = 0;
pub const BATTERY_PLUGGED_AC: u8 = 1;
pub const BATTERY_PLUGGED_USB: u8 = 2;
pub const BATTERY_PLUGGED_WIRELESS: u8 = 3;

// Event codes. The low bits name the event family; start/finish pairs carry
// the flag bits so a one-shot event is the bare code.
pub const EVENT_NONE: u16 = 0;
pub const EVENT_PROC: u16 = 1;
pub const EVENT_FOREGROUND: u16 = 2;
pub const EVENT_TOP: u16 = 3;
pub const EVENT_JOB: u16 = 4;
pub const EVENT_SYNC: u16 = 5;
pub const EVENT_ALARM: u16 = 6;
pub const EVENT_FLAG_START: u16 = 0x8000;
pub const EVENT_FLAG_FINISH: u16 = 0x4000;
pub const EVENT_TYPE_MASK: u16 = 0x3FFF;

/// Interned (string, subject) pair referenced from history records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryTag {
    pub string: String,
    pub uid: i32,
}

impl HistoryTag {
    pub fn new(string: impl Into<String>, uid: i32) -> Self {
        Self {
            string: string.into(),
            uid,
        }
    }
}

/// Record command. A buffer generation is `Reset` followed by `Update`
/// deltas, with `CurrentTime`/`Shutdown` markers interleaved as full records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryCmd {
    Update,
    Reset,
    CurrentTime,
    Shutdown,
}

impl HistoryCmd {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            HistoryCmd::Update => 0,
            HistoryCmd::Reset => 1,
            HistoryCmd::CurrentTime => 2,
            HistoryCmd::Shutdown => 3,
        }
    }

    pub(crate) fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(HistoryCmd::Update),
            1 => Some(HistoryCmd::Reset),
            2 => Some(HistoryCmd::CurrentTime),
            3 => Some(HistoryCmd::Shutdown),
            _ => None,
        }
    }
}

/// One snapshot of the tracked state. The log keeps a mutable `cur` item that
/// call sites update; appending encodes only what changed since the previous
/// record. Tag and event fields are transient: they belong to the record
/// being written and are cleared once it lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub time_ms: i64,
    pub cmd: HistoryCmd,
    pub states: u32,
    pub states2: u32,
    pub battery_level: u8,
    pub battery_status: u8,
    pub battery_health: u8,
    pub battery_plug_type: u8,
    /// Tenths of a degree Celsius.
    pub battery_temperature: i16,
    pub battery_voltage_mv: u16,
    pub battery_charge_uah: u32,
    pub wakelock_tag: Option<HistoryTag>,
    pub wake_reason_tag: Option<HistoryTag>,
    pub event_code: u16,
    pub event_tag: Option<HistoryTag>,
    /// Wall clock; carried by full records only.
    pub current_time_ms: i64,
}

impl HistoryItem {
    pub fn new() -> Self {
        Self {
            time_ms: 0,
            cmd: HistoryCmd::Update,
            states: 0,
            states2: 0,
            battery_level: 0,
            battery_status: BATTERY_STATUS_UNKNOWN,
            battery_health: BATTERY_HEALTH_UNKNOWN,
            battery_plug_type: BATTERY_PLUGGED_NONE,
            battery_temperature: 0,
            battery_voltage_mv: 0,
            battery_charge_uah: 0,
            wakelock_tag: None,
            wake_reason_tag: None,
            event_code: EVENT_NONE,
            event_tag: None,
            current_time_ms: 0,
        }
    }

    /// Copy another item's contents, reusing this item's allocations where
    /// possible (the free-list recycling path).
    pub fn set_to(&mut self, other: &HistoryItem) {
        self.clone_from(other);
    }

    pub fn clear(&mut self) {
        *self = HistoryItem::new();
    }

    /// Drop the per-record transient payloads after a write.
    pub(crate) fn clear_transient(&mut self) {
        self.wakelock_tag = None;
        self.wake_reason_tag = None;
        self.event_code = EVENT_NONE;
        self.event_tag = None;
    }

    pub fn has_event(&self) -> bool {
        self.event_code != EVENT_NONE
    }

    /// True when the battery snapshot fields match, which is one of the
    /// conditions for rewinding a chatty self-cancelling update.
    pub(crate) fn same_battery(&self, other: &HistoryItem) -> bool {
        self.battery_level == other.battery_level
            && self.battery_status == other.battery_status
            && self.battery_health == other.battery_health
            && self.battery_plug_type == other.battery_plug_type
            && self.battery_temperature == other.battery_temperature
            && self.battery_voltage_mv == other.battery_voltage_mv
    }
}

impl Default for HistoryItem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_to_copies_everything() {
        let mut a = HistoryItem::new();
        a.states = STATE_CPU_RUNNING | STATE_SCREEN_ON;
        a.wakelock_tag = Some(HistoryTag::new("sync", 1001));
        let mut b = HistoryItem::new();
        b.set_to(&a);
        assert_eq!(a, b);
        b.clear_transient();
        assert!(b.wakelock_tag.is_none());
        assert_eq!(b.states, a.states);
    }

    #[test]
    fn same_battery_ignores_states_and_charge() {
        let mut a = HistoryItem::new();
        let mut b = HistoryItem::new();
        a.states = STATE_GPS_ON;
        b.battery_charge_uah = 900_000;
        assert!(a.same_battery(&b));
        b.battery_level = 80;
        assert!(!a.same_battery(&b));
    }

    #[test]
    fn cmd_wire_round_trip() {
        for cmd in [
            HistoryCmd::Update,
            HistoryCmd::Reset,
            HistoryCmd::CurrentTime,
            HistoryCmd::Shutdown,
        ] {
            assert_eq!(HistoryCmd::from_wire(cmd.to_wire()), Some(cmd));
        }
        assert_eq!(HistoryCmd::from_wire(9), None);
    }
}
