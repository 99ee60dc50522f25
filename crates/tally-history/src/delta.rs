//! Bit-exact record codec. One record is a u32 little-endian header word plus
//! optional trailing words:
//!
//! - bits 0..19  — inline time delta in ms; `0x7FFFD` means a u32 delta
//!   follows, `0x7FFFE` a u64 delta, `0x7FFFF` a full snapshot record.
//! - bits 19..25 — one flag per optional section, in payload order:
//!   battery level, primary state, secondary state, wakelock/wake-reason
//!   tags, event tag, charge counter.
//! - bits 25..32 — the seven frequently-flipping primary state bits, carried
//!   inline on every record.
//!
//! A full snapshot record (`Reset` and the marker commands, or a delta whose
//! reader lost context) carries every section unconditionally. Strings are
//! u32 length + UTF-8 bytes zero-padded to a word boundary.

use crate::item::{HistoryCmd, HistoryItem, HistoryTag, EVENT_NONE};
use crate::tags::{TagPool, TagToken, TAG_FIRST_FLAG, TAG_INDEX_MASK, TAG_NONE, TAG_OVERFLOW_INDEX};
use thiserror::Error;

pub const DELTA_TIME_MASK: u32 = 0x0007_FFFF;
pub const DELTA_TIME_INT: u32 = 0x0007_FFFD;
pub const DELTA_TIME_LONG: u32 = 0x0007_FFFE;
pub const DELTA_TIME_ABS: u32 = 0x0007_FFFF;
pub const DELTA_BATTERY_LEVEL_FLAG: u32 = 1 << 19;
pub const DELTA_STATE_FLAG: u32 = 1 << 20;
pub const DELTA_STATE2_FLAG: u32 = 1 << 21;
pub const DELTA_WAKELOCK_FLAG: u32 = 1 << 22;
pub const DELTA_EVENT_FLAG: u32 = 1 << 23;
pub const DELTA_CHARGE_FLAG: u32 = 1 << 24;
/// Primary state bits carried inline in every header.
pub const DELTA_STATE_MASK: u32 = 0xFE00_0000;
/// Primary state bits that travel in the state section instead.
pub const STATE_LOW_MASK: u32 = 0x00FF_FFFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of history buffer at byte {0}")]
    UnexpectedEof(usize),
    #[error("tag index {0} not present in the reader pool")]
    BadTagIndex(u16),
    #[error("tag string is not valid utf-8")]
    BadUtf8,
    #[error("unknown record command {0}")]
    BadCmd(u32),
}

// ---------------------------------------------------------------------------
// Field packing
// ---------------------------------------------------------------------------

/// level:7 @25 | temperature:10 @15 (two's complement) | voltage:14 @1.
pub(crate) fn pack_battery_level(item: &HistoryItem) -> u32 {
    ((item.battery_level as u32 & 0x7F) << 25)
        | ((item.battery_temperature as u32 & 0x3FF) << 15)
        | ((item.battery_voltage_mv as u32 & 0x3FFF) << 1)
}

pub(crate) fn unpack_battery_level(word: u32, item: &mut HistoryItem) {
    item.battery_level = ((word >> 25) & 0x7F) as u8;
    let raw_temp = (word >> 15) & 0x3FF;
    // Sign-extend the 10-bit temperature.
    item.battery_temperature = (((raw_temp as i32) << 22) >> 22) as i16;
    item.battery_voltage_mv = ((word >> 1) & 0x3FFF) as u16;
}

/// status:3 @29 | health:3 @26 | plug:2 @24 | low 24 primary state bits.
pub(crate) fn pack_state(item: &HistoryItem) -> u32 {
    ((item.battery_status as u32 & 0x7) << 29)
        | ((item.battery_health as u32 & 0x7) << 26)
        | ((item.battery_plug_type as u32 & 0x3) << 24)
        | (item.states & STATE_LOW_MASK)
}

pub(crate) fn unpack_state(word: u32, header: u32, item: &mut HistoryItem) {
    item.battery_status = ((word >> 29) & 0x7) as u8;
    item.battery_health = ((word >> 26) & 0x7) as u8;
    item.battery_plug_type = ((word >> 24) & 0x3) as u8;
    item.states = (header & DELTA_STATE_MASK) | (word & STATE_LOW_MASK);
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let lo = self.read_u32()? as u64;
        let hi = self.read_u32()? as u64;
        Ok(lo | (hi << 32))
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let padded = (len + 3) & !3;
        let bytes = self.take(padded)?;
        String::from_utf8(bytes[..len].to_vec()).map_err(|_| DecodeError::BadUtf8)
    }
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(buf: &mut Vec<u8>, value: u64) {
    push_u32(buf, value as u32);
    push_u32(buf, (value >> 32) as u32);
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    push_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
    let pad = (4 - s.len() % 4) % 4;
    buf.extend_from_slice(&[0u8; 3][..pad]);
}

fn push_tag_payload(buf: &mut Vec<u8>, tag: &HistoryTag) {
    push_u32(buf, tag.uid as u32);
    push_string(buf, &tag.string);
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

fn intern_or_none(tags: &mut TagPool, tag: Option<&HistoryTag>) -> TagToken {
    tag.map_or(TagToken::NONE, |t| tags.intern(t))
}

/// Encode `cur` relative to `last`. Non-`Update` commands and a missing
/// `last` force a full snapshot record. Returns whether any first-occurrence
/// tag payload was written (a merge-compaction blocker).
pub fn write_record(
    buf: &mut Vec<u8>,
    cur: &HistoryItem,
    last: Option<&HistoryItem>,
    tags: &mut TagPool,
) -> bool {
    match last {
        Some(last) if cur.cmd == HistoryCmd::Update => write_delta(buf, cur, last, tags),
        _ => write_full(buf, cur, tags),
    }
}

fn write_delta(buf: &mut Vec<u8>, cur: &HistoryItem, last: &HistoryItem, tags: &mut TagPool) -> bool {
    let delta_ms = (cur.time_ms - last.time_ms).max(0);
    let time_token = if delta_ms < DELTA_TIME_INT as i64 {
        delta_ms as u32
    } else if delta_ms <= u32::MAX as i64 {
        DELTA_TIME_INT
    } else {
        DELTA_TIME_LONG
    };

    let battery_word = pack_battery_level(cur);
    let battery_changed = battery_word != pack_battery_level(last);
    let state_word = pack_state(cur);
    let state_changed = state_word != pack_state(last);
    let state2_changed = cur.states2 != last.states2;
    let has_tags = cur.wakelock_tag.is_some() || cur.wake_reason_tag.is_some();
    let has_event = cur.event_code != EVENT_NONE;
    let charge_changed = cur.battery_charge_uah != last.battery_charge_uah;

    let mut header = time_token | (cur.states & DELTA_STATE_MASK);
    if battery_changed {
        header |= DELTA_BATTERY_LEVEL_FLAG;
    }
    if state_changed {
        header |= DELTA_STATE_FLAG;
    }
    if state2_changed {
        header |= DELTA_STATE2_FLAG;
    }
    if has_tags {
        header |= DELTA_WAKELOCK_FLAG;
    }
    if has_event {
        header |= DELTA_EVENT_FLAG;
    }
    if charge_changed {
        header |= DELTA_CHARGE_FLAG;
    }

    push_u32(buf, header);
    match time_token {
        DELTA_TIME_INT => push_u32(buf, delta_ms as u32),
        DELTA_TIME_LONG => push_u64(buf, delta_ms as u64),
        _ => {}
    }
    if battery_changed {
        push_u32(buf, battery_word);
    }
    if state_changed {
        push_u32(buf, state_word);
    }
    if state2_changed {
        push_u32(buf, cur.states2);
    }

    let mut wrote_payload = false;
    if has_tags {
        let wl = intern_or_none(tags, cur.wakelock_tag.as_ref());
        let wr = intern_or_none(tags, cur.wake_reason_tag.as_ref());
        push_u32(buf, wl.halfword as u32 | ((wr.halfword as u32) << 16));
        if wl.write_payload {
            // intern() only asks for a payload when the tag exists
            if let Some(tag) = cur.wakelock_tag.as_ref() {
                push_tag_payload(buf, tag);
                wrote_payload = true;
            }
        }
        if wr.write_payload {
            if let Some(tag) = cur.wake_reason_tag.as_ref() {
                push_tag_payload(buf, tag);
                wrote_payload = true;
            }
        }
    }
    if has_event {
        let et = intern_or_none(tags, cur.event_tag.as_ref());
        push_u32(buf, cur.event_code as u32 | ((et.halfword as u32) << 16));
        if et.write_payload {
            if let Some(tag) = cur.event_tag.as_ref() {
                push_tag_payload(buf, tag);
                wrote_payload = true;
            }
        }
    }
    if charge_changed {
        push_u32(buf, cur.battery_charge_uah);
    }
    wrote_payload
}

fn write_full(buf: &mut Vec<u8>, cur: &HistoryItem, tags: &mut TagPool) -> bool {
    push_u32(buf, DELTA_TIME_ABS);
    push_u64(buf, cur.time_ms as u64);
    push_u32(buf, cur.cmd.to_wire());
    push_u64(buf, cur.current_time_ms as u64);
    push_u32(buf, pack_battery_level(cur));
    push_u32(
        buf,
        cur.battery_status as u32
            | ((cur.battery_health as u32) << 8)
            | ((cur.battery_plug_type as u32) << 16),
    );
    push_u32(buf, cur.states);
    push_u32(buf, cur.states2);
    push_u32(buf, cur.battery_charge_uah);

    let mut wrote_payload = false;
    let wl = intern_or_none(tags, cur.wakelock_tag.as_ref());
    let wr = intern_or_none(tags, cur.wake_reason_tag.as_ref());
    push_u32(buf, wl.halfword as u32 | ((wr.halfword as u32) << 16));
    if wl.write_payload {
        if let Some(tag) = cur.wakelock_tag.as_ref() {
            push_tag_payload(buf, tag);
            wrote_payload = true;
        }
    }
    if wr.write_payload {
        if let Some(tag) = cur.wake_reason_tag.as_ref() {
            push_tag_payload(buf, tag);
            wrote_payload = true;
        }
    }
    let et = intern_or_none(tags, cur.event_tag.as_ref());
    push_u32(buf, cur.event_code as u32 | ((et.halfword as u32) << 16));
    if et.write_payload {
        if let Some(tag) = cur.event_tag.as_ref() {
            push_tag_payload(buf, tag);
            wrote_payload = true;
        }
    }
    wrote_payload
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Tag dictionary rebuilt by the reader from first-occurrence payloads.
#[derive(Debug, Default)]
pub struct ReaderTags {
    entries: Vec<Option<HistoryTag>>,
}

impl ReaderTags {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&mut self, idx: u16, tag: HistoryTag) {
        let idx = idx as usize;
        if self.entries.len() <= idx {
            self.entries.resize(idx + 1, None);
        }
        self.entries[idx] = Some(tag);
    }

    fn lookup(&self, idx: u16) -> Result<HistoryTag, DecodeError> {
        self.entries
            .get(idx as usize)
            .and_then(Clone::clone)
            .ok_or(DecodeError::BadTagIndex(idx))
    }
}

fn read_tag(
    cursor: &mut ByteCursor<'_>,
    halfword: u16,
    tags: &mut ReaderTags,
) -> Result<Option<HistoryTag>, DecodeError> {
    let first = halfword & TAG_FIRST_FLAG != 0;
    let idx = halfword & TAG_INDEX_MASK;
    if !first {
        if idx == TAG_NONE {
            return Ok(None);
        }
        return tags.lookup(idx).map(Some);
    }
    let uid = cursor.read_u32()? as i32;
    let string = cursor.read_string()?;
    let tag = HistoryTag { string, uid };
    if idx != TAG_OVERFLOW_INDEX {
        tags.store(idx, tag.clone());
    }
    Ok(Some(tag))
}

/// Decode the record at the cursor. `prev` supplies the base state for delta
/// records; full records replace it entirely.
pub fn read_record(
    cursor: &mut ByteCursor<'_>,
    prev: &HistoryItem,
    tags: &mut ReaderTags,
) -> Result<HistoryItem, DecodeError> {
    let header = cursor.read_u32()?;
    let time_token = header & DELTA_TIME_MASK;
    if time_token == DELTA_TIME_ABS {
        return read_full(cursor, tags);
    }

    let delta_ms = match time_token {
        DELTA_TIME_INT => cursor.read_u32()? as i64,
        DELTA_TIME_LONG => cursor.read_u64()? as i64,
        inline => inline as i64,
    };

    let mut item = prev.clone();
    item.clear_transient();
    item.cmd = HistoryCmd::Update;
    item.time_ms = prev.time_ms + delta_ms;
    item.current_time_ms = 0;
    item.states = (header & DELTA_STATE_MASK) | (prev.states & STATE_LOW_MASK);

    if header & DELTA_BATTERY_LEVEL_FLAG != 0 {
        let word = cursor.read_u32()?;
        unpack_battery_level(word, &mut item);
    }
    if header & DELTA_STATE_FLAG != 0 {
        let word = cursor.read_u32()?;
        unpack_state(word, header, &mut item);
    }
    if header & DELTA_STATE2_FLAG != 0 {
        item.states2 = cursor.read_u32()?;
    }
    if header & DELTA_WAKELOCK_FLAG != 0 {
        let word = cursor.read_u32()?;
        item.wakelock_tag = read_tag(cursor, word as u16, tags)?;
        item.wake_reason_tag = read_tag(cursor, (word >> 16) as u16, tags)?;
    }
    if header & DELTA_EVENT_FLAG != 0 {
        let word = cursor.read_u32()?;
        item.event_code = word as u16;
        item.event_tag = read_tag(cursor, (word >> 16) as u16, tags)?;
    }
    if header & DELTA_CHARGE_FLAG != 0 {
        item.battery_charge_uah = cursor.read_u32()?;
    }
    Ok(item)
}

fn read_full(cursor: &mut ByteCursor<'_>, tags: &mut ReaderTags) -> Result<HistoryItem, DecodeError> {
    let mut item = HistoryItem::new();
    item.time_ms = cursor.read_u64()? as i64;
    let cmd = cursor.read_u32()?;
    item.cmd = HistoryCmd::from_wire(cmd).ok_or(DecodeError::BadCmd(cmd))?;
    item.current_time_ms = cursor.read_u64()? as i64;
    let battery_word = cursor.read_u32()?;
    unpack_battery_level(battery_word, &mut item);
    let shp = cursor.read_u32()?;
    item.battery_status = shp as u8;
    item.battery_health = (shp >> 8) as u8;
    item.battery_plug_type = (shp >> 16) as u8;
    item.states = cursor.read_u32()?;
    item.states2 = cursor.read_u32()?;
    item.battery_charge_uah = cursor.read_u32()?;
    let tag_word = cursor.read_u32()?;
    item.wakelock_tag = read_tag(cursor, tag_word as u16, tags)?;
    item.wake_reason_tag = read_tag(cursor, (tag_word >> 16) as u16, tags)?;
    let event_word = cursor.read_u32()?;
    item.event_code = event_word as u16;
    item.event_tag = read_tag(cursor, (event_word >> 16) as u16, tags)?;
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::*;

    fn round_trip(cur: &HistoryItem, last: &HistoryItem) -> HistoryItem {
        let mut tags = TagPool::new(64);
        let mut buf = Vec::new();
        write_record(&mut buf, cur, Some(last), &mut tags);
        let mut cursor = ByteCursor::new(&buf);
        let mut reader = ReaderTags::new();
        let item = read_record(&mut cursor, last, &mut reader).expect("decodes");
        assert!(cursor.at_end(), "no trailing bytes");
        item
    }

    #[test]
    fn unchanged_delta_is_one_word() {
        let last = HistoryItem::new();
        let mut cur = HistoryItem::new();
        cur.time_ms = 42;
        let mut tags = TagPool::new(64);
        let mut buf = Vec::new();
        write_record(&mut buf, &cur, Some(&last), &mut tags);
        assert_eq!(buf.len(), 4);
        assert_eq!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), 42);
    }

    #[test]
    fn inline_state_bits_ride_the_header() {
        let last = HistoryItem::new();
        let mut cur = HistoryItem::new();
        cur.time_ms = 10;
        cur.states = STATE_CPU_RUNNING | STATE_WAKE_LOCK;
        let mut tags = TagPool::new(64);
        let mut buf = Vec::new();
        write_record(&mut buf, &cur, Some(&last), &mut tags);
        // A toggle confined to the top seven bits costs no section word.
        assert_eq!(buf.len(), 4);
        let decoded = round_trip(&cur, &last);
        assert_eq!(decoded.states, cur.states);
        assert_eq!(decoded.time_ms, 10);
    }

    #[test]
    fn wide_time_deltas_escape() {
        let mut last = HistoryItem::new();
        last.time_ms = 0;
        let mut cur = HistoryItem::new();
        cur.time_ms = 600_000; // > 0x7FFFC ms
        let decoded = round_trip(&cur, &last);
        assert_eq!(decoded.time_ms, 600_000);

        cur.time_ms = 6_000_000_000; // > u32::MAX ms
        let decoded = round_trip(&cur, &last);
        assert_eq!(decoded.time_ms, 6_000_000_000);
    }

    #[test]
    fn battery_fields_round_trip_with_sign() {
        let last = HistoryItem::new();
        let mut cur = HistoryItem::new();
        cur.time_ms = 5;
        cur.battery_level = 87;
        cur.battery_temperature = -102;
        cur.battery_voltage_mv = 4125;
        let decoded = round_trip(&cur, &last);
        assert_eq!(decoded.battery_level, 87);
        assert_eq!(decoded.battery_temperature, -102);
        assert_eq!(decoded.battery_voltage_mv, 4125);
    }

    #[test]
    fn status_and_low_state_share_the_state_word() {
        let last = HistoryItem::new();
        let mut cur = HistoryItem::new();
        cur.time_ms = 5;
        cur.battery_status = BATTERY_STATUS_DISCHARGING;
        cur.battery_health = BATTERY_HEALTH_GOOD;
        cur.battery_plug_type = BATTERY_PLUGGED_NONE;
        cur.states = STATE_SCREEN_ON | STATE_SENSOR_ON;
        let decoded = round_trip(&cur, &last);
        assert_eq!(decoded.battery_status, BATTERY_STATUS_DISCHARGING);
        assert_eq!(decoded.battery_health, BATTERY_HEALTH_GOOD);
        assert_eq!(decoded.states, cur.states);
    }

    #[test]
    fn tags_and_events_round_trip() {
        let last = HistoryItem::new();
        let mut cur = HistoryItem::new();
        cur.time_ms = 9;
        cur.wakelock_tag = Some(HistoryTag::new("*job*/sync", 10023));
        cur.event_code = EVENT_JOB | EVENT_FLAG_START;
        cur.event_tag = Some(HistoryTag::new("backup", 10023));
        let decoded = round_trip(&cur, &last);
        assert_eq!(decoded.wakelock_tag, cur.wakelock_tag);
        assert_eq!(decoded.wake_reason_tag, None);
        assert_eq!(decoded.event_code, cur.event_code);
        assert_eq!(decoded.event_tag, cur.event_tag);
    }

    #[test]
    fn full_record_replaces_reader_state() {
        let mut cur = HistoryItem::new();
        cur.cmd = HistoryCmd::Reset;
        cur.time_ms = 1_234_567;
        cur.current_time_ms = 1_700_000_000_000;
        cur.states = STATE_CPU_RUNNING | STATE_SCREEN_ON;
        cur.states2 = STATE2_POWER_SAVE;
        cur.battery_level = 55;
        cur.battery_charge_uah = 2_800_000;
        let mut tags = TagPool::new(64);
        let mut buf = Vec::new();
        write_record(&mut buf, &cur, None, &mut tags);
        let mut cursor = ByteCursor::new(&buf);
        let mut reader = ReaderTags::new();
        // Garbage prev: a full record must not consult it.
        let mut prev = HistoryItem::new();
        prev.states = 0xFFFF_FFFF;
        prev.time_ms = 999;
        let decoded = read_record(&mut cursor, &prev, &mut reader).expect("decodes");
        assert_eq!(decoded, cur);
    }

    #[test]
    fn truncated_buffer_reports_eof() {
        let last = HistoryItem::new();
        let mut cur = HistoryItem::new();
        cur.time_ms = 5;
        cur.battery_level = 90;
        let mut tags = TagPool::new(64);
        let mut buf = Vec::new();
        write_record(&mut buf, &cur, Some(&last), &mut tags);
        buf.truncate(buf.len() - 1);
        let mut cursor = ByteCursor::new(&buf);
        let mut reader = ReaderTags::new();
        let err = read_record(&mut cursor, &last, &mut reader).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEof(_)));
    }

    #[test]
    fn unknown_tag_reference_is_an_error() {
        // A bare reference with no prior first-occurrence payload.
        let mut buf = Vec::new();
        push_u32(&mut buf, 7 | DELTA_WAKELOCK_FLAG);
        push_u32(&mut buf, 3u32 | ((TAG_NONE as u32) << 16));
        let mut cursor = ByteCursor::new(&buf);
        let mut reader = ReaderTags::new();
        let err = read_record(&mut cursor, &HistoryItem::new(), &mut reader).unwrap_err();
        assert_eq!(err, DecodeError::BadTagIndex(3));
    }
}
