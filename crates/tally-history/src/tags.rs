use crate::item::HistoryTag;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tag halfword meaning "no tag here".
pub const TAG_NONE: u16 = 0x7FFF;
/// Set when the tag's payload (string + uid) follows the record inline.
pub(crate) const TAG_FIRST_FLAG: u16 = 0x8000;
pub(crate) const TAG_INDEX_MASK: u16 = 0x7FFF;
/// Index used for tags past the pool ceiling: the payload is inlined on
/// every occurrence and never enters the pool.
pub(crate) const TAG_OVERFLOW_INDEX: u16 = 0x7FFF;
/// Hard ceiling on pool entries; index 0x7FFF is reserved.
pub const TAG_POOL_HARD_LIMIT: u16 = 0x7FFE;

/// Encoded tag reference plus whether the payload must follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TagToken {
    pub halfword: u16,
    pub write_payload: bool,
}

impl TagToken {
    pub(crate) const NONE: TagToken = TagToken {
        halfword: TAG_NONE,
        write_payload: false,
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TagEntry {
    pub tag: HistoryTag,
    /// Whether this entry's payload has been written in the current buffer
    /// generation. Rotation clears the markers so the new buffer is
    /// self-describing from its own start.
    pub written: bool,
}

/// Interning dictionary from (string, uid) to small indices, scoped to the
/// writer side of one history log. Overflow past the ceiling degrades to
/// inlining the payload every time rather than failing.
#[derive(Debug, Clone, Default)]
pub struct TagPool {
    index: HashMap<HistoryTag, u16>,
    entries: Vec<TagEntry>,
    limit: u16,
    overflows: u64,
}

impl TagPool {
    pub fn new(limit: u16) -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
            limit: limit.min(TAG_POOL_HARD_LIMIT),
            overflows: 0,
        }
    }

    pub(crate) fn intern(&mut self, tag: &HistoryTag) -> TagToken {
        if let Some(&idx) = self.index.get(tag) {
            let entry = &mut self.entries[idx as usize];
            if entry.written {
                return TagToken {
                    halfword: idx,
                    write_payload: false,
                };
            }
            entry.written = true;
            return TagToken {
                halfword: idx | TAG_FIRST_FLAG,
                write_payload: true,
            };
        }
        if (self.entries.len() as u16) < self.limit {
            let idx = self.entries.len() as u16;
            self.index.insert(tag.clone(), idx);
            self.entries.push(TagEntry {
                tag: tag.clone(),
                written: true,
            });
            return TagToken {
                halfword: idx | TAG_FIRST_FLAG,
                write_payload: true,
            };
        }
        self.overflows += 1;
        TagToken {
            halfword: TAG_OVERFLOW_INDEX | TAG_FIRST_FLAG,
            write_payload: true,
        }
    }

    /// Start a new buffer generation: every entry's payload must be written
    /// out again on first use.
    pub fn rewind_generation(&mut self) {
        for entry in &mut self.entries {
            entry.written = false;
        }
    }

    /// Forget everything, as on an explicit history reset.
    pub fn clear(&mut self) {
        self.index.clear();
        self.entries.clear();
        self.overflows = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    pub(crate) fn snapshot_entries(&self) -> Vec<TagEntry> {
        self.entries.clone()
    }

    pub(crate) fn restore(limit: u16, entries: Vec<TagEntry>, overflows: u64) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.tag.clone(), i as u16))
            .collect();
        Self {
            index,
            entries,
            limit: limit.min(TAG_POOL_HARD_LIMIT),
            overflows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_occurrence_once_then_references() {
        let mut pool = TagPool::new(16);
        let tag = HistoryTag::new("wl:job", 1001);
        let first = pool.intern(&tag);
        assert!(first.write_payload);
        assert_eq!(first.halfword, TAG_FIRST_FLAG);
        for _ in 0..5 {
            let again = pool.intern(&tag);
            assert!(!again.write_payload);
            assert_eq!(again.halfword, 0);
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn same_string_different_uid_is_a_new_tag() {
        let mut pool = TagPool::new(16);
        pool.intern(&HistoryTag::new("wl", 1));
        let other = pool.intern(&HistoryTag::new("wl", 2));
        assert_eq!(other.halfword & TAG_INDEX_MASK, 1);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn overflow_degrades_to_inline() {
        let mut pool = TagPool::new(2);
        pool.intern(&HistoryTag::new("a", 0));
        pool.intern(&HistoryTag::new("b", 0));
        let spilled = pool.intern(&HistoryTag::new("c", 0));
        assert!(spilled.write_payload);
        assert_eq!(spilled.halfword, TAG_OVERFLOW_INDEX | TAG_FIRST_FLAG);
        // Every further occurrence inlines again.
        let again = pool.intern(&HistoryTag::new("c", 0));
        assert!(again.write_payload);
        assert_eq!(pool.overflows(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn rewind_remarks_all_entries() {
        let mut pool = TagPool::new(16);
        let tag = HistoryTag::new("wl", 7);
        pool.intern(&tag);
        pool.intern(&tag);
        pool.rewind_generation();
        let after = pool.intern(&tag);
        assert!(after.write_payload, "payload re-emitted per generation");
        assert_eq!(after.halfword & TAG_INDEX_MASK, 0, "index is stable");
    }
}
