/// Minimal slab arena with free-slot reuse. Handles are plain indices; a slot
/// freed by `remove` is recycled by the next `insert`, so handle stability
/// only holds for live entries. All kernel objects live in slabs owned by the
/// `Ledger`, which is what makes disposal the single unregistration point.
#[derive(Debug, Clone)]
pub struct Slab<T> {
    entries: Vec<Option<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> u32 {
        self.len += 1;
        match self.free.pop() {
            Some(idx) => {
                self.entries[idx as usize] = Some(value);
                idx
            }
            None => {
                self.entries.push(Some(value));
                (self.entries.len() - 1) as u32
            }
        }
    }

    pub fn remove(&mut self, idx: u32) -> Option<T> {
        let slot = self.entries.get_mut(idx as usize)?;
        let value = slot.take()?;
        self.free.push(idx);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, idx: u32) -> Option<&T> {
        self.entries.get(idx as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, idx: u32) -> Option<&mut T> {
        self.entries.get_mut(idx as usize).and_then(Option::as_mut)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i as u32, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|v| (i as u32, v)))
    }

    /// Rebuild from (index, value) pairs, e.g. when restoring a checkpoint.
    /// Indices must be unique; gaps become free slots.
    pub fn from_entries(pairs: Vec<(u32, T)>) -> Self {
        let cap = pairs
            .iter()
            .map(|(i, _)| *i as usize + 1)
            .max()
            .unwrap_or(0);
        let mut entries: Vec<Option<T>> = Vec::with_capacity(cap);
        entries.resize_with(cap, || None);
        let mut len = 0;
        for (i, v) in pairs {
            if entries[i as usize].replace(v).is_none() {
                len += 1;
            }
        }
        let free = entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as u32)
            .collect();
        Self { entries, free, len }
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_reuses_slots() {
        let mut slab = Slab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.remove(a), Some("a"));
        let c = slab.insert("c");
        assert_eq!(c, a, "freed slot should be recycled");
        assert_eq!(slab.get(b), Some(&"b"));
        assert_eq!(slab.get(c), Some(&"c"));
    }

    #[test]
    fn remove_twice_is_none() {
        let mut slab = Slab::new();
        let a = slab.insert(1);
        assert_eq!(slab.remove(a), Some(1));
        assert_eq!(slab.remove(a), None);
    }

    #[test]
    fn from_entries_round_trips() {
        let mut slab = Slab::new();
        let a = slab.insert(10);
        let b = slab.insert(20);
        slab.remove(a);
        let pairs: Vec<(u32, i32)> = slab.iter().map(|(i, v)| (i, *v)).collect();
        let rebuilt = Slab::from_entries(pairs);
        assert_eq!(rebuilt.get(b), Some(&20));
        assert_eq!(rebuilt.get(a), None);
        assert_eq!(rebuilt.len(), 1);
    }
}
