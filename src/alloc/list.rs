//! `RangeList`: singly-linked lists of address ranges.
//!
//! The shared-memory allocator tracks its arena with two of these: an
//! address-ordered free list and an allocated list. Nodes live in a slot
//! vector and are linked by [`EntryId`] instead of raw pointers, so removal
//! and coalescing are plain index rewiring. Vacated slots are chained into
//! an internal free list and reused by later insertions.
//!
//! Nothing here performs I/O or synchronization; the owner decides policy.
//!
//! ```text
//! head
//!  |
//!  v
//! +--------+     +---------+     +----------+
//! | [0,20) | --> | [30,40) | --> | [80,100) | --> None
//! +--------+     +---------+     +----------+
//! ```

use core::fmt;

/// A half-open range `[offset, offset + size)` inside an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    /// Start of the range, relative to the arena base.
    pub offset: usize,
    /// Length in bytes.
    pub size: usize,
}

impl AddressRange {
    /// Creates a range.
    #[inline]
    pub const fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    /// One past the last byte of the range.
    #[inline]
    pub const fn end(&self) -> usize {
        self.offset + self.size
    }

    /// `true` if `next` starts exactly where `self` ends.
    #[inline]
    pub const fn touches(&self, next: &AddressRange) -> bool {
        self.end() == next.offset
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Stable handle to an entry of a [`RangeList`].
///
/// Only valid until the entry is removed; the slot may be reused afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(usize);

#[derive(Debug, Clone)]
enum Slot {
    Occupied {
        range: AddressRange,
        next: Option<EntryId>,
    },
    Vacant {
        next_vacant: Option<EntryId>,
    },
}

/// A singly-linked list of [`AddressRange`]s backed by a slot vector.
#[derive(Debug, Clone, Default)]
pub struct RangeList {
    slots: Vec<Slot>,
    vacant: Option<EntryId>,
    head: Option<EntryId>,
    len: usize,
}

impl RangeList {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: None,
            head: None,
            len: 0,
        }
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if the list has no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First entry, if any.
    #[inline]
    pub fn head(&self) -> Option<EntryId> {
        self.head
    }

    /// The range stored at `id`.
    pub fn get(&self, id: EntryId) -> Option<&AddressRange> {
        match self.slots.get(id.0) {
            Some(Slot::Occupied { range, .. }) => Some(range),
            _ => None,
        }
    }

    /// Mutable access to the range stored at `id`.
    ///
    /// Changing the offset can break the ordering of a sorted list; callers
    /// that shrink entries in place must keep the order intact.
    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut AddressRange> {
        match self.slots.get_mut(id.0) {
            Some(Slot::Occupied { range, .. }) => Some(range),
            _ => None,
        }
    }

    /// The entry following `id`.
    pub fn next(&self, id: EntryId) -> Option<EntryId> {
        match self.slots.get(id.0) {
            Some(Slot::Occupied { next, .. }) => *next,
            _ => None,
        }
    }

    fn set_next(&mut self, id: EntryId, link: Option<EntryId>) {
        if let Some(Slot::Occupied { next, .. }) = self.slots.get_mut(id.0) {
            *next = link;
        }
    }

    fn occupy(&mut self, range: AddressRange, next: Option<EntryId>) -> EntryId {
        let slot = Slot::Occupied { range, next };
        self.len += 1;
        match self.vacant {
            Some(id) => {
                self.vacant = match self.slots[id.0] {
                    Slot::Vacant { next_vacant } => next_vacant,
                    Slot::Occupied { .. } => None,
                };
                self.slots[id.0] = slot;
                id
            }
            None => {
                self.slots.push(slot);
                EntryId(self.slots.len() - 1)
            }
        }
    }

    fn vacate(&mut self, id: EntryId) -> Option<AddressRange> {
        let old = core::mem::replace(
            &mut self.slots[id.0],
            Slot::Vacant {
                next_vacant: self.vacant,
            },
        );
        match old {
            Slot::Occupied { range, .. } => {
                self.vacant = Some(id);
                self.len -= 1;
                Some(range)
            }
            vacant @ Slot::Vacant { .. } => {
                self.slots[id.0] = vacant;
                None
            }
        }
    }

    /// Prepends `range` and returns its id.
    pub fn push_front(&mut self, range: AddressRange) -> EntryId {
        let id = self.occupy(range, self.head);
        self.head = Some(id);
        id
    }

    /// Inserts `range` before the first entry whose offset is not smaller.
    ///
    /// Keeps an ascending list ascending.
    pub fn insert_sorted(&mut self, range: AddressRange) -> EntryId {
        let prev = self.find(|r| r.offset >= range.offset).map_or_else(
            || self.last(),
            |(prev, _)| prev,
        );
        match prev {
            None => self.push_front(range),
            Some(prev) => {
                let id = self.occupy(range, self.next(prev));
                self.set_next(prev, Some(id));
                id
            }
        }
    }

    /// Unlinks `id`, whose predecessor is `prev` (`None` for the head).
    ///
    /// Returns `None` and leaves the list untouched if `prev` is not the
    /// actual predecessor of `id`.
    pub fn remove(&mut self, prev: Option<EntryId>, id: EntryId) -> Option<AddressRange> {
        self.get(id)?;
        let linked = match prev {
            None => self.head == Some(id),
            Some(p) => self.get(p).is_some() && self.next(p) == Some(id),
        };
        if !linked {
            return None;
        }
        let after = self.next(id);
        match prev {
            None => self.head = after,
            Some(p) => self.set_next(p, after),
        }
        self.vacate(id)
    }

    /// Removes the entry starting at `offset`.
    pub fn remove_offset(&mut self, offset: usize) -> Option<AddressRange> {
        let (prev, id) = self.find(|r| r.offset == offset)?;
        self.remove(prev, id)
    }

    /// Scans from the head and returns `(predecessor, entry)` for the first
    /// entry matching `pred`.
    pub fn find<P>(&self, mut pred: P) -> Option<(Option<EntryId>, EntryId)>
    where
        P: FnMut(&AddressRange) -> bool,
    {
        let mut prev = None;
        let mut current = self.head;
        while let Some(id) = current {
            let range = self.get(id)?;
            if pred(range) {
                return Some((prev, id));
            }
            prev = Some(id);
            current = self.next(id);
        }
        None
    }

    fn last(&self) -> Option<EntryId> {
        let mut current = self.head?;
        while let Some(next) = self.next(current) {
            current = next;
        }
        Some(current)
    }

    /// Merges every run of touching entries into one entry with the summed
    /// size. Expects the list to be sorted by offset. Returns the number of
    /// entries absorbed.
    pub fn melt(&mut self) -> usize {
        let mut absorbed = 0;
        let mut current = self.head;
        while let Some(id) = current {
            let Some(next) = self.next(id) else { break };
            let (Some(&range), Some(&following)) = (self.get(id), self.get(next)) else {
                break;
            };
            if range.touches(&following) {
                let after = self.next(next);
                self.set_next(id, after);
                self.vacate(next);
                if let Some(r) = self.get_mut(id) {
                    r.size += following.size;
                }
                absorbed += 1;
            } else {
                current = Some(next);
            }
        }
        absorbed
    }

    /// Sum of all entry sizes.
    pub fn total_size(&self) -> usize {
        self.iter().map(|r| r.size).sum()
    }

    /// Size of the largest entry, zero when empty.
    pub fn largest(&self) -> usize {
        self.iter().map(|r| r.size).max().unwrap_or(0)
    }

    /// `true` if entries ascend by offset and neither overlap nor touch.
    pub fn is_coalesced(&self) -> bool {
        let mut iter = self.iter();
        let Some(mut prev) = iter.next() else { return true };
        for range in iter {
            if prev.end() >= range.offset {
                return false;
            }
            prev = range;
        }
        true
    }

    /// Iterates over the ranges in list order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            current: self.head,
            remaining: self.len,
        }
    }
}

/// Iterator over the ranges of a [`RangeList`].
pub struct Iter<'a> {
    list: &'a RangeList,
    current: Option<EntryId>,
    remaining: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a AddressRange;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        let range = self.list.get(id)?;
        self.current = self.list.next(id);
        self.remaining = self.remaining.saturating_sub(1);
        Some(range)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> IntoIterator for &'a RangeList {
    type Item = &'a AddressRange;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for RangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(empty)");
        }
        for (i, range) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(list: &RangeList) -> Vec<(usize, usize)> {
        list.iter().map(|r| (r.offset, r.size)).collect()
    }

    #[test]
    fn new_list_is_empty() {
        let list = RangeList::new();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert!(list.iter().next().is_none());
        assert_eq!(list.to_string(), "(empty)");
    }

    #[test]
    fn push_front_prepends() {
        let mut list = RangeList::new();
        list.push_front(AddressRange::new(10, 5));
        list.push_front(AddressRange::new(50, 5));
        assert_eq!(ranges(&list), vec![(50, 5), (10, 5)]);
    }

    #[test]
    fn insert_sorted_keeps_ascending_order() {
        let mut list = RangeList::new();
        for offset in [40, 0, 80, 20, 60] {
            list.insert_sorted(AddressRange::new(offset, 5));
        }
        assert_eq!(
            list.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![0, 20, 40, 60, 80]
        );
    }

    #[test]
    fn remove_checks_predecessor() {
        let mut list = RangeList::new();
        let a = list.insert_sorted(AddressRange::new(0, 10));
        let b = list.insert_sorted(AddressRange::new(20, 10));
        let c = list.insert_sorted(AddressRange::new(40, 10));

        // `a` is not the predecessor of `c`.
        assert_eq!(list.remove(Some(a), c), None);
        assert_eq!(list.len(), 3);

        assert_eq!(list.remove(Some(a), b), Some(AddressRange::new(20, 10)));
        assert_eq!(list.remove(None, a), Some(AddressRange::new(0, 10)));
        assert_eq!(ranges(&list), vec![(40, 10)]);
        assert_eq!(list.remove(None, a), None);
    }

    #[test]
    fn vacated_slots_are_reused() {
        let mut list = RangeList::new();
        let a = list.push_front(AddressRange::new(0, 1));
        list.remove_offset(0);
        let b = list.push_front(AddressRange::new(7, 1));
        assert_eq!(a, b);
        assert_eq!(list.slots.len(), 1);
    }

    #[test]
    fn melt_merges_touching_runs() {
        let mut list = RangeList::new();
        for (offset, size) in [(0, 10), (10, 10), (20, 5), (40, 10), (50, 10), (70, 1)] {
            list.insert_sorted(AddressRange::new(offset, size));
        }
        assert!(!list.is_coalesced());

        assert_eq!(list.melt(), 3);
        assert_eq!(ranges(&list), vec![(0, 25), (40, 20), (70, 1)]);
        assert!(list.is_coalesced());
        assert_eq!(list.total_size(), 46);
        assert_eq!(list.largest(), 25);
    }

    #[test]
    fn display_dumps_ranges() {
        let mut list = RangeList::new();
        list.insert_sorted(AddressRange::new(80, 20));
        list.insert_sorted(AddressRange::new(20, 10));
        assert_eq!(list.to_string(), "[20, 30) -> [80, 100)");
    }
}
