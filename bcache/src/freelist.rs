//! The recency-ordered list of unreferenced slots.
//!
//! Slots are pushed at the head when their last reference is released and victims are taken from
//! the tail, so the tail is always the least recently released slot. The list is intrusive: links
//! live in an array indexed by [SlotId], with one extra sentinel element closing the ring.
//!
//! A released slot remembers the block it last held (its content stays intact until the slot is
//! chosen as a victim). [FreeList::take] unlinks such a slot by key so the block can be reused
//! without reading it again.

use crate::{pool::SlotId, Key};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug)]
struct Link {
    prev: usize,
    next: usize,
    linked: bool,
    key: Option<Key>,
}

/// A doubly-linked list of free slots with a sentinel.
pub(crate) struct FreeList {
    /// `links[sentinel]` is the sentinel: its `next` is the head and its `prev` the tail.
    links: Vec<Link>,

    /// The index of the sentinel (equal to the pool capacity).
    sentinel: usize,

    /// Free slots that still hold the content of a block, by key.
    retained: HashMap<Key, SlotId>,

    /// The number of linked slots.
    len: usize,

    /// The number of pushes performed (used to detect releases while waiting for a victim).
    pushes: u64,
}

impl FreeList {
    /// Create a list holding all `capacity` slots, none of which retains a block.
    ///
    /// Slots are pushed in ascending order, so slot 0 is the first victim.
    pub(crate) fn new(capacity: usize) -> Self {
        let sentinel = capacity;
        let mut list = Self {
            links: vec![
                Link {
                    prev: sentinel,
                    next: sentinel,
                    linked: false,
                    key: None,
                };
                capacity + 1
            ],
            sentinel,
            retained: HashMap::with_capacity(capacity),
            len: 0,
            pushes: 0,
        };
        for index in 0..capacity {
            list.push_front(SlotId::new(index), None);
        }
        list.pushes = 0;
        list
    }

    /// Insert `slot` at the head (most recently released), remembering that it holds `key`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is already on the list or another free slot already retains `key`.
    pub(crate) fn push_front(&mut self, slot: SlotId, key: Option<Key>) {
        let index = slot.index();
        assert!(
            !self.links[index].linked,
            "invariant violated: slot {slot} is already free"
        );
        if let Some(key) = key {
            if let Some(other) = self.retained.insert(key, slot) {
                panic!("invariant violated: {key} already retained by free slot {other}");
            }
        }

        let head = self.links[self.sentinel].next;
        self.links[index] = Link {
            prev: self.sentinel,
            next: head,
            linked: true,
            key,
        };
        self.links[head].prev = index;
        self.links[self.sentinel].next = index;
        self.len += 1;
        self.pushes += 1;
    }

    /// Remove and return the least recently released slot along with the block it last held.
    ///
    /// The slot no longer retains that block afterwards.
    pub(crate) fn pop_back(&mut self) -> Option<(SlotId, Option<Key>)> {
        let tail = self.links[self.sentinel].prev;
        if tail == self.sentinel {
            return None;
        }
        let key = self.unlink(tail);
        if let Some(key) = key {
            self.retained.remove(&key);
        }
        Some((SlotId::new(tail), key))
    }

    /// Remove and return the free slot still holding `key`, if any.
    pub(crate) fn take(&mut self, key: Key) -> Option<SlotId> {
        let slot = self.retained.remove(&key)?;
        self.unlink(slot.index());
        Some(slot)
    }

    fn unlink(&mut self, index: usize) -> Option<Key> {
        let Link {
            prev, next, key, ..
        } = self.links[index];
        self.links[prev].next = next;
        self.links[next].prev = prev;
        self.links[index] = Link {
            prev: self.sentinel,
            next: self.sentinel,
            linked: false,
            key: None,
        };
        self.len -= 1;
        key
    }

    /// Returns true if `slot` is on the list.
    #[cfg(test)]
    pub(crate) fn contains(&self, slot: SlotId) -> bool {
        self.links[slot.index()].linked
    }

    /// The number of free slots.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no slot is free.
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The number of pushes since creation.
    pub(crate) fn pushes(&self) -> u64 {
        self.pushes
    }

    /// Iterate from head (most recently released) to tail (next victim).
    pub(crate) fn iter(&self) -> impl Iterator<Item = (SlotId, Option<Key>)> + '_ {
        let mut cursor = self.links[self.sentinel].next;
        std::iter::from_fn(move || {
            if cursor == self.sentinel {
                return None;
            }
            let link = self.links[cursor];
            let item = (SlotId::new(cursor), link.key);
            cursor = link.next;
            Some(item)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(block: u64) -> Key {
        Key::new(1, block)
    }

    fn order(list: &FreeList) -> Vec<usize> {
        list.iter().map(|(slot, _)| slot.index()).collect()
    }

    #[test]
    fn test_freelist_initial_order() {
        let mut list = FreeList::new(4);
        assert_eq!(list.len(), 4);
        assert_eq!(list.pushes(), 0);
        assert_eq!(order(&list), vec![3, 2, 1, 0]);

        // Victims come out in slot order
        for expected in 0..4 {
            let (slot, key) = list.pop_back().unwrap();
            assert_eq!(slot.index(), expected);
            assert_eq!(key, None);
            assert!(!list.contains(slot));
        }
        assert!(list.is_empty());
        assert!(list.pop_back().is_none());
    }

    #[test]
    fn test_freelist_recency_order() {
        let mut list = FreeList::new(3);
        let slots: Vec<_> = (0..3).map(|_| list.pop_back().unwrap().0).collect();

        // Release in a scrambled order; victims must follow release order
        let released = [slots[2], slots[0], slots[1]];
        for (i, slot) in released.iter().enumerate() {
            list.push_front(*slot, Some(key(i as u64)));
        }
        assert_eq!(list.pushes(), 3);
        for (i, slot) in released.iter().enumerate() {
            assert_eq!(list.pop_back(), Some((*slot, Some(key(i as u64)))));
        }
    }

    #[test]
    fn test_freelist_take_retained() {
        let mut list = FreeList::new(3);
        let a = list.pop_back().unwrap().0;
        let b = list.pop_back().unwrap().0;
        list.push_front(a, Some(key(10)));
        list.push_front(b, Some(key(11)));
        assert_eq!(list.len(), 3);

        // Take from the middle of the list
        assert_eq!(list.take(key(10)), Some(a));
        assert!(!list.contains(a));
        assert_eq!(list.take(key(10)), None);
        assert_eq!(order(&list), vec![b.index(), 2]);

        // Evicting a retained slot forgets its key
        assert_eq!(list.pop_back(), Some((SlotId::new(2), None)));
        assert_eq!(list.pop_back(), Some((b, Some(key(11)))));
        assert_eq!(list.take(key(11)), None);
        assert!(list.is_empty());
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn test_freelist_double_push() {
        let mut list = FreeList::new(2);
        list.push_front(SlotId::new(0), None);
    }

    #[test]
    #[should_panic(expected = "already retained")]
    fn test_freelist_duplicate_key() {
        let mut list = FreeList::new(2);
        let a = list.pop_back().unwrap().0;
        let b = list.pop_back().unwrap().0;
        list.push_front(a, Some(key(1)));
        list.push_front(b, Some(key(1)));
    }
}
