//! The recency ring: every mapped frame, ordered from least to most recently used.
//!
//! The ring is a circular doubly linked list threaded through an arena indexed by frame
//! index, so membership tests and removal are O(1) and a frame can never appear twice.
//! The hand points at the least recent entry; the entry just behind it is the most
//! recent. Advancing the hand therefore moves the entry it passes to the most-recent
//! position without relinking anything, which is all the clock scan needs.

use alloc::vec::Vec;

use crate::VirtualAddress;

/// One mapped frame: which address space maps it, and where.
#[derive(Debug, Clone)]
pub struct RecencyEntry<O> {
    owner: O,
    page: VirtualAddress,
    prev: usize,
    next: usize,
}

impl<O> RecencyEntry<O> {
    /// Returns the address space mapping the frame.
    pub fn owner(&self) -> &O {
        &self.owner
    }

    /// Returns the virtual page the frame backs.
    pub fn page(&self) -> VirtualAddress {
        self.page
    }
}

pub struct RecencyRing<O> {
    slots: Vec<Option<RecencyEntry<O>>>,
    hand: Option<usize>,
    len: usize,
}

impl<O> RecencyRing<O> {
    /// Creates an empty ring able to track `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            hand: None,
            len: 0,
        }
    }

    /// Inserts frame `index` at the most-recent position.
    ///
    /// # Panics
    ///
    /// Panics if the frame already has an entry.
    pub fn insert(&mut self, index: usize, owner: O, page: VirtualAddress) {
        assert!(
            self.slots[index].is_none(),
            "frame {} already has a recency entry",
            index
        );

        let (prev, next) = match self.hand {
            None => {
                self.hand = Some(index);
                (index, index)
            }
            Some(hand) => {
                let tail = self.link(hand).prev;
                self.link_mut(tail).next = index;
                self.link_mut(hand).prev = index;
                (tail, hand)
            }
        };

        self.slots[index] = Some(RecencyEntry {
            owner,
            page,
            prev,
            next,
        });
        self.len += 1;
    }

    /// Removes the entry of frame `index`, returning it.
    ///
    /// If the hand pointed at the entry it moves on to the next one.
    ///
    /// # Panics
    ///
    /// Panics if the frame has no entry.
    pub fn remove(&mut self, index: usize) -> RecencyEntry<O> {
        let entry = self
            .slots
            .get_mut(index)
            .and_then(Option::take)
            .unwrap_or_else(|| panic!("frame {} has no recency entry", index));
        self.len -= 1;

        if self.len == 0 {
            self.hand = None;
        } else {
            self.link_mut(entry.prev).next = entry.next;
            self.link_mut(entry.next).prev = entry.prev;
            if self.hand == Some(index) {
                self.hand = Some(entry.next);
            }
        }
        entry
    }

    /// Returns the frame index under the hand (the least recent entry).
    pub fn hand(&self) -> Option<usize> {
        self.hand
    }

    /// Returns the entry under the hand along with its frame index.
    pub fn hand_entry(&self) -> Option<(usize, &RecencyEntry<O>)> {
        let hand = self.hand?;
        Some((hand, self.link(hand)))
    }

    /// Moves the hand one step, making the entry it leaves the most recent.
    pub fn advance(&mut self) {
        if let Some(hand) = self.hand {
            self.hand = Some(self.link(hand).next);
        }
    }

    /// Returns the entry of frame `index`.
    pub fn entry(&self, index: usize) -> Option<&RecencyEntry<O>> {
        self.slots.get(index)?.as_ref()
    }

    /// Returns whether frame `index` has an entry.
    pub fn contains(&self, index: usize) -> bool {
        self.entry(index).is_some()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates from the least to the most recent entry.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &RecencyEntry<O>)> + '_ {
        let mut cursor = self.hand;
        let mut remaining = self.len;
        core::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let index = cursor?;
            let entry = self.link(index);
            cursor = Some(entry.next);
            remaining -= 1;
            Some((index, entry))
        })
    }

    fn link(&self, index: usize) -> &RecencyEntry<O> {
        match &self.slots[index] {
            Some(entry) => entry,
            None => panic!("recency ring links to empty slot {}", index),
        }
    }

    fn link_mut(&mut self, index: usize) -> &mut RecencyEntry<O> {
        match &mut self.slots[index] {
            Some(entry) => entry,
            None => panic!("recency ring links to empty slot {}", index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: usize) -> VirtualAddress {
        VirtualAddress::new(n * 0x1000)
    }

    fn order(ring: &RecencyRing<u32>) -> Vec<usize> {
        ring.iter().map(|(index, _)| index).collect()
    }

    #[test]
    fn insertion_order_is_recency_order() {
        let mut ring = RecencyRing::new(8);
        ring.insert(3, 1, page(3));
        ring.insert(5, 1, page(5));
        ring.insert(1, 2, page(1));
        assert_eq!(order(&ring), [3, 5, 1]);
        assert_eq!(ring.hand(), Some(3));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn advance_moves_hand_entry_to_most_recent() {
        let mut ring = RecencyRing::new(4);
        ring.insert(0, 1, page(0));
        ring.insert(1, 1, page(1));
        ring.insert(2, 1, page(2));
        ring.advance();
        assert_eq!(order(&ring), [1, 2, 0]);

        // New entries land behind the hand, after the entry it just passed.
        ring.insert(3, 1, page(3));
        assert_eq!(order(&ring), [1, 2, 0, 3]);
    }

    #[test]
    fn removing_hand_moves_it_forward() {
        let mut ring = RecencyRing::new(4);
        ring.insert(0, 1, page(0));
        ring.insert(1, 1, page(1));
        ring.insert(2, 1, page(2));

        let removed = ring.remove(0);
        assert_eq!(removed.page(), page(0));
        assert_eq!(ring.hand(), Some(1));
        assert_eq!(order(&ring), [1, 2]);

        ring.remove(2);
        assert_eq!(order(&ring), [1]);
        ring.remove(1);
        assert!(ring.is_empty());
        assert_eq!(ring.hand(), None);
    }

    #[test]
    fn removing_middle_entry_relinks_neighbors() {
        let mut ring = RecencyRing::new(4);
        for i in 0..4 {
            ring.insert(i, 7, page(i));
        }
        ring.remove(2);
        assert_eq!(order(&ring), [0, 1, 3]);
        assert!(!ring.contains(2));
        assert_eq!(ring.entry(3).map(|e| *e.owner()), Some(7));
    }

    #[test]
    #[should_panic(expected = "already has a recency entry")]
    fn duplicate_insert_panics() {
        let mut ring = RecencyRing::new(2);
        ring.insert(1, 1, page(1));
        ring.insert(1, 1, page(1));
    }

    #[test]
    #[should_panic(expected = "has no recency entry")]
    fn removing_absent_entry_panics() {
        let mut ring: RecencyRing<u32> = RecencyRing::new(2);
        ring.remove(1);
    }
}
