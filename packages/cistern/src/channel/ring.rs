// fixed-capacity ring storage part of a channel.

use std::fmt::{self, Formatter, Debug};


// fixed-capacity FIFO ring. allocated once, never grows.
//
// memory layout:
//
// - a "logical index" (front = 0) exists if it's in [0, len)
// - a logical index i maps to the storage index (start + i) % capacity
// - a storage slot is Some iff a logical index maps to it
pub(crate) struct Ring<T> {
    slots: Box<[Option<T>]>,
    // invariant: start < slots.len()
    start: usize,
    // invariant: len <= slots.len()
    len: usize,
}

impl<T> Ring<T> {
    // construct empty with the given capacity.
    //
    // panics if capacity is 0.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "Ring capacity must be non-zero");
        Ring {
            slots: (0..capacity).map(|_| None).collect(),
            start: 0,
            len: 0,
        }
    }

    // number of elements currently stored.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    // maximum number of elements.
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    // convert from logical index to storage index.
    fn storage_idx(&self, idx: usize) -> usize {
        debug_assert!(self.len <= self.capacity(), "Ring len > capacity (internal bug)");
        (self.start + idx) % self.capacity()
    }

    // push to the back. hands the element back if full.
    pub(crate) fn push(&mut self, elem: T) -> Result<(), T> {
        if self.is_full() {
            return Err(elem);
        }
        let storage_idx = self.storage_idx(self.len);
        debug_assert!(self.slots[storage_idx].is_none());
        self.slots[storage_idx] = Some(elem);
        self.len += 1;
        Ok(())
    }

    // pop from the front.
    pub(crate) fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let elem = self.slots[self.start].take();
        debug_assert!(elem.is_some(), "Ring slot empty within len (internal bug)");
        self.start = (self.start + 1) % self.capacity();
        self.len -= 1;
        elem
    }

    // iterate front to back by reference.
    pub(crate) fn iter(&self) -> impl Iterator<Item=&T> + '_ {
        (0..self.len).filter_map(move |i| self.slots[self.storage_idx(i)].as_ref())
    }
}

impl<T: Debug> Debug for Ring<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
