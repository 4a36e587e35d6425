//! A double-ended ring buffer backed by a single slot arena.
//!
//! Used in two shapes: as an unbounded FIFO backlog (the rendezvous queue
//! grows it on demand) and as a fixed-capacity sliding window where pushing
//! into a full buffer evicts the oldest element (the rate counters).

use std::fmt;

pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    fn physical(&self, logical: usize) -> usize {
        (self.head + logical) % self.slots.len()
    }

    /// Doubles the arena, unrolling the live range so that `head` is zero.
    fn grow(&mut self) {
        let new_capacity = (self.slots.len() * 2).max(4);
        let mut slots: Vec<Option<T>> = Vec::with_capacity(new_capacity);
        for i in 0..self.len {
            let idx = self.physical(i);
            slots.push(self.slots[idx].take());
        }
        slots.resize_with(new_capacity, || None);
        self.slots = slots;
        self.head = 0;
    }

    pub fn push_back(&mut self, value: T) {
        if self.is_full() {
            self.grow();
        }
        let idx = self.physical(self.len);
        self.slots[idx] = Some(value);
        self.len += 1;
    }

    pub fn push_front(&mut self, value: T) {
        if self.is_full() {
            self.grow();
        }
        let cap = self.slots.len();
        self.head = (self.head + cap - 1) % cap;
        self.slots[self.head] = Some(value);
        self.len += 1;
    }

    /// Pushes into a fixed window. When the buffer is full the oldest element
    /// is evicted and returned. A zero-capacity buffer rejects every value.
    pub fn push_evicting(&mut self, value: T) -> Option<T> {
        if self.slots.is_empty() {
            return Some(value);
        }
        if self.is_full() {
            let evicted = self.pop_front();
            self.push_back(value);
            return evicted;
        }
        self.push_back(value);
        None
    }

    pub fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        value
    }

    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.slots[self.physical(index)].as_ref()
    }

    /// Removes the first element matching `predicate`, preserving the order
    /// of everything else.
    pub fn remove_first(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let position = self.iter().position(|item| predicate(item))?;
        let idx = self.physical(position);
        let removed = self.slots[idx].take();
        for i in position..self.len - 1 {
            let from = self.physical(i + 1);
            let to = self.physical(i);
            self.slots[to] = self.slots[from].take();
        }
        self.len -= 1;
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.slots[self.physical(i)].as_ref())
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_across_growth() {
        let mut buf = RingBuffer::new();
        for i in 0..10 {
            buf.push_back(i);
        }
        assert_eq!(buf.len(), 10);
        for i in 0..10 {
            assert_eq!(buf.pop_front(), Some(i));
        }
        assert!(buf.pop_front().is_none());
    }

    #[test]
    fn wraps_and_grows_without_reordering() {
        let mut buf = RingBuffer::with_capacity(4);
        buf.push_back(1);
        buf.push_back(2);
        buf.push_back(3);
        assert_eq!(buf.pop_front(), Some(1));
        buf.push_back(4);
        buf.push_back(5);
        // head is now mid-arena, the next push forces a grow
        buf.push_back(6);
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn push_front_is_popped_first() {
        let mut buf = RingBuffer::new();
        buf.push_back(2);
        buf.push_front(1);
        assert_eq!(buf.front(), Some(&1));
        assert_eq!(buf.get(1), Some(&2));
        assert_eq!(buf.pop_front(), Some(1));
        assert_eq!(buf.pop_front(), Some(2));
    }

    #[test]
    fn evicting_window_keeps_newest() {
        let mut window = RingBuffer::with_capacity(3);
        assert_eq!(window.push_evicting(1), None);
        assert_eq!(window.push_evicting(2), None);
        assert_eq!(window.push_evicting(3), None);
        assert_eq!(window.push_evicting(4), Some(1));
        assert_eq!(window.len(), 3);
        assert_eq!(window.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn zero_capacity_window_rejects() {
        let mut window = RingBuffer::with_capacity(0);
        assert_eq!(window.push_evicting(7), Some(7));
        assert_eq!(window.len(), 0);
    }

    #[test]
    fn remove_first_preserves_order() {
        let mut buf = RingBuffer::with_capacity(4);
        buf.push_back(0);
        buf.pop_front();
        for i in 1..=4 {
            buf.push_back(i);
        }
        assert_eq!(buf.remove_first(|v| *v == 2), Some(2));
        assert_eq!(buf.remove_first(|v| *v == 9), None);
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![1, 3, 4]);
    }
}
