// Min-heap ordered by a key pulled out of each element at insertion time.
// Equal keys come out in insertion order.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
};

struct Entry<T, K> {
    key: K,
    seq: u64,
    value: T,
}

impl<T, K: Ord> PartialEq for Entry<T, K> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl<T, K: Ord> Eq for Entry<T, K> {}

impl<T, K: Ord> PartialOrd for Entry<T, K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, K: Ord> Ord for Entry<T, K> {
    // BinaryHeap is a max-heap, so flip both comparisons
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct KeyedMinHeap<T, K, F>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    heap: BinaryHeap<Entry<T, K>>,
    key_fn: F,
    next_seq: u64,
}

impl<T, K, F> KeyedMinHeap<T, K, F>
where
    K: Ord + Clone,
    F: Fn(&T) -> K,
{
    pub fn new(key_fn: F) -> Self {
        Self {
            heap: BinaryHeap::new(),
            key_fn,
            next_seq: 0,
        }
    }

    pub fn insert(&mut self, value: T) {
        let key = (self.key_fn)(&value);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { key, seq, value });
    }

    pub fn peek_earliest(&self) -> Option<&T> {
        self.heap.peek().map(|e| &e.value)
    }

    pub fn peek_key(&self) -> Option<&K> {
        self.heap.peek().map(|e| &e.key)
    }

    pub fn remove_earliest(&mut self) -> Option<T> {
        self.heap.pop().map(|e| e.value)
    }

    // Removes the earliest element only if its key is <= bound
    pub fn pop_due(&mut self, bound: &K) -> Option<T> {
        match self.heap.peek() {
            Some(e) if e.key <= *bound => self.remove_earliest(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.heap.len();
        self.heap.clear();
        n
    }
}
