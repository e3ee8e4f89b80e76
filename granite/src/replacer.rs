//! The LRU victim queue used by the buffer pool for victim selection.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

const NIL: usize = usize::MAX;

struct Node<T> {
    value: T,
    prev: usize,
    next: usize,
}

struct LruInner<T> {
    /// Arena of list nodes; `free` holds reusable slots.
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    /// Most recently used end.
    head: usize,
    /// Least recently used end.
    tail: usize,
    /// Side index mapping a value to its node slot.
    index: HashMap<T, usize>,
}

/// An ordered set of distinct values in touch order.
///
/// `insert` marks a value most-recently-used, `victim` pops the
/// least-recently-used one. All operations are O(1) and mutually exclusive
/// under a single latch.
pub struct LruReplacer<T> {
    inner: Mutex<LruInner<T>>,
}

impl<T: Eq + Hash + Copy> LruReplacer<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruInner {
                nodes: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
                index: HashMap::new(),
            }),
        }
    }

    /// Records a touch of `value`: moves it to the MRU position, adding it
    /// if absent.
    pub fn insert(&self, value: T) {
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.index.get(&value) {
            inner.unlink(slot);
            inner.push_front(slot);
        } else {
            let slot = inner.alloc(value);
            inner.push_front(slot);
            inner.index.insert(value, slot);
        }
    }

    /// Removes and returns the least-recently-used value, or `None` if the
    /// queue is empty.
    pub fn victim(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let slot = inner.tail;
        if slot == NIL {
            return None;
        }
        let value = inner.nodes[slot].value;
        inner.unlink(slot);
        inner.free.push(slot);
        inner.index.remove(&value);
        Some(value)
    }

    /// Removes `value` if present.
    pub fn erase(&self, value: &T) -> bool {
        let mut inner = self.inner.lock();
        match inner.index.remove(value) {
            Some(slot) => {
                inner.unlink(slot);
                inner.free.push(slot);
                true
            }
            None => false,
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().index.len()
    }
}

impl<T: Eq + Hash + Copy> Default for LruReplacer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruInner<T> {
    fn alloc(&mut self, value: T) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot].value = value;
                slot
            }
            None => {
                self.nodes.push(Node {
                    value,
                    prev: NIL,
                    next: NIL,
                });
                self.nodes.len() - 1
            }
        }
    }

    fn push_front(&mut self, slot: usize) {
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else if self.head == slot {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else if self.tail == slot {
            self.tail = prev;
        }
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = NIL;
    }
}
