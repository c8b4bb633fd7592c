use std::collections::HashSet;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring capacity must be a positive integer, got {0}")]
    InvalidCapacity(i64),
}

/// Fixed-capacity ring buffer. Oldest entry is overwritten when full.
///
/// Live entries occupy logical positions `[head - len, head)` (mod capacity),
/// oldest first. Every other slot is `None`.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    data: Vec<Option<T>>,
    head: usize,
    len: usize,
    cap: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(cap: usize) -> Result<Self, RingError> {
        if cap == 0 {
            return Err(RingError::InvalidCapacity(0));
        }
        let mut data = Vec::with_capacity(cap);
        data.resize_with(cap, || None);
        Ok(Self { data, head: 0, len: 0, cap })
    }

    /// Build from a signed capacity as read from config or the command line.
    pub fn with_requested_capacity(requested: i64) -> Result<Self, RingError> {
        let cap = usize::try_from(requested).map_err(|_| RingError::InvalidCapacity(requested))?;
        Self::new(cap).map_err(|_| RingError::InvalidCapacity(requested))
    }

    pub fn push(&mut self, val: T) {
        self.data[self.head] = Some(val);
        self.head = (self.head + 1) % self.cap;
        if self.len < self.cap {
            self.len += 1;
        }
    }

    pub fn clear(&mut self) {
        for slot in self.data.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }

    /// Remove every live entry equal to one of `targets`, keeping survivors in order.
    /// Equal duplicates are all removed, not just one occurrence.
    pub fn remove(&mut self, targets: &[T]) -> usize
    where
        T: Eq + Hash,
    {
        if targets.is_empty() {
            return 0;
        }
        let set: HashSet<&T> = targets.iter().collect();
        let doomed = self.mark(|v| set.contains(v));
        self.compact(&doomed)
    }

    /// Like [`remove`](Self::remove) but matches on a key derived from each entry.
    pub fn remove_by_key<K, F>(&mut self, keys: &[K], key: F) -> usize
    where
        K: Eq + Hash,
        F: Fn(&T) -> K,
    {
        if keys.is_empty() {
            return 0;
        }
        let set: HashSet<&K> = keys.iter().collect();
        let doomed = self.mark(|v| set.contains(&key(v)));
        self.compact(&doomed)
    }

    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
    pub fn is_full(&self) -> bool { self.len == self.cap }
    pub fn capacity(&self) -> usize { self.cap }

    /// Iterate live entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.data[self.slot(i)].as_ref())
    }

    /// Physical index of logical position `i` (0 = oldest).
    fn slot(&self, i: usize) -> usize {
        (self.head + self.cap - self.len + i) % self.cap
    }

    fn mark<P: Fn(&T) -> bool>(&self, doomed: P) -> Vec<bool> {
        (0..self.len)
            .map(|i| self.data[self.slot(i)].as_ref().map_or(false, &doomed))
            .collect()
    }

    fn compact(&mut self, doomed: &[bool]) -> usize {
        let base = self.head + self.cap - self.len;
        let mut write = 0;
        let mut removed = 0;
        for (read, &drop_it) in doomed.iter().enumerate() {
            let src = (base + read) % self.cap;
            if drop_it {
                self.data[src] = None;
                removed += 1;
            } else {
                if write != read {
                    let dst = (base + write) % self.cap;
                    self.data[dst] = self.data[src].take();
                }
                write += 1;
            }
        }
        // tail slots were either taken or dropped above; make sure nothing stale survives
        for i in write..self.len {
            self.data[(base + i) % self.cap] = None;
        }
        self.len = write;
        self.head = (self.head + self.cap - removed) % self.cap;
        removed
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Snapshot of all live values, oldest first.
    pub fn read_all(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}
