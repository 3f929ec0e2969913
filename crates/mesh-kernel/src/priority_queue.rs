//! Binary min-heaps.
//!
//! [`PriorityQueue`] is a plain value heap ordered by the element's `<`.
//!
//! [`IndexedHeap`] stores `u32` handles whose keys live in the caller's own
//! arrays. It keeps a handle-to-slot map so an element can be re-ordered or
//! removed in O(log n) after an unrelated edit changed its key. Removal can be
//! lazy: the element is parked behind the live heap and counted as deleted
//! until [`IndexedHeap::reinsert_deleted`] puts it back.

/// Array-backed binary min-heap over `PartialOrd` values.
#[derive(Debug, Clone)]
pub struct PriorityQueue<T> {
    heap: Vec<T>,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self { heap: Vec::new() }
    }
}

impl<T: PartialOrd> PriorityQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty queue with room for `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
        }
    }

    /// Number of queued elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop all elements.
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// The smallest element.
    #[inline]
    pub fn peek(&self) -> Option<&T> {
        self.heap.first()
    }

    /// Insert an element.
    pub fn push(&mut self, value: T) {
        self.heap.push(value);
        let mut i = self.heap.len() - 1;
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i] < self.heap[parent] {
                self.heap.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    /// Remove and return the smallest element.
    pub fn pop(&mut self) -> Option<T> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let min = self.heap.pop();

        let n = self.heap.len();
        let mut i = 0;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            if left + 1 < n && self.heap[left + 1] < self.heap[left] {
                child = left + 1;
            }
            if self.heap[child] < self.heap[i] {
                self.heap.swap(i, child);
                i = child;
            } else {
                break;
            }
        }
        min
    }
}

const NOT_QUEUED: i32 = -1;

/// Min-heap of handles with a handle-to-slot map and lazy deletion.
///
/// Every operation that compares elements takes a `less(a, b)` closure over
/// handles, so the keys can stay in the caller's storage.
#[derive(Debug, Clone, Default)]
pub struct IndexedHeap {
    /// Live heap in `[0, len - num_deleted)`, parked elements after it.
    heap: Vec<u32>,
    slots: Vec<i32>,
    num_deleted: usize,
}

impl IndexedHeap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every element.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.slots.clear();
        self.num_deleted = 0;
    }

    /// Number of live elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len() - self.num_deleted
    }

    /// Whether no live element remains.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of lazily deleted elements waiting for re-insertion.
    #[inline]
    pub fn num_deleted(&self) -> usize {
        self.num_deleted
    }

    /// Heap slot of `handle`, or `None` when it is not queued.
    #[inline]
    pub fn position(&self, handle: u32) -> Option<usize> {
        match self.slots.get(handle as usize) {
            Some(&slot) if slot >= 0 => Some(slot as usize),
            _ => None,
        }
    }

    /// Whether `handle` is in the live heap.
    #[inline]
    pub fn contains(&self, handle: u32) -> bool {
        self.position(handle).is_some()
    }

    /// The live element with the smallest key.
    #[inline]
    pub fn peek(&self) -> Option<u32> {
        if self.is_empty() { None } else { Some(self.heap[0]) }
    }

    fn set_slot(&mut self, i: usize) {
        let handle = self.heap[i] as usize;
        self.slots[handle] = i as i32;
    }

    fn ensure_slot(&mut self, handle: u32) {
        let h = handle as usize;
        if h >= self.slots.len() {
            self.slots.resize(h + 1, NOT_QUEUED);
        }
    }

    /// Build the heap from `handles` in O(n).
    pub fn build(&mut self, handles: impl IntoIterator<Item = u32>, less: impl Fn(u32, u32) -> bool) {
        self.clear();
        for handle in handles {
            self.ensure_slot(handle);
            self.heap.push(handle);
            self.set_slot(self.heap.len() - 1);
        }
        let n = self.heap.len();
        for i in (0..n / 2).rev() {
            self.sift_down(i, &less);
        }
    }

    /// Insert `handle`; ignored when it is already queued. A parked handle
    /// is moved back into the live heap.
    pub fn push(&mut self, handle: u32, less: impl Fn(u32, u32) -> bool) {
        self.ensure_slot(handle);
        if self.contains(handle) {
            return;
        }
        let live = self.len();
        if let Some(k) = self.heap[live..].iter().position(|&h| h == handle) {
            self.heap.remove(live + k);
            self.num_deleted -= 1;
        }
        self.heap.insert(live, handle);
        // parked elements behind the live range keep slot -1
        self.set_slot(live);
        self.update_at(live, &less);
    }

    /// Restore heap order after the key of `handle` changed.
    pub fn update(&mut self, handle: u32, less: impl Fn(u32, u32) -> bool) {
        if let Some(i) = self.position(handle) {
            self.update_at(i, &less);
        }
    }

    /// Remove `handle` from the live heap.
    ///
    /// With `append` the element is parked behind the heap and counted as
    /// deleted, to be restored by [`Self::reinsert_deleted`].
    pub fn remove(&mut self, handle: u32, append: bool, less: impl Fn(u32, u32) -> bool) {
        let Some(i) = self.position(handle) else {
            return;
        };
        let last = self.len() - 1;
        self.slots[handle as usize] = NOT_QUEUED;
        self.heap[i] = self.heap[last];
        if append {
            self.heap[last] = handle;
            self.num_deleted += 1;
        } else {
            self.heap.remove(last);
        }
        if i < last {
            self.set_slot(i);
            self.update_at(i, &less);
        }
    }

    /// Remove and return the live element with the smallest key.
    pub fn pop(&mut self, less: impl Fn(u32, u32) -> bool) -> Option<u32> {
        let top = self.peek()?;
        self.remove(top, false, less);
        Some(top)
    }

    /// Move parked elements back into the live heap.
    ///
    /// Elements for which `keep` returns false are dropped for good.
    pub fn reinsert_deleted(&mut self, keep: impl Fn(u32) -> bool, less: impl Fn(u32, u32) -> bool) {
        while self.num_deleted > 0 {
            self.num_deleted -= 1;
            let i = self.heap.len() - 1 - self.num_deleted;
            let handle = self.heap[i];
            if keep(handle) {
                self.set_slot(i);
                self.update_at(i, &less);
            } else {
                self.heap.remove(i);
            }
        }
    }

    /// Check the heap property and the slot map. Used by tests and debug assertions.
    pub fn check_consistency(&self, less: impl Fn(u32, u32) -> bool) -> bool {
        let n = self.len();
        for i in 0..n {
            if self.slots[self.heap[i] as usize] != i as i32 {
                return false;
            }
            if i > 0 && less(self.heap[i], self.heap[(i - 1) / 2]) {
                return false;
            }
        }
        self.heap[n..]
            .iter()
            .all(|&h| self.slots[h as usize] == NOT_QUEUED)
    }

    fn update_at(&mut self, mut i: usize, less: &impl Fn(u32, u32) -> bool) {
        let handle = self.heap[i];
        while i > 0 {
            let parent = (i - 1) / 2;
            if less(handle, self.heap[parent]) {
                self.heap[i] = self.heap[parent];
                self.set_slot(i);
                i = parent;
            } else {
                break;
            }
        }
        self.heap[i] = handle;
        self.set_slot(i);
        self.sift_down(i, less);
    }

    fn sift_down(&mut self, mut i: usize, less: &impl Fn(u32, u32) -> bool) {
        let n = self.len();
        let handle = self.heap[i];
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            if left + 1 < n && less(self.heap[left + 1], self.heap[left]) {
                child = left + 1;
            }
            if less(self.heap[child], handle) {
                self.heap[i] = self.heap[child];
                self.set_slot(i);
                i = child;
            } else {
                break;
            }
        }
        self.heap[i] = handle;
        self.set_slot(i);
    }
}
