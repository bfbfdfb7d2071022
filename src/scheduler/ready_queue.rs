use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::graph::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    id: TaskId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then the earlier submission
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Priority-ordered queue of ready task ids
pub struct ReadyQueue {
    heap: Mutex<BinaryHeap<ReadyEntry>>,
    size: AtomicUsize,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            size: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, id: TaskId, priority: i32) {
        let mut heap = self.heap.lock();
        heap.push(ReadyEntry { priority, id });
        self.size.store(heap.len(), Ordering::Release);
    }

    /// Pop the highest priority entry; never blocks on an empty queue
    pub fn pop(&self) -> Option<TaskId> {
        let mut heap = self.heap.lock();
        let entry = heap.pop();
        self.size.store(heap.len(), Ordering::Release);
        entry.map(|entry| entry.id)
    }

    /// Returns the current number of entries, stale ones included
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut heap = self.heap.lock();
        heap.clear();
        self.size.store(0, Ordering::Release);
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_operations() {
        let queue = ReadyQueue::new();

        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);

        queue.push(1, 0);
        queue.push(2, 0);
        queue.push(3, 0);
        assert_eq!(queue.len(), 3);

        // Equal priority keeps submission order
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.len(), 1);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_priority_order() {
        let queue = ReadyQueue::new();
        queue.push(1, 0);
        queue.push(2, 5);
        queue.push(3, -1);
        queue.push(4, 5);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_concurrent_push_pop() {
        let queue = Arc::new(ReadyQueue::new());
        let num_threads = 8;
        let items_per_thread = 100;

        let mut handles = vec![];

        for i in 0..num_threads {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for j in 0..items_per_thread {
                    queue.push((i * items_per_thread + j) as TaskId, (j % 3) as i32);
                }
            }));
        }

        for _ in 0..num_threads {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                let mut count = 0;
                while count < items_per_thread {
                    if queue.pop().is_some() {
                        count += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(queue.is_empty());
    }
}
