//! Lock-free, wait-free-enqueue, single-consumer-dequeue priority queue.
//!
//! Ported from an intrusive Michael & Scott style queue with a stub node
//! per lane: each priority lane is its own linked list, enqueue swaps the
//! tail pointer atomically and links the previous tail to the new node,
//! dequeue advances the head past the stub. Lanes are cache-line padded
//! so producers hammering one priority don't thrash another lane's
//! cache line.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn new(value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

#[repr(align(64))]
struct Lane<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
}

impl<T> Lane<T> {
    fn new() -> Self {
        let stub = Node::new(None);
        Lane {
            head: AtomicPtr::new(stub),
            tail: AtomicPtr::new(stub),
        }
    }

    /// Wait-free: a single atomic swap establishes this producer's
    /// position, then a store links the old tail to the new node. Between
    /// the swap and the store the lane is briefly inconsistent for a
    /// concurrent dequeuer, who spins on `next` being non-null for the
    /// stub case; this mirrors the Vyukov MPSC design.
    fn push(&self, value: T) {
        let node = Node::new(Some(value));
        let prev = self.tail.swap(node, Ordering::AcqRel);
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
    }

    /// Single-consumer only: never call concurrently from more than one
    /// thread.
    fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Acquire);
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        let value = unsafe { (*next).value.take() };
        self.head.store(next, Ordering::Release);
        unsafe {
            drop(Box::from_raw(head));
        }
        value
    }
}

impl<T> Drop for Lane<T> {
    fn drop(&mut self) {
        let mut current = self.head.load(Ordering::Relaxed);
        while !current.is_null() {
            let next = unsafe { (*current).next.load(Ordering::Relaxed) };
            unsafe {
                drop(Box::from_raw(current));
            }
            current = next;
        }
    }
}

/// What happens to an enqueue attempt once the queue is at or over its
/// configured capacity.
///
/// The underlying intrusive list has no efficient way to drop the oldest
/// element of the highest-priority lane without scanning, so
/// `DropOldest` and `Block` both degrade to `DropNewest` with a one-time
/// warning the first time they are exercised under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropNewest,
    DropOldest,
    Block,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_size: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_size: 4096,
            overflow_policy: OverflowPolicy::DropNewest,
        }
    }
}

/// A bounded, priority-laned MPSC queue. `P` is the number of lanes
/// (priorities `0..P`, where `P - 1` is drained first).
pub struct PriorityQueue<T> {
    lanes: Vec<Lane<T>>,
    size: AtomicUsize,
    config: QueueConfig,
    degraded_warned: std::sync::atomic::AtomicBool,
}

impl<T> PriorityQueue<T> {
    pub fn new(lane_count: usize, config: QueueConfig) -> Self {
        let lane_count = lane_count.max(1);
        PriorityQueue {
            lanes: (0..lane_count).map(|_| Lane::new()).collect(),
            size: AtomicUsize::new(0),
            config,
            degraded_warned: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn max_priority(&self) -> usize {
        self.lanes.len() - 1
    }

    /// Wait-free. Returns `false` if the approximate size is at or past
    /// capacity and the overflow policy is not to admit the item.
    pub fn enqueue(&self, value: T, priority: usize) -> bool {
        let priority = priority.min(self.max_priority());
        if self.size.load(Ordering::Relaxed) >= self.config.max_size {
            if self.config.overflow_policy != OverflowPolicy::DropNewest
                && !self.degraded_warned.swap(true, Ordering::Relaxed)
            {
                log::warn!(
                    "priority queue overflow policy {:?} degrades to DropNewest under a lock-free lane",
                    self.config.overflow_policy
                );
            }
            return false;
        }
        self.lanes[priority].push(value);
        self.size.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Single-consumer only. Drains from the highest-priority non-empty
    /// lane first.
    pub fn dequeue(&self) -> Option<T> {
        for lane in self.lanes.iter().rev() {
            if let Some(value) = lane.pop() {
                self.size.fetch_sub(1, Ordering::Relaxed);
                return Some(value);
            }
        }
        None
    }

    /// Eventually-consistent approximate count.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

unsafe impl<T: Send> Send for PriorityQueue<T> {}
unsafe impl<T: Send> Sync for PriorityQueue<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_higher_priority_lanes_first() {
        let q: PriorityQueue<&str> = PriorityQueue::new(4, QueueConfig::default());
        q.enqueue("A", 1);
        q.enqueue("B", 3);
        q.enqueue("C", 1);
        q.enqueue("D", 3);
        assert_eq!(q.dequeue(), Some("B"));
        assert_eq!(q.dequeue(), Some("D"));
        assert_eq!(q.dequeue(), Some("A"));
        assert_eq!(q.dequeue(), Some("C"));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn fifo_within_a_lane() {
        let q: PriorityQueue<i32> = PriorityQueue::new(1, QueueConfig::default());
        for i in 0..50 {
            q.enqueue(i, 0);
        }
        for i in 0..50 {
            assert_eq!(q.dequeue(), Some(i));
        }
    }

    #[test]
    fn rejects_past_capacity() {
        let q: PriorityQueue<i32> = PriorityQueue::new(
            1,
            QueueConfig {
                max_size: 2,
                overflow_policy: OverflowPolicy::DropNewest,
            },
        );
        assert!(q.enqueue(1, 0));
        assert!(q.enqueue(2, 0));
        assert!(!q.enqueue(3, 0));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn priority_clamped_to_max_lane() {
        let q: PriorityQueue<i32> = PriorityQueue::new(2, QueueConfig::default());
        q.enqueue(1, 99);
        assert_eq!(q.dequeue(), Some(1));
    }

    #[test]
    fn concurrent_producers_single_consumer() {
        use std::sync::Arc;
        use std::thread;

        let q: Arc<PriorityQueue<i32>> = Arc::new(PriorityQueue::new(2, QueueConfig {
            max_size: 100_000,
            overflow_policy: OverflowPolicy::DropNewest,
        }));
        let mut handles = Vec::new();
        for t in 0..8 {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    q.enqueue(t * 1000 + i, (t % 2) as usize);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut count = 0;
        while q.dequeue().is_some() {
            count += 1;
        }
        assert_eq!(count, 8000);
    }
}
